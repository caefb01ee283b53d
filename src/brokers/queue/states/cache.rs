use crate::brokers::queue::message::QueueMessage;
use crate::brokers::queue::queue::Queue;
use crate::brokers::queue::states::{EnterResult, PullResult, PushResult};

/// Single-slot latest value. A pull reads the slot without consuming it.
#[derive(Debug, Default)]
pub struct CacheState;

impl CacheState {
    pub(crate) async fn accept(&self, queue: &Queue, message: QueueMessage) -> PushResult {
        for previous in queue.replace_backlog(message) {
            queue.remove_message(&previous).await;
        }
        PushResult::Success
    }

    pub(crate) async fn pull(&self, queue: &Queue, consumer_id: &str) -> PullResult {
        let Some(consumer) = queue.find_consumer(consumer_id) else {
            return PullResult::UnknownConsumer;
        };
        let Some(cached) = queue.peek_latest() else {
            return PullResult::Empty;
        };

        if queue.send_snapshot(&cached, &consumer).await {
            PullResult::Delivered(1)
        } else {
            PullResult::Empty
        }
    }

    /// Keeps only the most recent message of an inherited backlog.
    pub(crate) async fn enter(&self, queue: &Queue) -> EnterResult {
        for stale in queue.trim_to_latest() {
            queue.remove_message(&stale).await;
        }
        EnterResult::Allow
    }
}
