use crate::brokers::queue::queue::{Queue, SendMode};
use crate::brokers::queue::states::{PullRequest, PullResult};

/// Consumers ask for messages. An empty queue answers `Empty` instead of blocking.
#[derive(Debug, Default)]
pub struct PullState;

impl PullState {
    pub(crate) async fn pull(&self, queue: &Queue, consumer_id: &str, request: PullRequest) -> PullResult {
        let Some(consumer) = queue.find_consumer(consumer_id) else {
            return PullResult::UnknownConsumer;
        };

        let wait_ack = queue.options().waits_for_ack();
        if wait_ack && !queue.deliveries().is_empty() {
            return PullResult::AwaitingAcknowledge;
        }
        let count = if wait_ack { 1 } else { request.count.max(1) };

        let mut delivered = 0;
        for _ in 0..count {
            let Some(message) = queue.dequeue(request.order) else {
                break;
            };
            delivered += queue.send_to(message, vec![consumer.clone()], SendMode::PULL).await;
            if !consumer.is_connected() {
                break;
            }
        }

        queue.clear_backlog(request.clear_after).await;

        if delivered == 0 {
            PullResult::Empty
        } else {
            PullResult::Delivered(delivered)
        }
    }
}
