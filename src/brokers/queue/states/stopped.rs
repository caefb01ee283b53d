use tracing::info;

use crate::brokers::queue::decision::Transmission;
use crate::brokers::queue::message::QueueMessage;
use crate::brokers::queue::options::QueueStatus;
use crate::brokers::queue::queue::Queue;
use crate::brokers::queue::states::{EnterResult, PushResult};

/// Hard drain: entering clears both lists and every tracked delivery.
#[derive(Debug, Default)]
pub struct StoppedState;

impl StoppedState {
    pub(crate) fn accept(&self, _queue: &Queue, mut message: QueueMessage) -> PushResult {
        message.notify_producer(Transmission::Failed);
        PushResult::StatusNotSupported
    }

    pub(crate) async fn enter(&self, queue: &Queue, previous: QueueStatus) -> EnterResult {
        queue.stop_sweeper();
        let dropped = queue.purge().await;
        info!(
            "Queue '{}': stopped (was {}), dropped {} messages",
            queue.name(),
            previous,
            dropped
        );
        EnterResult::Allow
    }

    pub(crate) fn leave(&self, queue: &Queue, _next: QueueStatus) {
        queue.start_sweeper();
    }
}
