use crate::brokers::queue::decision::Transmission;
use crate::brokers::queue::message::QueueMessage;
use crate::brokers::queue::queue::{Queue, SendMode};
use crate::brokers::queue::states::{DispatchOutcome, PullOrder, PushResult};

/// Fire-and-forget fan-out. Nothing is queued and nothing is acknowledged.
#[derive(Debug, Default)]
pub struct BroadcastState;

impl BroadcastState {
    pub(crate) fn can_enqueue(&self, queue: &Queue, _message: &QueueMessage) -> bool {
        !queue.connected_consumers().is_empty()
    }

    pub(crate) async fn accept(&self, queue: &Queue, mut message: QueueMessage) -> PushResult {
        let consumers = queue.connected_consumers();
        let Some(owner) = queue.handle() else {
            message.notify_producer(Transmission::Failed);
            return PushResult::StatusNotSupported;
        };
        if consumers.is_empty() {
            message.notify_producer(Transmission::Failed);
            queue.remove_message(&message).await;
            return PushResult::NoConsumers;
        }

        tokio::spawn(async move {
            owner.send_to(message, consumers, SendMode::BROADCAST).await;
        });
        PushResult::Success
    }

    /// Drains a backlog left by an earlier status.
    pub(crate) async fn dispatch_next(&self, queue: &Queue) -> DispatchOutcome {
        let consumers = queue.connected_consumers();
        if consumers.is_empty() {
            return DispatchOutcome::Idle;
        }
        let Some(message) = queue.dequeue(PullOrder::Fifo) else {
            return DispatchOutcome::Idle;
        };
        queue.send_to(message, consumers, SendMode::BROADCAST).await;
        DispatchOutcome::Delivered
    }
}
