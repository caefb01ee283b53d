use crate::brokers::queue::queue::{Queue, SendMode};
use crate::brokers::queue::states::{DispatchOutcome, PullOrder};

/// Fan-out: every connected consumer gets every message.
#[derive(Debug, Default)]
pub struct PushState;

impl PushState {
    pub(crate) async fn dispatch_next(&self, queue: &Queue) -> DispatchOutcome {
        let consumers = queue.connected_consumers();
        if consumers.is_empty() {
            return DispatchOutcome::Idle;
        }
        let Some(message) = queue.dequeue(PullOrder::Fifo) else {
            return DispatchOutcome::Idle;
        };

        if queue.send_to(message, consumers, SendMode::DISPATCH).await == 0 {
            DispatchOutcome::Idle
        } else {
            DispatchOutcome::Delivered
        }
    }
}
