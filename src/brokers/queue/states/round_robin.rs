use parking_lot::Mutex;

use crate::brokers::queue::queue::{Queue, SendMode};
use crate::brokers::queue::states::{DispatchOutcome, PullOrder};

/// One consumer per message, rotating. Under ack-wait a consumer holding an
/// unacknowledged message is skipped.
#[derive(Debug, Default)]
pub struct RoundRobinState {
    cursor: Mutex<usize>,
}

impl RoundRobinState {
    pub(crate) async fn dispatch_next(&self, queue: &Queue) -> DispatchOutcome {
        let consumers = queue.connected_consumers();
        if consumers.is_empty() {
            return DispatchOutcome::Idle;
        }

        let skip_busy = queue.options().waits_for_ack();
        let picked = self.next_index(consumers.len(), |i| {
            !skip_busy || !queue.deliveries().is_busy(consumers[i].id())
        });
        let Some(index) = picked else {
            return DispatchOutcome::Idle;
        };
        let Some(message) = queue.dequeue(PullOrder::Fifo) else {
            return DispatchOutcome::Idle;
        };

        let target = vec![consumers[index].clone()];
        if queue.send_to(message, target, SendMode::DISPATCH).await == 0 {
            DispatchOutcome::Idle
        } else {
            DispatchOutcome::Delivered
        }
    }

    /// Next available index starting at the cursor. Advances the cursor past the pick.
    fn next_index(&self, len: usize, available: impl Fn(usize) -> bool) -> Option<usize> {
        let mut cursor = self.cursor.lock();
        for step in 0..len {
            let index = (*cursor + step) % len;
            if available(index) {
                *cursor = (index + 1) % len;
                return Some(index);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation() {
        let state = RoundRobinState::default();
        let picks: Vec<_> = (0..5).filter_map(|_| state.next_index(3, |_| true)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_skips_unavailable() {
        let state = RoundRobinState::default();
        assert_eq!(state.next_index(3, |i| i != 0), Some(1));
        assert_eq!(state.next_index(3, |i| i != 2), Some(0));
        assert_eq!(state.next_index(3, |_| false), None);
    }
}
