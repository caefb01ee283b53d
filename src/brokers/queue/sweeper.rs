use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::brokers::queue::queue::Queue;

/// Periodic ack/message timeout scan for one queue. `start` and `stop` are idempotent.
pub(crate) struct Sweeper {
    period: Duration,
    token: Mutex<Option<CancellationToken>>,
}

impl Sweeper {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            token: Mutex::new(None),
        }
    }

    pub fn start(&self, queue: Weak<Queue>) {
        let mut slot = self.token.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let period = self.period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(queue) = queue.upgrade() else { break };
                        queue.sweep().await;
                    }
                }
            }
            debug!("Sweeper stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.token.lock().is_some()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
