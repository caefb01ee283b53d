pub mod brokers;
pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

use std::sync::Arc;
use std::time::Instant;

use crate::brokers::queue::{ManagerOptions, QueueManager};
use crate::config::Config;

// ========================================
// ENGINE
// ========================================

/// Holds the queue manager for the lifetime of the process.
/// Cheap to clone.
#[derive(Clone)]
pub struct TideEngine {
    pub queues: Arc<QueueManager>,
    pub start_time: Instant,
}

impl TideEngine {
    pub fn new(config: &Config) -> Self {
        let queues = Arc::new(QueueManager::new(ManagerOptions::from_config(config)));
        queues.start_reaper();
        Self {
            queues,
            start_time: Instant::now(),
        }
    }

    pub async fn shutdown(&self) {
        self.queues.shutdown().await;
    }
}
