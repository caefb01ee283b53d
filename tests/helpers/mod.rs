#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;

use tidemq::brokers::queue::persistence::{Database, DatabaseOptions};
use tidemq::brokers::queue::{ChannelConsumer, ConsumerSink, JsonCodec, ManagerOptions, Message, QueueManager};

/// Manager over a temp data dir. The sweeper tick is long so tests drive `sweep()` themselves.
pub fn setup_manager() -> (Arc<QueueManager>, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(QueueManager::new(manager_options(temp_dir.path())));
    (manager, temp_dir)
}

pub fn manager_options(data_dir: &Path) -> ManagerOptions {
    ManagerOptions {
        data_dir: data_dir.to_path_buf(),
        auto_create: true,
        sweep_interval_ms: 60_000,
        auto_destroy_check_ms: 0,
        ..ManagerOptions::default()
    }
}

/// Store options with the background flusher and shrinker off.
pub fn quiet_db_options() -> DatabaseOptions {
    DatabaseOptions {
        auto_flush: false,
        auto_shrink: false,
        ..DatabaseOptions::default()
    }
}

pub async fn open_database(dir: &Path, name: &str, options: DatabaseOptions) -> Arc<Database> {
    let db = Arc::new(Database::new(name, dir.join(format!("{}.tdb", name)), options));
    db.open().await.unwrap();
    db
}

pub fn msg(id: &str, payload: &str) -> Message {
    Message::with_id(id, Bytes::from(payload.to_string()))
}

// ---------- TestConsumer ----------

pub struct TestConsumer {
    pub id: String,
    sink: Arc<ChannelConsumer>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl TestConsumer {
    pub fn new(id: &str) -> Self {
        let (sink, rx) = ChannelConsumer::new(id, 1024);
        Self {
            id: id.to_string(),
            sink: Arc::new(sink),
            rx: Some(rx),
        }
    }

    pub fn sink(&self) -> Arc<dyn ConsumerSink> {
        self.sink.clone()
    }

    /// Next message, or `None` if nothing arrives within `ms`.
    pub async fn recv_within(&mut self, ms: u64) -> Option<Message> {
        let rx = self.rx.as_mut()?;
        match tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await {
            Ok(Some(bytes)) => Some(JsonCodec.decode(&bytes).unwrap()),
            _ => None,
        }
    }

    pub async fn recv(&mut self) -> Message {
        self.recv_within(1000)
            .await
            .unwrap_or_else(|| panic!("consumer '{}' received nothing", self.id))
    }

    /// Drains whatever is already buffered.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        if let Some(rx) = self.rx.as_mut() {
            while let Ok(bytes) = rx.try_recv() {
                out.push(JsonCodec.decode(&bytes).unwrap());
            }
        }
        out
    }

    pub fn disconnect(&mut self) {
        self.rx = None;
    }
}

pub async fn wait_for<F: Fn() -> bool>(condition: F, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
