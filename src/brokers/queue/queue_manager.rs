use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::brokers::queue::codec::{JsonCodec, MessageCodec};
use crate::brokers::queue::consumer::ConsumerSink;
use crate::brokers::queue::events::{EventListener, EventRegistry, QueueEvent};
use crate::brokers::queue::handler::{DeliveryHandler, PassThroughHandler};
use crate::brokers::queue::message::Message;
use crate::brokers::queue::options::{validate_queue_name, QueueOptions, QueueStatus};
use crate::brokers::queue::persistence::{PersistenceOptions, PersistentDeliveryHandler, ShrinkInfo};
use crate::brokers::queue::queue::{Queue, QueueSnapshot};
use crate::brokers::queue::replication::ReplicaSync;
use crate::brokers::queue::states::{PullRequest, PullResult, PushResult};
use crate::config::Config;
use crate::error::QueueError;
use crate::utils::current_time_ms;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub data_dir: PathBuf,
    pub auto_create: bool,
    pub sweep_interval_ms: u64,
    pub auto_destroy_check_ms: u64,
    pub default_options: QueueOptions,
    /// When set, auto-created queues are durable.
    pub default_persistence: Option<PersistenceOptions>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/queues"),
            auto_create: true,
            sweep_interval_ms: 1000,
            auto_destroy_check_ms: 5000,
            default_options: QueueOptions::default(),
            default_persistence: None,
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: PathBuf::from(&config.broker.data_dir),
            auto_create: config.broker.auto_create_queues,
            sweep_interval_ms: config.broker.sweep_interval_ms,
            auto_destroy_check_ms: config.broker.auto_destroy_check_ms,
            default_options: config.queue.to_options(),
            default_persistence: config
                .persistence
                .durable_by_default
                .then(|| config.persistence.to_options()),
        }
    }
}

pub struct QueueManager {
    queues: DashMap<String, Arc<Queue>>,
    options: ManagerOptions,
    codec: Arc<dyn MessageCodec>,
    events: EventRegistry,
    replica: RwLock<Option<Arc<dyn ReplicaSync>>>,
    create_lock: tokio::sync::Mutex<()>,
    reaper: Mutex<Option<CancellationToken>>,
}

impl QueueManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self::with_codec(options, Arc::new(JsonCodec))
    }

    pub fn with_codec(options: ManagerOptions, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            queues: DashMap::new(),
            options,
            codec,
            events: EventRegistry::default(),
            replica: RwLock::new(None),
            create_lock: tokio::sync::Mutex::new(()),
            reaper: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn on_event(&self, listener: EventListener) {
        self.events.subscribe(listener);
    }

    pub fn set_replica(&self, replica: Arc<dyn ReplicaSync>) {
        *self.replica.write() = Some(replica);
    }

    // ==========================================
    // CREATION
    // ==========================================

    pub async fn create_queue(&self, name: &str, options: Option<QueueOptions>) -> Result<Arc<Queue>, QueueError> {
        let options = options.unwrap_or_else(|| self.options.default_options.clone());
        self.create_queue_with_handler(name, options, Arc::new(PassThroughHandler)).await
    }

    pub async fn create_durable_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
        persistence: Option<PersistenceOptions>,
    ) -> Result<Arc<Queue>, QueueError> {
        let key = validate_queue_name(name)?;
        let options = options.unwrap_or_else(|| self.options.default_options.clone());
        let persistence = persistence
            .or_else(|| self.options.default_persistence.clone())
            .unwrap_or_default();
        let handler = PersistentDeliveryHandler::new(&key, &self.options.data_dir, persistence);
        self.create_queue_with_handler(name, options, Arc::new(handler)).await
    }

    pub async fn create_queue_with_handler(
        &self,
        name: &str,
        options: QueueOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Arc<Queue>, QueueError> {
        let _creating = self.create_lock.lock().await;
        self.register(name, options, handler).await
    }

    async fn register(
        &self,
        name: &str,
        options: QueueOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Arc<Queue>, QueueError> {
        let key = validate_queue_name(name)?;
        if self.queues.contains_key(&key) {
            return Err(QueueError::AlreadyExists(key));
        }

        let queue = Queue::new(
            key.clone(),
            options,
            handler,
            self.codec.clone(),
            Duration::from_millis(self.options.sweep_interval_ms),
        );
        if let Err(e) = queue.initialize().await {
            error!("Queue '{}': initialization failed: {}", key, e);
            queue.close(false).await;
            return Err(e);
        }

        let inserted = match self.queues.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(queue.clone());
                true
            }
        };
        if !inserted {
            queue.close(false).await;
            return Err(QueueError::AlreadyExists(key));
        }

        info!("Queue '{}': created ({}, durable: {})", key, queue.status(), queue.is_durable());
        self.events.emit(QueueEvent::Created { queue: key });
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(&name.to_lowercase()).map(|q| q.value().clone())
    }

    /// Returns the queue, creating it with the defaults when auto-creation is on.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Queue>, QueueError> {
        if let Some(queue) = self.get(name) {
            return Ok(queue);
        }
        if !self.options.auto_create {
            return Err(QueueError::AutoCreateDisabled(name.to_string()));
        }

        let _creating = self.create_lock.lock().await;
        if let Some(queue) = self.get(name) {
            return Ok(queue);
        }
        let options = self.options.default_options.clone();
        let handler: Arc<dyn DeliveryHandler> = match &self.options.default_persistence {
            Some(persistence) => {
                let key = validate_queue_name(name)?;
                Arc::new(PersistentDeliveryHandler::new(&key, &self.options.data_dir, persistence.clone()))
            }
            None => Arc::new(PassThroughHandler),
        };
        self.register(name, options, handler).await
    }

    fn require(&self, name: &str) -> Result<Arc<Queue>, QueueError> {
        self.get(name).ok_or_else(|| QueueError::NotFound(name.to_string()))
    }

    // ==========================================
    // MESSAGING
    // ==========================================

    pub async fn push(&self, queue: &str, message: Message) -> Result<PushResult, QueueError> {
        let queue = self.get_or_create(queue).await?;
        Ok(queue.push(message).await)
    }

    pub async fn subscribe(&self, queue: &str, consumer: Arc<dyn ConsumerSink>) -> Result<Arc<Queue>, QueueError> {
        let queue = self.get_or_create(queue).await?;
        queue.subscribe(consumer)?;
        Ok(queue)
    }

    pub fn unsubscribe(&self, queue: &str, consumer_id: &str) -> Result<bool, QueueError> {
        Ok(self.require(queue)?.unsubscribe(consumer_id))
    }

    pub async fn pull(&self, queue: &str, consumer_id: &str, request: PullRequest) -> Result<PullResult, QueueError> {
        Ok(self.require(queue)?.pull(consumer_id, request).await)
    }

    pub async fn acknowledge(&self, queue: &str, consumer_id: &str, message_id: &str, success: bool) -> Result<bool, QueueError> {
        Ok(self.require(queue)?.acknowledge(consumer_id, message_id, success).await)
    }

    // ==========================================
    // ADMIN
    // ==========================================

    pub async fn remove_queue(&self, name: &str) -> Result<(), QueueError> {
        let key = name.to_lowercase();
        let (key, queue) = self
            .queues
            .remove(&key)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        queue.close(true).await;
        info!("Queue '{}': removed", key);
        self.events.emit(QueueEvent::Removed { queue: key });
        Ok(())
    }

    /// Snapshots of every queue, sorted by name.
    pub fn list(&self) -> Vec<QueueSnapshot> {
        let mut snapshots: Vec<QueueSnapshot> = self.queues.iter().map(|q| q.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub async fn set_options(&self, name: &str, options: QueueOptions) -> Result<(), QueueError> {
        let queue = self.require(name)?;
        let previous = queue.status();
        queue.set_options(options).await?;
        let current = queue.status();
        if previous != current {
            self.events.emit(QueueEvent::StatusChanged { queue: queue.name().to_string(), from: previous, to: current });
        }
        Ok(())
    }

    pub async fn set_status(&self, name: &str, status: QueueStatus) -> Result<QueueStatus, QueueError> {
        let queue = self.require(name)?;
        let previous = queue.set_status(status).await?;
        if previous != status {
            self.events.emit(QueueEvent::StatusChanged { queue: queue.name().to_string(), from: previous, to: status });
        }
        Ok(previous)
    }

    pub async fn clear(&self, name: &str) -> Result<usize, QueueError> {
        Ok(self.require(name)?.clear().await)
    }

    pub async fn shrink(&self, name: &str) -> Result<ShrinkInfo, QueueError> {
        let queue = self.require(name)?;
        let store = queue
            .handler()
            .store()
            .ok_or_else(|| QueueError::Configuration(format!("queue '{}' is not durable", queue.name())))?;
        Ok(store.shrink().await)
    }

    /// Streams a queue's live content to the configured replica. Returns how many messages were sent.
    pub async fn sync_queue(&self, name: &str) -> Result<usize, QueueError> {
        let queue = self.require(name)?;
        let Some(replica) = self.replica.read().clone() else {
            return Err(QueueError::Configuration("no replica configured".into()));
        };

        let messages = queue.sync_snapshot().await;
        let count = messages.len();
        if let Err(e) = replica.begin_sync(queue.name(), messages).await {
            warn!("Queue '{}': replica sync failed: {:#}", queue.name(), e);
            return Err(QueueError::Configuration(format!("replica sync failed: {:#}", e)));
        }
        if let Err(e) = replica.sync_completed(queue.name()).await {
            warn!("Queue '{}': replica did not confirm sync: {:#}", queue.name(), e);
        }
        Ok(count)
    }

    // ==========================================
    // AUTO-DESTROY
    // ==========================================

    /// Removes queues whose auto-destroy grace period has elapsed. Returns their names.
    pub async fn reap(&self) -> Vec<String> {
        let now = current_time_ms();
        let due: Vec<String> = self
            .queues
            .iter()
            .filter(|q| q.value().auto_destroy_due(now))
            .map(|q| q.key().clone())
            .collect();

        let mut removed = Vec::new();
        for name in due {
            match self.remove_queue(&name).await {
                Ok(()) => {
                    info!("Queue '{}': auto-destroyed", name);
                    removed.push(name);
                }
                Err(e) => warn!("Queue '{}': auto-destroy failed: {}", name, e),
            }
        }
        removed
    }

    pub fn start_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock();
        if slot.is_some() || self.options.auto_destroy_check_ms == 0 {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let weak: Weak<QueueManager> = Arc::downgrade(self);
        let period = Duration::from_millis(self.options.auto_destroy_check_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.reap().await;
                    }
                }
            }
        });
    }

    pub fn stop_reaper(&self) {
        if let Some(token) = self.reaper.lock().take() {
            token.cancel();
        }
    }

    /// Closes every queue, keeping durable state on disk.
    pub async fn shutdown(&self) {
        self.stop_reaper();
        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| q.value().clone()).collect();
        self.queues.clear();
        for queue in queues {
            queue.close(false).await;
        }
        info!("Queue manager: shut down");
    }
}
