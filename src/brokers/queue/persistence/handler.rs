//! Durable delivery handler: binds the delivery hooks to a `Database` and an
//! optional `RedeliveryTracker` according to the configured delete/commit/put-back policies.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::database::Database;
use super::redelivery::RedeliveryTracker;
use super::types::{CommitWhen, DeleteWhen, ErrorHint, PersistenceOptions};
use crate::brokers::queue::decision::{Decision, PutBack, Transmission};
use crate::brokers::queue::handler::{DeliveryHandler, QueueInfo};
use crate::brokers::queue::message::{MessageDelivery, QueueMessage, DELIVERY_COUNT_HEADER};
use crate::brokers::queue::options::{queue_file_stem, AckMode};
use crate::error::QueueError;

const DELETE_ATTEMPTS: u32 = 3;
const DELETE_RETRY_MS: u64 = 10;

pub struct PersistentDeliveryHandler {
    name: String,
    options: PersistenceOptions,
    database: Arc<Database>,
    tracker: Option<RedeliveryTracker>,
    hints: Arc<AtomicU64>,
}

impl PersistentDeliveryHandler {
    pub fn new(queue_name: &str, data_dir: &Path, options: PersistenceOptions) -> Self {
        let stem = queue_file_stem(queue_name);
        let hints = Arc::new(AtomicU64::new(0));

        let hint_name = queue_name.to_string();
        let hint_counter = hints.clone();
        let hint: ErrorHint = Arc::new(move |kind, err| {
            hint_counter.fetch_add(1, Ordering::Relaxed);
            debug!("Queue '{}': store hint {}: {}", hint_name, kind, err);
        });

        let database = Database::new(
            queue_name,
            data_dir.join(format!("{}.tdb", stem)),
            options.database.clone(),
        )
        .with_error_hint(hint);

        let tracker = options
            .use_redelivery
            .then(|| RedeliveryTracker::new(queue_name, data_dir.join(format!("{}.delivery", stem))));

        Self {
            name: queue_name.to_string(),
            options,
            database: Arc::new(database),
            tracker,
            hints,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn tracker(&self) -> Option<&RedeliveryTracker> {
        self.tracker.as_ref()
    }

    pub fn options(&self) -> &PersistenceOptions {
        &self.options
    }

    /// Number of store errors reported through the error-hint channel.
    pub fn error_hints(&self) -> u64 {
        self.hints.load(Ordering::Relaxed)
    }

    /// Deletes with a short bounded retry. Gives up quietly.
    async fn delete_with_retry(&self, id: &str) -> bool {
        for attempt in 1..=DELETE_ATTEMPTS {
            match self.database.delete(id).await {
                Ok(deleted) => return deleted,
                Err(e) if attempt < DELETE_ATTEMPTS => {
                    debug!("Queue '{}': delete of '{}' failed (attempt {}): {}", self.name, id, attempt, e);
                    tokio::time::sleep(Duration::from_millis(DELETE_RETRY_MS)).await;
                }
                Err(e) => warn!("Queue '{}': giving up deleting '{}': {}", self.name, id, e),
            }
        }
        false
    }

    async fn forget(&self, id: &str) {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.remove(id).await {
                warn!("Queue '{}': cannot drop delivery counter of '{}': {}", self.name, id, e);
            }
        }
    }

    async fn discard(&self, id: &str) {
        self.delete_with_retry(id).await;
        self.forget(id).await;
    }

    async fn apply_put_back_policy(&self, message: &mut QueueMessage, policy: PutBack) -> Decision {
        match policy {
            PutBack::No => {
                self.discard(message.id()).await;
                Decision::allow().with_transmission(Transmission::Failed)
            }
            PutBack::Regular | PutBack::End => {
                // Already deleted after send: store it again before it re-enters the queue.
                if self.options.delete_when == DeleteWhen::AfterSend && !self.database.contains(message.id()).await {
                    match self.database.insert(&message.message).await {
                        Ok(()) => message.is_saved = true,
                        Err(e) => warn!("Queue '{}': cannot re-save '{}': {}", self.name, message.id(), e),
                    }
                }
                Decision::allow().with_put_back(policy).kept()
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for PersistentDeliveryHandler {
    async fn initialize(&self, queue: &QueueInfo) -> Result<Vec<QueueMessage>, QueueError> {
        if self.options.depends_on_ack() && queue.options.acknowledge == AckMode::None {
            return Err(QueueError::Configuration(format!(
                "queue '{}': delete-when {:?} / commit-when {:?} need acknowledgements, but the acknowledge mode is None",
                queue.name, self.options.delete_when, self.options.commit_when
            )));
        }

        self.database.open().await?;
        let counts = match &self.tracker {
            Some(tracker) => {
                tracker.load().await?;
                tracker.all().await
            }
            None => Default::default(),
        };

        let restored: Vec<QueueMessage> = self
            .database
            .list()
            .await
            .into_iter()
            .map(|message| {
                let mut restored = QueueMessage::new(message);
                restored.is_saved = true;
                restored.delivery_count = counts.get(restored.id()).copied().unwrap_or(0);
                restored
            })
            .collect();

        info!(
            "Queue '{}': durable store ready at {:?} ({} messages)",
            self.name,
            self.database.path(),
            restored.len()
        );
        Ok(restored)
    }

    async fn received_from_producer(&self, message: &mut QueueMessage) -> anyhow::Result<Decision> {
        let saved = match self.database.insert(&message.message).await {
            Ok(()) => true,
            Err(e) if e.is_duplicate() => {
                warn!("Queue '{}': rejected duplicate '{}'", self.name, message.id());
                return Ok(Decision::deny().with_transmission(Transmission::Failed));
            }
            Err(e) => {
                warn!("Queue '{}': could not save '{}': {}", self.name, message.id(), e);
                false
            }
        };
        message.is_saved = saved;

        let decision = if saved { Decision::allow().saved() } else { Decision::allow() };
        Ok(match self.options.commit_when {
            CommitWhen::AfterReceived => decision.with_transmission(Transmission::Commit),
            CommitWhen::AfterSaved if saved => decision.with_transmission(Transmission::Commit),
            CommitWhen::AfterSaved => Decision::deny().with_transmission(Transmission::Failed),
            CommitWhen::AfterAcknowledge => decision,
        })
    }

    async fn begin_send(&self, message: &mut QueueMessage) -> anyhow::Result<Decision> {
        if let Some(tracker) = &self.tracker {
            let count = match tracker.increment(message.id()).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Queue '{}': cannot persist delivery count of '{}': {}", self.name, message.id(), e);
                    message.delivery_count + 1
                }
            };
            message
                .message
                .headers
                .insert(DELIVERY_COUNT_HEADER.to_string(), count.to_string());
        }
        Ok(Decision::allow())
    }

    async fn end_send(&self, message: &mut QueueMessage) -> anyhow::Result<Decision> {
        if message.current_delivery_receivers.is_empty() {
            return Ok(Decision::allow().with_put_back(PutBack::Regular).kept());
        }
        if self.options.delete_when == DeleteWhen::AfterSend {
            self.discard(message.id()).await;
        }
        Ok(Decision::allow())
    }

    async fn acknowledge_received(
        &self,
        message: &mut QueueMessage,
        _delivery: &MessageDelivery,
        success: bool,
    ) -> anyhow::Result<Decision> {
        if !success {
            return Ok(self.apply_put_back_policy(message, self.options.nack_put_back).await);
        }

        if self.options.delete_when == DeleteWhen::AfterAcknowledge {
            self.discard(message.id()).await;
        }
        let decision = Decision::allow();
        Ok(match self.options.commit_when {
            CommitWhen::AfterAcknowledge => decision.with_transmission(Transmission::Commit),
            _ => decision,
        })
    }

    async fn acknowledge_timed_out(&self, message: &mut QueueMessage, _delivery: &MessageDelivery) -> anyhow::Result<Decision> {
        Ok(self.apply_put_back_policy(message, self.options.ack_timeout_put_back).await)
    }

    async fn message_timed_out(&self, message: &mut QueueMessage) -> anyhow::Result<Decision> {
        self.discard(message.id()).await;
        Ok(Decision::allow().with_transmission(Transmission::Failed))
    }

    async fn message_removed(&self, message: &QueueMessage) -> anyhow::Result<()> {
        self.discard(message.id()).await;
        Ok(())
    }

    async fn queue_cleared(&self) -> anyhow::Result<()> {
        self.database.clear().await?;
        if let Some(tracker) = &self.tracker {
            tracker.clear().await?;
        }
        Ok(())
    }

    async fn shutdown(&self, destroy: bool) -> anyhow::Result<()> {
        if destroy {
            self.database.remove_database().await?;
            if let Some(tracker) = &self.tracker {
                tracker.remove_file().await?;
            }
        } else {
            self.database.close().await?;
            if let Some(tracker) = &self.tracker {
                tracker.close().await?;
            }
        }
        Ok(())
    }

    fn store(&self) -> Option<Arc<Database>> {
        Some(self.database.clone())
    }
}
