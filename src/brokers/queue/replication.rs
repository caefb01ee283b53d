//! Replica sync hooks. Leader election and transport live outside the broker;
//! the manager only announces the start and end of a queue sync.

use async_trait::async_trait;

use crate::brokers::queue::message::Message;

#[async_trait]
pub trait ReplicaSync: Send + Sync {
    /// Streams the live content of `queue` to a replica.
    async fn begin_sync(&self, queue: &str, messages: Vec<Message>) -> anyhow::Result<()>;

    async fn sync_completed(&self, queue: &str) -> anyhow::Result<()>;
}
