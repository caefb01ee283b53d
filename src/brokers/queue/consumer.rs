//! Transport seam: the queue only needs to know whether a consumer is
//! connected and how to hand it a pre-encoded payload.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub type ConsumerId = String;

#[async_trait]
pub trait ConsumerSink: Send + Sync {
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Sends one encoded message. A failed send is an ordinary outcome (disconnects happen).
    async fn send(&self, payload: Bytes) -> anyhow::Result<()>;
}

/// In-process consumer backed by a tokio mpsc channel.
pub struct ChannelConsumer {
    id: ConsumerId,
    tx: mpsc::Sender<Bytes>,
}

impl ChannelConsumer {
    pub fn new(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id: id.into(), tx }, rx)
    }
}

#[async_trait]
impl ConsumerSink for ChannelConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| anyhow::anyhow!("consumer '{}' disconnected", self.id))
    }
}
