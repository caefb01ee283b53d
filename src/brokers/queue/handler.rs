//! Delivery handler: the hooks a queue calls at every step of a message's life.
//!
//! Hook order per message:
//! `received_from_producer` -> `message_dequeued` -> `begin_send` ->
//! per consumer {`can_consumer_receive`, send, `consumer_received` | `consumer_receive_failed`} ->
//! `end_send`, and later `acknowledge_received` / `acknowledge_timed_out` / `message_timed_out`.
//!
//! Hooks return `anyhow::Result`. The queue routes every error (and every panic)
//! to `exception_thrown` and keeps running.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::warn;

use crate::brokers::queue::decision::{Decision, PutBack, Transmission};
use crate::brokers::queue::message::{MessageDelivery, QueueMessage};
use crate::brokers::queue::options::QueueOptions;
use crate::brokers::queue::persistence::Database;
use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    ReceivedFromProducer,
    MessageDequeued,
    BeginSend,
    CanConsumerReceive,
    ConsumerReceived,
    ConsumerReceiveFailed,
    EndSend,
    AcknowledgeReceived,
    AcknowledgeTimedOut,
    MessageTimedOut,
    MessageRemoved,
    QueueCleared,
    Encode,
}

/// What a handler learns about its queue at initialization.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub options: QueueOptions,
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Validates the queue configuration and returns messages to restore.
    async fn initialize(&self, _queue: &QueueInfo) -> Result<Vec<QueueMessage>, QueueError> {
        Ok(Vec::new())
    }

    async fn received_from_producer(&self, _message: &mut QueueMessage) -> anyhow::Result<Decision> {
        Ok(Decision::allow().with_transmission(Transmission::Commit))
    }

    async fn message_dequeued(&self, _message: &QueueMessage) -> anyhow::Result<()> {
        Ok(())
    }

    async fn begin_send(&self, _message: &mut QueueMessage) -> anyhow::Result<Decision> {
        Ok(Decision::allow())
    }

    async fn can_consumer_receive(&self, _message: &QueueMessage, _consumer: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn consumer_received(&self, _message: &QueueMessage, _delivery: &MessageDelivery) -> anyhow::Result<Decision> {
        Ok(Decision::allow())
    }

    async fn consumer_receive_failed(&self, _message: &QueueMessage, _delivery: &MessageDelivery) -> anyhow::Result<Decision> {
        Ok(Decision::allow())
    }

    /// Default: nobody got it, so it goes back.
    async fn end_send(&self, message: &mut QueueMessage) -> anyhow::Result<Decision> {
        if message.current_delivery_receivers.is_empty() {
            Ok(Decision::allow().with_put_back(PutBack::Regular))
        } else {
            Ok(Decision::allow())
        }
    }

    async fn acknowledge_received(
        &self,
        _message: &mut QueueMessage,
        _delivery: &MessageDelivery,
        success: bool,
    ) -> anyhow::Result<Decision> {
        if success {
            Ok(Decision::allow())
        } else {
            Ok(Decision::allow().with_transmission(Transmission::Failed))
        }
    }

    async fn acknowledge_timed_out(&self, _message: &mut QueueMessage, _delivery: &MessageDelivery) -> anyhow::Result<Decision> {
        Ok(Decision::allow().with_put_back(PutBack::Regular))
    }

    async fn message_timed_out(&self, _message: &mut QueueMessage) -> anyhow::Result<Decision> {
        Ok(Decision::allow().with_transmission(Transmission::Failed))
    }

    /// The message left the queue for good.
    async fn message_removed(&self, _message: &QueueMessage) -> anyhow::Result<()> {
        Ok(())
    }

    async fn queue_cleared(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn exception_thrown(&self, hook: Hook, message: Option<&QueueMessage>, error: &anyhow::Error) -> Decision {
        warn!(
            "Delivery handler fault in {:?} (message {:?}): {:#}",
            hook,
            message.map(QueueMessage::id),
            error
        );
        Decision::allow()
    }

    /// `destroy` removes durable state as well.
    async fn shutdown(&self, _destroy: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn store(&self) -> Option<Arc<Database>> {
        None
    }
}

/// In-memory handler: commits on receipt, nothing is persisted.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughHandler;

#[async_trait]
impl DeliveryHandler for PassThroughHandler {}

/// Runs a hook future, turning a panic into an error.
pub(crate) async fn catch_hook<T, F>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::queue::message::Message;

    async fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_catch_hook_converts_panic() {
        let result = catch_hook(explode()).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_default_end_send_puts_back_unreceived() {
        let handler = PassThroughHandler;
        let mut msg = QueueMessage::new(Message::new("x"));
        let decision = handler.end_send(&mut msg).await.unwrap();
        assert_eq!(decision.put_back, PutBack::Regular);

        msg.current_delivery_receivers.push("c1".into());
        let decision = handler.end_send(&mut msg).await.unwrap();
        assert_eq!(decision.put_back, PutBack::No);
    }
}
