use std::collections::BTreeMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::brokers::queue::consumer::ConsumerId;
use crate::brokers::queue::decision::{Decision, Transmission};
use crate::utils::current_time_ms;

/// Header stamped on every send when redelivery tracking is enabled.
pub const DELIVERY_COUNT_HEADER: &str = "Delivery-Count";

// ---------- Message ----------

/// A decoded producer message. The transport hands these to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
    #[serde(default)]
    pub high_priority: bool,
    pub created_at: u64,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            headers: BTreeMap::new(),
            payload: payload.into(),
            high_priority: false,
            created_at: current_time_ms(),
        }
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

// ---------- QueueMessage ----------

/// Broker-side envelope around a message while the queue owns it.
#[derive(Debug)]
pub struct QueueMessage {
    pub message: Message,
    pub is_in_queue: bool,
    /// Queue-level expiry (ms since epoch).
    pub deadline: Option<u64>,
    pub delivery_count: u32,
    pub send_count: u32,
    /// The active handler holds a durable copy.
    pub is_saved: bool,
    /// Consumers currently holding this message and owing an acknowledgement.
    pub current_delivery_receivers: Vec<ConsumerId>,
    pub decision: Decision,
    producer: Option<oneshot::Sender<Transmission>>,
}

impl QueueMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            is_in_queue: false,
            deadline: None,
            delivery_count: 0,
            send_count: 0,
            is_saved: false,
            current_delivery_receivers: Vec::new(),
            decision: Decision::allow(),
            producer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn is_high_priority(&self) -> bool {
        self.message.high_priority
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }

    pub(crate) fn attach_producer(&mut self, tx: oneshot::Sender<Transmission>) {
        self.producer = Some(tx);
    }

    /// Reports the transmission outcome to the producer. Only the first report is delivered.
    pub(crate) fn notify_producer(&mut self, transmission: Transmission) -> bool {
        if transmission == Transmission::None {
            return false;
        }
        match self.producer.take() {
            Some(tx) => tx.send(transmission).is_ok(),
            None => false,
        }
    }
}

// ---------- MessageDelivery ----------

/// One (message, consumer) pairing in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDelivery {
    pub message_id: String,
    pub consumer_id: ConsumerId,
    pub ack_deadline: Option<u64>,
    pub sent_at: u64,
    pub is_sent: bool,
    /// Acknowledged or negatively acknowledged.
    pub is_acknowledged: bool,
    pub is_timed_out: bool,
}

impl MessageDelivery {
    pub fn new(message_id: &str, consumer_id: &str, ack_deadline: Option<u64>) -> Self {
        Self {
            message_id: message_id.to_string(),
            consumer_id: consumer_id.to_string(),
            ack_deadline,
            sent_at: current_time_ms(),
            is_sent: false,
            is_acknowledged: false,
            is_timed_out: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.is_acknowledged || self.is_timed_out
    }

    pub fn is_expired(&self, now: u64) -> bool {
        !self.is_resolved() && matches!(self.ack_deadline, Some(deadline) if deadline <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_notified_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut msg = QueueMessage::new(Message::new("x"));
        msg.attach_producer(tx);

        assert!(!msg.notify_producer(Transmission::None));
        assert!(msg.notify_producer(Transmission::Commit));
        assert!(!msg.notify_producer(Transmission::Failed));
        assert_eq!(rx.try_recv().unwrap(), Transmission::Commit);
    }

    #[test]
    fn test_expiry() {
        let mut msg = QueueMessage::new(Message::new("x"));
        assert!(!msg.is_expired(u64::MAX));
        msg.deadline = Some(100);
        assert!(!msg.is_expired(99));
        assert!(msg.is_expired(100));
    }

    #[test]
    fn test_delivery_expiry_ignores_resolved() {
        let mut delivery = MessageDelivery::new("m", "c", Some(10));
        assert!(delivery.is_expired(10));
        delivery.is_acknowledged = true;
        assert!(!delivery.is_expired(10));
    }

    #[test]
    fn test_message_builders() {
        let msg = Message::with_id("m1", "body").high_priority().with_header("k", "v");
        assert_eq!(msg.id, "m1");
        assert!(msg.high_priority);
        assert_eq!(msg.header("k"), Some("v"));
        assert_eq!(msg.header("missing"), None);
    }
}
