//! In-flight deliveries awaiting acknowledgement.
//!
//! Each tracked message owns an `InFlight` entry behind its own async mutex.
//! The send pipeline locks the entry before the first byte leaves, so an
//! acknowledgement that races the pipeline waits for it instead of missing it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::brokers::queue::consumer::ConsumerId;
use crate::brokers::queue::decision::Decision;
use crate::brokers::queue::message::{MessageDelivery, QueueMessage};

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    pub message: Option<QueueMessage>,
    pub deliveries: Vec<MessageDelivery>,
    /// Merged outcome of the acknowledgements seen so far.
    pub decision: Decision,
    pub finished: bool,
}

impl InFlight {
    pub fn all_resolved(&self) -> bool {
        self.deliveries.iter().all(MessageDelivery::is_resolved)
    }
}

pub(crate) type InFlightEntry = Arc<Mutex<InFlight>>;

pub(crate) struct DeliveryTracker {
    entries: parking_lot::Mutex<HashMap<String, InFlightEntry>>,
    busy: parking_lot::Mutex<HashMap<ConsumerId, usize>>,
    pending: watch::Sender<usize>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
            busy: parking_lot::Mutex::new(HashMap::new()),
            pending,
        }
    }

    /// Registers a new entry and returns it already locked.
    /// `None` when the id is already in flight.
    pub fn begin(&self, message_id: &str) -> Option<OwnedMutexGuard<InFlight>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(message_id) {
            return None;
        }
        let entry: InFlightEntry = Arc::new(Mutex::new(InFlight::default()));
        let guard = entry.clone().try_lock_owned().ok()?;
        entries.insert(message_id.to_string(), entry);
        self.pending.send_replace(entries.len());
        Some(guard)
    }

    pub fn get(&self, message_id: &str) -> Option<InFlightEntry> {
        self.entries.lock().get(message_id).cloned()
    }

    pub fn remove(&self, message_id: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(message_id).is_some() {
            self.pending.send_replace(entries.len());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    pub fn mark_busy(&self, consumer: &str) {
        *self.busy.lock().entry(consumer.to_string()).or_insert(0) += 1;
    }

    pub fn release(&self, consumer: &str) {
        let mut busy = self.busy.lock();
        if let Some(count) = busy.get_mut(consumer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                busy.remove(consumer);
            }
        }
    }

    pub fn is_busy(&self, consumer: &str) -> bool {
        self.busy.lock().contains_key(consumer)
    }

    /// (message id, consumer id) pairs whose ack deadline has passed.
    /// Entries still held by a send pipeline are skipped until the next scan.
    pub fn expired(&self, now: u64) -> Vec<(String, ConsumerId)> {
        let entries: Vec<(String, InFlightEntry)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, entry) in entries {
            let Ok(inflight) = entry.try_lock() else { continue };
            for delivery in inflight.deliveries.iter().filter(|d| d.is_expired(now)) {
                expired.push((id.clone(), delivery.consumer_id.clone()));
            }
        }
        expired
    }

    /// Drops every tracked delivery, returning the messages that were held.
    pub fn reset(&self) -> Vec<QueueMessage> {
        let drained: Vec<InFlightEntry> = {
            let mut entries = self.entries.lock();
            let drained = entries.drain().map(|(_, entry)| entry).collect();
            self.pending.send_replace(0);
            drained
        };
        self.busy.lock().clear();

        drained
            .into_iter()
            .filter_map(|entry| {
                let mut inflight = entry.try_lock().ok()?;
                inflight.finished = true;
                inflight.message.take()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::queue::message::Message;

    #[tokio::test]
    async fn test_begin_rejects_duplicate_in_flight() {
        let tracker = DeliveryTracker::new();
        let guard = tracker.begin("m1");
        assert!(guard.is_some());
        assert!(tracker.begin("m1").is_none());
        assert_eq!(*tracker.subscribe().borrow(), 1);

        drop(guard);
        tracker.remove("m1");
        assert!(tracker.is_empty());
        assert_eq!(*tracker.subscribe().borrow(), 0);
    }

    #[tokio::test]
    async fn test_expired_skips_resolved() {
        let tracker = DeliveryTracker::new();
        {
            let mut guard = tracker.begin("m1").unwrap();
            guard.message = Some(QueueMessage::new(Message::with_id("m1", "x")));
            guard.deliveries.push(MessageDelivery::new("m1", "a", Some(10)));
            let mut acked = MessageDelivery::new("m1", "b", Some(10));
            acked.is_acknowledged = true;
            guard.deliveries.push(acked);
        }

        let expired = tracker.expired(11);
        assert_eq!(expired, vec![("m1".to_string(), "a".to_string())]);
        assert!(tracker.expired(5).is_empty());
    }

    #[test]
    fn test_busy_counts() {
        let tracker = DeliveryTracker::new();
        tracker.mark_busy("a");
        tracker.mark_busy("a");
        tracker.release("a");
        assert!(tracker.is_busy("a"));
        tracker.release("a");
        assert!(!tracker.is_busy("a"));
    }
}
