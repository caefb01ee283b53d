use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

/// Running per-queue counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    received: AtomicU64,
    sent: AtomicU64,
    acknowledged: AtomicU64,
    negative_acknowledged: AtomicU64,
    ack_timed_out: AtomicU64,
    message_timed_out: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub sent: u64,
    pub acknowledged: u64,
    pub negative_acknowledged: u64,
    pub ack_timed_out: u64,
    pub message_timed_out: u64,
    pub errors: u64,
}

impl QueueStats {
    pub fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn acknowledged(&self, success: bool) {
        if success {
            self.acknowledged.fetch_add(1, Ordering::Relaxed);
        } else {
            self.negative_acknowledged.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn ack_timed_out(&self) {
        self.ack_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_timed_out(&self) {
        self.message_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            negative_acknowledged: self.negative_acknowledged.load(Ordering::Relaxed),
            ack_timed_out: self.ack_timed_out.load(Ordering::Relaxed),
            message_timed_out: self.message_timed_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
