//! Queue states: one variant per `QueueStatus`.
//!
//! The queue holds exactly one active `QueueState` and only `Queue::set_status`
//! replaces it (`leave` on the old state, swap, `enter` on the new one).

mod broadcast;
mod cache;
mod pause;
mod pull;
mod push;
mod round_robin;
mod stopped;

use serde::{Deserialize, Serialize};

use crate::brokers::queue::message::QueueMessage;
use crate::brokers::queue::options::QueueStatus;
use crate::brokers::queue::queue::Queue;

pub use broadcast::BroadcastState;
pub use cache::CacheState;
pub use pause::PausedState;
pub use pull::PullState;
pub use push::PushState;
pub use round_robin::RoundRobinState;
pub use stopped::StoppedState;

// ---------- Results ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Success,
    /// Nobody to deliver to; the message was not queued.
    NoConsumers,
    StatusNotSupported,
    LimitExceeded,
    /// The delivery handler refused the message.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    Delivered(usize),
    Empty,
    StatusNotSupported,
    UnknownConsumer,
    /// A previous delivery is still waiting for its acknowledgement.
    AwaitingAcknowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterResult {
    Allow,
    /// Drain the backlog right after the swap.
    AllowAndTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Delivered,
    Idle,
}

// ---------- Pull request ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PullOrder {
    #[default]
    Fifo,
    Lifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClearAfter {
    #[default]
    None,
    Priority,
    Regular,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub count: usize,
    pub order: PullOrder,
    pub clear_after: ClearAfter,
}

impl Default for PullRequest {
    fn default() -> Self {
        Self {
            count: 1,
            order: PullOrder::Fifo,
            clear_after: ClearAfter::None,
        }
    }
}

impl PullRequest {
    pub fn count(count: usize) -> Self {
        Self { count, ..Default::default() }
    }

    pub fn with_order(mut self, order: PullOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_clear_after(mut self, clear_after: ClearAfter) -> Self {
        self.clear_after = clear_after;
        self
    }
}

// ---------- QueueState ----------

pub(crate) enum QueueState {
    Push(PushState),
    RoundRobin(RoundRobinState),
    Broadcast(BroadcastState),
    Pull(PullState),
    Cache(CacheState),
    Paused(PausedState),
    Stopped(StoppedState),
}

impl QueueState {
    pub fn for_status(status: QueueStatus) -> Self {
        match status {
            QueueStatus::Push => QueueState::Push(PushState),
            QueueStatus::RoundRobin => QueueState::RoundRobin(RoundRobinState::default()),
            QueueStatus::Broadcast => QueueState::Broadcast(BroadcastState),
            QueueStatus::Pull => QueueState::Pull(PullState),
            QueueStatus::Cache => QueueState::Cache(CacheState),
            QueueStatus::Paused => QueueState::Paused(PausedState),
            QueueStatus::Stopped => QueueState::Stopped(StoppedState),
        }
    }

    pub fn status(&self) -> QueueStatus {
        match self {
            QueueState::Push(_) => QueueStatus::Push,
            QueueState::RoundRobin(_) => QueueStatus::RoundRobin,
            QueueState::Broadcast(_) => QueueStatus::Broadcast,
            QueueState::Pull(_) => QueueStatus::Pull,
            QueueState::Cache(_) => QueueStatus::Cache,
            QueueState::Paused(_) => QueueStatus::Paused,
            QueueState::Stopped(_) => QueueStatus::Stopped,
        }
    }

    /// Whether the drain loop holds back while a delivery awaits its acknowledgement.
    pub fn gates_on_ack(&self) -> bool {
        matches!(self, QueueState::Push(_) | QueueState::RoundRobin(_))
    }

    pub fn can_enqueue(&self, queue: &Queue, message: &QueueMessage) -> bool {
        match self {
            QueueState::Broadcast(s) => s.can_enqueue(queue, message),
            QueueState::Stopped(_) => false,
            _ => true,
        }
    }

    pub fn reject_reason(&self) -> PushResult {
        match self {
            QueueState::Broadcast(_) => PushResult::NoConsumers,
            _ => PushResult::StatusNotSupported,
        }
    }

    /// Takes ownership of an admitted message.
    pub async fn accept(&self, queue: &Queue, message: QueueMessage) -> PushResult {
        match self {
            QueueState::Broadcast(s) => s.accept(queue, message).await,
            QueueState::Cache(s) => s.accept(queue, message).await,
            QueueState::Stopped(s) => s.accept(queue, message),
            QueueState::Push(_) | QueueState::RoundRobin(_) | QueueState::Pull(_) | QueueState::Paused(_) => {
                queue.enqueue(message);
                PushResult::Success
            }
        }
    }

    /// Delivers the next queued message, if the state delivers on its own.
    pub async fn dispatch_next(&self, queue: &Queue) -> DispatchOutcome {
        match self {
            QueueState::Push(s) => s.dispatch_next(queue).await,
            QueueState::RoundRobin(s) => s.dispatch_next(queue).await,
            QueueState::Broadcast(s) => s.dispatch_next(queue).await,
            _ => DispatchOutcome::Idle,
        }
    }

    pub async fn pull(&self, queue: &Queue, consumer: &str, request: PullRequest) -> PullResult {
        match self {
            QueueState::Pull(s) => s.pull(queue, consumer, request).await,
            QueueState::Cache(s) => s.pull(queue, consumer).await,
            _ => PullResult::StatusNotSupported,
        }
    }

    pub async fn enter(&self, queue: &Queue, previous: QueueStatus) -> EnterResult {
        match self {
            QueueState::Push(_) | QueueState::RoundRobin(_) | QueueState::Broadcast(_) => EnterResult::AllowAndTrigger,
            QueueState::Cache(s) => s.enter(queue).await,
            QueueState::Stopped(s) => s.enter(queue, previous).await,
            QueueState::Pull(_) | QueueState::Paused(_) => EnterResult::Allow,
        }
    }

    pub async fn leave(&self, queue: &Queue, next: QueueStatus) {
        if let QueueState::Stopped(s) = self {
            s.leave(queue, next);
        }
    }
}
