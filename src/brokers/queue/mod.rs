//! Queue delivery engine: per-queue state machine, delivery hooks, the
//! durable store and the manager that owns every queue.

pub mod codec;
pub mod consumer;
pub mod decision;
pub(crate) mod delivery;
pub mod events;
pub mod handler;
pub mod message;
pub mod options;
pub mod persistence;
#[allow(clippy::module_inception)]
pub mod queue;
pub mod queue_manager;
pub mod replication;
pub mod states;
pub mod stats;
pub(crate) mod sweeper;

pub use codec::{JsonCodec, MessageCodec};
pub use consumer::{ChannelConsumer, ConsumerId, ConsumerSink};
pub use decision::{Decision, PutBack, Transmission};
pub use events::{EventListener, QueueEvent};
pub use handler::{DeliveryHandler, Hook, PassThroughHandler, QueueInfo};
pub use message::{Message, MessageDelivery, QueueMessage, DELIVERY_COUNT_HEADER};
pub use options::{AckMode, AutoDestroy, OverflowStrategy, QueueOptions, QueueStatus};
pub use queue::{MessageInfo, Queue, QueueSnapshot};
pub use queue_manager::{ManagerOptions, QueueManager};
pub use replication::ReplicaSync;
pub use states::{ClearAfter, PullOrder, PullRequest, PullResult, PushResult};
pub use stats::StatsSnapshot;
