pub mod database;
pub mod handler;
pub mod record;
pub mod redelivery;
pub mod types;

pub use database::Database;
pub use handler::PersistentDeliveryHandler;
pub use redelivery::RedeliveryTracker;
pub use types::{
    CommitWhen, DatabaseOptions, DeleteWhen, ErrorHint, PersistenceOptions, ShrinkInfo, StoreErrorKind,
};
