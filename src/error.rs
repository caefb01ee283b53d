//! Error taxonomy shared by the store, the delivery protocol and the queue manager.

use thiserror::Error;

/// Failures raised by the append-only message store and the redelivery tracker.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message '{0}' is already stored")]
    Duplicate(String),

    #[error("store is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue name '{0}'")]
    InvalidName(String),

    #[error("queue '{0}' already exists")]
    AlreadyExists(String),

    #[error("queue '{0}' not found")]
    NotFound(String),

    #[error("queue '{0}' not found and automatic creation is disabled")]
    AutoCreateDisabled(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("client limit of {0} reached")]
    ClientLimitExceeded(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_distinguishable() {
        let err = StoreError::Duplicate("m1".into());
        assert!(err.is_duplicate());
        assert!(!StoreError::Closed.is_duplicate());
        assert_eq!(err.to_string(), "message 'm1' is already stored");
    }

    #[test]
    fn test_store_error_converts_into_queue_error() {
        let err: QueueError = StoreError::Closed.into();
        assert!(matches!(err, QueueError::Store(StoreError::Closed)));
    }
}
