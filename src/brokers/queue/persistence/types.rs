use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::brokers::queue::decision::PutBack;
use crate::error::StoreError;

// ---------- Store options ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    /// fsync after every mutation.
    pub instant_flush: bool,
    pub auto_flush: bool,
    pub flush_interval_ms: u64,
    pub auto_shrink: bool,
    pub shrink_interval_ms: u64,
    pub create_backup_on_shrink: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            instant_flush: false,
            auto_flush: true,
            flush_interval_ms: 50,
            auto_shrink: true,
            shrink_interval_ms: 60_000,
            create_backup_on_shrink: false,
        }
    }
}

// ---------- Error hints ----------

/// Which store operation an error-hint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    Insert,
    Delete,
    Shrink,
    Backup,
    DeleteFile,
    ShrinkAfterLoad,
    SyncShrinkFiles,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Out-of-band channel for transient store failures. The failing operation
/// still returns its error to the caller.
pub type ErrorHint = Arc<dyn Fn(StoreErrorKind, &StoreError) + Send + Sync>;

// ---------- ShrinkInfo ----------

#[derive(Debug, Clone, Default)]
pub struct ShrinkInfo {
    pub successful: bool,
    pub prepare_duration: Duration,
    pub truncate_duration: Duration,
    pub sync_duration: Duration,
    pub old_size: u64,
    pub new_size: u64,
    pub error: Option<String>,
}

impl ShrinkInfo {
    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            successful: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.prepare_duration + self.truncate_duration + self.sync_duration
    }
}

// ---------- Durable handler policies ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeleteWhen {
    #[default]
    AfterAcknowledge,
    AfterSend,
}

impl FromStr for DeleteWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "after_send" | "aftersend" | "send" => Ok(DeleteWhen::AfterSend),
            "after_ack" | "after_acknowledge" | "afteracknowledge" | "ack" => Ok(DeleteWhen::AfterAcknowledge),
            other => Err(format!("unknown delete-when policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommitWhen {
    AfterReceived,
    #[default]
    AfterSaved,
    AfterAcknowledge,
}

impl FromStr for CommitWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "after_received" | "afterreceived" | "received" => Ok(CommitWhen::AfterReceived),
            "after_saved" | "aftersaved" | "saved" => Ok(CommitWhen::AfterSaved),
            "after_ack" | "after_acknowledge" | "afteracknowledge" | "ack" => Ok(CommitWhen::AfterAcknowledge),
            other => Err(format!("unknown commit-when policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceOptions {
    pub delete_when: DeleteWhen,
    pub commit_when: CommitWhen,
    pub nack_put_back: PutBack,
    pub ack_timeout_put_back: PutBack,
    pub use_redelivery: bool,
    pub database: DatabaseOptions,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            delete_when: DeleteWhen::AfterAcknowledge,
            commit_when: CommitWhen::AfterSaved,
            nack_put_back: PutBack::Regular,
            ack_timeout_put_back: PutBack::Regular,
            use_redelivery: false,
            database: DatabaseOptions::default(),
        }
    }
}

impl PersistenceOptions {
    pub fn depends_on_ack(&self) -> bool {
        self.delete_when == DeleteWhen::AfterAcknowledge
            || self.commit_when == CommitWhen::AfterAcknowledge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("AFTER_SEND".parse::<DeleteWhen>().unwrap(), DeleteWhen::AfterSend);
        assert_eq!("ack".parse::<CommitWhen>().unwrap(), CommitWhen::AfterAcknowledge);
        assert!("later".parse::<CommitWhen>().is_err());
    }

    #[test]
    fn test_depends_on_ack() {
        let mut opts = PersistenceOptions {
            delete_when: DeleteWhen::AfterSend,
            commit_when: CommitWhen::AfterSaved,
            ..Default::default()
        };
        assert!(!opts.depends_on_ack());
        opts.commit_when = CommitWhen::AfterAcknowledge;
        assert!(opts.depends_on_ack());
    }
}
