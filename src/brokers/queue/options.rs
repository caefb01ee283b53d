use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

// ---------- Enums ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AckMode {
    #[default]
    None,
    /// Consumers are asked to acknowledge, the queue does not wait.
    JustRequest,
    /// Dispatch holds back until the previous delivery resolves.
    WaitForAcknowledge,
}

impl AckMode {
    pub fn requires_ack(self) -> bool {
        !matches!(self, AckMode::None)
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AckMode::None),
            "request" | "just_request" | "justrequest" => Ok(AckMode::JustRequest),
            "wait" | "wait_for_ack" | "waitforacknowledge" => Ok(AckMode::WaitForAcknowledge),
            other => Err(format!("unknown acknowledge mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QueueStatus {
    #[default]
    Push,
    RoundRobin,
    Broadcast,
    Pull,
    Cache,
    Paused,
    Stopped,
}

impl QueueStatus {
    /// Statuses whose drain loop delivers without a consumer asking.
    pub fn is_dispatching(self) -> bool {
        matches!(self, QueueStatus::Push | QueueStatus::RoundRobin | QueueStatus::Broadcast)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueStatus::Push => "push",
            QueueStatus::RoundRobin => "round_robin",
            QueueStatus::Broadcast => "broadcast",
            QueueStatus::Pull => "pull",
            QueueStatus::Cache => "cache",
            QueueStatus::Paused => "paused",
            QueueStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(QueueStatus::Push),
            "round_robin" | "roundrobin" => Ok(QueueStatus::RoundRobin),
            "broadcast" => Ok(QueueStatus::Broadcast),
            "pull" => Ok(QueueStatus::Pull),
            "cache" => Ok(QueueStatus::Cache),
            "paused" | "pause" => Ok(QueueStatus::Paused),
            "stopped" | "stop" => Ok(QueueStatus::Stopped),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowStrategy {
    #[default]
    RejectNew,
    DeleteOldest,
}

impl FromStr for OverflowStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" | "reject_new" | "rejectnew" => Ok(OverflowStrategy::RejectNew),
            "delete_oldest" | "deleteoldest" => Ok(OverflowStrategy::DeleteOldest),
            other => Err(format!("unknown overflow strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoDestroy {
    #[default]
    Disabled,
    /// No consumers attached.
    NoConsumers,
    /// Backlog and in-flight set are empty.
    NoMessages,
    /// Both of the above.
    Empty,
}

impl FromStr for AutoDestroy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(AutoDestroy::Disabled),
            "no_consumers" | "noconsumers" => Ok(AutoDestroy::NoConsumers),
            "no_messages" | "nomessages" => Ok(AutoDestroy::NoMessages),
            "empty" => Ok(AutoDestroy::Empty),
            other => Err(format!("unknown auto-destroy policy '{}'", other)),
        }
    }
}

// ---------- QueueOptions ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub status: QueueStatus,
    pub acknowledge: AckMode,
    pub acknowledge_timeout_ms: u64,
    /// 0 disables the queue-level deadline.
    pub message_timeout_ms: u64,
    /// 0 means unlimited.
    pub client_limit: usize,
    /// 0 means unlimited.
    pub message_limit: usize,
    pub overflow: OverflowStrategy,
    pub delay_between_messages_ms: u64,
    pub put_back_delay_ms: u64,
    pub auto_destroy: AutoDestroy,
    pub auto_destroy_idle_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            status: QueueStatus::Push,
            acknowledge: AckMode::None,
            acknowledge_timeout_ms: 15_000,
            message_timeout_ms: 0,
            client_limit: 0,
            message_limit: 0,
            overflow: OverflowStrategy::RejectNew,
            delay_between_messages_ms: 0,
            put_back_delay_ms: 0,
            auto_destroy: AutoDestroy::Disabled,
            auto_destroy_idle_ms: 30_000,
        }
    }
}

impl QueueOptions {
    pub fn with_status(mut self, status: QueueStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_ack(mut self, acknowledge: AckMode) -> Self {
        self.acknowledge = acknowledge;
        self
    }

    pub fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.acknowledge_timeout_ms = ms;
        self
    }

    pub fn with_message_timeout_ms(mut self, ms: u64) -> Self {
        self.message_timeout_ms = ms;
        self
    }

    pub fn with_message_limit(mut self, limit: usize, overflow: OverflowStrategy) -> Self {
        self.message_limit = limit;
        self.overflow = overflow;
        self
    }

    pub fn with_client_limit(mut self, limit: usize) -> Self {
        self.client_limit = limit;
        self
    }

    pub fn with_auto_destroy(mut self, policy: AutoDestroy, idle_ms: u64) -> Self {
        self.auto_destroy = policy;
        self.auto_destroy_idle_ms = idle_ms;
        self
    }

    pub fn waits_for_ack(&self) -> bool {
        self.acknowledge == AckMode::WaitForAcknowledge
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.acknowledge.requires_ack() && self.acknowledge_timeout_ms == 0 {
            return Err(QueueError::Configuration(
                "acknowledge timeout must be greater than zero when acknowledgements are requested".into(),
            ));
        }
        Ok(())
    }
}

// ---------- Names ----------

const MAX_QUEUE_NAME_LEN: usize = 256;

/// Queue names are case-insensitive. Returns the normalized (lowercase) name.
pub fn validate_queue_name(name: &str) -> Result<String, QueueError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_QUEUE_NAME_LEN || trimmed != name {
        return Err(QueueError::InvalidName(name.to_string()));
    }
    if name.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
        return Err(QueueError::InvalidName(name.to_string()));
    }
    Ok(name.to_lowercase())
}

/// File stem for a queue's on-disk files. Bytes outside `[a-z0-9-_.]` are
/// written as `%xx`, so distinct names never share a stem.
pub fn queue_file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for byte in name.to_lowercase().bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => stem.push(byte as char),
            _ => stem.push_str(&format!("%{:02x}", byte)),
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        assert_eq!(validate_queue_name("Orders").unwrap(), "orders");
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(" padded ").is_err());
        assert!(validate_queue_name("a/b").is_err());
        assert!(validate_queue_name(&"x".repeat(MAX_QUEUE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_file_stem_is_deterministic() {
        assert_eq!(queue_file_stem("Orders.EU"), "orders.eu");
        assert_eq!(queue_file_stem("a b:c"), "a%20b%3ac");
        assert_eq!(queue_file_stem("Ünï"), "%c3%bcn%c3%af");
    }

    #[test]
    fn test_distinct_names_get_distinct_stems() {
        let stems: std::collections::HashSet<String> =
            ["a b", "a:b", "a_b", "a%20b", "a.b"].iter().map(|n| queue_file_stem(n)).collect();
        assert_eq!(stems.len(), 5);
    }

    #[test]
    fn test_enum_parsing_is_case_insensitive() {
        assert_eq!("WAIT".parse::<AckMode>().unwrap(), AckMode::WaitForAcknowledge);
        assert_eq!("Round_Robin".parse::<QueueStatus>().unwrap(), QueueStatus::RoundRobin);
        assert_eq!("delete_oldest".parse::<OverflowStrategy>().unwrap(), OverflowStrategy::DeleteOldest);
        assert_eq!("Empty".parse::<AutoDestroy>().unwrap(), AutoDestroy::Empty);
        assert!("sometimes".parse::<AckMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ack_timeout() {
        let opts = QueueOptions::default()
            .with_ack(AckMode::WaitForAcknowledge)
            .with_ack_timeout_ms(0);
        assert!(matches!(opts.validate(), Err(QueueError::Configuration(_))));
        assert!(QueueOptions::default().with_ack_timeout_ms(0).validate().is_ok());
    }
}
