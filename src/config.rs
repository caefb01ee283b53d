use std::env;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use tracing::warn;

use crate::brokers::queue::decision::PutBack;
use crate::brokers::queue::options::{AckMode, AutoDestroy, OverflowStrategy, QueueOptions};
use crate::brokers::queue::persistence::{CommitWhen, DatabaseOptions, DeleteWhen, PersistenceOptions};

static CONFIG: OnceCell<Config> = OnceCell::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub queue: QueueDefaults,
    pub persistence: PersistenceDefaults,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    pub fn load() -> Self {
        dotenv::dotenv().ok();
        let queue = QueueDefaults::load();
        let mut persistence = PersistenceDefaults::load();
        persistence.align_with_ack(queue.acknowledge);
        Self {
            broker: BrokerConfig::load(),
            queue,
            persistence,
        }
    }
}

// --- MODULES ---

// BROKER
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub data_dir: String,
    pub auto_create_queues: bool,
    pub sweep_interval_ms: u64,
    pub auto_destroy_check_ms: u64,
    pub log_level: String,
}

impl BrokerConfig {
    fn load() -> Self {
        Self {
            data_dir:              get_env("TIDEMQ_DATA_DIR", "./data/queues".to_string()),
            auto_create_queues:    get_env("TIDEMQ_AUTO_CREATE", true),
            sweep_interval_ms:     get_env("TIDEMQ_SWEEP_INTERVAL_MS", 1000),
            auto_destroy_check_ms: get_env("TIDEMQ_AUTO_DESTROY_CHECK_MS", 5000),
            log_level:             get_env("TIDEMQ_LOG", "info".to_string()),
        }
    }
}

// QUEUE
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub acknowledge: AckMode,
    pub acknowledge_timeout_ms: u64,
    pub message_timeout_ms: u64,
    pub message_limit: usize,
    pub overflow: OverflowStrategy,
    pub client_limit: usize,
    pub delay_between_messages_ms: u64,
    pub put_back_delay_ms: u64,
    pub auto_destroy: AutoDestroy,
    pub auto_destroy_idle_ms: u64,
}

impl QueueDefaults {
    fn load() -> Self {
        Self {
            acknowledge:               get_env("TIDEMQ_QUEUE_ACK", AckMode::None),
            acknowledge_timeout_ms:    get_env("TIDEMQ_QUEUE_ACK_TIMEOUT_MS", 15_000),
            message_timeout_ms:        get_env("TIDEMQ_QUEUE_MESSAGE_TIMEOUT_MS", 0),
            message_limit:             get_env("TIDEMQ_QUEUE_MESSAGE_LIMIT", 0),
            overflow:                  get_env("TIDEMQ_QUEUE_OVERFLOW", OverflowStrategy::RejectNew),
            client_limit:              get_env("TIDEMQ_QUEUE_CLIENT_LIMIT", 0),
            delay_between_messages_ms: get_env("TIDEMQ_QUEUE_DELAY_MS", 0),
            put_back_delay_ms:         get_env("TIDEMQ_QUEUE_PUT_BACK_DELAY_MS", 0),
            auto_destroy:              get_env("TIDEMQ_QUEUE_AUTO_DESTROY", AutoDestroy::Disabled),
            auto_destroy_idle_ms:      get_env("TIDEMQ_QUEUE_AUTO_DESTROY_IDLE_MS", 30_000),
        }
    }

    pub fn to_options(&self) -> QueueOptions {
        QueueOptions {
            acknowledge: self.acknowledge,
            acknowledge_timeout_ms: self.acknowledge_timeout_ms,
            message_timeout_ms: self.message_timeout_ms,
            client_limit: self.client_limit,
            message_limit: self.message_limit,
            overflow: self.overflow,
            delay_between_messages_ms: self.delay_between_messages_ms,
            put_back_delay_ms: self.put_back_delay_ms,
            auto_destroy: self.auto_destroy,
            auto_destroy_idle_ms: self.auto_destroy_idle_ms,
            ..QueueOptions::default()
        }
    }
}

// PERSISTENCE
#[derive(Debug, Clone)]
pub struct PersistenceDefaults {
    /// Auto-created queues get a durable handler.
    pub durable_by_default: bool,
    pub instant_flush: bool,
    pub auto_flush: bool,
    pub flush_interval_ms: u64,
    pub auto_shrink: bool,
    pub shrink_interval_ms: u64,
    pub create_backup_on_shrink: bool,
    pub use_redelivery: bool,
    pub delete_when: DeleteWhen,
    pub commit_when: CommitWhen,
    pub nack_put_back: PutBack,
    pub ack_timeout_put_back: PutBack,
}

impl PersistenceDefaults {
    fn load() -> Self {
        Self {
            durable_by_default:      get_env("TIDEMQ_DURABLE", false),
            instant_flush:           get_env("TIDEMQ_DB_INSTANT_FLUSH", false),
            auto_flush:              get_env("TIDEMQ_DB_AUTO_FLUSH", true),
            flush_interval_ms:       get_env("TIDEMQ_DB_FLUSH_MS", 50),
            auto_shrink:             get_env("TIDEMQ_DB_AUTO_SHRINK", true),
            shrink_interval_ms:      get_env("TIDEMQ_DB_SHRINK_MS", 60_000),
            create_backup_on_shrink: get_env("TIDEMQ_DB_BACKUP_ON_SHRINK", false),
            use_redelivery:          get_env("TIDEMQ_REDELIVERY", false),
            delete_when:             get_env("TIDEMQ_DELETE_WHEN", DeleteWhen::AfterAcknowledge),
            commit_when:             get_env("TIDEMQ_COMMIT_WHEN", CommitWhen::AfterSaved),
            nack_put_back:           get_env("TIDEMQ_NACK_PUT_BACK", PutBack::Regular),
            ack_timeout_put_back:    get_env("TIDEMQ_ACK_TIMEOUT_PUT_BACK", PutBack::Regular),
        }
    }

    /// Ack-dependent policies cannot work when queues never ask for acknowledgements;
    /// they fall back to the closest policy that does not need one.
    pub fn align_with_ack(&mut self, acknowledge: AckMode) {
        if acknowledge.requires_ack() {
            return;
        }
        if self.delete_when == DeleteWhen::AfterAcknowledge {
            warn!("Config: TIDEMQ_DELETE_WHEN=after_ack needs acknowledgements, using after_send");
            self.delete_when = DeleteWhen::AfterSend;
        }
        if self.commit_when == CommitWhen::AfterAcknowledge {
            warn!("Config: TIDEMQ_COMMIT_WHEN=after_ack needs acknowledgements, using after_saved");
            self.commit_when = CommitWhen::AfterSaved;
        }
    }

    pub fn to_options(&self) -> PersistenceOptions {
        PersistenceOptions {
            delete_when: self.delete_when,
            commit_when: self.commit_when,
            nack_put_back: self.nack_put_back,
            ack_timeout_put_back: self.ack_timeout_put_back,
            use_redelivery: self.use_redelivery,
            database: DatabaseOptions {
                instant_flush: self.instant_flush,
                auto_flush: self.auto_flush,
                flush_interval_ms: self.flush_interval_ms,
                auto_shrink: self.auto_shrink,
                shrink_interval_ms: self.shrink_interval_ms,
                create_backup_on_shrink: self.create_backup_on_shrink,
            },
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Config: {}='{}' is not valid, using the default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::queue::{ManagerOptions, QueueManager};

    #[test]
    fn test_get_env_falls_back_on_garbage() {
        env::set_var("TIDEMQ_TEST_GARBAGE_MS", "soon");
        assert_eq!(get_env("TIDEMQ_TEST_GARBAGE_MS", 42u64), 42);

        env::set_var("TIDEMQ_TEST_ACK_MODE", "Wait");
        assert_eq!(get_env("TIDEMQ_TEST_ACK_MODE", AckMode::None), AckMode::WaitForAcknowledge);

        assert!(get_env("TIDEMQ_TEST_UNSET_FLAG", true));
    }

    #[test]
    fn test_defaults_map_to_options() {
        let queue = QueueDefaults::load().to_options();
        assert_eq!(queue.acknowledge_timeout_ms, 15_000);

        let persistence = PersistenceDefaults::load().to_options();
        assert_eq!(persistence.delete_when, DeleteWhen::AfterAcknowledge);
        assert!(persistence.database.auto_flush);
    }

    #[test]
    fn test_ack_policies_follow_ack_mode() {
        let mut kept = PersistenceDefaults::load();
        kept.commit_when = CommitWhen::AfterAcknowledge;
        kept.align_with_ack(AckMode::WaitForAcknowledge);
        assert_eq!(kept.delete_when, DeleteWhen::AfterAcknowledge);
        assert_eq!(kept.commit_when, CommitWhen::AfterAcknowledge);

        let mut relaxed = kept.clone();
        relaxed.align_with_ack(AckMode::None);
        assert_eq!(relaxed.delete_when, DeleteWhen::AfterSend);
        assert_eq!(relaxed.commit_when, CommitWhen::AfterSaved);
        assert!(!relaxed.to_options().depends_on_ack());
    }

    #[tokio::test]
    async fn test_durable_by_default_auto_creates_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::load();
        config.broker.data_dir = tmp.path().to_string_lossy().into_owned();
        config.broker.auto_create_queues = true;
        config.broker.auto_destroy_check_ms = 0;
        config.queue.acknowledge = AckMode::None;
        config.persistence.durable_by_default = true;
        config.persistence.delete_when = DeleteWhen::AfterAcknowledge;
        config.persistence.align_with_ack(config.queue.acknowledge);

        let manager = QueueManager::new(ManagerOptions::from_config(&config));
        let queue = manager.get_or_create("implicit").await.unwrap();
        assert!(queue.is_durable());
        manager.shutdown().await;
    }
}
