//! Engine configuration
//!
//! Every knob is a command-line flag with an environment-variable fallback,
//! so the same struct serves the binary and embedders constructing the
//! engine directly through [`SyncConfig::default`].

use clap::Args;
use std::time::Duration;
use sync_shared::ChecksumAlgorithm;

#[derive(Args, Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of causally blocked deltas waiting for resolution
    #[arg(long, env = "WORLD_SYNC_MAX_DEFERRED", default_value_t = 1000)]
    pub max_deferred_deltas: usize,

    /// How long a blocked delta may wait before it is dropped (ms)
    #[arg(long, env = "WORLD_SYNC_CAUSALITY_TIMEOUT_MS", default_value_t = 5000)]
    pub causality_timeout_ms: u64,

    /// Fallback re-check interval of the causality worker (ms)
    #[arg(long, env = "WORLD_SYNC_CAUSALITY_POLL_MS", default_value_t = 10)]
    pub causality_poll_ms: u64,

    /// Applied deltas kept in the causal log, and operations kept in the
    /// sequence log while no client is registered
    #[arg(long, env = "WORLD_SYNC_MAX_OPERATION_LOG", default_value_t = 10_000)]
    pub max_operation_log: usize,

    /// Operations kept below the slowest client's acknowledged sequence
    #[arg(long, env = "WORLD_SYNC_RETENTION_BUFFER", default_value_t = 100)]
    pub retention_buffer: u64,

    /// Run log cleanup every N submitted operations
    #[arg(long, env = "WORLD_SYNC_CLEANUP_INTERVAL", default_value_t = 100)]
    pub cleanup_interval: u64,

    /// Capacity of each client's outbound operation queue
    #[arg(long, env = "WORLD_SYNC_CLIENT_QUEUE_SIZE", default_value_t = 1000)]
    pub client_queue_size: usize,

    /// Interval between state digests pushed to clients (ms)
    #[arg(long, env = "WORLD_SYNC_SYNC_INTERVAL_MS", default_value_t = 100)]
    pub sync_interval_ms: u64,

    /// Checksum algorithm: sha256, md5 or blake3
    #[arg(long = "checksum", env = "WORLD_SYNC_CHECKSUM", default_value = "sha256")]
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Initial capacity of the avatar registry
    #[arg(long = "avatar-capacity", env = "WORLD_SYNC_AVATAR_CAPACITY", default_value_t = 1000)]
    pub avatar_registry_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_deferred_deltas: 1000,
            causality_timeout_ms: 5000,
            causality_poll_ms: 10,
            max_operation_log: 10_000,
            retention_buffer: 100,
            cleanup_interval: 100,
            client_queue_size: 1000,
            sync_interval_ms: 100,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            avatar_registry_capacity: 1000,
        }
    }
}

impl SyncConfig {
    pub fn causality_timeout(&self) -> Duration {
        Duration::from_millis(self.causality_timeout_ms)
    }

    pub fn causality_poll_interval(&self) -> Duration {
        Duration::from_millis(self.causality_poll_ms.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    /// Rejects sizes that would make a queue or log unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("max_deferred_deltas", self.max_deferred_deltas as u64),
            ("max_operation_log", self.max_operation_log as u64),
            ("client_queue_size", self.client_queue_size as u64),
            ("cleanup_interval", self.cleanup_interval),
        ];
        match sizes.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::ZeroSize { field }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least 1")]
    ZeroSize { field: &'static str },
}
