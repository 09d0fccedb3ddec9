//! TOML configuration for every role in a shardgraph deployment.
//!
//! All sections are optional; missing keys fall back to the defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How channel endpoints are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Every endpoint address is known up front, so channels can be pre-created.
    Static,
    /// Endpoints appear at runtime; channels are only created on first use.
    Dynamic,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Cluster topology.
    pub cluster: ClusterConfig,
    /// Per-partition write applier settings.
    pub applier: ApplierConfig,
    /// Snapshot coordinator settings.
    pub coordinator: CoordinatorConfig,
    /// Transport settings.
    pub rpc: RpcConfig,
}

/// Cluster topology: how many processes of each role exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Endpoint discovery mode.
    pub discovery: DiscoveryMode,
    /// Number of coordinator processes.
    pub coordinator_count: u32,
    /// Number of storage partitions.
    pub store_count: u32,
    /// Number of frontends that serve queries.
    pub frontend_count: u32,
    /// Number of ingest processes.
    pub ingestor_count: u32,
    /// Number of durable ingest queues feeding every partition.
    pub queue_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryMode::Static,
            coordinator_count: 1,
            store_count: 2,
            frontend_count: 1,
            ingestor_count: 1,
            queue_count: 2,
        }
    }
}

/// Settings for the per-partition merge queue and write applier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    /// Buffered batches per input queue before `offer` blocks.
    pub queue_capacity: usize,
    /// How long a single `poll` waits before re-checking the stop flag.
    pub poll_timeout_ms: u64,
    /// Upper bound on joining worker threads during `stop`.
    pub stop_timeout_ms: u64,
    /// Pause between storage apply retries.
    pub retry_backoff_ms: u64,
    /// Batches read from a queue log per delivery round.
    pub delivery_read_batch: usize,
    /// Directory for per-partition checkpoint files; disabled when unset.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            poll_timeout_ms: 100,
            stop_timeout_ms: 3_000,
            retry_backoff_ms: 50,
            delivery_read_batch: 64,
            checkpoint_dir: None,
        }
    }
}

impl ApplierConfig {
    /// Poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Stop timeout as a [`Duration`].
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Retry backoff as a [`Duration`].
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Settings for the snapshot coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interval between write snapshot bumps.
    pub write_snapshot_interval_ms: u64,
    /// Directory for coordinator metadata; in-memory when unset.
    pub meta_dir: Option<PathBuf>,
    /// How long a DDL submission waits to become visible.
    pub ddl_wait_timeout_ms: u64,
    /// Number of `(session, request)` DDL outcomes remembered for dedup.
    pub ddl_dedup_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            write_snapshot_interval_ms: 100,
            meta_dir: None,
            ddl_wait_timeout_ms: 30_000,
            ddl_dedup_capacity: 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Write snapshot interval as a [`Duration`].
    pub fn write_snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.write_snapshot_interval_ms)
    }

    /// DDL wait timeout as a [`Duration`].
    pub fn ddl_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ddl_wait_timeout_ms)
    }
}

/// Transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Worker threads of the transport executor.
    pub worker_threads: usize,
    /// Upper bound on draining a channel during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl RpcConfig {
    /// Shutdown timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl ShardConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ShardConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a configuration held in memory.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ShardConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Rejects topologies and capacities the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cluster = &self.cluster;
        for (field, value) in [
            ("cluster.coordinator_count", cluster.coordinator_count),
            ("cluster.store_count", cluster.store_count),
            ("cluster.ingestor_count", cluster.ingestor_count),
            ("cluster.queue_count", cluster.queue_count),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1",
                });
            }
        }
        if self.applier.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "applier.queue_capacity",
                reason: "must be at least 1",
            });
        }
        if self.applier.delivery_read_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "applier.delivery_read_batch",
                reason: "must be at least 1",
            });
        }
        if self.coordinator.write_snapshot_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "coordinator.write_snapshot_interval_ms",
                reason: "must be positive",
            });
        }
        if self.rpc.worker_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "rpc.worker_threads",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Config file is not valid TOML for [`ShardConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Config could not be rendered as TOML.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("config field '{field}' {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}
