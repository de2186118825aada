use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;

/// Configuration for the run queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of runs held across all priority lanes.
    pub max_runs: usize,
    /// Buffer length for each registered queue-event listener.
    pub event_channel_length: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_runs: 10_000,
            event_channel_length: 1024,
        }
    }
}

/// Configuration for the in-flight monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Number of times a failed run is re-enqueued before it is abandoned.
    pub max_grade_retries: u32,
    /// Wall-clock deadline for a single attempt on a worker.
    pub attempt_timeout_ms: u64,
    /// How often the monitor scans for attempts past their deadline.
    pub sweep_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_grade_retries: 3,
            attempt_timeout_ms: 60_000,
            sweep_interval_ms: 1_000,
        }
    }
}

/// Configuration for the input cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget for cached input bundles.
    pub size_bytes: u64,
    /// Directory holding the on-disk cache and the durable bundle store.
    pub runtime_path: PathBuf,
}

impl CacheConfig {
    /// Directory scanned at startup for already-materialized bundles.
    pub fn cache_dir(&self) -> PathBuf {
        self.runtime_path.join("cache")
    }

    /// Directory the default bundle factory fetches from.
    pub fn store_dir(&self) -> PathBuf {
        self.runtime_path.join("store")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_bytes: 1 << 30, // 1 GiB
            runtime_path: PathBuf::from("/var/lib/grader"),
        }
    }
}

/// Configuration for the read-only status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Port to serve the status endpoint on. `None` disables it.
    pub port: Option<u16>,
}

/// Configuration for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level, overridable through `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration for the grading dispatch daemon.
///
/// Every section has a complete default so a partial (or absent) JSON file
/// still yields a working configuration. The daemon reads but never mutates
/// these values at runtime; reloads publish a fresh snapshot through
/// [`ConfigHandle`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub queue: QueueConfig,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

impl GraderConfig {
    /// Read a configuration from a JSON document.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }
}

/// Publishes immutable configuration snapshots.
///
/// Components capture the `Arc<GraderConfig>` current at construction;
/// a reload publishes a new snapshot that only subsequently-started
/// operations observe. In-flight operations keep the snapshot they
/// started with.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<GraderConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: GraderConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<GraderConfig> {
        self.tx.borrow().clone()
    }

    /// Publish a new snapshot, replacing the current one.
    pub fn publish(&self, config: GraderConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<GraderConfig>> {
        self.tx.subscribe()
    }
}
