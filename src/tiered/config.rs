//! Store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::metadata::HEADER_SIZE;
use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default mapped capacity (2GB)
pub const DEFAULT_CAPACITY: u64 = 2 * 1024 * 1024 * 1024;

/// Default batch window of the sync pipeline
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(100);

/// Default requests per batch before an early flush
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 10;

/// Default concurrent flushes
pub const DEFAULT_SYNC_CONCURRENCY: usize = 1;

/// Default hold-back for low-priority requests
pub const DEFAULT_LOW_PRIORITY_DELAY: Duration = Duration::from_secs(10);

/// Default attempts per flush
pub const DEFAULT_FLUSH_RETRIES: u32 = 3;

/// Default pipeline shutdown deadline
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Queue Capacities
// =============================================================================

/// Bounded capacity of each priority queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCapacity {
    pub low: usize,
    pub mid: usize,
    pub high: usize,
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self {
            low: 400,
            mid: 200,
            high: 50,
        }
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration for a [`TieredStore`](super::TieredStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of the mapped file in bytes, header included
    pub capacity: u64,

    /// Directory holding the mapped file
    pub data_dir: PathBuf,

    /// Ticker period of the sync pipeline
    #[serde(with = "duration_ms")]
    pub sync_interval: Duration,

    /// Batch size that triggers an early flush
    pub sync_batch_size: usize,

    /// Maximum flushes in flight at once
    pub sync_concurrency: usize,

    /// Minimum age before a low-priority, non-final request is flushed
    #[serde(with = "duration_ms")]
    pub low_priority_delay: Duration,

    /// Capacity of each priority queue
    pub queue_capacity: QueueCapacity,

    /// Attempts made by a single flush before reporting failure
    pub flush_retries: u32,

    /// Base delay between flush attempts
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,

    /// How long close waits for the pipeline worker
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            data_dir: PathBuf::from("./data"),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            sync_batch_size: DEFAULT_SYNC_BATCH_SIZE,
            sync_concurrency: DEFAULT_SYNC_CONCURRENCY,
            low_priority_delay: DEFAULT_LOW_PRIORITY_DELAY,
            queue_capacity: QueueCapacity::default(),
            flush_retries: DEFAULT_FLUSH_RETRIES,
            retry_delay: Duration::from_millis(100),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            capacity,
            ..Default::default()
        }
    }

    /// Load a YAML configuration file. Missing fields take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Bytes available for block data.
    pub fn data_capacity(&self) -> u64 {
        self.capacity.saturating_sub(HEADER_SIZE as u64)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity <= HEADER_SIZE as u64 {
            return Err(Error::InvalidConfig(format!(
                "capacity must exceed the {} byte metadata header",
                HEADER_SIZE
            )));
        }
        if usize::try_from(self.capacity).is_err() {
            return Err(Error::InvalidConfig(
                "capacity does not fit in the address space".into(),
            ));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::InvalidConfig("sync_interval must be > 0".into()));
        }
        if self.sync_batch_size == 0 {
            return Err(Error::InvalidConfig("sync_batch_size must be > 0".into()));
        }
        if self.sync_concurrency == 0 {
            return Err(Error::InvalidConfig("sync_concurrency must be > 0".into()));
        }
        let queues = self.queue_capacity;
        if queues.low == 0 || queues.mid == 0 || queues.high == 0 {
            return Err(Error::InvalidConfig(
                "queue capacities must be > 0".into(),
            ));
        }
        if self.flush_retries == 0 {
            return Err(Error::InvalidConfig("flush_retries must be > 0".into()));
        }
        Ok(())
    }
}

/// Serde adapter storing durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
