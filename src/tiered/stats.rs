//! Store statistics.
//!
//! Counters are plain atomics updated on the hot path; a [`StatsSnapshot`]
//! freezes them for display as JSON or Prometheus text.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::pipeline::PipelineStatsSnapshot;
use crate::error::{Error, Result};

/// Operation counters of a [`TieredStore`](super::TieredStore).
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    syncs: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    flush_failures: AtomicU64,
    stale_flushes: AtomicU64,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read served from the mapping.
    pub fn record_hit(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A read served by the sync target.
    pub fn record_miss(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    /// A block reached its target.
    pub fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        *self.last_sync.lock() = Some(Utc::now());
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A flush found its region already replaced or removed.
    pub fn record_stale_flush(&self) {
        self.stale_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits() as f64;
        let total = hits + self.cache_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock()
    }
}

/// Frozen view of store and pipeline counters plus space usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub removes: u64,
    pub syncs: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flush_failures: u64,
    pub stale_flushes: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub resident_blocks: u64,
    pub free_bytes: u64,
    pub largest_free_block: u64,
    pub capacity: u64,
    pub pipeline: PipelineStatsSnapshot,
}

impl StoreStats {
    /// Snapshot the counters. Space and pipeline fields are filled by the
    /// store.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            stale_flushes: self.stale_flushes.load(Ordering::Relaxed),
            last_sync: self.last_sync(),
            ..Default::default()
        }
    }
}

impl StatsSnapshot {
    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> Result<String> {
        let registry = Registry::new_custom(Some("tierstore".to_string()), None)
            .map_err(|e| Error::Internal(format!("metrics registry: {}", e)))?;

        let counters: [(&str, &str, u64); 16] = [
            ("reads_total", "Block reads", self.reads),
            ("writes_total", "Block writes", self.writes),
            ("removes_total", "Block removes", self.removes),
            ("syncs_total", "Blocks flushed to their target", self.syncs),
            ("cache_hits_total", "Reads served from the mapping", self.cache_hits),
            ("cache_misses_total", "Reads served by the target", self.cache_misses),
            ("read_bytes_total", "Bytes returned by reads", self.bytes_read),
            ("written_bytes_total", "Bytes accepted by writes", self.bytes_written),
            ("flush_failures_total", "Failed flush attempts", self.flush_failures),
            ("stale_flushes_total", "Flushes of replaced regions", self.stale_flushes),
            ("pipeline_submitted_total", "Sync requests submitted", self.pipeline.submitted),
            ("pipeline_degraded_total", "Sync requests moved to a lower queue", self.pipeline.degraded),
            ("pipeline_inline_total", "Sync requests flushed inline", self.pipeline.inline_flushes),
            ("pipeline_superseded_total", "Sync requests replaced in a batch", self.pipeline.superseded),
            ("pipeline_requeued_total", "Failed sync requests requeued", self.pipeline.requeued),
            ("pipeline_held_back_total", "Low priority requests deferred", self.pipeline.held_back),
        ];

        let gauges: [(&str, &str, u64); 4] = [
            ("resident_blocks", "Blocks held in the mapping", self.resident_blocks),
            ("free_bytes", "Free bytes in the mapping", self.free_bytes),
            ("largest_free_block_bytes", "Largest contiguous free range", self.largest_free_block),
            ("capacity_bytes", "Size of the mapping", self.capacity),
        ];

        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(Opts::new(name, help))
                .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
            counter.inc_by(value);
            registry
                .register(Box::new(counter))
                .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
        }

        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(Opts::new(name, help))
                .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
            registry
                .register(Box::new(gauge))
                .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
