//! Sync Pipeline - asynchronous, priority-aware flushing of resident blocks
//!
//! Writers hand regions to the pipeline and return as soon as their bytes
//! are in the mapping. A single background worker batches the requests and
//! drains them to the durable target through a caller-supplied flush
//! function.
//!
//! # Workflow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Sync Pipeline Workflow                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  submit(region, priority)                                                │
//! │     │                                                                    │
//! │     ▼            full?            full?            full?                 │
//! │  ┌──────┐  ───────────▶  ┌─────┐  ──────▶  ┌─────┐  ──────▶  inline     │
//! │  │ high │                │ mid │           │ low │           flush      │
//! │  └──┬───┘                └──┬──┘           └──┬──┘                       │
//! │     └───────────────┬───────┴─────────────────┘                          │
//! │                     ▼                                                    │
//! │              ┌─────────────┐   batch full / tick / shutdown              │
//! │              │    batch    │ ─────────────────────────────┐              │
//! │              └─────────────┘                              ▼              │
//! │                                 ┌──────────────────────────────────┐     │
//! │                                 │ 1. drop versions below the newest │     │
//! │                                 │ 2. hold back young low requests   │     │
//! │                                 │ 3. flush the rest, N at a time    │     │
//! │                                 │ 4. requeue failures, demoted      │     │
//! │                                 └──────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests are never dropped for lack of queue space: a full queue sends the
//! request one level down, and when the low queue is full too the flush runs
//! on the submitting task.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::config::{QueueCapacity, StoreConfig};
use super::region::FileRegion;
use crate::error::{Error, Result};

/// Flushes one region to durable storage.
pub type FlushFn = Arc<dyn Fn(FileRegion) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Told the outcome of every flush attempt of a request.
pub type SyncCallback = Arc<dyn Fn(Option<&Error>) + Send + Sync>;

// =============================================================================
// Priority
// =============================================================================

/// Queue a request waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    /// Recovery resubmits and demoted retries; subject to hold-back
    Low = 0,
    /// Ordinary writes
    Mid = 1,
    /// Final-version writes
    High = 2,
}

impl Priority {
    /// Map a numeric level to a priority. Out-of-range levels become `Low`.
    pub fn from_level(level: i64) -> Self {
        match level {
            1 => Priority::Mid,
            2 => Priority::High,
            _ => Priority::Low,
        }
    }

    /// Next queue down, if any.
    pub fn lower(self) -> Option<Self> {
        match self {
            Priority::High => Some(Priority::Mid),
            Priority::Mid => Some(Priority::Low),
            Priority::Low => None,
        }
    }

    /// One level down, saturating at `Low`.
    pub fn demoted(self) -> Self {
        self.lower().unwrap_or(Priority::Low)
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Mid => write!(f, "mid"),
            Priority::High => write!(f, "high"),
        }
    }
}

// =============================================================================
// Request
// =============================================================================

/// A queued request to flush one region.
pub struct SyncRequest {
    pub region: FileRegion,
    pub priority: Priority,
    pub created_at: Instant,
    callback: Option<SyncCallback>,
}

impl SyncRequest {
    fn new(region: FileRegion, priority: Priority, callback: Option<SyncCallback>) -> Self {
        Self {
            region,
            priority,
            created_at: Instant::now(),
            callback,
        }
    }

    /// Young low-priority requests wait so later versions can replace them.
    fn is_held_back(&self, delay: Duration) -> bool {
        self.priority == Priority::Low
            && !self.region.is_final()
            && self.created_at.elapsed() < delay
    }

    fn notify(&self, result: &Result<()>) {
        if let Some(callback) = &self.callback {
            callback(result.as_ref().err());
        }
    }
}

impl fmt::Debug for SyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRequest")
            .field("region", &self.region)
            .field("priority", &self.priority)
            .field("created_at", &self.created_at)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Sync Pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ticker period
    pub interval: Duration,

    /// Batch length that triggers an early flush
    pub batch_size: usize,

    /// Maximum flushes in flight
    pub concurrency: usize,

    /// Hold-back for low-priority, non-final requests
    pub low_priority_delay: Duration,

    /// Capacity of each priority queue
    pub queue_capacity: QueueCapacity,

    /// Deadline for the worker to exit on close
    pub close_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for PipelineConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            interval: config.sync_interval,
            batch_size: config.sync_batch_size,
            concurrency: config.sync_concurrency,
            low_priority_delay: config.low_priority_delay,
            queue_capacity: config.queue_capacity,
            close_timeout: config.close_timeout,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the Sync Pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Requests accepted by submit
    pub submitted: AtomicU64,

    /// Times a request moved to a lower queue because its queue was full
    pub degraded: AtomicU64,

    /// Requests flushed on the submitting task
    pub inline_flushes: AtomicU64,

    /// Successful flushes
    pub flushed: AtomicU64,

    /// Failed flushes
    pub failed: AtomicU64,

    /// Requests dropped because a newer version was in the same batch
    pub superseded: AtomicU64,

    /// Times a young low-priority request was kept for a later batch
    pub held_back: AtomicU64,

    /// Failed requests put back into the batch
    pub requeued: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub submitted: u64,
    pub degraded: u64,
    pub inline_flushes: u64,
    pub flushed: u64,
    pub failed: u64,
    pub superseded: u64,
    pub held_back: u64,
    pub requeued: u64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            inline_flushes: self.inline_flushes.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            held_back: self.held_back.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Sync Pipeline
// =============================================================================

/// Batched, concurrency-limited flush engine with three priority queues.
pub struct SyncPipeline {
    config: PipelineConfig,

    /// Queue senders indexed by priority
    senders: [mpsc::Sender<SyncRequest>; 3],

    /// Used for inline flushes when every queue is full
    flush: FlushFn,

    /// Signals the worker to drain and exit
    shutdown: CancellationToken,

    closed: AtomicBool,

    worker: Mutex<Option<JoinHandle<()>>>,

    stats: Arc<PipelineStats>,
}

impl SyncPipeline {
    /// Create the pipeline and spawn its worker on the current runtime.
    pub fn new(config: PipelineConfig, flush: FlushFn) -> Self {
        let caps = config.queue_capacity;
        let (low_tx, low_rx) = mpsc::channel(caps.low.max(1));
        let (mid_tx, mid_rx) = mpsc::channel(caps.mid.max(1));
        let (high_tx, high_rx) = mpsc::channel(caps.high.max(1));

        let shutdown = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());

        let worker = Worker {
            config: config.clone(),
            high_rx,
            mid_rx,
            low_rx,
            batch: Vec::new(),
            flush: Arc::clone(&flush),
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            shutdown: shutdown.clone(),
            stats: Arc::clone(&stats),
        };

        info!(
            "Starting sync pipeline (interval={:?}, batch={}, concurrency={})",
            config.interval, config.batch_size, config.concurrency
        );
        let handle = tokio::spawn(worker.run());

        Self {
            config,
            senders: [low_tx, mid_tx, high_tx],
            flush,
            shutdown,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
            stats,
        }
    }

    /// Queue `region` for flushing.
    ///
    /// Final-version regions always enter the high queue. When the chosen
    /// queue is full the request moves down one queue at a time; when the low
    /// queue is full as well the flush runs here and its result is returned.
    #[instrument(skip(self, region, callback), fields(block = %region.block_id, version = region.version))]
    pub async fn submit(
        &self,
        region: FileRegion,
        priority: Priority,
        callback: Option<SyncCallback>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SystemClosed);
        }

        let mut priority = if region.is_final() {
            Priority::High
        } else {
            priority
        };
        let mut request = SyncRequest::new(region, priority, callback);
        PipelineStats::bump(&self.stats.submitted);

        loop {
            match self.senders[priority.index()].try_send(request) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(Error::SystemClosed),
                Err(TrySendError::Full(returned)) => {
                    request = returned;
                    PipelineStats::bump(&self.stats.degraded);
                    match priority.lower() {
                        Some(next) => {
                            debug!("{} queue full, degrading to {}", priority, next);
                            priority = next;
                            request.priority = next;
                        }
                        None => {
                            warn!(
                                "All sync queues full, flushing block {} inline",
                                request.region.block_id
                            );
                            PipelineStats::bump(&self.stats.inline_flushes);
                            let result = (self.flush)(request.region.clone()).await;
                            request.notify(&result);
                            return result;
                        }
                    }
                }
            }
        }
    }

    /// Stop the worker after a final flush of everything it holds.
    ///
    /// Returns [`Error::CloseTimeout`] if the worker does not finish within
    /// the configured deadline. Calling close twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();

        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(self.config.close_timeout, handle).await {
            Ok(Ok(())) => {
                info!("Sync pipeline stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Internal(format!("sync worker failed: {}", e))),
            Err(_) => {
                error!(
                    "Sync pipeline did not stop within {:?}",
                    self.config.close_timeout
                );
                Err(Error::CloseTimeout(self.config.close_timeout))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Requests currently waiting in `priority`'s queue.
    pub fn queued(&self, priority: Priority) -> usize {
        let sender = &self.senders[priority.index()];
        sender.max_capacity() - sender.capacity()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Drop for SyncPipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    config: PipelineConfig,
    high_rx: mpsc::Receiver<SyncRequest>,
    mid_rx: mpsc::Receiver<SyncRequest>,
    low_rx: mpsc::Receiver<SyncRequest>,
    batch: Vec<SyncRequest>,
    flush: FlushFn,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    stats: Arc<PipelineStats>,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    self.drain_queues();
                    debug!("Sync worker draining {} requests", self.batch.len());
                    self.flush_batch(true).await;
                    break;
                }

                Some(request) = self.high_rx.recv() => self.accept(request).await,
                Some(request) = self.mid_rx.recv() => self.accept(request).await,
                Some(request) = self.low_rx.recv() => self.accept(request).await,

                _ = ticker.tick() => self.flush_batch(false).await,
            }
        }
    }

    async fn accept(&mut self, request: SyncRequest) {
        self.batch.push(request);
        if self.batch.len() >= self.config.batch_size {
            self.flush_batch(false).await;
        }
    }

    fn drain_queues(&mut self) {
        for rx in [&mut self.high_rx, &mut self.mid_rx, &mut self.low_rx] {
            while let Ok(request) = rx.try_recv() {
                self.batch.push(request);
            }
        }
    }

    /// Flush the accumulated batch.
    ///
    /// With `draining` set, nothing is held back and failures are not
    /// requeued since no later batch will run.
    async fn flush_batch(&mut self, draining: bool) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);

        let mut newest: HashMap<String, i32> = HashMap::new();
        for request in &batch {
            let version = request.region.version;
            newest
                .entry(request.region.block_id.clone())
                .and_modify(|v| *v = (*v).max(version))
                .or_insert(version);
        }

        let mut due = Vec::with_capacity(batch.len());
        for request in batch {
            let latest = newest
                .get(&request.region.block_id)
                .copied()
                .unwrap_or(request.region.version);
            if request.region.version < latest {
                debug!(
                    "Dropping block {} v{} superseded by v{}",
                    request.region.block_id, request.region.version, latest
                );
                PipelineStats::bump(&self.stats.superseded);
                continue;
            }

            if !draining && request.is_held_back(self.config.low_priority_delay) {
                PipelineStats::bump(&self.stats.held_back);
                self.batch.push(request);
                continue;
            }

            due.push(request);
        }

        if due.is_empty() {
            return;
        }

        due.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!("Flushing {} requests ({} held)", due.len(), self.batch.len());

        let mut tasks = JoinSet::new();
        for request in due {
            let flush = Arc::clone(&self.flush);
            let semaphore = Arc::clone(&self.semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => flush(request.region.clone()).await,
                    Err(e) => Err(Error::Internal(format!(
                        "Failed to acquire sync permit: {}",
                        e
                    ))),
                };
                request.notify(&result);
                (request, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => PipelineStats::bump(&self.stats.flushed),
                Ok((mut request, Err(e))) => {
                    PipelineStats::bump(&self.stats.failed);
                    if draining {
                        warn!(
                            "Final flush of block {} v{} failed: {}",
                            request.region.block_id, request.region.version, e
                        );
                        continue;
                    }
                    warn!(
                        "Flush of block {} v{} failed, requeueing: {}",
                        request.region.block_id, request.region.version, e
                    );
                    request.priority = request.priority.demoted();
                    PipelineStats::bump(&self.stats.requeued);
                    self.batch.push(request);
                }
                Err(e) => error!("Flush task aborted: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiered::region::Region;
    use crate::tiered::FINAL_VERSION;
    use futures::FutureExt;
    use tokio::sync::Notify;

    type Log = Arc<Mutex<Vec<(String, i32)>>>;

    fn region(block: &str, version: i32) -> FileRegion {
        FileRegion::new("store", block, Region::new(0, 1), version)
    }

    fn recording_flush(log: Log) -> FlushFn {
        Arc::new(move |region: FileRegion| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push((region.block_id, region.version));
                Ok(())
            }
            .boxed()
        })
    }

    fn quiet_config() -> PipelineConfig {
        PipelineConfig {
            interval: Duration::from_secs(3600),
            batch_size: 100,
            ..PipelineConfig::default()
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    // =========================================================================
    // Priority
    // =========================================================================

    #[test]
    fn test_priority_levels() {
        assert_eq!(Priority::from_level(2), Priority::High);
        assert_eq!(Priority::from_level(1), Priority::Mid);
        assert_eq!(Priority::from_level(0), Priority::Low);
        assert_eq!(Priority::from_level(3), Priority::Low);
        assert_eq!(Priority::from_level(-1), Priority::Low);

        assert_eq!(Priority::High.lower(), Some(Priority::Mid));
        assert_eq!(Priority::Low.lower(), None);
        assert_eq!(Priority::Low.demoted(), Priority::Low);
        assert!(Priority::High > Priority::Low);
    }

    #[test]
    fn test_hold_back_rules() {
        let delay = Duration::from_secs(60);
        let low = SyncRequest::new(region("b", 1), Priority::Low, None);
        assert!(low.is_held_back(delay));
        assert!(!low.is_held_back(Duration::ZERO));

        let mid = SyncRequest::new(region("b", 1), Priority::Mid, None);
        assert!(!mid.is_held_back(delay));

        let final_low = SyncRequest::new(region("b", FINAL_VERSION), Priority::Low, None);
        assert!(!final_low.is_held_back(delay));
    }

    // =========================================================================
    // Batching
    // =========================================================================

    #[tokio::test]
    async fn test_superseded_versions_are_skipped() {
        let log: Log = Arc::default();
        let pipeline = SyncPipeline::new(quiet_config(), recording_flush(Arc::clone(&log)));

        pipeline.submit(region("b1", 1), Priority::Mid, None).await.unwrap();
        pipeline.submit(region("b1", 2), Priority::Mid, None).await.unwrap();
        pipeline.submit(region("b2", 7), Priority::Mid, None).await.unwrap();
        pipeline.close().await.unwrap();

        let mut flushed = log.lock().clone();
        flushed.sort();
        assert_eq!(flushed, vec![("b1".to_string(), 2), ("b2".to_string(), 7)]);
        assert_eq!(pipeline.stats().snapshot().superseded, 1);
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let log: Log = Arc::default();
        let config = PipelineConfig {
            batch_size: 2,
            ..quiet_config()
        };
        let pipeline = SyncPipeline::new(config, recording_flush(Arc::clone(&log)));

        pipeline.submit(region("a", 1), Priority::Mid, None).await.unwrap();
        pipeline.submit(region("b", 1), Priority::Mid, None).await.unwrap();

        wait_for(|| log.lock().len() == 2).await;
        pipeline.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_low_priority_held_until_delay() {
        let log: Log = Arc::default();
        let config = PipelineConfig {
            interval: Duration::from_millis(10),
            low_priority_delay: Duration::from_secs(3600),
            ..quiet_config()
        };
        let pipeline = SyncPipeline::new(config, recording_flush(Arc::clone(&log)));

        pipeline.submit(region("young", 1), Priority::Low, None).await.unwrap();
        pipeline
            .submit(region("sealed", FINAL_VERSION), Priority::Low, None)
            .await
            .unwrap();

        wait_for(|| log.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().clone(), vec![("sealed".to_string(), FINAL_VERSION)]);
        assert!(pipeline.stats().snapshot().held_back > 0);

        // Shutdown flushes held requests
        pipeline.close().await.unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_is_requeued_and_reported() {
        let attempts = Arc::new(AtomicU64::new(0));
        let flush: FlushFn = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move |_region: FileRegion| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::Target("transient".into()))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })
        };
        let outcomes: Arc<Mutex<Vec<bool>>> = Arc::default();
        let callback: SyncCallback = {
            let outcomes = Arc::clone(&outcomes);
            Arc::new(move |err: Option<&Error>| outcomes.lock().push(err.is_none()))
        };

        let config = PipelineConfig {
            interval: Duration::from_millis(10),
            low_priority_delay: Duration::ZERO,
            ..quiet_config()
        };
        let pipeline = SyncPipeline::new(config, flush);
        pipeline
            .submit(region("b1", 1), Priority::High, Some(callback))
            .await
            .unwrap();

        wait_for(|| outcomes.lock().len() == 2).await;
        assert_eq!(outcomes.lock().clone(), vec![false, true]);

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.flushed, 1);
        pipeline.close().await.unwrap();
    }

    // =========================================================================
    // Backpressure
    // =========================================================================

    #[tokio::test]
    async fn test_full_queues_degrade_then_flush_inline() {
        let log: Log = Arc::default();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let flush: FlushFn = {
            let log = Arc::clone(&log);
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            Arc::new(move |region: FileRegion| {
                let log = Arc::clone(&log);
                let entered = Arc::clone(&entered);
                let release = Arc::clone(&release);
                async move {
                    if region.block_id == "stuck" {
                        entered.notify_one();
                        release.notified().await;
                    }
                    log.lock().push((region.block_id, region.version));
                    Ok(())
                }
                .boxed()
            })
        };

        let config = PipelineConfig {
            batch_size: 1,
            queue_capacity: QueueCapacity {
                low: 1,
                mid: 1,
                high: 1,
            },
            ..quiet_config()
        };
        let pipeline = SyncPipeline::new(config, flush);

        // Park the worker inside a flush
        pipeline.submit(region("stuck", 1), Priority::High, None).await.unwrap();
        entered.notified().await;

        pipeline.submit(region("a", 1), Priority::High, None).await.unwrap();
        pipeline.submit(region("b", 1), Priority::High, None).await.unwrap();
        pipeline.submit(region("c", 1), Priority::High, None).await.unwrap();
        assert_eq!(pipeline.queued(Priority::High), 1);
        assert_eq!(pipeline.queued(Priority::Mid), 1);
        assert_eq!(pipeline.queued(Priority::Low), 1);

        pipeline.submit(region("d", 1), Priority::High, None).await.unwrap();
        assert_eq!(log.lock().clone(), vec![("d".to_string(), 1)]);

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.inline_flushes, 1);
        assert_eq!(stats.degraded, 1 + 2 + 3);

        release.notify_one();
        pipeline.close().await.unwrap();

        let mut flushed: Vec<String> = log.lock().iter().map(|(b, _)| b.clone()).collect();
        flushed.sort();
        assert_eq!(flushed, vec!["a", "b", "c", "d", "stuck"]);
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let log: Log = Arc::default();
        let pipeline = SyncPipeline::new(quiet_config(), recording_flush(log));
        pipeline.close().await.unwrap();
        pipeline.close().await.unwrap();

        let err = pipeline
            .submit(region("late", 1), Priority::Mid, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SystemClosed));
        assert!(pipeline.is_closed());
    }

    #[tokio::test]
    async fn test_close_times_out_on_stuck_flush() {
        let flush: FlushFn = Arc::new(|_region: FileRegion| {
            async move {
                futures::future::pending::<()>().await;
                Ok(())
            }
            .boxed()
        });
        let config = PipelineConfig {
            close_timeout: Duration::from_millis(50),
            ..quiet_config()
        };
        let pipeline = SyncPipeline::new(config, flush);
        pipeline.submit(region("b", 1), Priority::Mid, None).await.unwrap();

        let err = pipeline.close().await.unwrap_err();
        assert!(matches!(err, Error::CloseTimeout(_)));
    }
}
