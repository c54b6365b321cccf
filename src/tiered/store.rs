//! Tiered Store - mmap-backed block staging with asynchronous drain
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              TieredStore                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                           │
//! │   write ──▶ RegionAllocator ──▶ copy into mapping ──▶ table + header      │
//! │                                                            │              │
//! │                                                            ▼              │
//! │                                                      SyncPipeline         │
//! │                                                            │              │
//! │   read ──▶ table hit? ──yes──▶ copy out of mapping         ▼              │
//! │              │                                     flush_to_target        │
//! │              no                                            │              │
//! │              ▼                                             ▼              │
//! │        SyncTargetor::read_block  ◀─────────────── SyncTargetor::write     │
//! │                                                   then free + DONTNEED    │
//! │                                                                           │
//! │   .mmap_cache.dat: [ header (HEADER_SIZE) | block bytes ...            ]  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A block is resident while its region is in the table. Once the pipeline
//! has placed it at its target the entry is dropped, the region is returned
//! to the allocator and later reads go to the target.
//!
//! # Locking
//!
//! The table lock guards both the key→region map and the mapped bytes. The
//! allocator has its own lock and is never touched while the table lock is
//! held; superseded regions are freed after the lock is released. No lock is
//! held across target I/O.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::allocator::RegionAllocator;
use super::config::StoreConfig;
use super::keylock::KeyLock;
use super::metadata::{self, HeaderState, HEADER_SIZE, METADATA_MAX_FILES};
use super::pipeline::{FlushFn, PipelineConfig, Priority, SyncPipeline};
use super::region::{FileRegion, Region};
use super::stats::{StatsSnapshot, StoreStats};
use super::target::{read_window, SyncTargetor};
use super::{FINAL_VERSION, MMAP_FILE_NAME};
use crate::error::{Error, Result};

// =============================================================================
// Internal State
// =============================================================================

/// Key→region map and the mapping it points into.
struct Table {
    files: HashMap<String, FileRegion>,
    /// `None` once the store is closed
    mmap: Option<MmapMut>,
}

/// An upload in flight, cancellable by a newer version of the same block.
struct TargetTask {
    version: i32,
    cancel: CancellationToken,
}

/// Outcome of installing a write under the table lock.
enum Installed {
    /// New region is live; carries the region it replaced
    Replaced(Option<FileRegion>),
    /// A newer version is already resident
    Stale,
}

/// Everything the flush path needs, shared with the pipeline worker.
struct StoreCore {
    config: StoreConfig,
    path: PathBuf,
    table: RwLock<Table>,
    file: Mutex<Option<File>>,
    allocator: RegionAllocator,
    targets: RwLock<HashMap<String, Arc<dyn SyncTargetor>>>,
    tasks: Mutex<HashMap<String, TargetTask>>,
    key_locks: KeyLock,
    stats: StoreStats,
    closed: AtomicBool,
}

// =============================================================================
// Tiered Store
// =============================================================================

/// Fixed-capacity, memory-mapped staging area for blocks.
///
/// Dropping the store without [`close`](Self::close) persists the header and
/// releases the mapping, then stops the pipeline without waiting for it.
/// Flushes still running after the drop can no longer touch the file.
pub struct TieredStore {
    core: Arc<StoreCore>,
    pipeline: SyncPipeline,
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore").finish_non_exhaustive()
    }
}

impl TieredStore {
    /// Open or create the mapped file under `config.data_dir` and recover any
    /// blocks it still holds.
    ///
    /// Recovered blocks are resubmitted for syncing at low priority. Must be
    /// called from within a Tokio runtime.
    #[instrument(skip(config), fields(dir = %config.data_dir.display(), capacity = config.capacity))]
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(MMAP_FILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let previous_len = file.metadata()?.len();

        file.set_len(config.capacity)?;
        if let Err(e) = preallocate(&file, config.capacity) {
            warn!("Failed to preallocate {}: {}", path.display(), e);
        }

        // SAFETY: the file was opened read-write by this store and is sized to
        // `capacity`; the mapping lives as long as the file handle kept in
        // `StoreCore`. External modification of the file is not supported.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let allocator = RegionAllocator::new(config.capacity);
        let files = load_metadata(&mut mmap, &allocator, config.capacity, previous_len)?;
        let recovered: Vec<FileRegion> = files.values().cloned().collect();

        info!(
            "Opened {} ({} bytes, {} recovered blocks, {} free)",
            path.display(),
            config.capacity,
            recovered.len(),
            allocator.free_space()
        );

        let core = Arc::new(StoreCore {
            config,
            path,
            table: RwLock::new(Table {
                files,
                mmap: Some(mmap),
            }),
            file: Mutex::new(Some(file)),
            allocator,
            targets: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            key_locks: KeyLock::new(),
            stats: StoreStats::new(),
            closed: AtomicBool::new(false),
        });

        let flush: FlushFn = {
            let core = Arc::clone(&core);
            Arc::new(move |region: FileRegion| {
                let core = Arc::clone(&core);
                async move { core.flush_to_target(region).await }.boxed()
            })
        };
        let pipeline = SyncPipeline::new(PipelineConfig::from(&core.config), flush);

        for region in recovered {
            if let Err(e) = pipeline.submit(region, Priority::Low, None).await {
                warn!("Failed to resubmit recovered block: {}", e);
            }
        }

        Ok(Self { core, pipeline })
    }

    /// Register the durable target for blocks of `storage_id`.
    pub fn register_target(&self, storage_id: impl Into<String>, target: Arc<dyn SyncTargetor>) {
        let storage_id = storage_id.into();
        debug!("Registered sync target for storage {}", storage_id);
        self.core.targets.write().insert(storage_id, target);
    }

    pub fn unregister_target(&self, storage_id: &str) -> Option<Arc<dyn SyncTargetor>> {
        self.core.targets.write().remove(storage_id)
    }

    // =========================================================================
    // Block Operations
    // =========================================================================

    /// Stage a block made of `chunks` at `version`.
    ///
    /// An empty block removes `block_id`. If a newer version is already
    /// resident the write is silently ignored; an equal version overwrites.
    #[instrument(skip(self, chunks), fields(storage = storage_id, block = block_id))]
    pub async fn write<C>(
        &self,
        storage_id: &str,
        block_id: &str,
        chunks: &[C],
        version: i32,
    ) -> Result<()>
    where
        C: AsRef<[u8]> + Sync,
    {
        self.ensure_open()?;
        validate_id(storage_id)?;
        validate_id(block_id)?;

        let total: u64 = chunks.iter().map(|c| c.as_ref().len() as u64).sum();
        if total == 0 {
            return self.remove(storage_id, block_id).await;
        }

        let capacity = self.core.config.capacity;
        if total > capacity {
            return Err(Error::FileTooLarge {
                size: total,
                capacity,
            });
        }

        let Some(region) = self.core.install(storage_id, block_id, chunks, total, version)? else {
            return Ok(());
        };
        self.core.stats.record_write(total);

        let priority = if version == FINAL_VERSION {
            Priority::High
        } else {
            Priority::Mid
        };
        if let Err(e) = self.pipeline.submit(region, priority, None).await {
            warn!("Block {} stays resident until the next sync: {}", block_id, e);
        }

        Ok(())
    }

    /// Read `length` bytes at `offset` (`length == 0` reads to the end).
    ///
    /// Resident blocks are served from the mapping; others from the target.
    #[instrument(skip(self), fields(storage = storage_id, block = block_id))]
    pub async fn read(
        &self,
        storage_id: &str,
        block_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.ensure_open()?;
        validate_id(storage_id)?;
        validate_id(block_id)?;

        if let Some(data) = self.core.read_resident(block_id, offset, length)? {
            self.core.stats.record_hit(data.len() as u64);
            return Ok(data);
        }

        let target = self
            .core
            .target(storage_id)
            .ok_or_else(|| Error::FileNotFound(block_id.to_string()))?;
        let data = target.read_block(block_id, offset, length).await?;
        self.core.stats.record_miss(data.len() as u64);
        Ok(data)
    }

    /// Drop a block from the store and, best effort, from its target.
    ///
    /// Removing an absent block succeeds.
    #[instrument(skip(self), fields(storage = storage_id, block = block_id))]
    pub async fn remove(&self, storage_id: &str, block_id: &str) -> Result<()> {
        self.ensure_open()?;
        validate_id(storage_id)?;
        validate_id(block_id)?;

        if let Some(task) = self.core.tasks.lock().get(block_id) {
            task.cancel.cancel();
        }

        // Serialized with uploads of the same block so none can land after
        // the target copy is deleted.
        let persisted = {
            let _guard = self.core.key_locks.lock(block_id).await;
            let persisted = self.core.remove_entry(block_id);

            if let Some(target) = self.core.target(storage_id) {
                if let Err(e) = target.delete_block(block_id).await {
                    debug!("Ignoring target delete failure for {}: {}", block_id, e);
                }
            }
            persisted
        };

        self.core.stats.record_remove();
        persisted
    }

    /// Flush one resident block to its target now.
    ///
    /// Fails with [`Error::FileNotFound`] if the block is not resident.
    pub async fn sync(&self, block_id: &str) -> Result<()> {
        self.ensure_open()?;
        let region = self.core.table.read().files.get(block_id).cloned();
        match region {
            Some(region) => self.core.flush_to_target(region).await,
            None => Err(Error::FileNotFound(block_id.to_string())),
        }
    }

    /// Flush every resident block now.
    pub async fn sync_all(&self) -> Result<()> {
        self.ensure_open()?;
        self.core.sync_all().await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether the block is resident or present at its target. Always
    /// false once closed.
    pub async fn exists(&self, storage_id: &str, block_id: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.is_resident(block_id) {
            return true;
        }
        match self.core.target(storage_id) {
            Some(target) => target.block_exists(block_id).await,
            None => false,
        }
    }

    /// Whether the block is currently held in the mapping.
    pub fn is_resident(&self, block_id: &str) -> bool {
        self.core.table.read().files.contains_key(block_id)
    }

    /// Resident blocks ordered by block id.
    pub fn list_files(&self) -> Vec<FileRegion> {
        let mut files: Vec<FileRegion> = self.core.table.read().files.values().cloned().collect();
        files.sort_by(|a, b| a.block_id.cmp(&b.block_id));
        files
    }

    /// Free bytes in the mapping.
    pub fn free_space(&self) -> u64 {
        self.core.allocator.free_space()
    }

    pub fn largest_free_block(&self) -> u64 {
        self.core.allocator.largest_free_block()
    }

    pub fn capacity(&self) -> u64 {
        self.core.config.capacity
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.core.stats.snapshot();
        snapshot.resident_blocks = self.core.table.read().files.len() as u64;
        snapshot.free_bytes = self.core.allocator.free_space();
        snapshot.largest_free_block = self.core.allocator.largest_free_block();
        snapshot.capacity = self.core.config.capacity;
        snapshot.pipeline = self.pipeline.stats().snapshot();
        snapshot
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the pipeline, persist the header, sync every resident block and
    /// release the mapping.
    ///
    /// Every step runs even if an earlier one fails; failures are reported
    /// together as [`Error::Shutdown`]. Closing twice is a no-op.
    #[instrument(skip(self), fields(path = %self.core.path.display()))]
    pub async fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();

        if let Err(e) = self.pipeline.close().await {
            errors.push(format!("stop sync pipeline: {}", e));
        }
        if let Err(e) = self.core.save_metadata() {
            errors.push(format!("save metadata: {}", e));
        }
        if let Err(e) = self.core.sync_all().await {
            errors.push(format!("sync resident blocks: {}", e));
        }
        if let Err(e) = self.core.unmap() {
            errors.push(format!("release mapping: {}", e));
        }

        if errors.is_empty() {
            info!("Closed {}", self.core.path.display());
            Ok(())
        } else {
            error!("Close finished with {} errors", errors.len());
            Err(Error::Shutdown(errors))
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::SystemClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for TieredStore {
    fn drop(&mut self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            "{} dropped without close, persisting header",
            self.core.path.display()
        );
        if let Err(e) = self.core.save_metadata() {
            error!("Failed to persist header on drop: {}", e);
        }
        // The worker may outlive the store; without the mapping it can no
        // longer write this file's header.
        if let Err(e) = self.core.unmap() {
            error!("Failed to release mapping on drop: {}", e);
        }
    }
}

// =============================================================================
// Core Operations
// =============================================================================

impl StoreCore {
    fn target(&self, storage_id: &str) -> Option<Arc<dyn SyncTargetor>> {
        self.targets.read().get(storage_id).cloned()
    }

    fn is_current(&self, region: &FileRegion) -> bool {
        self.table.read().files.get(&region.block_id) == Some(region)
    }

    /// Allocate, copy and publish a write. Returns `None` for a stale write.
    fn install<C: AsRef<[u8]>>(
        &self,
        storage_id: &str,
        block_id: &str,
        chunks: &[C],
        total: u64,
        version: i32,
    ) -> Result<Option<FileRegion>> {
        let offset = self.allocator.alloc_best_fit(total)?;
        let region = FileRegion::new(storage_id, block_id, Region::at(offset, total), version);

        let outcome = {
            let mut table = self.table.write();
            install_locked(&mut table, &region, chunks)
        };

        match outcome {
            Ok(Installed::Replaced(old)) => {
                if let Some(old) = old {
                    self.allocator.free(old.start(), old.size());
                }
                debug!("Installed {} v{} at {}", block_id, version, offset);
                Ok(Some(region))
            }
            Ok(Installed::Stale) => {
                self.allocator.free(offset, total);
                debug!("Ignoring stale write of {} v{}", block_id, version);
                Ok(None)
            }
            Err(e) => {
                self.allocator.free(offset, total);
                Err(e)
            }
        }
    }

    fn read_resident(&self, block_id: &str, offset: u64, length: u64) -> Result<Option<Bytes>> {
        let table = self.table.read();
        let Some(region) = table.files.get(block_id) else {
            return Ok(None);
        };
        let mmap = table.mmap.as_ref().ok_or(Error::SystemClosed)?;

        let want = read_window(offset, length, region.size())?;
        let start = (region.start() + offset) as usize;
        Ok(Some(Bytes::copy_from_slice(
            &mmap[start..start + want as usize],
        )))
    }

    /// Remove an entry and free its region. The header is rewritten even
    /// when nothing was resident.
    fn remove_entry(&self, block_id: &str) -> Result<()> {
        let (removed, persisted) = {
            let mut guard = self.table.write();
            let table = &mut *guard;
            let Some(mmap) = table.mmap.as_mut() else {
                return Err(Error::SystemClosed);
            };
            let removed = table.files.remove(block_id);
            if let Some(region) = &removed {
                discard_pages(mmap, &region.region);
            }
            (removed, persist_header(&table.files, mmap))
        };

        if let Some(region) = removed {
            self.allocator.free(region.start(), region.size());
            debug!("Removed {} ({} bytes)", block_id, region.size());
        }
        persisted
    }

    /// Place a region at its target, retrying transient failures.
    #[instrument(skip(self, region), fields(block = %region.block_id, version = region.version))]
    async fn flush_to_target(&self, region: FileRegion) -> Result<()> {
        let attempts = self.config.flush_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.flush_once(&region).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.stats.record_flush_failure();
                    if attempt >= attempts || !e.is_retryable() {
                        return Err(e);
                    }
                    warn!("Flush attempt {}/{} failed: {}", attempt, attempts, e);
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
            }
        }
    }

    async fn flush_once(&self, region: &FileRegion) -> Result<()> {
        let data = {
            let table = self.table.read();
            if table.files.get(&region.block_id) != Some(region) {
                self.stats.record_stale_flush();
                return Ok(());
            }
            let mmap = table.mmap.as_ref().ok_or(Error::SystemClosed)?;
            Bytes::copy_from_slice(&mmap[region.start() as usize..region.end() as usize])
        };

        let target = self
            .target(&region.storage_id)
            .ok_or_else(|| Error::TargetNotRegistered(region.storage_id.clone()))?;

        if let Some(task) = self.tasks.lock().get(&region.block_id) {
            if task.version < region.version {
                debug!(
                    "Cancelling upload of {} v{} for v{}",
                    region.block_id, task.version, region.version
                );
                task.cancel.cancel();
            }
        }

        let _guard = self.key_locks.lock(region.block_id.as_str()).await;
        if !self.is_current(region) {
            self.stats.record_stale_flush();
            return Ok(());
        }

        let cancel = CancellationToken::new();
        self.tasks.lock().insert(
            region.block_id.clone(),
            TargetTask {
                version: region.version,
                cancel: cancel.clone(),
            },
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled { block_id: region.block_id.clone() }),
            written = target.write_block_direct(&cancel, &region.block_id, data) => written,
        };

        {
            let mut tasks = self.tasks.lock();
            if tasks
                .get(&region.block_id)
                .is_some_and(|t| t.version == region.version)
            {
                tasks.remove(&region.block_id);
            }
        }

        result?;
        self.stats.record_sync();
        self.release_flushed(region)
    }

    /// Drop a flushed region from the table if it is still the current one.
    fn release_flushed(&self, region: &FileRegion) -> Result<()> {
        let persisted = {
            let mut guard = self.table.write();
            let table = &mut *guard;
            if table.files.get(&region.block_id) != Some(region) {
                self.stats.record_stale_flush();
                return Ok(());
            }
            let Some(mmap) = table.mmap.as_mut() else {
                return Ok(());
            };
            table.files.remove(&region.block_id);
            discard_pages(mmap, &region.region);
            persist_header(&table.files, mmap)
        };

        self.allocator.free(region.start(), region.size());
        debug!("Released {} after sync", region.block_id);
        persisted
    }

    async fn sync_all(&self) -> Result<()> {
        let regions: Vec<FileRegion> = self.table.read().files.values().cloned().collect();
        if regions.is_empty() {
            return Ok(());
        }

        let total = regions.len();
        let results: Vec<Result<()>> = stream::iter(regions)
            .map(|region| self.flush_to_target(region))
            .buffer_unordered(self.config.sync_concurrency.max(1))
            .collect()
            .await;

        let mut failures = results.into_iter().filter_map(|r| r.err());
        match failures.next() {
            None => Ok(()),
            Some(first) => {
                let failed = 1 + failures.count();
                warn!("{} of {} blocks failed to sync", failed, total);
                Err(first)
            }
        }
    }

    /// Rewrite the header and sync it to disk.
    fn save_metadata(&self) -> Result<()> {
        let mut guard = self.table.write();
        let table = &mut *guard;
        let Some(mmap) = table.mmap.as_mut() else {
            return Ok(());
        };
        metadata::write_table(&mut mmap[..HEADER_SIZE], table.files.values())?;
        mmap.flush_range(0, HEADER_SIZE)?;
        Ok(())
    }

    /// Flush and unmap the mapping, then sync and close the file.
    fn unmap(&self) -> Result<()> {
        let mmap = self.table.write().mmap.take();
        let flushed = match mmap {
            Some(mmap) => mmap.flush(),
            None => Ok(()),
        };

        let synced = match self.file.lock().take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        };

        flushed?;
        synced?;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn install_locked<C: AsRef<[u8]>>(
    table: &mut Table,
    region: &FileRegion,
    chunks: &[C],
) -> Result<Installed> {
    let Some(mmap) = table.mmap.as_mut() else {
        return Err(Error::SystemClosed);
    };

    match table.files.get(&region.block_id) {
        Some(existing) if existing.version > region.version => return Ok(Installed::Stale),
        Some(_) => {}
        None if table.files.len() >= METADATA_MAX_FILES => {
            return Err(Error::TableFull {
                max: METADATA_MAX_FILES,
            })
        }
        None => {}
    }

    let mut cursor = region.start() as usize;
    for chunk in chunks {
        let bytes = chunk.as_ref();
        mmap[cursor..cursor + bytes.len()].copy_from_slice(bytes);
        cursor += bytes.len();
    }

    let old = table.files.insert(region.block_id.clone(), region.clone());
    if let Err(e) = persist_header(&table.files, mmap) {
        match &old {
            Some(previous) => table.files.insert(region.block_id.clone(), previous.clone()),
            None => table.files.remove(&region.block_id),
        };
        return Err(e);
    }

    if let Err(e) = mmap.flush_async_range(region.start() as usize, region.size() as usize) {
        debug!("Async flush of {} failed: {}", region.block_id, e);
    }
    if let Some(previous) = &old {
        discard_pages(mmap, &previous.region);
    }

    Ok(Installed::Replaced(old))
}

/// Rewrite the header from the table and schedule it for writeback.
fn persist_header(files: &HashMap<String, FileRegion>, mmap: &mut MmapMut) -> Result<()> {
    metadata::write_table(&mut mmap[..HEADER_SIZE], files.values())?;
    mmap.flush_async_range(0, HEADER_SIZE)?;
    Ok(())
}

/// Rebuild the table from the header, reserving every recovered range.
fn load_metadata(
    mmap: &mut MmapMut,
    allocator: &RegionAllocator,
    capacity: u64,
    previous_len: u64,
) -> Result<HashMap<String, FileRegion>> {
    let state = if previous_len < HEADER_SIZE as u64 {
        HeaderState::Fresh
    } else {
        metadata::read_prefix(&mmap[..HEADER_SIZE])?
    };

    allocator.alloc_at(0, HEADER_SIZE as u64)?;

    let mut files: HashMap<String, FileRegion> = HashMap::new();
    if state == HeaderState::Fresh {
        metadata::write_table(&mut mmap[..HEADER_SIZE], files.values())?;
        mmap.flush_range(0, HEADER_SIZE)?;
        info!("Initialized metadata header ({} bytes)", HEADER_SIZE);
        return Ok(files);
    }

    let mut discarded = 0;
    for idx in 0..METADATA_MAX_FILES {
        let slot = metadata::read_slot(&mmap[..HEADER_SIZE], idx);
        if slot.discard {
            continue;
        }
        if !slot.is_live(capacity) {
            warn!(
                "Discarding header slot {} with invalid range [{}, {})",
                idx, slot.start, slot.end
            );
            metadata::mark_discarded(&mut mmap[..HEADER_SIZE], idx);
            discarded += 1;
            continue;
        }

        let region = slot.into_file_region();
        if let Some(existing) = files.get(&region.block_id) {
            if existing.version >= region.version {
                warn!("Discarding duplicate slot {} for {}", idx, region.block_id);
                metadata::mark_discarded(&mut mmap[..HEADER_SIZE], idx);
                discarded += 1;
                continue;
            }
        }

        if let Err(e) = allocator.alloc_at(region.start(), region.end()) {
            warn!("Discarding slot {} for {}: {}", idx, region.block_id, e);
            metadata::mark_discarded(&mut mmap[..HEADER_SIZE], idx);
            discarded += 1;
            continue;
        }

        if let Some(older) = files.insert(region.block_id.clone(), region) {
            allocator.free(older.start(), older.size());
        }
    }

    if discarded > 0 {
        mmap.flush_range(0, HEADER_SIZE)?;
    }
    Ok(files)
}

/// Reject ids that are empty, escape a directory or overflow a header field.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.contains("..")
        || id.contains(['/', '\\', '\0'])
        || !metadata::id_fits(id)
    {
        return Err(Error::InvalidPath(id.to_string()));
    }
    Ok(())
}

fn page_size() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as u64;
        }
    }
    4096
}

/// Tell the kernel the whole pages inside `region` need not be kept.
fn discard_pages(mmap: &mut MmapMut, region: &Region) {
    let page = page_size();
    let start = region.start.div_ceil(page) * page;
    let end = region.end / page * page;
    if end <= start || end as usize > mmap.len() {
        return;
    }

    #[cfg(unix)]
    {
        // SAFETY: [start, end) was bounds-checked against the mapping above.
        // The caller holds the table write lock and no live region overlaps
        // the range, so no reference into these pages exists.
        let rc = unsafe {
            libc::madvise(
                mmap.as_mut_ptr().add(start as usize) as *mut libc::c_void,
                (end - start) as usize,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            debug!(
                "madvise(DONTNEED) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let len = libc::off_t::try_from(len)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "length too large"))?;
    // SAFETY: the descriptor is owned by `file` and valid for this call
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::from_raw_os_error(rc))
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _len: u64) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiered::target::InMemoryTarget;
    use assert_matches::assert_matches;
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;

    fn test_config(dir: &Path) -> StoreConfig {
        StoreConfig {
            sync_interval: Duration::from_secs(3600),
            retry_delay: Duration::from_millis(1),
            ..StoreConfig::new(dir, MB)
        }
    }

    /// Target whose uploads take `delay` and stop early when cancelled.
    struct SlowTarget {
        inner: InMemoryTarget,
        delay: Duration,
        started: std::sync::atomic::AtomicU64,
    }

    impl SlowTarget {
        fn new(delay: Duration) -> Self {
            Self {
                inner: InMemoryTarget::new(),
                delay,
                started: std::sync::atomic::AtomicU64::new(0),
            }
        }

        async fn wait_started(&self, uploads: u64) {
            for _ in 0..500 {
                if self.started.load(Ordering::SeqCst) >= uploads {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("upload never started");
        }
    }

    #[async_trait::async_trait]
    impl SyncTargetor for SlowTarget {
        fn block_path(&self, block_id: &str) -> PathBuf {
            self.inner.block_path(block_id)
        }

        async fn write_block_direct(
            &self,
            cancel: &CancellationToken,
            block_id: &str,
            data: Bytes,
        ) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled { block_id: block_id.to_string() }),
                _ = tokio::time::sleep(self.delay) => {
                    self.inner.write_block_direct(cancel, block_id, data).await
                }
            }
        }

        async fn read_block(&self, block_id: &str, offset: u64, length: u64) -> Result<Bytes> {
            self.inner.read_block(block_id, offset, length).await
        }

        async fn delete_block(&self, block_id: &str) -> Result<()> {
            self.inner.delete_block(block_id).await
        }

        async fn block_exists(&self, block_id: &str) -> bool {
            self.inner.block_exists(block_id).await
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_validate_id() {
        assert!(validate_id("block-01").is_ok());
        assert_matches!(validate_id(""), Err(Error::InvalidPath(_)));
        assert_matches!(validate_id("../etc"), Err(Error::InvalidPath(_)));
        assert_matches!(validate_id("a/b"), Err(Error::InvalidPath(_)));
        assert_matches!(validate_id(&"x".repeat(33)), Err(Error::InvalidPath(_)));
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    // =========================================================================
    // Write / Read
    // =========================================================================

    #[tokio::test]
    async fn test_fresh_store_reserves_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();

        assert_eq!(store.free_space(), MB - HEADER_SIZE as u64);
        assert!(store.path().ends_with(MMAP_FILE_NAME));
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), MB);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_chunks_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();

        store
            .write("s1", "b1", &[&b"hello "[..], &b"world"[..]], 1)
            .await
            .unwrap();
        let data = store.read("s1", "b1", 0, 0).await.unwrap();
        assert_eq!(&data[..], b"hello world");

        let part = store.read("s1", "b1", 6, 3).await.unwrap();
        assert_eq!(&part[..], b"wor");

        assert_matches!(
            store.read("s1", "b1", 12, 0).await,
            Err(Error::OutOfBounds { .. })
        );
        assert_matches!(
            store.read("s1", "b1", 6, 6).await,
            Err(Error::OutOfBounds { .. })
        );
        assert_matches!(
            store.read("s1", "missing", 0, 0).await,
            Err(Error::FileNotFound(_))
        );

        let stats = store.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.resident_blocks, 1);
    }

    #[tokio::test]
    async fn test_rejects_oversized_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();

        let big = vec![0u8; (MB + 1) as usize];
        assert_matches!(
            store.write("s1", "big", &[big], 1).await,
            Err(Error::FileTooLarge { .. })
        );

        let almost = vec![0u8; (MB - 1) as usize];
        assert_matches!(
            store.write("s1", "almost", &[almost], 1).await,
            Err(Error::SpaceExhausted { .. })
        );

        assert_matches!(
            store.write("s1", "..", &[b"x"], 1).await,
            Err(Error::InvalidPath(_))
        );
        assert_eq!(store.free_space(), MB - HEADER_SIZE as u64);
    }

    #[tokio::test]
    async fn test_table_full() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();

        for i in 0..METADATA_MAX_FILES {
            store
                .write("s1", &format!("b{}", i), &[b"x"], 1)
                .await
                .unwrap();
        }
        assert_matches!(
            store.write("s1", "overflow", &[b"x"], 1).await,
            Err(Error::TableFull { .. })
        );
        // Rewriting a resident block is still allowed
        store.write("s1", "b0", &[b"y"], 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_length_write_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();

        store.write("s1", "b1", &[b"abc"], 1).await.unwrap();
        let empty: [&[u8]; 0] = [];
        store.write("s1", "b1", &empty, 2).await.unwrap();
        assert!(!store.is_resident("b1"));
    }

    // =========================================================================
    // Flush
    // =========================================================================

    #[tokio::test]
    async fn test_sync_moves_block_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();
        let target = Arc::new(InMemoryTarget::new());
        store.register_target("s1", target.clone());

        store.write("s1", "b1", &[b"payload"], 1).await.unwrap();
        let before = store.free_space();

        store.sync("b1").await.unwrap();
        assert!(!store.is_resident("b1"));
        assert_eq!(store.free_space(), before + 7);
        assert_eq!(&target.get("b1").unwrap()[..], b"payload");

        let data = store.read("s1", "b1", 0, 0).await.unwrap();
        assert_eq!(&data[..], b"payload");
        assert_eq!(store.stats().cache_misses, 1);
        assert!(store.exists("s1", "b1").await);
    }

    #[tokio::test]
    async fn test_sync_without_target_keeps_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();

        store.write("s1", "b1", &[b"payload"], 1).await.unwrap();
        assert_matches!(
            store.sync("b1").await,
            Err(Error::TargetNotRegistered(_))
        );
        assert!(store.is_resident("b1"));
        assert_matches!(
            store.sync("not-resident").await,
            Err(Error::FileNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_stale_flush_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();
        let target = Arc::new(InMemoryTarget::new());
        store.register_target("s1", target.clone());

        store.write("s1", "b1", &[b"v1"], 1).await.unwrap();
        let old = store.list_files().remove(0);
        store.write("s1", "b1", &[b"v2!"], 2).await.unwrap();

        store.core.flush_to_target(old).await.unwrap();
        assert!(target.is_empty());
        assert!(store.is_resident("b1"));
        assert_eq!(store.stats().stale_flushes, 1);
    }

    // =========================================================================
    // Close
    // =========================================================================

    #[tokio::test]
    async fn test_operations_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert_matches!(
            store.write("s1", "b1", &[b"x"], 1).await,
            Err(Error::SystemClosed)
        );
        assert_matches!(store.read("s1", "b1", 0, 0).await, Err(Error::SystemClosed));
        assert_matches!(store.remove("s1", "b1").await, Err(Error::SystemClosed));
        assert_matches!(store.sync_all().await, Err(Error::SystemClosed));
    }

    #[tokio::test]
    async fn test_exists_is_false_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();

        store.write("s1", "b1", &[b"kept"], 1).await.unwrap();
        assert!(store.exists("s1", "b1").await);

        // No target, so the block stays in the table
        assert_matches!(store.close().await, Err(Error::Shutdown(_)));
        assert!(!store.exists("s1", "b1").await);
    }

    #[tokio::test]
    async fn test_dropped_store_releases_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(SlowTarget::new(Duration::from_millis(300)));

        let first = TieredStore::open(test_config(dir.path())).await.unwrap();
        first.register_target("s1", target.clone());
        first.write("s1", "b1", &[b"first"], 1).await.unwrap();

        let region = first.list_files().remove(0);
        let first_core = Arc::clone(&first.core);
        let inflight = {
            let core = Arc::clone(&first_core);
            tokio::spawn(async move { core.flush_to_target(region).await })
        };
        target.wait_started(1).await;

        drop(first);
        assert!(first_core.table.read().mmap.is_none());
        assert!(first_core.file.lock().is_none());

        let second = TieredStore::open(test_config(dir.path())).await.unwrap();
        second.write("s1", "b2", &[b"second"], 1).await.unwrap();

        // The upload started by the dropped store finishes after the reopen
        let _ = inflight.await.unwrap();

        let raw = std::fs::read(dir.path().join(MMAP_FILE_NAME)).unwrap();
        let mut listed: Vec<String> = (0..METADATA_MAX_FILES)
            .map(|idx| metadata::read_slot(&raw[..HEADER_SIZE], idx))
            .filter(|slot| !slot.discard)
            .map(|slot| slot.block_id)
            .collect();
        listed.sort();
        assert_eq!(listed, vec!["b1".to_string(), "b2".to_string()]);
        assert!(second.is_resident("b1"));
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    #[tokio::test]
    async fn test_newer_flush_cancels_older_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();
        let target = Arc::new(SlowTarget::new(Duration::from_millis(300)));
        store.register_target("s1", target.clone());

        store.write("s1", "b", &[b"v1"], 1).await.unwrap();
        let older = store.list_files().remove(0);
        let older_flush = {
            let core = Arc::clone(&store.core);
            tokio::spawn(async move { core.flush_to_target(older).await })
        };
        target.wait_started(1).await;

        store.write("s1", "b", &[b"v2!"], 2).await.unwrap();
        store.sync("b").await.unwrap();
        older_flush.await.unwrap().unwrap();

        assert_eq!(&target.inner.get("b").unwrap()[..], b"v2!");
        assert_eq!(target.inner.write_count(), 1);
        assert!(store.stats().flush_failures >= 1);
        assert!(!store.is_resident("b"));
    }

    #[tokio::test]
    async fn test_remove_cancels_inflight_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::open(test_config(dir.path())).await.unwrap();
        let target = Arc::new(SlowTarget::new(Duration::from_millis(300)));
        store.register_target("s1", target.clone());

        store.write("s1", "b", &[b"doomed"], 1).await.unwrap();
        let region = store.list_files().remove(0);
        let flush = {
            let core = Arc::clone(&store.core);
            tokio::spawn(async move { core.flush_to_target(region).await })
        };
        target.wait_started(1).await;

        store.remove("s1", "b").await.unwrap();
        flush.await.unwrap().unwrap();

        assert!(target.inner.is_empty());
        assert_eq!(target.inner.write_count(), 0);
        assert!(!store.exists("s1", "b").await);
    }

    #[tokio::test]
    async fn test_remove_waits_for_upload_section() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TieredStore::open(test_config(dir.path())).await.unwrap());
        let target = Arc::new(InMemoryTarget::new());
        store.register_target("s1", target.clone());
        store.write("s1", "b", &[b"data"], 1).await.unwrap();

        // Hold the block's upload section as a flush past its checks would
        let section = store.core.key_locks.lock("b").await;
        let remover = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.remove("s1", "b").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished());

        target
            .write_block_direct(&CancellationToken::new(), "b", Bytes::from_static(b"data"))
            .await
            .unwrap();
        drop(section);

        remover.await.unwrap().unwrap();
        assert!(target.is_empty());
        assert!(!store.is_resident("b"));
        assert!(!store.exists("s1", "b").await);
    }
}
