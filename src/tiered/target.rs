//! Sync Targets - where flushed blocks durably live
//!
//! A [`SyncTargetor`] is registered per storage id. The store calls
//! [`SyncTargetor::write_block_direct`] from its flush path and falls back to
//! [`SyncTargetor::read_block`] when a block is no longer resident.
//!
//! Two implementations ship with the crate:
//!
//! - [`DiskTarget`] - one file per block under a two-level fan-out directory
//! - [`InMemoryTarget`] - DashMap-backed, for tests and embedding

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// Durable home of the blocks of one storage backend.
#[async_trait]
pub trait SyncTargetor: Send + Sync {
    /// Path of the durable copy of `block_id`.
    fn block_path(&self, block_id: &str) -> PathBuf;

    /// Durably store `data` as `block_id`.
    ///
    /// Must be safe to retry, and should stop early once `cancel` fires.
    async fn write_block_direct(
        &self,
        cancel: &CancellationToken,
        block_id: &str,
        data: Bytes,
    ) -> Result<()>;

    /// Read `length` bytes at `offset` of the durable copy (`0` reads to the
    /// end).
    async fn read_block(&self, block_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        read_file_range(&self.block_path(block_id), block_id, offset, length).await
    }

    /// Remove the durable copy. Missing blocks are not an error.
    async fn delete_block(&self, block_id: &str) -> Result<()> {
        match fs::remove_file(self.block_path(block_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn block_exists(&self, block_id: &str) -> bool {
        fs::try_exists(self.block_path(block_id))
            .await
            .unwrap_or(false)
    }
}

/// Resolve the readable window of a `size`-byte block.
///
/// `length == 0` selects everything from `offset` to the end.
pub(crate) fn read_window(offset: u64, length: u64, size: u64) -> Result<u64> {
    if offset > size {
        return Err(Error::OutOfBounds {
            offset,
            length,
            size,
        });
    }
    let available = size - offset;
    if length == 0 {
        return Ok(available);
    }
    if length > available {
        return Err(Error::OutOfBounds {
            offset,
            length,
            size,
        });
    }
    Ok(length)
}

/// Seeked read of a block file, tolerating a file that shrinks mid-read.
async fn read_file_range(path: &Path, block_id: &str, offset: u64, length: u64) -> Result<Bytes> {
    let mut file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::FileNotFound(block_id.to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    let size = file.metadata().await?.len();
    let want = read_window(offset, length, size)?;

    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; want as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);

    Ok(Bytes::from(buf))
}

// =============================================================================
// Disk Target
// =============================================================================

/// Blocks as files under `root/<id[0..2]>/<id[2..4]>/<id>`.
///
/// Writes go to a temporary sibling that is renamed into place, so readers
/// never observe a partial block.
#[derive(Debug, Clone)]
pub struct DiskTarget {
    root: PathBuf,
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

impl DiskTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cancelled(block_id: &str) -> Error {
        Error::Cancelled {
            block_id: block_id.to_string(),
        }
    }

    async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl SyncTargetor for DiskTarget {
    fn block_path(&self, block_id: &str) -> PathBuf {
        match (block_id.get(0..2), block_id.get(2..4)) {
            (Some(first), Some(second)) => self.root.join(first).join(second).join(block_id),
            _ => self.root.join(block_id),
        }
    }

    #[instrument(level = "trace", skip(self, cancel, data), fields(len = data.len()))]
    async fn write_block_direct(
        &self,
        cancel: &CancellationToken,
        block_id: &str,
        data: Bytes,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Self::cancelled(block_id));
        }

        let path = self.block_path(block_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_file_name(format!("{}.tmp.{}.{}", block_id, std::process::id(), seq));

        let written = tokio::select! {
            _ = cancel.cancelled() => Err(Self::cancelled(block_id)),
            result = Self::write_file(&tmp, &data) => result,
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        if cancel.is_cancelled() {
            let _ = fs::remove_file(&tmp).await;
            return Err(Self::cancelled(block_id));
        }

        fs::rename(&tmp, &path).await?;
        debug!("Wrote block {} to {}", block_id, path.display());
        Ok(())
    }
}

// =============================================================================
// In-Memory Target
// =============================================================================

/// In-memory target for testing.
#[derive(Debug, Default)]
pub struct InMemoryTarget {
    blocks: DashMap<String, Bytes>,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes of a block.
    pub fn get(&self, block_id: &str) -> Option<Bytes> {
        self.blocks.get(block_id).map(|b| b.value().clone())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Completed writes, overwrites included.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SyncTargetor for InMemoryTarget {
    fn block_path(&self, block_id: &str) -> PathBuf {
        PathBuf::from("memory").join(block_id)
    }

    async fn write_block_direct(
        &self,
        cancel: &CancellationToken,
        block_id: &str,
        data: Bytes,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                block_id: block_id.to_string(),
            });
        }
        self.blocks.insert(block_id.to_string(), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_block(&self, block_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        let data = self
            .get(block_id)
            .ok_or_else(|| Error::FileNotFound(block_id.to_string()))?;
        let want = read_window(offset, length, data.len() as u64)?;
        Ok(data.slice(offset as usize..(offset + want) as usize))
    }

    async fn delete_block(&self, block_id: &str) -> Result<()> {
        if self.blocks.remove(block_id).is_some() {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn block_exists(&self, block_id: &str) -> bool {
        self.blocks.contains_key(block_id)
    }
}
