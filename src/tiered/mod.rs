//! Tiered Block Store
//!
//! Blocks are staged in a fixed-capacity memory-mapped file and drained in
//! the background to a durable per-storage target. Reads of resident blocks
//! are served from the mapping; once a block has been synced its space is
//! reclaimed and reads go to the target.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Tiered Block Store                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  ┌──────────────┐    ┌──────────────┐    ┌───────────────────────────┐  │
//! │  │    Region    │    │   Metadata   │    │      Sync Pipeline        │  │
//! │  │  Allocator   │    │    Header    │    │  (high / mid / low queue) │  │
//! │  └──────────────┘    └──────────────┘    └───────────────────────────┘  │
//! │         │                   │                         │                  │
//! │         └───────────────────┼─────────────────────────┘                  │
//! │                             │                                            │
//! │                   ┌─────────┴─────────┐        ┌──────────────────┐      │
//! │                   │    TieredStore    │ ─────▶ │   SyncTargetor   │      │
//! │                   └───────────────────┘        └──────────────────┘      │
//! │                                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Region Allocator** (`allocator.rs`): best-fit free list over the
//!   mapped address space, merging neighbours on free
//! - **Metadata Header** (`metadata.rs`): fixed little-endian table of
//!   resident blocks at the start of the file, used for recovery
//! - **Sync Pipeline** (`pipeline.rs`): prioritized batching of flushes with
//!   backpressure, supersession and hold-back of young low-priority work
//! - **Targets** (`target.rs`): durable homes of synced blocks
//! - **Store** (`store.rs`): ties the above together
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tierstore::tiered::{DiskTarget, StoreConfig, TieredStore};
//!
//! let store = TieredStore::open(StoreConfig::new("/var/cache/blocks", 1 << 30)).await?;
//! store.register_target("bucket-a", Arc::new(DiskTarget::new("/srv/blocks")));
//!
//! store.write("bucket-a", "blk-0001", &[&b"hello"[..]], 1).await?;
//! let data = store.read("bucket-a", "blk-0001", 0, 0).await?;
//!
//! store.close().await?;
//! ```

pub mod allocator;
pub mod config;
pub mod keylock;
pub mod metadata;
pub mod pipeline;
pub mod region;
pub mod stats;
pub mod store;
pub mod target;

#[cfg(test)]
mod proptest;

/// Version marking a block as complete; its flush is never deferred.
pub const FINAL_VERSION: i32 = 0x07FFFF;

/// Name of the mapped file inside the data directory
pub const MMAP_FILE_NAME: &str = ".mmap_cache.dat";

pub use allocator::RegionAllocator;
pub use config::{QueueCapacity, StoreConfig};
pub use metadata::HEADER_SIZE;
pub use pipeline::{Priority, SyncCallback, SyncPipeline};
pub use region::{FileRegion, Region};
pub use stats::StatsSnapshot;
pub use store::TieredStore;
pub use target::{DiskTarget, InMemoryTarget, SyncTargetor};
