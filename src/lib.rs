//! tierstore - Tiered mmap Block Store
//!
//! A block cache and allocator for a deduplicating object store. Incoming
//! blocks are staged in a single pre-sized memory-mapped file, recorded in a
//! fixed header so they survive a restart, and drained in the background to
//! a durable per-storage target.
//!
//! # Architecture
//!
//! ```text
//! write ─▶ RegionAllocator ─▶ mmap ─▶ SyncPipeline ─▶ SyncTargetor
//!                               ▲                          │
//! read ─────── resident? ───────┘── no ────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`error`] - Error types
//! - [`tiered`] - Allocator, metadata header, sync pipeline, targets and store

pub mod error;
pub mod tiered;

// Re-export commonly used types
pub use error::{Error, Result};
pub use tiered::{
    DiskTarget, FileRegion, InMemoryTarget, Priority, Region, RegionAllocator, StoreConfig,
    SyncPipeline, SyncTargetor, TieredStore, FINAL_VERSION,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
