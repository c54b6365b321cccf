//! Region Allocator
//!
//! Free-space bookkeeping over the fixed `[0, capacity)` address space of the
//! mapped file. The allocator knows nothing about blocks; it hands out offsets
//! and takes them back.
//!
//! # Free List
//!
//! ```text
//!   0        header        a         b              c          capacity
//!   ├──────────────────────┼─────────┼──────────────┼──────────────┤
//!   │      reserved        │  FREE   │     used     │     FREE     │
//!   └──────────────────────┴─────────┴──────────────┴──────────────┘
//!                free list = [ [header, a), [b, c) ... ]  sorted by start
//! ```
//!
//! Free regions are kept sorted by start and never overlap. Two free regions
//! are never adjacent: `free` merges a released range with its neighbours,
//! which bounds the length of the list by the number of live allocations.

use parking_lot::RwLock;

use super::region::Region;
use crate::error::{Error, Result};

/// Best-fit allocator over a fixed-size linear address space.
#[derive(Debug)]
pub struct RegionAllocator {
    /// Total size of the managed space
    capacity: u64,
    /// Start-sorted, non-overlapping, non-adjacent free ranges
    free: RwLock<Vec<Region>>,
}

impl RegionAllocator {
    /// Create an allocator whose whole space is free.
    pub fn new(capacity: u64) -> Self {
        let free = if capacity > 0 {
            vec![Region::new(0, capacity)]
        } else {
            Vec::new()
        };
        Self {
            capacity,
            free: RwLock::new(free),
        }
    }

    /// Total size of the managed space.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocate `size` bytes from the tightest-fitting free region.
    ///
    /// An exact fit ends the scan early; otherwise the smallest region that
    /// is large enough wins, ties going to the lowest offset.
    pub fn alloc_best_fit(&self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }

        let mut free = self.free.write();

        let mut best: Option<usize> = None;
        for (idx, region) in free.iter().enumerate() {
            let available = region.size();
            if available == size {
                best = Some(idx);
                break;
            }
            if available > size && best.map_or(true, |b| available < free[b].size()) {
                best = Some(idx);
            }
        }

        let Some(idx) = best else {
            return Err(Error::SpaceExhausted {
                requested: size,
                largest: largest_of(&free),
            });
        };

        let offset = free[idx].start;
        if free[idx].size() == size {
            free.remove(idx);
        } else {
            free[idx].start += size;
        }

        Ok(offset)
    }

    /// Return `[offset, offset + size)` to the free list.
    ///
    /// The caller guarantees the range is currently allocated; double frees
    /// are not detected. Freeing zero bytes does nothing.
    pub fn free(&self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }

        let released = Region::at(offset, size);
        let mut free = self.free.write();

        let mut idx = free.partition_point(|r| r.start < released.start);
        free.insert(idx, released);

        if idx + 1 < free.len() && free[idx].touches(&free[idx + 1]) {
            free[idx].end = free[idx + 1].end;
            free.remove(idx + 1);
        }

        if idx > 0 && free[idx - 1].touches(&free[idx]) {
            free[idx - 1].end = free[idx].end;
            free.remove(idx);
            idx -= 1;
        }

        debug_assert!(free[idx].end <= self.capacity);
    }

    /// Reserve exactly `[start, end)`, which must be entirely free.
    ///
    /// Used for the metadata header and for reinstalling recovered blocks.
    pub fn alloc_at(&self, start: u64, end: u64) -> Result<()> {
        if end <= start {
            return Err(Error::InvalidSize(0));
        }

        let wanted = Region::new(start, end);
        let mut free = self.free.write();

        let idx = free
            .iter()
            .position(|r| r.contains(&wanted))
            .ok_or(Error::RangeUnavailable { start, end })?;

        let host = free[idx];
        match (host.start == start, host.end == end) {
            (true, true) => {
                free.remove(idx);
            }
            (true, false) => free[idx].start = end,
            (false, true) => free[idx].end = start,
            (false, false) => {
                free[idx].end = start;
                free.insert(idx + 1, Region::new(end, host.end));
            }
        }

        Ok(())
    }

    /// Total free bytes.
    pub fn free_space(&self) -> u64 {
        self.free.read().iter().map(Region::size).sum()
    }

    /// Size of the biggest contiguous free region.
    pub fn largest_free_block(&self) -> u64 {
        largest_of(&self.free.read())
    }

    /// Snapshot of the free list.
    pub fn free_regions(&self) -> Vec<Region> {
        self.free.read().clone()
    }
}

fn largest_of(free: &[Region]) -> u64 {
    free.iter().map(Region::size).max().unwrap_or(0)
}
