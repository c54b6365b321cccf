//! Byte ranges within the mapped address space.

use serde::Serialize;

/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Build a region from an offset and a length.
    pub fn at(offset: u64, size: u64) -> Self {
        Self {
            start: offset,
            end: offset + size,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `other` lies entirely inside this region.
    pub fn contains(&self, other: &Region) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` starts exactly where this region ends.
    pub fn touches(&self, other: &Region) -> bool {
        self.end == other.start
    }
}

/// A used region bound to the block whose bytes it holds.
///
/// Two `FileRegion`s are equal only if every field matches, which is how the
/// store tells a still-current region from one that was superseded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FileRegion {
    pub region: Region,
    pub storage_id: String,
    pub block_id: String,
    pub version: i32,
}

impl FileRegion {
    pub fn new(
        storage_id: impl Into<String>,
        block_id: impl Into<String>,
        region: Region,
        version: i32,
    ) -> Self {
        Self {
            region,
            storage_id: storage_id.into(),
            block_id: block_id.into(),
            version,
        }
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.region.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.region.end
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.region.size()
    }

    /// Whether this region carries the final version sentinel.
    pub fn is_final(&self) -> bool {
        self.version == super::FINAL_VERSION
    }
}
