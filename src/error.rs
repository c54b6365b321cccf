//! Error types for the tiered block store

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered block store
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    /// Requested allocation size is zero
    #[error("Invalid allocation size: {0}")]
    InvalidSize(u64),

    /// No free region is large enough
    #[error("No free region of {requested} bytes (largest free block: {largest})")]
    SpaceExhausted { requested: u64, largest: u64 },

    /// A fixed-offset reservation overlaps space that is not free
    #[error("Range [{start}, {end}) is not entirely free")]
    RangeUnavailable { start: u64, end: u64 },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Block is neither resident nor present at its target
    #[error("Block not found: {0}")]
    FileNotFound(String),

    /// Block is larger than the mapped capacity
    #[error("Block of {size} bytes exceeds capacity of {capacity} bytes")]
    FileTooLarge { size: u64, capacity: u64 },

    /// Read range falls outside the block
    #[error("Read out of bounds: offset {offset}, length {length}, size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Empty, traversing or oversized identifier
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// Operation issued after shutdown
    #[error("System is closed")]
    SystemClosed,

    /// Too many resident blocks for the metadata header
    #[error("Resident block table is full ({max} entries)")]
    TableFull { max: usize },

    // =========================================================================
    // Metadata Errors
    // =========================================================================
    /// Header magic does not match
    #[error("Invalid metadata header: {0}")]
    InvalidMetadata(String),

    /// Header was written by an unsupported format version
    #[error("Unsupported metadata version {found} (expected {expected})")]
    UnsupportedMetadataVersion { found: u32, expected: u32 },

    // =========================================================================
    // Sync Errors
    // =========================================================================
    /// No targetor registered for a storage id
    #[error("No sync target registered for storage {0}")]
    TargetNotRegistered(String),

    /// The sync target reported a failure
    #[error("Sync target error: {0}")]
    Target(String),

    /// Flush was cancelled by a newer version of the same block
    #[error("Flush of block {block_id} cancelled")]
    Cancelled { block_id: String },

    /// Pipeline worker did not exit in time
    #[error("Sync pipeline did not stop within {0:?}")]
    CloseTimeout(std::time::Duration),

    /// One or more steps failed while closing
    #[error("Errors during shutdown: {}", .0.join("; "))]
    Shutdown(Vec<String>),
}

impl Error {
    /// Whether a flush that failed with this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Target(_) | Error::Cancelled { .. } | Error::Internal(_)
        )
    }
}
