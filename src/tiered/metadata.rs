//! Metadata Header
//!
//! The first [`HEADER_SIZE`] bytes of the mapped file describe every resident
//! block so the table can be rebuilt after a restart. The layout is fixed and
//! little-endian, packed field by field:
//!
//! ```text
//! ┌──────────────────────────── prefix (128 bytes) ────────────────────────────┐
//! │ magic u64 │ format u32 │                 reserved                          │
//! ├──────────────────────────── slot 0 (88 bytes) ─────────────────────────────┤
//! │ storage_id [32] │ block_id [32] │ start u64 │ end u64 │ ver i32 │ discard u8 │ pad [3]
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │ slot 1 .. slot 199                                                          │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole header is rewritten on every mutation of the table.

use super::region::{FileRegion, Region};
use crate::error::{Error, Result};

// =============================================================================
// Layout
// =============================================================================

/// "BOULDER\0" read as a little-endian integer
pub const METADATA_MAGIC: u64 = 0x424f_554c_4445_5200;

/// Current header format
pub const METADATA_VERSION: u32 = 1;

/// Number of descriptor slots, which caps the resident block count
pub const METADATA_MAX_FILES: usize = 200;

/// Width of the storage and block id fields
pub const ID_LEN: usize = 32;

/// Bytes before the first slot
pub const PREFIX_SIZE: usize = 128;

/// Bytes per descriptor slot
pub const SLOT_SIZE: usize = 88;

/// Total bytes reserved for the header at offset 0
pub const HEADER_SIZE: usize = PREFIX_SIZE + METADATA_MAX_FILES * SLOT_SIZE;

const MAGIC_OFFSET: usize = 0;
const FORMAT_OFFSET: usize = 8;

const STORAGE_ID_OFFSET: usize = 0;
const BLOCK_ID_OFFSET: usize = STORAGE_ID_OFFSET + ID_LEN;
const START_OFFSET: usize = BLOCK_ID_OFFSET + ID_LEN;
const END_OFFSET: usize = START_OFFSET + 8;
const VERSION_OFFSET: usize = END_OFFSET + 8;
const DISCARD_OFFSET: usize = VERSION_OFFSET + 4;

// =============================================================================
// Prefix
// =============================================================================

/// What the prefix of a mapped file says about its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Zero magic; the file has never held a header
    Fresh,
    /// Valid magic and a supported format
    Valid,
}

/// Inspect the header prefix.
pub fn read_prefix(buf: &[u8]) -> Result<HeaderState> {
    if buf.len() < HEADER_SIZE {
        return Ok(HeaderState::Fresh);
    }

    let magic = read_u64(buf, MAGIC_OFFSET);
    if magic == 0 {
        return Ok(HeaderState::Fresh);
    }
    if magic != METADATA_MAGIC {
        return Err(Error::InvalidMetadata(format!(
            "bad magic {:#018x}",
            magic
        )));
    }

    let found = read_u32(buf, FORMAT_OFFSET);
    if found != METADATA_VERSION {
        return Err(Error::UnsupportedMetadataVersion {
            found,
            expected: METADATA_VERSION,
        });
    }

    Ok(HeaderState::Valid)
}

/// Stamp magic and format, zeroing the reserved area.
pub fn init_prefix(buf: &mut [u8]) {
    buf[..PREFIX_SIZE].fill(0);
    buf[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
    buf[FORMAT_OFFSET..FORMAT_OFFSET + 4].copy_from_slice(&METADATA_VERSION.to_le_bytes());
}

// =============================================================================
// Slots
// =============================================================================

/// One decoded descriptor slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub storage_id: String,
    pub block_id: String,
    pub start: u64,
    pub end: u64,
    pub version: i32,
    pub discard: bool,
}

impl SlotRecord {
    fn empty() -> Self {
        Self {
            storage_id: String::new(),
            block_id: String::new(),
            start: 0,
            end: 0,
            version: 0,
            discard: true,
        }
    }

    fn from_region(region: &FileRegion) -> Self {
        Self {
            storage_id: region.storage_id.clone(),
            block_id: region.block_id.clone(),
            start: region.start(),
            end: region.end(),
            version: region.version,
            discard: false,
        }
    }

    /// Whether this slot describes a block that can be reinstalled into a
    /// mapping of `capacity` bytes.
    pub fn is_live(&self, capacity: u64) -> bool {
        !self.discard
            && !self.block_id.is_empty()
            && self.end > self.start
            && self.start >= HEADER_SIZE as u64
            && self.end <= capacity
    }

    pub fn into_file_region(self) -> FileRegion {
        FileRegion::new(
            self.storage_id,
            self.block_id,
            Region::new(self.start, self.end),
            self.version,
        )
    }

    fn encode_into(&self, slot: &mut [u8]) -> Result<()> {
        slot.fill(0);
        encode_id(&mut slot[STORAGE_ID_OFFSET..STORAGE_ID_OFFSET + ID_LEN], &self.storage_id)?;
        encode_id(&mut slot[BLOCK_ID_OFFSET..BLOCK_ID_OFFSET + ID_LEN], &self.block_id)?;
        slot[START_OFFSET..START_OFFSET + 8].copy_from_slice(&self.start.to_le_bytes());
        slot[END_OFFSET..END_OFFSET + 8].copy_from_slice(&self.end.to_le_bytes());
        slot[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&self.version.to_le_bytes());
        slot[DISCARD_OFFSET] = u8::from(self.discard);
        Ok(())
    }

    fn decode(slot: &[u8]) -> Self {
        Self {
            storage_id: decode_id(&slot[STORAGE_ID_OFFSET..STORAGE_ID_OFFSET + ID_LEN]),
            block_id: decode_id(&slot[BLOCK_ID_OFFSET..BLOCK_ID_OFFSET + ID_LEN]),
            start: read_u64(slot, START_OFFSET),
            end: read_u64(slot, END_OFFSET),
            version: read_i32(slot, VERSION_OFFSET),
            discard: slot[DISCARD_OFFSET] != 0,
        }
    }
}

fn slot_range(idx: usize) -> std::ops::Range<usize> {
    let start = PREFIX_SIZE + idx * SLOT_SIZE;
    start..start + SLOT_SIZE
}

/// Decode slot `idx`.
pub fn read_slot(buf: &[u8], idx: usize) -> SlotRecord {
    SlotRecord::decode(&buf[slot_range(idx)])
}

/// Flag slot `idx` as discarded in place.
pub fn mark_discarded(buf: &mut [u8], idx: usize) {
    buf[slot_range(idx)][DISCARD_OFFSET] = 1;
}

/// Rewrite the whole header from the live table.
///
/// Slots beyond the live entries are cleared and flagged discarded.
pub fn write_table<'a>(
    buf: &mut [u8],
    regions: impl ExactSizeIterator<Item = &'a FileRegion>,
) -> Result<()> {
    if regions.len() > METADATA_MAX_FILES {
        return Err(Error::TableFull {
            max: METADATA_MAX_FILES,
        });
    }

    init_prefix(buf);

    let mut idx = 0;
    for region in regions {
        SlotRecord::from_region(region).encode_into(&mut buf[slot_range(idx)])?;
        idx += 1;
    }

    let empty = SlotRecord::empty();
    for rest in idx..METADATA_MAX_FILES {
        empty.encode_into(&mut buf[slot_range(rest)])?;
    }

    Ok(())
}

// =============================================================================
// Field Helpers
// =============================================================================

/// Whether `id` fits in a header id field.
pub fn id_fits(id: &str) -> bool {
    id.len() <= ID_LEN
}

fn encode_id(dst: &mut [u8], id: &str) -> Result<()> {
    let bytes = id.as_bytes();
    if bytes.len() > dst.len() {
        return Err(Error::InvalidPath(id.to_string()));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn decode_id(src: &[u8]) -> String {
    let len = src.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    String::from_utf8_lossy(&src[..len]).into_owned()
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(raw)
}
