//! Extent descriptors, fork data, and overflow extent keys/records.

use pfx_types::{
    ensure_slice, read_be_u32, read_be_u64, write_be_u32, write_be_u64, CatalogNodeId, ParseError,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Number of extent descriptors stored inline in a fork or overflow record.
pub const EXTENTS_PER_RECORD: usize = 8;

/// Serialized size of an [`ExtentRecord`].
pub const EXTENT_RECORD_SIZE: usize = EXTENTS_PER_RECORD * 8;

/// Serialized size of [`ForkData`].
pub const FORK_DATA_SIZE: usize = 80;

/// Serialized size of an [`ExtentKey`] including its length prefix.
pub const EXTENT_KEY_SIZE: usize = 12;

// ── ExtentDescriptor ────────────────────────────────────────────────────────

/// A contiguous run of allocation blocks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    #[must_use]
    pub fn new(start_block: u32, block_count: u32) -> Self {
        Self {
            start_block,
            block_count,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    /// One past the last block of the run.
    #[must_use]
    pub fn end_block(&self) -> u32 {
        self.start_block.saturating_add(self.block_count)
    }

    /// Whether two runs share any block.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start_block < other.end_block()
            && other.start_block < self.end_block()
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            start_block: read_be_u32(buf, offset)?,
            block_count: read_be_u32(buf, offset + 4)?,
        })
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) {
        write_be_u32(buf, offset, self.start_block);
        write_be_u32(buf, offset + 4, self.block_count);
    }
}

// ── ExtentRecord ────────────────────────────────────────────────────────────

/// Eight extent descriptors: the inline set of a fork, or one overflow
/// record in the extents B-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentRecord(pub [ExtentDescriptor; EXTENTS_PER_RECORD]);

impl ExtentRecord {
    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(buf, offset, EXTENT_RECORD_SIZE)?;
        let mut extents = [ExtentDescriptor::default(); EXTENTS_PER_RECORD];
        for (i, ext) in extents.iter_mut().enumerate() {
            *ext = ExtentDescriptor::parse(buf, offset + i * 8)?;
        }
        Ok(Self(extents))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; EXTENT_RECORD_SIZE] {
        let mut buf = [0_u8; EXTENT_RECORD_SIZE];
        for (i, ext) in self.0.iter().enumerate() {
            ext.write(&mut buf, i * 8);
        }
        buf
    }

    /// Iterate the non-empty descriptors.
    pub fn active(&self) -> impl Iterator<Item = &ExtentDescriptor> {
        self.0.iter().filter(|e| !e.is_empty())
    }

    /// Total blocks covered by the record.
    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.active().map(|e| e.block_count).sum()
    }
}

// ── ForkData ────────────────────────────────────────────────────────────────

/// Size and location of one fork of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: ExtentRecord,
}

impl ForkData {
    /// A fork holding a single contiguous run, as the rebuilder produces.
    #[must_use]
    pub fn contiguous(start_block: u32, block_count: u32, block_size: u32) -> Self {
        let mut extents = ExtentRecord::default();
        extents.0[0] = ExtentDescriptor::new(start_block, block_count);
        Self {
            logical_size: u64::from(block_count) * u64::from(block_size),
            clump_size: block_size,
            total_blocks: block_count,
            extents,
        }
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            logical_size: read_be_u64(buf, offset)?,
            clump_size: read_be_u32(buf, offset + 8)?,
            total_blocks: read_be_u32(buf, offset + 12)?,
            extents: ExtentRecord::parse(buf, offset + 16)?,
        })
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) {
        write_be_u64(buf, offset, self.logical_size);
        write_be_u32(buf, offset + 8, self.clump_size);
        write_be_u32(buf, offset + 12, self.total_blocks);
        buf[offset + 16..offset + 16 + EXTENT_RECORD_SIZE]
            .copy_from_slice(&self.extents.to_bytes());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_blocks == 0
    }
}

// ── ForkKind ────────────────────────────────────────────────────────────────

/// Which fork of a file an extent key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ForkKind {
    Data,
    Resource,
}

impl ForkKind {
    const RAW_DATA: u8 = 0x00;
    const RAW_RESOURCE: u8 = 0xFF;

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            Self::RAW_DATA => Ok(Self::Data),
            Self::RAW_RESOURCE => Ok(Self::Resource),
            _ => Err(ParseError::InvalidField {
                field: "fork_type",
                reason: "must be 0x00 (data) or 0xFF (resource)",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Data => Self::RAW_DATA,
            Self::Resource => Self::RAW_RESOURCE,
        }
    }
}

// ── ExtentKey ───────────────────────────────────────────────────────────────

/// Key of an overflow extent record: (file, fork, starting file block).
///
/// Layout: u16 key length (always 10), u8 fork type, u8 pad, u32 file id,
/// u32 start block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentKey {
    pub fork: ForkKind,
    pub file_id: CatalogNodeId,
    pub start_block: u32,
}

impl ExtentKey {
    #[must_use]
    pub fn new(fork: ForkKind, file_id: CatalogNodeId, start_block: u32) -> Self {
        Self {
            fork,
            file_id,
            start_block,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let key_len = pfx_types::read_be_u16(buf, 0)?;
        if key_len != 10 {
            return Err(ParseError::InvalidField {
                field: "extent_key_length",
                reason: "must be 10",
            });
        }
        let raw_fork = ensure_slice(buf, 2, 1)?[0];
        Ok(Self {
            fork: ForkKind::from_raw(raw_fork)?,
            file_id: CatalogNodeId(read_be_u32(buf, 4)?),
            start_block: read_be_u32(buf, 8)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; EXTENT_KEY_SIZE] {
        let mut buf = [0_u8; EXTENT_KEY_SIZE];
        pfx_types::write_be_u16(&mut buf, 0, 10);
        buf[2] = self.fork.to_raw();
        // buf[3] is pad
        write_be_u32(&mut buf, 4, self.file_id.0);
        write_be_u32(&mut buf, 8, self.start_block);
        buf
    }
}

/// Extent-tree key order: file id, then fork, then start block.
#[must_use]
pub fn extent_key_cmp(a: &[u8], b: &[u8]) -> Ordering {
    match (ExtentKey::decode(a), ExtentKey::decode(b)) {
        (Ok(ka), Ok(kb)) => ka
            .file_id
            .cmp(&kb.file_id)
            .then(ka.fork.cmp(&kb.fork))
            .then(ka.start_block.cmp(&kb.start_block)),
        // Malformed keys only arise inside nodes already failing validation;
        // byte order keeps the comparator total.
        _ => a.cmp(b),
    }
}

// ── ForkMap ─────────────────────────────────────────────────────────────────

/// Logical-to-physical byte mapping for a fork addressed by its inline
/// extents. Tree files are required to resolve within these eight runs.
#[derive(Debug, Clone)]
pub struct ForkMap {
    block_size: u32,
    extents: Vec<ExtentDescriptor>,
}

impl ForkMap {
    #[must_use]
    pub fn new(fork: &ForkData, block_size: u32) -> Self {
        Self {
            block_size,
            extents: fork.extents.active().copied().collect(),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total blocks covered by the map.
    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.extents.iter().map(|e| e.block_count).sum()
    }

    /// Physical byte offset of a logical byte offset within the fork.
    ///
    /// The caller is responsible for not reading across a run boundary;
    /// tree nodes never straddle one because node size divides block size
    /// or vice versa and runs are whole blocks.
    pub fn physical_offset(&self, logical: u64) -> Result<u64, ParseError> {
        let mut remaining = logical;
        for ext in &self.extents {
            let run_bytes = u64::from(ext.block_count) * u64::from(self.block_size);
            if remaining < run_bytes {
                return Ok(u64::from(ext.start_block) * u64::from(self.block_size) + remaining);
            }
            remaining -= run_bytes;
        }
        Err(ParseError::InvalidField {
            field: "fork_offset",
            reason: "logical offset beyond mapped extents",
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_overlap() {
        let a = ExtentDescriptor::new(10, 5);
        let b = ExtentDescriptor::new(14, 4);
        let c = ExtentDescriptor::new(15, 4);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&ExtentDescriptor::default()));
    }

    #[test]
    fn fork_data_round_trip() {
        let fork = ForkData::contiguous(100, 8, 4096);
        let mut buf = [0_u8; FORK_DATA_SIZE];
        fork.write(&mut buf, 0);
        let parsed = ForkData::parse(&buf, 0).unwrap();
        assert_eq!(parsed, fork);
        assert_eq!(parsed.logical_size, 8 * 4096);
        assert_eq!(parsed.extents.active().count(), 1);
    }

    #[test]
    fn extent_key_round_trip_and_order() {
        let k1 = ExtentKey::new(ForkKind::Data, CatalogNodeId(20), 0);
        let k2 = ExtentKey::new(ForkKind::Data, CatalogNodeId(20), 64);
        let k3 = ExtentKey::new(ForkKind::Resource, CatalogNodeId(20), 0);
        let k4 = ExtentKey::new(ForkKind::Data, CatalogNodeId(21), 0);

        assert_eq!(ExtentKey::decode(&k1.encode()).unwrap(), k1);

        assert_eq!(extent_key_cmp(&k1.encode(), &k2.encode()), Ordering::Less);
        // Data fork sorts before resource fork for the same file.
        assert_eq!(extent_key_cmp(&k1.encode(), &k3.encode()), Ordering::Less);
        assert_eq!(extent_key_cmp(&k3.encode(), &k4.encode()), Ordering::Less);
    }

    #[test]
    fn extent_key_bad_length_rejected() {
        let mut raw = ExtentKey::new(ForkKind::Data, CatalogNodeId(5), 9).encode();
        raw[1] = 12;
        assert!(ExtentKey::decode(&raw).is_err());
    }

    #[test]
    fn fork_map_spans_runs() {
        let mut fork = ForkData::contiguous(100, 2, 512);
        fork.extents.0[1] = ExtentDescriptor::new(500, 2);
        fork.total_blocks = 4;
        let map = ForkMap::new(&fork, 512);

        assert_eq!(map.physical_offset(0).unwrap(), 100 * 512);
        assert_eq!(map.physical_offset(1023).unwrap(), 100 * 512 + 1023);
        // Third block comes from the second run.
        assert_eq!(map.physical_offset(1024).unwrap(), 500 * 512);
        assert!(map.physical_offset(4 * 512).is_err());
    }
}
