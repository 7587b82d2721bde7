#![forbid(unsafe_code)]
//! Shared newtypes and byte-level helpers for PlusFix.
//!
//! Everything on disk is big-endian. The helpers here are the only place
//! that does raw slice arithmetic; the codec crates build on them and
//! surface [`ParseError`] for anything malformed.

use serde::{Deserialize, Serialize};

// ── Newtypes ────────────────────────────────────────────────────────────────

/// An allocation-block number within the volume.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u32);

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A B-tree node number within a tree file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeNumber(pub u32);

impl std::fmt::Display for NodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A catalog node id (file or folder id).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CatalogNodeId(pub u32);

impl std::fmt::Display for CatalogNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Reserved catalog node ids ───────────────────────────────────────────────

pub const ROOT_PARENT_ID: CatalogNodeId = CatalogNodeId(1);
pub const ROOT_FOLDER_ID: CatalogNodeId = CatalogNodeId(2);
pub const EXTENTS_FILE_ID: CatalogNodeId = CatalogNodeId(3);
pub const CATALOG_FILE_ID: CatalogNodeId = CatalogNodeId(4);
pub const BAD_BLOCK_FILE_ID: CatalogNodeId = CatalogNodeId(5);
pub const ALLOCATION_FILE_ID: CatalogNodeId = CatalogNodeId(6);
pub const STARTUP_FILE_ID: CatalogNodeId = CatalogNodeId(7);
pub const ATTRIBUTES_FILE_ID: CatalogNodeId = CatalogNodeId(8);
/// Temporary file id the rebuilder owns while a replacement tree is built.
pub const REPAIR_FILE_ID: CatalogNodeId = CatalogNodeId(14);
/// First id available for ordinary files and folders.
pub const FIRST_USER_ID: CatalogNodeId = CatalogNodeId(16);

// ── Volume constants ────────────────────────────────────────────────────────

/// Byte offset of the primary volume header from the start of the volume.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;
/// Serialized size of a volume header.
pub const VOLUME_HEADER_SIZE: usize = 512;
/// Seconds between the 1904 volume epoch and the Unix epoch.
pub const MAC_EPOCH_TO_UNIX_OFFSET: i64 = 2_082_844_800;

/// Convert a volume timestamp (seconds since 1904) to Unix seconds.
#[must_use]
pub fn mac_to_unix(secs: u32) -> i64 {
    i64::from(secs) - MAC_EPOCH_TO_UNIX_OFFSET
}

/// Convert Unix seconds to a volume timestamp, clamping out-of-range values.
#[must_use]
pub fn unix_to_mac(secs: i64) -> u32 {
    let shifted = secs.saturating_add(MAC_EPOCH_TO_UNIX_OFFSET);
    u32::try_from(shifted.clamp(0, i64::from(u32::MAX))).unwrap_or(u32::MAX)
}

// ── Parse errors ────────────────────────────────────────────────────────────

/// Error from decoding a fixed on-disk structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The input slice is too short for the structure.
    #[error("insufficient data: need {needed} bytes at offset {offset}, have {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    /// A signature or type-tag field holds an unexpected value.
    #[error("invalid magic: expected {expected:#06x}, got {actual:#06x}")]
    InvalidMagic { expected: u32, actual: u32 },
    /// A field holds a value the format does not allow.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Big-endian slice helpers ────────────────────────────────────────────────

/// Return `len` bytes at `offset`, or an [`ParseError::InsufficientData`].
pub fn ensure_slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    buf.get(offset..end).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: buf.len().saturating_sub(offset),
    })
}

pub fn read_be_u16(buf: &[u8], offset: usize) -> Result<u16, ParseError> {
    let s = ensure_slice(buf, offset, 2)?;
    Ok(u16::from_be_bytes([s[0], s[1]]))
}

pub fn read_be_u32(buf: &[u8], offset: usize) -> Result<u32, ParseError> {
    let s = ensure_slice(buf, offset, 4)?;
    Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

pub fn read_be_u64(buf: &[u8], offset: usize) -> Result<u64, ParseError> {
    let s = ensure_slice(buf, offset, 8)?;
    Ok(u64::from_be_bytes([
        s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
    ]))
}

/// Read a fixed-size byte array at `offset`.
pub fn read_fixed<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let s = ensure_slice(buf, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(s);
    Ok(out)
}

pub fn write_be_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn write_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn write_be_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn be_round_trips() {
        let mut buf = [0_u8; 16];
        write_be_u16(&mut buf, 0, 0x1234);
        write_be_u32(&mut buf, 2, 0xDEAD_BEEF);
        write_be_u64(&mut buf, 6, 0x0102_0304_0506_0708);
        assert_eq!(read_be_u16(&buf, 0).unwrap(), 0x1234);
        assert_eq!(read_be_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_be_u64(&buf, 6).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn short_read_reports_need() {
        let buf = [0_u8; 3];
        let err = read_be_u32(&buf, 1).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn mac_epoch_conversion() {
        assert_eq!(mac_to_unix(2_082_844_800), 0);
        assert_eq!(unix_to_mac(0), 2_082_844_800);
        // Pre-1904 Unix times clamp to zero.
        assert_eq!(unix_to_mac(i64::MIN), 0);
    }

    #[test]
    fn reserved_ids_are_below_first_user_id() {
        for id in [
            ROOT_PARENT_ID,
            ROOT_FOLDER_ID,
            EXTENTS_FILE_ID,
            CATALOG_FILE_ID,
            ALLOCATION_FILE_ID,
            ATTRIBUTES_FILE_ID,
            REPAIR_FILE_ID,
        ] {
            assert!(id.0 < FIRST_USER_ID.0);
        }
    }
}
