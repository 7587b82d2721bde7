//! Extended-attribute keys and records.
//!
//! Attribute records mirror catalog fork semantics: small payloads are
//! stored inline, larger ones through a fork descriptor whose overflow
//! extents live in further attribute records.

use crate::extents::{ExtentRecord, ForkData, EXTENT_RECORD_SIZE, FORK_DATA_SIZE};
use crate::name::CatName;
use pfx_types::{read_be_u16, read_be_u32, CatalogNodeId, ParseError};
use std::cmp::Ordering;

pub const ATTR_RECORD_INLINE: u32 = 0x10;
pub const ATTR_RECORD_FORK: u32 = 0x20;
pub const ATTR_RECORD_EXTENTS: u32 = 0x30;

/// recordType + two reserved words + attrSize.
pub const ATTR_INLINE_HEADER_SIZE: usize = 16;
pub const ATTR_FORK_RECORD_SIZE: usize = 8 + FORK_DATA_SIZE;
pub const ATTR_EXTENTS_RECORD_SIZE: usize = 8 + EXTENT_RECORD_SIZE;

// ── Attribute key ───────────────────────────────────────────────────────────

/// Attribute B-tree key: (file id, attribute name, starting file block).
///
/// Layout: u16 key length, u16 pad, u32 file id, u32 start block, name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeKey {
    pub file_id: CatalogNodeId,
    pub start_block: u32,
    pub name: CatName,
}

impl AttributeKey {
    #[must_use]
    pub fn new(file_id: CatalogNodeId, start_block: u32, name: CatName) -> Self {
        Self {
            file_id,
            start_block,
            name,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let key_len = usize::from(read_be_u16(buf, 0)?);
        if key_len < 12 {
            return Err(ParseError::InvalidField {
                field: "attribute_key_length",
                reason: "shorter than fixed part",
            });
        }
        let file_id = CatalogNodeId(read_be_u32(buf, 4)?);
        let start_block = read_be_u32(buf, 8)?;
        let (name, consumed) = CatName::parse(buf, 12)?;
        if consumed + 10 != key_len {
            return Err(ParseError::InvalidField {
                field: "attribute_key_length",
                reason: "does not match encoded name length",
            });
        }
        Ok(Self {
            file_id,
            start_block,
            name,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let key_len = 10 + self.name.encoded_len();
        let mut out = Vec::with_capacity(2 + key_len);
        out.extend_from_slice(&(key_len as u16).to_be_bytes());
        out.extend_from_slice(&0_u16.to_be_bytes());
        out.extend_from_slice(&self.file_id.0.to_be_bytes());
        out.extend_from_slice(&self.start_block.to_be_bytes());
        self.name.write_to(&mut out);
        out
    }
}

/// Attribute-tree key order: file id, then name (binary), then start block.
#[must_use]
pub fn attribute_key_cmp(a: &[u8], b: &[u8]) -> Ordering {
    match (AttributeKey::decode(a), AttributeKey::decode(b)) {
        (Ok(ka), Ok(kb)) => ka
            .file_id
            .cmp(&kb.file_id)
            .then_with(|| ka.name.fold_cmp(&kb.name, true))
            .then(ka.start_block.cmp(&kb.start_block)),
        _ => a.cmp(b),
    }
}

// ── Attribute record ────────────────────────────────────────────────────────

/// Any attribute leaf record, tagged by its on-disk record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeRecord {
    /// Payload stored inline in the leaf.
    Inline(Vec<u8>),
    /// Payload stored in a fork.
    Fork(ForkData),
    /// Overflow extents of an attribute fork.
    Extents(ExtentRecord),
}

impl AttributeRecord {
    /// Decode and shape-check: inline records must agree with their embedded
    /// size, fork and extents records are fixed-size.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let record_type = read_be_u32(buf, 0)?;
        match record_type {
            ATTR_RECORD_INLINE => {
                if buf.len() < ATTR_INLINE_HEADER_SIZE {
                    return Err(ParseError::InvalidField {
                        field: "attribute_record_length",
                        reason: "shorter than inline header",
                    });
                }
                let attr_size = read_be_u32(buf, 12)? as usize;
                if ATTR_INLINE_HEADER_SIZE + attr_size != buf.len() {
                    return Err(ParseError::InvalidField {
                        field: "attribute_size",
                        reason: "does not match record length",
                    });
                }
                Ok(Self::Inline(buf[ATTR_INLINE_HEADER_SIZE..].to_vec()))
            }
            ATTR_RECORD_FORK => {
                if buf.len() != ATTR_FORK_RECORD_SIZE {
                    return Err(ParseError::InvalidField {
                        field: "attribute_record_length",
                        reason: "fork record must be exactly 88 bytes",
                    });
                }
                Ok(Self::Fork(ForkData::parse(buf, 8)?))
            }
            ATTR_RECORD_EXTENTS => {
                if buf.len() != ATTR_EXTENTS_RECORD_SIZE {
                    return Err(ParseError::InvalidField {
                        field: "attribute_record_length",
                        reason: "extents record must be exactly 72 bytes",
                    });
                }
                Ok(Self::Extents(ExtentRecord::parse(buf, 8)?))
            }
            other => Err(ParseError::InvalidMagic {
                expected: ATTR_RECORD_INLINE,
                actual: other,
            }),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Inline(data) => {
                let mut out = vec![0_u8; ATTR_INLINE_HEADER_SIZE + data.len()];
                out[0..4].copy_from_slice(&ATTR_RECORD_INLINE.to_be_bytes());
                out[12..16].copy_from_slice(&(data.len() as u32).to_be_bytes());
                out[ATTR_INLINE_HEADER_SIZE..].copy_from_slice(data);
                out
            }
            Self::Fork(fork) => {
                let mut out = vec![0_u8; ATTR_FORK_RECORD_SIZE];
                out[0..4].copy_from_slice(&ATTR_RECORD_FORK.to_be_bytes());
                fork.write(&mut out, 8);
                out
            }
            Self::Extents(extents) => {
                let mut out = vec![0_u8; ATTR_EXTENTS_RECORD_SIZE];
                out[0..4].copy_from_slice(&ATTR_RECORD_EXTENTS.to_be_bytes());
                out[8..].copy_from_slice(&extents.to_bytes());
                out
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
