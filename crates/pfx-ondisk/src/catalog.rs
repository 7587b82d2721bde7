//! Catalog keys and file/folder/thread records.
//!
//! Record sizes are part of the on-disk contract: folder records are
//! exactly 88 bytes, file records exactly 248, and thread records are
//! variable (10-byte fixed part plus the name). [`CatalogRecord::decode`]
//! enforces those shapes against the declared type tag; the rebuilder
//! relies on that to reject damaged leaf records.

use crate::extents::{ForkData, FORK_DATA_SIZE};
use crate::name::CatName;
use pfx_types::{
    read_be_u16, read_be_u32, read_fixed, write_be_u16, write_be_u32, CatalogNodeId, ParseError,
};
use std::cmp::Ordering;

pub const RECORD_TYPE_FOLDER: u16 = 0x0001;
pub const RECORD_TYPE_FILE: u16 = 0x0002;
pub const RECORD_TYPE_FOLDER_THREAD: u16 = 0x0003;
pub const RECORD_TYPE_FILE_THREAD: u16 = 0x0004;

pub const FOLDER_RECORD_SIZE: usize = 88;
pub const FILE_RECORD_SIZE: usize = 248;
pub const THREAD_RECORD_FIXED_SIZE: usize = 10;
pub const THREAD_RECORD_MAX_SIZE: usize = THREAD_RECORD_FIXED_SIZE + 510;

/// A thread record exists for this file or folder.
pub const FLAG_THREAD_EXISTS: u16 = 0x0002;
/// This file record participates in a hard-link chain.
pub const FLAG_HAS_LINK_CHAIN: u16 = 0x0020;

// ── Catalog key ─────────────────────────────────────────────────────────────

/// Catalog B-tree key: parent folder id plus node name.
///
/// Layout: u16 key length (excluding itself), u32 parent id, name.
/// Thread records are keyed by (own id, empty name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: CatalogNodeId,
    pub name: CatName,
}

impl CatalogKey {
    #[must_use]
    pub fn new(parent_id: CatalogNodeId, name: CatName) -> Self {
        Self { parent_id, name }
    }

    /// The key a thread record for `id` lives under.
    #[must_use]
    pub fn thread(id: CatalogNodeId) -> Self {
        Self {
            parent_id: id,
            name: CatName::empty(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let key_len = usize::from(read_be_u16(buf, 0)?);
        if key_len < 6 {
            return Err(ParseError::InvalidField {
                field: "catalog_key_length",
                reason: "shorter than fixed part",
            });
        }
        let parent_id = CatalogNodeId(read_be_u32(buf, 2)?);
        let (name, consumed) = CatName::parse(buf, 6)?;
        if consumed + 4 != key_len {
            return Err(ParseError::InvalidField {
                field: "catalog_key_length",
                reason: "does not match encoded name length",
            });
        }
        Ok(Self { parent_id, name })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let key_len = 4 + self.name.encoded_len();
        let mut out = Vec::with_capacity(2 + key_len);
        out.extend_from_slice(&(key_len as u16).to_be_bytes());
        out.extend_from_slice(&self.parent_id.0.to_be_bytes());
        self.name.write_to(&mut out);
        out
    }

    #[must_use]
    pub fn cmp_with(&self, other: &Self, case_sensitive: bool) -> Ordering {
        self.parent_id
            .cmp(&other.parent_id)
            .then_with(|| self.name.fold_cmp(&other.name, case_sensitive))
    }
}

fn cmp_encoded(a: &[u8], b: &[u8], case_sensitive: bool) -> Ordering {
    match (CatalogKey::decode(a), CatalogKey::decode(b)) {
        (Ok(ka), Ok(kb)) => ka.cmp_with(&kb, case_sensitive),
        _ => a.cmp(b),
    }
}

/// Catalog key order for case-insensitive volumes.
#[must_use]
pub fn catalog_key_cmp_folded(a: &[u8], b: &[u8]) -> Ordering {
    cmp_encoded(a, b, false)
}

/// Catalog key order for case-sensitive volumes.
#[must_use]
pub fn catalog_key_cmp_binary(a: &[u8], b: &[u8]) -> Ordering {
    cmp_encoded(a, b, true)
}

// ── BSD info ────────────────────────────────────────────────────────────────

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;

/// Ownership, permissions, and the context-dependent `special` field
/// (inode id for link entries, link count for inode files).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

impl BsdInfo {
    pub const SIZE: usize = 16;

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = read_fixed::<2>(buf, offset + 8)?;
        Ok(Self {
            owner_id: read_be_u32(buf, offset)?,
            group_id: read_be_u32(buf, offset + 4)?,
            admin_flags: raw[0],
            owner_flags: raw[1],
            file_mode: read_be_u16(buf, offset + 10)?,
            special: read_be_u32(buf, offset + 12)?,
        })
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) {
        write_be_u32(buf, offset, self.owner_id);
        write_be_u32(buf, offset + 4, self.group_id);
        buf[offset + 8] = self.admin_flags;
        buf[offset + 9] = self.owner_flags;
        write_be_u16(buf, offset + 10, self.file_mode);
        write_be_u32(buf, offset + 12, self.special);
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_mode & S_IFMT == S_IFLNK
    }
}

// ── Folder record ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FolderRecord {
    pub flags: u16,
    /// Number of immediate children.
    pub valence: u32,
    pub folder_id: CatalogNodeId,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub bsd: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub folder_count: u32,
}

impl FolderRecord {
    fn decode_body(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            flags: read_be_u16(buf, 2)?,
            valence: read_be_u32(buf, 4)?,
            folder_id: CatalogNodeId(read_be_u32(buf, 8)?),
            create_date: read_be_u32(buf, 12)?,
            content_mod_date: read_be_u32(buf, 16)?,
            attribute_mod_date: read_be_u32(buf, 20)?,
            access_date: read_be_u32(buf, 24)?,
            backup_date: read_be_u32(buf, 28)?,
            bsd: BsdInfo::parse(buf, 32)?,
            user_info: read_fixed::<16>(buf, 48)?,
            finder_info: read_fixed::<16>(buf, 64)?,
            text_encoding: read_be_u32(buf, 80)?,
            folder_count: read_be_u32(buf, 84)?,
        })
    }

    fn encode_body(&self, buf: &mut [u8]) {
        write_be_u16(buf, 0, RECORD_TYPE_FOLDER);
        write_be_u16(buf, 2, self.flags);
        write_be_u32(buf, 4, self.valence);
        write_be_u32(buf, 8, self.folder_id.0);
        write_be_u32(buf, 12, self.create_date);
        write_be_u32(buf, 16, self.content_mod_date);
        write_be_u32(buf, 20, self.attribute_mod_date);
        write_be_u32(buf, 24, self.access_date);
        write_be_u32(buf, 28, self.backup_date);
        self.bsd.write(buf, 32);
        buf[48..64].copy_from_slice(&self.user_info);
        buf[64..80].copy_from_slice(&self.finder_info);
        write_be_u32(buf, 80, self.text_encoding);
        write_be_u32(buf, 84, self.folder_count);
    }
}

// ── File record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileRecord {
    pub flags: u16,
    /// Previous entry in this file's hard-link chain; for an inode file,
    /// the first link of the chain. Zero when unused.
    pub prev_link_id: u32,
    pub file_id: CatalogNodeId,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub bsd: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    /// Next entry in this file's hard-link chain. Zero when unused.
    pub next_link_id: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

impl FileRecord {
    fn decode_body(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            flags: read_be_u16(buf, 2)?,
            prev_link_id: read_be_u32(buf, 4)?,
            file_id: CatalogNodeId(read_be_u32(buf, 8)?),
            create_date: read_be_u32(buf, 12)?,
            content_mod_date: read_be_u32(buf, 16)?,
            attribute_mod_date: read_be_u32(buf, 20)?,
            access_date: read_be_u32(buf, 24)?,
            backup_date: read_be_u32(buf, 28)?,
            bsd: BsdInfo::parse(buf, 32)?,
            user_info: read_fixed::<16>(buf, 48)?,
            finder_info: read_fixed::<16>(buf, 64)?,
            text_encoding: read_be_u32(buf, 80)?,
            next_link_id: read_be_u32(buf, 84)?,
            data_fork: ForkData::parse(buf, 88)?,
            resource_fork: ForkData::parse(buf, 88 + FORK_DATA_SIZE)?,
        })
    }

    fn encode_body(&self, buf: &mut [u8]) {
        write_be_u16(buf, 0, RECORD_TYPE_FILE);
        write_be_u16(buf, 2, self.flags);
        write_be_u32(buf, 4, self.prev_link_id);
        write_be_u32(buf, 8, self.file_id.0);
        write_be_u32(buf, 12, self.create_date);
        write_be_u32(buf, 16, self.content_mod_date);
        write_be_u32(buf, 20, self.attribute_mod_date);
        write_be_u32(buf, 24, self.access_date);
        write_be_u32(buf, 28, self.backup_date);
        self.bsd.write(buf, 32);
        buf[48..64].copy_from_slice(&self.user_info);
        buf[64..80].copy_from_slice(&self.finder_info);
        write_be_u32(buf, 80, self.text_encoding);
        write_be_u32(buf, 84, self.next_link_id);
        self.data_fork.write(buf, 88);
        self.resource_fork.write(buf, 88 + FORK_DATA_SIZE);
    }

    /// Whether this record is part of a hard-link chain.
    #[must_use]
    pub fn has_link_chain(&self) -> bool {
        self.flags & FLAG_HAS_LINK_CHAIN != 0
    }

    /// Fork accessor by kind.
    #[must_use]
    pub fn fork(&self, kind: crate::extents::ForkKind) -> &ForkData {
        match kind {
            crate::extents::ForkKind::Data => &self.data_fork,
            crate::extents::ForkKind::Resource => &self.resource_fork,
        }
    }

    #[must_use]
    pub fn fork_mut(&mut self, kind: crate::extents::ForkKind) -> &mut ForkData {
        match kind {
            crate::extents::ForkKind::Data => &mut self.data_fork,
            crate::extents::ForkKind::Resource => &mut self.resource_fork,
        }
    }
}

// ── Thread record ───────────────────────────────────────────────────────────

/// Maps an id back to its (parent, name), enabling id-to-path lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub is_folder: bool,
    pub parent_id: CatalogNodeId,
    pub name: CatName,
}

impl ThreadRecord {
    fn decode_body(buf: &[u8], is_folder: bool) -> Result<Self, ParseError> {
        let parent_id = CatalogNodeId(read_be_u32(buf, 4)?);
        let (name, consumed) = CatName::parse(buf, 8)?;
        if 8 + consumed != buf.len() {
            return Err(ParseError::InvalidField {
                field: "thread_record_length",
                reason: "does not match encoded name length",
            });
        }
        Ok(Self {
            is_folder,
            parent_id,
            name,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let record_type = if self.is_folder {
            RECORD_TYPE_FOLDER_THREAD
        } else {
            RECORD_TYPE_FILE_THREAD
        };
        out.extend_from_slice(&record_type.to_be_bytes());
        out.extend_from_slice(&0_u16.to_be_bytes());
        out.extend_from_slice(&self.parent_id.0.to_be_bytes());
        self.name.write_to(out);
    }
}

// ── CatalogRecord ───────────────────────────────────────────────────────────

/// Any catalog leaf record, tagged by its on-disk record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    Thread(ThreadRecord),
}

impl CatalogRecord {
    /// Decode and shape-check a record. Fixed-size types must match their
    /// size exactly; thread records must fall in the bounded range and
    /// agree with their embedded name length.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let record_type = read_be_u16(buf, 0)?;
        match record_type {
            RECORD_TYPE_FOLDER => {
                if buf.len() != FOLDER_RECORD_SIZE {
                    return Err(ParseError::InvalidField {
                        field: "folder_record_length",
                        reason: "must be exactly 88 bytes",
                    });
                }
                Ok(Self::Folder(FolderRecord::decode_body(buf)?))
            }
            RECORD_TYPE_FILE => {
                if buf.len() != FILE_RECORD_SIZE {
                    return Err(ParseError::InvalidField {
                        field: "file_record_length",
                        reason: "must be exactly 248 bytes",
                    });
                }
                Ok(Self::File(FileRecord::decode_body(buf)?))
            }
            RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {
                if buf.len() < THREAD_RECORD_FIXED_SIZE || buf.len() > THREAD_RECORD_MAX_SIZE {
                    return Err(ParseError::InvalidField {
                        field: "thread_record_length",
                        reason: "outside the 10..=520 byte range",
                    });
                }
                Ok(Self::Thread(ThreadRecord::decode_body(
                    buf,
                    record_type == RECORD_TYPE_FOLDER_THREAD,
                )?))
            }
            other => Err(ParseError::InvalidMagic {
                expected: u32::from(RECORD_TYPE_FOLDER),
                actual: u32::from(other),
            }),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Folder(folder) => {
                let mut buf = vec![0_u8; FOLDER_RECORD_SIZE];
                folder.encode_body(&mut buf);
                buf
            }
            Self::File(file) => {
                let mut buf = vec![0_u8; FILE_RECORD_SIZE];
                file.encode_body(&mut buf);
                buf
            }
            Self::Thread(thread) => {
                let mut out = Vec::with_capacity(THREAD_RECORD_FIXED_SIZE + 512);
                thread.encode_body(&mut out);
                out
            }
        }
    }

    /// Own id of a file or folder record; threads have none.
    #[must_use]
    pub fn id(&self) -> Option<CatalogNodeId> {
        match self {
            Self::Folder(folder) => Some(folder.folder_id),
            Self::File(file) => Some(file.file_id),
            Self::Thread(_) => None,
        }
    }

    #[must_use]
    pub fn is_thread(&self) -> bool {
        matches!(self, Self::Thread(_))
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder(_))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
