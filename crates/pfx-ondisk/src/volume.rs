//! Volume header: primary copy at byte 1024, alternate copy 1024 bytes
//! before the end of the volume.

use crate::extents::{ForkData, FORK_DATA_SIZE};
use pfx_types::{
    read_be_u16, read_be_u32, read_be_u64, write_be_u16, write_be_u32, write_be_u64,
    CatalogNodeId, ParseError, ALLOCATION_FILE_ID, ATTRIBUTES_FILE_ID, CATALOG_FILE_ID,
    EXTENTS_FILE_ID, STARTUP_FILE_ID, VOLUME_HEADER_SIZE,
};

/// "H+": case-insensitive volume.
pub const SIGNATURE_PLUS: u16 = 0x482B;
/// "HX": case-sensitive volume.
pub const SIGNATURE_CASE_SENSITIVE: u16 = 0x4858;

pub const VERSION_PLUS: u16 = 4;
pub const VERSION_CASE_SENSITIVE: u16 = 5;

/// Volume was unmounted cleanly.
pub const ATTR_UNMOUNTED: u32 = 1 << 8;
/// Volume is marked inconsistent and needs repair.
pub const ATTR_INCONSISTENT: u32 = 1 << 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: CatalogNodeId,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_fork: ForkData,
    pub extents_fork: ForkData,
    pub catalog_fork: ForkData,
    pub attributes_fork: ForkData,
    pub startup_fork: ForkData,
}

impl VolumeHeader {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < VOLUME_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: VOLUME_HEADER_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        let signature = read_be_u16(region, 0)?;
        if signature != SIGNATURE_PLUS && signature != SIGNATURE_CASE_SENSITIVE {
            return Err(ParseError::InvalidMagic {
                expected: u32::from(SIGNATURE_PLUS),
                actual: u32::from(signature),
            });
        }
        let mut finder_info = [0_u32; 8];
        for (i, slot) in finder_info.iter_mut().enumerate() {
            *slot = read_be_u32(region, 80 + 4 * i)?;
        }
        Ok(Self {
            signature,
            version: read_be_u16(region, 2)?,
            attributes: read_be_u32(region, 4)?,
            last_mounted_version: read_be_u32(region, 8)?,
            journal_info_block: read_be_u32(region, 12)?,
            create_date: read_be_u32(region, 16)?,
            modify_date: read_be_u32(region, 20)?,
            backup_date: read_be_u32(region, 24)?,
            checked_date: read_be_u32(region, 28)?,
            file_count: read_be_u32(region, 32)?,
            folder_count: read_be_u32(region, 36)?,
            block_size: read_be_u32(region, 40)?,
            total_blocks: read_be_u32(region, 44)?,
            free_blocks: read_be_u32(region, 48)?,
            next_allocation: read_be_u32(region, 52)?,
            rsrc_clump_size: read_be_u32(region, 56)?,
            data_clump_size: read_be_u32(region, 60)?,
            next_catalog_id: CatalogNodeId(read_be_u32(region, 64)?),
            write_count: read_be_u32(region, 68)?,
            encodings_bitmap: read_be_u64(region, 72)?,
            finder_info,
            allocation_fork: ForkData::parse(region, 112)?,
            extents_fork: ForkData::parse(region, 112 + FORK_DATA_SIZE)?,
            catalog_fork: ForkData::parse(region, 112 + 2 * FORK_DATA_SIZE)?,
            attributes_fork: ForkData::parse(region, 112 + 3 * FORK_DATA_SIZE)?,
            startup_fork: ForkData::parse(region, 112 + 4 * FORK_DATA_SIZE)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; VOLUME_HEADER_SIZE] {
        let mut buf = [0_u8; VOLUME_HEADER_SIZE];
        write_be_u16(&mut buf, 0, self.signature);
        write_be_u16(&mut buf, 2, self.version);
        write_be_u32(&mut buf, 4, self.attributes);
        write_be_u32(&mut buf, 8, self.last_mounted_version);
        write_be_u32(&mut buf, 12, self.journal_info_block);
        write_be_u32(&mut buf, 16, self.create_date);
        write_be_u32(&mut buf, 20, self.modify_date);
        write_be_u32(&mut buf, 24, self.backup_date);
        write_be_u32(&mut buf, 28, self.checked_date);
        write_be_u32(&mut buf, 32, self.file_count);
        write_be_u32(&mut buf, 36, self.folder_count);
        write_be_u32(&mut buf, 40, self.block_size);
        write_be_u32(&mut buf, 44, self.total_blocks);
        write_be_u32(&mut buf, 48, self.free_blocks);
        write_be_u32(&mut buf, 52, self.next_allocation);
        write_be_u32(&mut buf, 56, self.rsrc_clump_size);
        write_be_u32(&mut buf, 60, self.data_clump_size);
        write_be_u32(&mut buf, 64, self.next_catalog_id.0);
        write_be_u32(&mut buf, 68, self.write_count);
        write_be_u64(&mut buf, 72, self.encodings_bitmap);
        for (i, value) in self.finder_info.iter().enumerate() {
            write_be_u32(&mut buf, 80 + 4 * i, *value);
        }
        self.allocation_fork.write(&mut buf, 112);
        self.extents_fork.write(&mut buf, 112 + FORK_DATA_SIZE);
        self.catalog_fork.write(&mut buf, 112 + 2 * FORK_DATA_SIZE);
        self.attributes_fork
            .write(&mut buf, 112 + 3 * FORK_DATA_SIZE);
        self.startup_fork.write(&mut buf, 112 + 4 * FORK_DATA_SIZE);
        buf
    }

    /// Basic geometry checks a repairable volume must still satisfy.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two >= 512",
            });
        }
        if self.total_blocks == 0 {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "cannot be zero",
            });
        }
        if self.free_blocks > self.total_blocks {
            return Err(ParseError::InvalidField {
                field: "free_blocks",
                reason: "exceeds total_blocks",
            });
        }
        if self.catalog_fork.is_empty() || self.allocation_fork.is_empty() {
            return Err(ParseError::InvalidField {
                field: "special_forks",
                reason: "catalog and allocation forks must be mapped",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_case_sensitive(&self) -> bool {
        self.signature == SIGNATURE_CASE_SENSITIVE
    }

    /// Byte offset of the alternate header for a device of `device_len` bytes.
    #[must_use]
    pub fn alternate_offset(device_len: u64) -> u64 {
        device_len.saturating_sub(1024)
    }

    /// Special-file fork for a reserved catalog node id, if `id` names one.
    #[must_use]
    pub fn special_fork(&self, id: CatalogNodeId) -> Option<&ForkData> {
        match id {
            EXTENTS_FILE_ID => Some(&self.extents_fork),
            CATALOG_FILE_ID => Some(&self.catalog_fork),
            ALLOCATION_FILE_ID => Some(&self.allocation_fork),
            ATTRIBUTES_FILE_ID => Some(&self.attributes_fork),
            STARTUP_FILE_ID => Some(&self.startup_fork),
            _ => None,
        }
    }

    #[must_use]
    pub fn special_fork_mut(&mut self, id: CatalogNodeId) -> Option<&mut ForkData> {
        match id {
            EXTENTS_FILE_ID => Some(&mut self.extents_fork),
            CATALOG_FILE_ID => Some(&mut self.catalog_fork),
            ALLOCATION_FILE_ID => Some(&mut self.allocation_fork),
            ATTRIBUTES_FILE_ID => Some(&mut self.attributes_fork),
            STARTUP_FILE_ID => Some(&mut self.startup_fork),
            _ => None,
        }
    }

    /// Reserved ids whose forks live in the header, in the order the
    /// overlapping-extent resolver probes them.
    pub const SPECIAL_FILE_IDS: [CatalogNodeId; 5] = [
        ALLOCATION_FILE_ID,
        EXTENTS_FILE_ID,
        CATALOG_FILE_ID,
        ATTRIBUTES_FILE_ID,
        STARTUP_FILE_ID,
    ];
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> VolumeHeader {
        VolumeHeader {
            signature: SIGNATURE_PLUS,
            version: VERSION_PLUS,
            attributes: ATTR_INCONSISTENT,
            last_mounted_version: 0x3130_2E30,
            journal_info_block: 0,
            create_date: 3_600_000_000,
            modify_date: 3_600_000_100,
            backup_date: 0,
            checked_date: 3_600_000_050,
            file_count: 10,
            folder_count: 4,
            block_size: 4096,
            total_blocks: 2048,
            free_blocks: 1000,
            next_allocation: 64,
            rsrc_clump_size: 65536,
            data_clump_size: 65536,
            next_catalog_id: CatalogNodeId(120),
            write_count: 7,
            encodings_bitmap: 1,
            finder_info: [0; 8],
            allocation_fork: ForkData::contiguous(1, 1, 4096),
            extents_fork: ForkData::contiguous(2, 4, 4096),
            catalog_fork: ForkData::contiguous(6, 8, 4096),
            attributes_fork: ForkData::default(),
            startup_fork: ForkData::default(),
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        let parsed = VolumeHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        parsed.validate_geometry().unwrap();
    }

    #[test]
    fn bad_signature_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = b'Z';
        assert!(matches!(
            VolumeHeader::parse(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn geometry_validation_catches_bad_values() {
        let mut header = sample_header();
        header.block_size = 3000;
        assert!(header.validate_geometry().is_err());

        let mut header = sample_header();
        header.free_blocks = header.total_blocks + 1;
        assert!(header.validate_geometry().is_err());

        let mut header = sample_header();
        header.catalog_fork = ForkData::default();
        assert!(header.validate_geometry().is_err());
    }

    #[test]
    fn case_sensitivity_follows_signature() {
        let mut header = sample_header();
        assert!(!header.is_case_sensitive());
        header.signature = SIGNATURE_CASE_SENSITIVE;
        assert!(header.is_case_sensitive());
    }

    #[test]
    fn special_fork_lookup() {
        let header = sample_header();
        assert!(header.special_fork(CATALOG_FILE_ID).is_some());
        assert!(header.special_fork(CatalogNodeId(99)).is_none());
        assert_eq!(
            header.special_fork(EXTENTS_FILE_ID).unwrap().total_blocks,
            4
        );
    }

    #[test]
    fn alternate_offset_is_end_minus_1024() {
        assert_eq!(VolumeHeader::alternate_offset(8 * 1024 * 1024), 8 * 1024 * 1024 - 1024);
    }
}
