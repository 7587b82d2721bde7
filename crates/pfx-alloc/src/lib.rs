#![forbid(unsafe_code)]
//! Allocation-bitmap collaborator.
//!
//! One bit per allocation block, most significant bit first, stored in the
//! volume's allocation fork. Mutations are simple flag-setting operations
//! with no rollback; the overlapping-extent resolver compensates for its
//! own failures by re-capturing blocks it provisionally freed.

use pfx_block::BlockDevice;
use pfx_error::{PfxError, Result};
use pfx_ondisk::{ForkData, ForkMap};
use pfx_types::BlockNumber;

pub struct Allocator<'d> {
    dev: &'d dyn BlockDevice,
    map: ForkMap,
    total_blocks: u32,
}

impl<'d> Allocator<'d> {
    #[must_use]
    pub fn new(
        dev: &'d dyn BlockDevice,
        allocation_fork: &ForkData,
        block_size: u32,
        total_blocks: u32,
    ) -> Self {
        Self {
            dev,
            map: ForkMap::new(allocation_fork, block_size),
            total_blocks,
        }
    }

    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    fn check_block_range(&self, start: u32, count: u32) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.total_blocks => Ok(()),
            _ => Err(PfxError::Internal(format!(
                "block range {start}+{count} beyond volume of {} blocks",
                self.total_blocks
            ))),
        }
    }

    fn read_byte(&self, byte_index: u64) -> Result<u8> {
        let offset = self.map.physical_offset(byte_index)?;
        Ok(self.dev.read(offset, 1)?[0])
    }

    fn write_byte(&self, byte_index: u64, value: u8) -> Result<()> {
        let offset = self.map.physical_offset(byte_index)?;
        self.dev.write(offset, &[value])
    }

    pub fn is_allocated(&self, block: BlockNumber) -> Result<bool> {
        self.check_block_range(block.0, 1)?;
        let byte = self.read_byte(u64::from(block.0 / 8))?;
        Ok(byte & (0x80 >> (block.0 % 8)) != 0)
    }

    fn set_range(&self, start: u32, count: u32, allocated: bool) -> Result<()> {
        self.check_block_range(start, count)?;
        let mut block = start;
        let end = start + count;
        while block < end {
            let byte_index = u64::from(block / 8);
            let mut byte = self.read_byte(byte_index)?;
            while block < end && u64::from(block / 8) == byte_index {
                let mask = 0x80 >> (block % 8);
                if allocated {
                    byte |= mask;
                } else {
                    byte &= !mask;
                }
                block += 1;
            }
            self.write_byte(byte_index, byte)?;
        }
        Ok(())
    }

    /// Find and mark a contiguous run of `count` free blocks.
    ///
    /// First fit from the start of the volume. Disk-full is reported as
    /// [`PfxError::DiskFull`], distinct from every other failure.
    pub fn allocate_contiguous(&self, count: u32) -> Result<BlockNumber> {
        if count == 0 {
            return Err(PfxError::Internal("zero-length allocation".into()));
        }
        let mut run_start = 0_u32;
        let mut run_len = 0_u32;
        let mut block = 0_u32;
        while block < self.total_blocks {
            let byte = self.read_byte(u64::from(block / 8))?;
            if byte == 0xFF && block % 8 == 0 && block + 8 <= self.total_blocks {
                // Whole byte allocated; skip it.
                run_len = 0;
                block += 8;
                continue;
            }
            let upper = (block + 8 - block % 8).min(self.total_blocks);
            while block < upper {
                if byte & (0x80 >> (block % 8)) == 0 {
                    if run_len == 0 {
                        run_start = block;
                    }
                    run_len += 1;
                    if run_len == count {
                        self.set_range(run_start, count, true)?;
                        return Ok(BlockNumber(run_start));
                    }
                } else {
                    run_len = 0;
                }
                block += 1;
            }
        }
        Err(PfxError::DiskFull)
    }

    /// Mark a run free.
    pub fn release(&self, start: BlockNumber, count: u32) -> Result<()> {
        self.set_range(start.0, count, false)
    }

    /// Re-mark a run allocated (compensation for a provisional release).
    pub fn capture(&self, start: BlockNumber, count: u32) -> Result<()> {
        self.set_range(start.0, count, true)
    }

    /// Count free blocks by scanning the whole bitmap once. The resolver
    /// calls this a single time after its allocate/release churn.
    pub fn count_free(&self) -> Result<u32> {
        let mut free = 0_u32;
        let full_bytes = self.total_blocks / 8;
        for byte_index in 0..u64::from(full_bytes) {
            free += u32::from(self.read_byte(byte_index)?.count_zeros() as u8);
        }
        for block in full_bytes * 8..self.total_blocks {
            let byte = self.read_byte(u64::from(block / 8))?;
            if byte & (0x80 >> (block % 8)) == 0 {
                free += 1;
            }
        }
        Ok(free)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
