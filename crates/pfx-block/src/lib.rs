#![forbid(unsafe_code)]
//! Block-cache collaborator for PlusFix.
//!
//! The repair engine talks to the volume exclusively through
//! [`BlockDevice`]: byte-addressed reads and writes plus a block copy and a
//! flush. A write must be visible to a subsequent read at the same offset
//! before `flush` returns; both devices here satisfy that by construction.
//!
//! Two implementations are provided: [`MemDevice`] for tests and
//! [`FileDevice`] for repairing real volume images.

use parking_lot::Mutex;
use pfx_error::{PfxError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Synchronous, byte-addressed access to a volume.
pub trait BlockDevice {
    /// Read `len` bytes at `offset`. Short reads are errors.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`. The write is visible to subsequent reads
    /// immediately; durability is only promised after [`BlockDevice::flush`].
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Copy `len` bytes from `src` to `dst`. Ranges may not overlap.
    fn copy_blocks(&self, src: u64, dst: u64, len: u64) -> Result<()> {
        if src < dst.saturating_add(len) && dst < src.saturating_add(len) {
            return Err(PfxError::Internal(format!(
                "overlapping copy: src={src} dst={dst} len={len}"
            )));
        }
        // Chunked so a large relocation does not hold the whole run in memory.
        const CHUNK: u64 = 1 << 20;
        let mut moved = 0_u64;
        while moved < len {
            let step = (len - moved).min(CHUNK);
            let buf = self.read(src + moved, step as usize)?;
            self.write(dst + moved, &buf)?;
            moved += step;
        }
        Ok(())
    }

    /// Persist all writes issued so far.
    fn flush(&self) -> Result<()>;

    /// Total device size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(PfxError::OutOfRange {
            offset,
            len: len as u64,
            device_len,
        })?;
    if end > device_len {
        return Err(PfxError::OutOfRange {
            offset,
            len: len as u64,
            device_len,
        });
    }
    Ok(())
}

// ── MemDevice ───────────────────────────────────────────────────────────────

/// In-memory device, used by the test suites of every crate above this one.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Snapshot of the current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemDevice {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.data.lock();
        check_range(offset, len, data.len() as u64)?;
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        check_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

// ── FileDevice ──────────────────────────────────────────────────────────────

/// File-backed device for repairing a volume image in place.
pub struct FileDevice {
    file: Mutex<File>,
    len: u64,
}

impl FileDevice {
    /// Open an image read-write. The file length is fixed at open time; the
    /// repair engine never grows a volume.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl BlockDevice for FileDevice {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.len)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0_u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.len)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
