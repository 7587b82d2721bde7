//! The explicit repair context passed by reference through every phase.
//!
//! Replaces hidden global state with a plain struct: the user-abort flag
//! checked at phase boundaries and traversal batches, per-structure dirty
//! flags read by the driver, and the engine options.

use pfx_error::{PfxError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Behavior knobs for one repair run.
#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Whether the volume variant supports symlinks; when false the
    /// overlap resolver creates plain placeholder files instead.
    pub symlinks_supported: bool,
    /// Abort-flag check cadence during long traversals, in records.
    pub batch_size: u32,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            symlinks_supported: true,
            batch_size: 64,
        }
    }
}

/// Per-structure dirty flags, set by the phase that mutated the structure
/// and cleared by the driver once the change is accounted for.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureStatus {
    pub catalog_dirty: bool,
    pub extents_dirty: bool,
    pub attributes_dirty: bool,
    pub volume_dirty: bool,
}

impl StructureStatus {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn any_dirty(&self) -> bool {
        self.catalog_dirty || self.extents_dirty || self.attributes_dirty || self.volume_dirty
    }
}

pub struct RepairContext {
    abort: Arc<AtomicBool>,
    pub options: RepairOptions,
    pub status: StructureStatus,
}

impl RepairContext {
    #[must_use]
    pub fn new(options: RepairOptions) -> Self {
        Self {
            abort: Arc::new(AtomicBool::new(false)),
            options,
            status: StructureStatus::default(),
        }
    }

    /// Handle a front end can set from a signal handler.
    #[must_use]
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Cooperative cancellation point. Partial repairs committed before a
    /// checkpoint fires remain valid on disk.
    pub fn checkpoint(&self) -> Result<()> {
        if self.abort.load(Ordering::Relaxed) {
            return Err(PfxError::Cancelled);
        }
        Ok(())
    }
}

impl Default for RepairContext {
    fn default() -> Self {
        Self::new(RepairOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_until_abort() {
        let ctx = RepairContext::default();
        ctx.checkpoint().unwrap();
        ctx.request_abort();
        assert!(matches!(ctx.checkpoint(), Err(PfxError::Cancelled)));
    }

    #[test]
    fn abort_handle_is_shared() {
        let ctx = RepairContext::default();
        let handle = ctx.abort_handle();
        handle.store(true, Ordering::Relaxed);
        assert!(ctx.checkpoint().is_err());
    }

    #[test]
    fn status_flags_clear() {
        let mut ctx = RepairContext::default();
        ctx.status.catalog_dirty = true;
        ctx.status.volume_dirty = true;
        assert!(ctx.status.any_dirty());
        ctx.status.clear();
        assert!(!ctx.status.any_dirty());
    }
}
