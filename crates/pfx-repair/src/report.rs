//! Structured reporting: the engine emits typed events into a sink and
//! never formats final user strings itself.

use crate::volume::TreeKind;
use serde::Serialize;

/// One user-relevant occurrence during a repair run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RepairEvent {
    /// An allocation could not be satisfied; surfaced once per batch.
    DiskFull { requested_blocks: u32 },
    TreeRebuilt {
        tree: TreeKind,
        records: u64,
        skipped_nodes: u32,
    },
    RebuildAborted {
        tree: TreeKind,
        reason: String,
    },
    /// A file's overlapping extent now lives at a new start block.
    FileRelocated {
        file_id: u32,
        old_start: u32,
        new_start: u32,
        blocks: u32,
    },
    DamagedFilesCreated,
    /// A pointer to a relocated file was placed under `DamagedFiles`.
    DamagedFilesEntry { file_id: u32, name: String },
    /// Symlink creation was not possible; a placeholder file was left.
    SymlinkFallback { file_id: u32 },
    LostFoundCreated,
    ThreadSynthesized { id: u32 },
    OrphanThreadDeleted { id: u32 },
    LinkEntryDeleted { link_id: u32, inode_id: u32 },
    InodeRelocated { inode_id: u32 },
    OrderRequeued { description: String },
    OrderDropped { description: String },
    OrderFailed {
        description: String,
        error: String,
    },
}

/// Where the engine sends events. The front end renders them.
pub trait ReportSink {
    fn report(&mut self, event: RepairEvent);
}

/// Sink that keeps everything, for tests and for the CLI's JSON output.
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<RepairEvent>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_matching(&self, pred: impl Fn(&RepairEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl ReportSink for EventLog {
    fn report(&mut self, event: RepairEvent) {
        self.events.push(event);
    }
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn report(&mut self, _event: RepairEvent) {}
}

/// Final accounting for a repair run. Unresolved orders make the run
/// non-clean even when everything else succeeded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairSummary {
    pub trees_rebuilt: u32,
    pub records_recovered: u64,
    pub overlaps_repaired: u32,
    pub overlaps_failed: u32,
    pub orders_repaired: u32,
    pub orders_failed: u32,
    pub orders_unresolved: u32,
    pub threads_synthesized: u32,
    pub orphan_threads_deleted: u32,
    pub links_deleted: u32,
    pub inodes_relocated: u32,
    pub disk_full: bool,
}

impl RepairSummary {
    /// Whether every requested repair landed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orders_failed == 0 && self.orders_unresolved == 0 && self.overlaps_failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_collects() {
        let mut log = EventLog::new();
        log.report(RepairEvent::DiskFull {
            requested_blocks: 8,
        });
        log.report(RepairEvent::ThreadSynthesized { id: 20 });
        assert_eq!(log.events.len(), 2);
        assert_eq!(
            log.count_matching(|e| matches!(e, RepairEvent::DiskFull { .. })),
            1
        );
    }

    #[test]
    fn summary_cleanliness() {
        let mut summary = RepairSummary::default();
        assert!(summary.is_clean());
        summary.orders_unresolved = 1;
        assert!(!summary.is_clean());
    }
}
