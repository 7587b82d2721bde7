#![forbid(unsafe_code)]
//! PlusFix repair engine.
//!
//! Given a volume already diagnosed as inconsistent, this crate performs
//! the corrective actions: rebuilding a damaged B-tree from its surviving
//! leaf records, relocating overlapping extents, reconciling catalog
//! records against thread records, repairing hard-link chains, and
//! applying a queue of deferred field-level fixes.
//!
//! ## Modules
//!
//! - **context**: the explicit repair context (abort flag, status flags).
//! - **report**: typed events, sinks, and the final summary.
//! - **volume**: the open-volume handle shared by every phase.
//! - **catalog_ops**: id-indexed catalog lookups and mutations.
//! - **scan**: physical-order leaf scanner.
//! - **rebuild**: all-or-nothing tree rebuild and swap.
//! - **overlap**: overlapping-extent detection response.
//! - **threads**: orphan/thread consistency engine.
//! - **orders**: minor-repair dispatcher and its requeue protocol.

pub mod catalog_ops;
pub mod context;
pub mod orders;
pub mod overlap;
pub mod rebuild;
pub mod report;
pub mod scan;
pub mod threads;
pub mod volume;

pub use context::{RepairContext, RepairOptions, StructureStatus};
pub use orders::{QueueStats, RepairOrder, RepairQueue};
pub use overlap::{ExtentInfo, OverlapOutcome};
pub use rebuild::{RebuildOutcome, RebuildPhase};
pub use report::{EventLog, NullSink, RepairEvent, RepairSummary, ReportSink};
pub use scan::{ScannedRecord, Scanner};
pub use threads::ThreadOutcome;
pub use volume::{TreeKind, Volume};

use pfx_error::Result;
use pfx_ondisk::volume::{ATTR_INCONSISTENT, ATTR_UNMOUNTED};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, info_span};

/// Everything the diagnosis phase asks this engine to do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairPlan {
    /// Trees to rebuild from their surviving leaves.
    #[serde(default)]
    pub rebuild: Vec<TreeKind>,
    /// Overlapping-extent work items.
    #[serde(default)]
    pub overlaps: Vec<ExtentInfo>,
    /// Deferred field-level fixes.
    #[serde(default)]
    pub orders: Vec<RepairOrder>,
}

impl RepairPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rebuild.is_empty() && self.overlaps.is_empty() && self.orders.is_empty()
    }
}

fn now_mac() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    pfx_types::unix_to_mac(unix as i64)
}

/// Execute a repair plan against an open volume.
///
/// Phase order is load-bearing: tree rebuilds first (later phases need
/// working trees), then overlap resolution, then minor repairs, the
/// orphan/thread engine, and minor repairs again. The second queue run
/// picks up orders that false-succeeded before thread consistency was
/// restored, plus the chain fixes the thread engine itself enqueued.
pub fn repair_volume(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    plan: RepairPlan,
    sink: &mut dyn ReportSink,
) -> Result<RepairSummary> {
    let span = info_span!("repair_volume");
    let _guard = span.enter();
    let mut summary = RepairSummary::default();

    for kind in &plan.rebuild {
        ctx.checkpoint()?;
        let outcome = rebuild::rebuild_tree(ctx, vol, *kind, sink)?;
        summary.trees_rebuilt += 1;
        summary.records_recovered += outcome.records;
    }

    ctx.checkpoint()?;
    if !plan.overlaps.is_empty() {
        let outcome = overlap::resolve_overlaps(ctx, vol, plan.overlaps, sink)?;
        summary.overlaps_repaired = outcome.repaired;
        summary.overlaps_failed = outcome.failed;
        summary.disk_full |= outcome.disk_full;
    }

    let mut queue = RepairQueue::from_orders(plan.orders);

    ctx.checkpoint()?;
    let first_pass = orders::run_queue(ctx, vol, &mut queue, sink)?;

    ctx.checkpoint()?;
    let threads_outcome = threads::repair_threads(ctx, vol, &mut queue, sink)?;
    summary.threads_synthesized = threads_outcome.synthesized;
    summary.orphan_threads_deleted = threads_outcome.orphans_deleted;
    summary.links_deleted = threads_outcome.links_deleted;
    summary.inodes_relocated = threads_outcome.inodes_relocated;

    ctx.checkpoint()?;
    let second_pass = orders::run_queue(ctx, vol, &mut queue, sink)?;

    summary.orders_repaired = first_pass.repaired + second_pass.repaired;
    summary.orders_failed = first_pass.failed + second_pass.failed;
    summary.orders_unresolved = queue.len() as u32;

    // Final summary flush: recount what changed, stamp the check time,
    // and only then decide whether the volume may be marked consistent.
    if ctx.status.catalog_dirty {
        let cat = vol.catalog()?;
        let (files, folders) = catalog_ops::recount(&cat)?;
        vol.header.file_count = files;
        vol.header.folder_count = folders;
    }
    vol.header.free_blocks = vol.allocator().count_free()?;
    vol.header.checked_date = now_mac();
    if summary.is_clean() {
        vol.header.attributes &= !ATTR_INCONSISTENT;
        vol.header.attributes |= ATTR_UNMOUNTED;
    }
    vol.flush_header()?;
    vol.dev.flush()?;
    ctx.status.clear();

    info!(
        trees_rebuilt = summary.trees_rebuilt,
        orders_repaired = summary.orders_repaired,
        orders_unresolved = summary.orders_unresolved,
        clean = summary.is_clean(),
        "repair run complete"
    );
    Ok(summary)
}
