//! B-tree rebuild: scan the corrupt tree's surviving leaves, reinsert
//! every record into a freshly allocated tree, and swap it in atomically.
//!
//! All-or-nothing: any failure before the swap leaves the original tree
//! untouched and releases the half-built replacement. Disk-full during
//! allocation is reported distinctly from every other failure.

use crate::context::RepairContext;
use crate::report::{RepairEvent, ReportSink};
use crate::scan::Scanner;
use crate::volume::{TreeKind, Volume};
use pfx_btree::Tree;
use pfx_error::{PfxError, Result};
use pfx_ondisk::{
    AttributeKey, AttributeRecord, CatalogKey, CatalogRecord, ExtentKey, ExtentRecord, ForkData,
    ForkMap,
};
use pfx_types::BlockNumber;
use tracing::{debug, info, warn};

/// Rebuild progression; `Failed` is reachable from every other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPhase {
    Idle,
    Allocating,
    Inserting,
    Finalizing,
    Swapped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RebuildOutcome {
    pub tree: TreeKind,
    pub records: u64,
    pub skipped_nodes: u32,
    pub new_start: BlockNumber,
    pub released_blocks: u32,
}

/// Validate a scanned record against the codec for its tree. Exact sizes
/// for fixed types, bounded sizes for variable ones; any mismatch aborts
/// the whole rebuild.
fn validate_record(kind: TreeKind, key: &[u8], data: &[u8]) -> Result<()> {
    match kind {
        TreeKind::Catalog => {
            CatalogKey::decode(key)?;
            CatalogRecord::decode(data)?;
        }
        TreeKind::Extents => {
            ExtentKey::decode(key)?;
            if data.len() != pfx_ondisk::extents::EXTENT_RECORD_SIZE {
                return Err(PfxError::Format(format!(
                    "overflow extent record of {} bytes, expected 64",
                    data.len()
                )));
            }
            ExtentRecord::parse(data, 0)?;
        }
        TreeKind::Attributes => {
            AttributeKey::decode(key)?;
            AttributeRecord::decode(data)?;
        }
    }
    Ok(())
}

/// Rebuild one tree of the volume.
pub fn rebuild_tree(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    kind: TreeKind,
    sink: &mut dyn ReportSink,
) -> Result<RebuildOutcome> {
    ctx.checkpoint()?;
    let mut phase = RebuildPhase::Idle;
    debug!(%kind, ?phase, "starting tree rebuild");

    let old_fork = *vol.fork_of(kind);
    if old_fork.is_empty() {
        return Err(PfxError::NotFound);
    }
    let block_size = vol.block_size();

    // The corrupt tree's header node must still declare a usable node size
    // and node count; without those there is nothing to scan.
    let old_map = ForkMap::new(&old_fork, block_size);
    let old_tree = Tree::open(vol.dev, old_map, vol.tree_cmp(kind))?;
    let node_size = old_tree.header.node_size;
    let old_total_nodes = old_tree.header.total_nodes;
    let key_compare_type = old_tree.header.key_compare_type;
    drop(old_tree);

    // ── Allocating ──────────────────────────────────────────────────────
    phase = RebuildPhase::Allocating;
    let alloc = vol.allocator();
    let block_count = old_fork.total_blocks;
    let new_start = match alloc.allocate_contiguous(block_count) {
        Ok(start) => start,
        Err(PfxError::DiskFull) => {
            sink.report(RepairEvent::DiskFull {
                requested_blocks: block_count,
            });
            sink.report(RepairEvent::RebuildAborted {
                tree: kind,
                reason: "not enough contiguous space for the replacement tree".into(),
            });
            return Err(PfxError::DiskFull);
        }
        Err(other) => return Err(other),
    };

    let new_fork = ForkData::contiguous(new_start.0, block_count, block_size);

    // Everything from here to the swap is compensated on failure: the new
    // allocation is released and the original tree remains authoritative.
    let built = build_replacement(
        ctx,
        vol,
        kind,
        &old_fork,
        &new_fork,
        node_size,
        old_total_nodes,
        key_compare_type,
        &mut phase,
    );
    let (records, skipped_nodes) = match built {
        Ok(counts) => counts,
        Err(err) => {
            phase = RebuildPhase::Failed;
            warn!(%kind, ?phase, error = %err, "rebuild abandoned; original tree left intact");
            alloc.release(new_start, block_count)?;
            sink.report(RepairEvent::RebuildAborted {
                tree: kind,
                reason: err.to_string(),
            });
            return Err(err);
        }
    };

    // ── Swapped ─────────────────────────────────────────────────────────
    // Order matters: point the volume at the new tree and persist both
    // header copies before the old extents go back to the bitmap.
    phase = RebuildPhase::Swapped;
    vol.set_fork(kind, new_fork);
    vol.flush_header()?;

    let mut released_blocks = 0_u32;
    for ext in old_fork.extents.active() {
        alloc.release(BlockNumber(ext.start_block), ext.block_count)?;
        released_blocks += ext.block_count;
    }
    vol.header.free_blocks = alloc.count_free()?;
    vol.flush_header()?;

    match kind {
        TreeKind::Catalog => ctx.status.catalog_dirty = true,
        TreeKind::Extents => ctx.status.extents_dirty = true,
        TreeKind::Attributes => ctx.status.attributes_dirty = true,
    }
    ctx.status.volume_dirty = true;

    info!(%kind, records, skipped_nodes, ?phase, "tree rebuilt and swapped in");
    sink.report(RepairEvent::TreeRebuilt {
        tree: kind,
        records,
        skipped_nodes,
    });
    Ok(RebuildOutcome {
        tree: kind,
        records,
        skipped_nodes,
        new_start,
        released_blocks,
    })
}

/// Format the replacement tree, then scan-and-insert every surviving
/// record. Returns (records inserted, damaged nodes skipped).
#[expect(clippy::too_many_arguments)]
fn build_replacement(
    ctx: &RepairContext,
    vol: &Volume<'_>,
    kind: TreeKind,
    old_fork: &ForkData,
    new_fork: &ForkData,
    node_size: u16,
    old_total_nodes: u32,
    key_compare_type: u8,
    phase: &mut RebuildPhase,
) -> Result<(u64, u32)> {
    let block_size = vol.block_size();

    // Zero-fill the fresh allocation so stale bytes never masquerade as
    // tree nodes.
    let zero = vec![0_u8; 64 * 1024];
    let total_bytes = u64::from(new_fork.total_blocks) * u64::from(block_size);
    let base = u64::from(new_fork.extents.0[0].start_block) * u64::from(block_size);
    let mut written = 0_u64;
    while written < total_bytes {
        let step = (total_bytes - written).min(zero.len() as u64);
        vol.dev.write(base + written, &zero[..step as usize])?;
        written += step;
    }

    let mut new_tree = Tree::format(
        vol.dev,
        ForkMap::new(new_fork, block_size),
        node_size,
        vol.tree_cmp(kind),
        key_compare_type,
    )?;

    *phase = RebuildPhase::Inserting;
    let mut scanner = Scanner::new(
        vol.dev,
        ForkMap::new(old_fork, block_size),
        node_size,
        old_total_nodes,
    );
    let mut records = 0_u64;
    while let Some(scanned) = scanner.next_record()? {
        if records % u64::from(ctx.options.batch_size.max(1)) == 0 {
            ctx.checkpoint()?;
        }
        validate_record(kind, &scanned.key, &scanned.data)?;
        // A duplicate key here means two leaves claim the same record;
        // the insert's DuplicateRecord aborts the rebuild.
        new_tree.insert(&scanned.key, &scanned.data)?;
        records += 1;
    }

    *phase = RebuildPhase::Finalizing;
    new_tree.flush_header()?;
    vol.dev.flush()?;
    Ok((records, scanner.skipped_nodes))
}
