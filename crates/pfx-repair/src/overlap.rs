//! Overlapping-extent resolution: relocate data that two or more owners
//! claim, rewrite the owning record, and leave the user a pointer under
//! `DamagedFiles`.
//!
//! The pass is deliberately partial-success: an item that cannot get a
//! replacement run is recorded (disk-full flag) while its siblings still
//! get their chance, and the bitmap is compensated per item afterwards.
//! The volume free count is recomputed exactly once at the end so the
//! allocate/release churn cannot double-count.

use crate::catalog_ops::{
    create_recovery_file, ensure_folder, lookup_by_id, path_from_root, replace_record,
    RecoveryPayload, DAMAGED_FILES_DIR,
};
use crate::context::RepairContext;
use crate::report::{RepairEvent, ReportSink};
use crate::volume::{TreeKind, Volume};
use pfx_btree::Tree;
use pfx_error::{PfxError, Result};
use pfx_ondisk::{
    AttributeKey, AttributeRecord, CatalogRecord, ExtentDescriptor, ExtentKey, ExtentRecord,
    ForkKind, VolumeHeader,
};
use pfx_types::{BlockNumber, CatalogNodeId, FIRST_USER_ID, ROOT_FOLDER_ID};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Longest target path a recovery symlink will carry.
const MAX_SYMLINK_TARGET: usize = 1024;

/// One overlap-resolution work item, produced by the diagnosis phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentInfo {
    pub file_id: CatalogNodeId,
    pub fork: ForkKind,
    pub old_start: u32,
    pub block_count: u32,
    #[serde(skip)]
    pub new_start: Option<u32>,
    #[serde(skip)]
    pub repaired: bool,
}

impl ExtentInfo {
    #[must_use]
    pub fn new(file_id: CatalogNodeId, fork: ForkKind, old_start: u32, block_count: u32) -> Self {
        Self {
            file_id,
            fork,
            old_start,
            block_count,
            new_start: None,
            repaired: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OverlapOutcome {
    pub repaired: u32,
    pub failed: u32,
    pub disk_full: bool,
}

impl OverlapOutcome {
    /// The pass succeeds if anything at all was repaired.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.repaired > 0
    }
}

/// Resolve a batch of overlapping extents.
pub fn resolve_overlaps(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    mut items: Vec<ExtentInfo>,
    sink: &mut dyn ReportSink,
) -> Result<OverlapOutcome> {
    let mut outcome = OverlapOutcome::default();
    if items.is_empty() {
        return Ok(outcome);
    }
    ctx.checkpoint()?;

    // Largest requests first: they are the hardest to satisfy and placing
    // them early reduces fragmentation.
    items.sort_by(|a, b| b.block_count.cmp(&a.block_count));

    let alloc = vol.allocator();
    let block_size = u64::from(vol.block_size());

    // ── Pre-allocate replacements ───────────────────────────────────────
    let mut starved_blocks = 0_u32;
    for item in &mut items {
        ctx.checkpoint()?;
        match alloc.allocate_contiguous(item.block_count) {
            Ok(start) => item.new_start = Some(start.0),
            Err(PfxError::DiskFull) => {
                outcome.disk_full = true;
                starved_blocks += item.block_count;
            }
            Err(other) => return Err(other),
        }
    }

    // ── Copy and re-point owners ────────────────────────────────────────
    let mut cat = vol.catalog()?;
    let mut ext = vol.open_tree(TreeKind::Extents).ok();
    let mut attr = vol.open_tree(TreeKind::Attributes).ok();
    for item in &mut items {
        let Some(new_start) = item.new_start else {
            continue;
        };
        ctx.checkpoint()?;
        vol.dev.copy_blocks(
            u64::from(item.old_start) * block_size,
            u64::from(new_start) * block_size,
            u64::from(item.block_count) * block_size,
        )?;
        let owner = rewrite_owner(
            &mut cat,
            ext.as_mut(),
            attr.as_mut(),
            &mut vol.header,
            item,
            new_start,
        )?;
        match owner {
            Some(found_in) => {
                item.repaired = true;
                ctx.status.volume_dirty = true;
                match found_in {
                    TreeKind::Catalog => ctx.status.catalog_dirty = true,
                    TreeKind::Extents => ctx.status.extents_dirty = true,
                    TreeKind::Attributes => ctx.status.attributes_dirty = true,
                }
                debug!(
                    file_id = item.file_id.0,
                    old_start = item.old_start,
                    new_start,
                    "overlapping extent relocated"
                );
                sink.report(RepairEvent::FileRelocated {
                    file_id: item.file_id.0,
                    old_start: item.old_start,
                    new_start,
                    blocks: item.block_count,
                });
            }
            None => {
                warn!(
                    file_id = item.file_id.0,
                    "no structure claims the overlapped extent; leaving data in place"
                );
            }
        }
    }

    // ── DamagedFiles pointers for every moved user file ─────────────────
    for item in &items {
        if !item.repaired || item.file_id < FIRST_USER_ID {
            continue;
        }
        ctx.checkpoint()?;
        match leave_damaged_pointer(ctx, vol, &mut cat, item, sink) {
            Ok(()) => {}
            Err(PfxError::DiskFull) => outcome.disk_full = true,
            // A second overlap item for the same file already left one.
            Err(PfxError::DuplicateRecord) => {}
            Err(other) => return Err(other),
        }
    }

    // ── Compensating bitmap cleanup ─────────────────────────────────────
    for item in &items {
        if item.repaired {
            // The new blocks are live now; the overlapped originals are not.
            alloc.release(BlockNumber(item.old_start), item.block_count)?;
        } else {
            // Overlap detection provisionally freed the overlapped region;
            // this item stays where it was, so take its blocks back.
            alloc.capture(BlockNumber(item.old_start), item.block_count)?;
            if let Some(new_start) = item.new_start {
                alloc.release(BlockNumber(new_start), item.block_count)?;
            }
        }
    }

    // Single recount after all the churn above.
    vol.header.free_blocks = alloc.count_free()?;
    ctx.status.volume_dirty = true;
    vol.flush_header()?;

    for item in &items {
        if item.repaired {
            outcome.repaired += 1;
        } else {
            outcome.failed += 1;
        }
    }
    if outcome.disk_full {
        sink.report(RepairEvent::DiskFull {
            requested_blocks: starved_blocks,
        });
    }
    info!(
        repaired = outcome.repaired,
        failed = outcome.failed,
        disk_full = outcome.disk_full,
        "overlap resolution finished"
    );
    Ok(outcome)
}

/// Find the record owning `item`'s old extent and point it at `new_start`.
/// Probes, in order: reserved-file forks in the volume header, the
/// catalog, the extents overflow tree, the attributes tree. First
/// structural match wins.
fn rewrite_owner(
    cat: &mut Tree<'_>,
    ext: Option<&mut Tree<'_>>,
    attr: Option<&mut Tree<'_>>,
    header: &mut VolumeHeader,
    item: &ExtentInfo,
    new_start: u32,
) -> Result<Option<TreeKind>> {
    let matches = |desc: &ExtentDescriptor| {
        desc.start_block == item.old_start && desc.block_count == item.block_count
    };

    // (a) reserved files live in the volume header.
    if let Some(fork) = header.special_fork_mut(item.file_id) {
        for desc in fork.extents.0.iter_mut() {
            if matches(desc) {
                desc.start_block = new_start;
                // Header flush happens once at the end of the pass.
                return Ok(Some(TreeKind::Catalog));
            }
        }
    }

    // (b) catalog file record.
    if let Some((key, CatalogRecord::File(mut file))) = lookup_by_id(cat, item.file_id)? {
        let fork = file.fork_mut(item.fork);
        for desc in fork.extents.0.iter_mut() {
            if matches(desc) {
                desc.start_block = new_start;
                replace_record(cat, &key, &CatalogRecord::File(file))?;
                return Ok(Some(TreeKind::Catalog));
            }
        }
    }

    // (c) extents overflow tree.
    if let Some(ext) = ext {
        for (key_bytes, data) in ext.collect_records()? {
            let Ok(key) = ExtentKey::decode(&key_bytes) else {
                continue;
            };
            if key.file_id != item.file_id || key.fork != item.fork {
                continue;
            }
            let mut record = ExtentRecord::parse(&data, 0)?;
            for desc in record.0.iter_mut() {
                if matches(desc) {
                    desc.start_block = new_start;
                    ext.replace(&key_bytes, &record.to_bytes())?;
                    return Ok(Some(TreeKind::Extents));
                }
            }
        }
    }

    // (d) attribute tree records carrying fork data or overflow extents.
    if let Some(attr) = attr {
        for (key_bytes, data) in attr.collect_records()? {
            let Ok(key) = AttributeKey::decode(&key_bytes) else {
                continue;
            };
            if key.file_id != item.file_id {
                continue;
            }
            match AttributeRecord::decode(&data)? {
                AttributeRecord::Fork(mut fork) => {
                    let mut hit = false;
                    for desc in fork.extents.0.iter_mut() {
                        if matches(desc) {
                            desc.start_block = new_start;
                            hit = true;
                            break;
                        }
                    }
                    if hit {
                        attr.replace(&key_bytes, &AttributeRecord::Fork(fork).encode())?;
                        return Ok(Some(TreeKind::Attributes));
                    }
                }
                AttributeRecord::Extents(mut record) => {
                    let mut hit = false;
                    for desc in record.0.iter_mut() {
                        if matches(desc) {
                            desc.start_block = new_start;
                            hit = true;
                            break;
                        }
                    }
                    if hit {
                        attr.replace(&key_bytes, &AttributeRecord::Extents(record).encode())?;
                        return Ok(Some(TreeKind::Attributes));
                    }
                }
                AttributeRecord::Inline(_) => {}
            }
        }
    }

    Ok(None)
}

/// Leave a `<fileID> <filename>` entry under `DamagedFiles` pointing at
/// the moved file's original path, so the user can find data that moved.
/// Falls back to a plain placeholder when symlinks are unsupported or the
/// path is too long or could not be reconstructed.
fn leave_damaged_pointer(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    cat: &mut Tree<'_>,
    item: &ExtentInfo,
    sink: &mut dyn ReportSink,
) -> Result<()> {
    let (dir_id, created) =
        ensure_folder(cat, &mut vol.header, ROOT_FOLDER_ID, DAMAGED_FILES_DIR)?;
    if created {
        sink.report(RepairEvent::DamagedFilesCreated);
    }

    let path = path_from_root(cat, item.file_id)?;
    let leaf_name = path
        .as_deref()
        .and_then(|p| p.rsplit('/').next())
        .unwrap_or("file")
        .to_string();
    let entry_name = format!("{} {}", item.file_id.0, leaf_name);

    let alloc = vol.allocator();
    let payload = match path.as_deref() {
        Some(target)
            if ctx.options.symlinks_supported && target.len() <= MAX_SYMLINK_TARGET =>
        {
            RecoveryPayload::Symlink(target)
        }
        _ => {
            sink.report(RepairEvent::SymlinkFallback {
                file_id: item.file_id.0,
            });
            RecoveryPayload::Placeholder
        }
    };
    create_recovery_file(
        vol.dev,
        &alloc,
        cat,
        &mut vol.header,
        dir_id,
        &entry_name,
        payload,
    )?;
    ctx.status.catalog_dirty = true;
    sink.report(RepairEvent::DamagedFilesEntry {
        file_id: item.file_id.0,
        name: entry_name,
    });
    Ok(())
}
