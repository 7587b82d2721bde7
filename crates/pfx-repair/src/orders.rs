//! Minor-repair dispatcher: a FIFO queue of small, declarative fixes with
//! a single-retry requeue protocol.
//!
//! Every order locates its target record by id or key, asserts the
//! recorded "incorrect" value still matches the disk, writes the
//! "correct" value, and persists. An order whose target cannot be located
//! because its thread record is missing reports **false success** and is
//! requeued; the driver runs the queue once before and once after the
//! orphan/thread engine, which breaks the dependency cycle. A second
//! false success means the target really is gone and the order is dropped
//! as failed.

use crate::catalog_ops::{
    delete_record, find_record, lookup_by_id, replace_record, bump_valence,
};
use crate::context::RepairContext;
use crate::report::{RepairEvent, ReportSink};
use crate::volume::{TreeKind, Volume};
use pfx_alloc::Allocator;
use pfx_btree::Tree;
use pfx_error::{PfxError, Result};
use pfx_ondisk::{
    CatName, CatalogKey, CatalogRecord, ExtentDescriptor, ExtentKey, ExtentRecord, ForkKind,
    VolumeHeader,
};
use pfx_types::{read_be_u16, write_be_u16, BlockNumber, CatalogNodeId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

// ── Orders ──────────────────────────────────────────────────────────────────

/// One deferred field-level fix. A closed set: the dispatcher matches
/// exhaustively, so an unknown repair type cannot exist at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairOrder {
    /// Correct a folder's child count.
    FolderValence {
        folder_id: CatalogNodeId,
        incorrect: u32,
        correct: u32,
    },
    /// Correct the finder-flag word of a file or folder.
    FinderFlags {
        id: CatalogNodeId,
        incorrect: u16,
        correct: u16,
    },
    /// Delete a data node nothing links to, returning its blocks.
    DeleteOrphanedNode { file_id: CatalogNodeId },
    /// Fix a hard-link entry's previous-link id.
    LinkChainPrev {
        file_id: CatalogNodeId,
        incorrect: u32,
        correct: u32,
    },
    /// Fix a hard-link entry's next-link id.
    LinkChainNext {
        file_id: CatalogNodeId,
        incorrect: u32,
        correct: u32,
    },
    /// Fix the first-link id stored on a link target (inode) file.
    LinkChainFirst {
        inode_id: CatalogNodeId,
        incorrect: u32,
        correct: u32,
    },
    /// Rename an entry whose name the catalog forbids.
    RenameIllegalName {
        parent_id: CatalogNodeId,
        incorrect: String,
        correct: String,
    },
    /// Truncate a fork to its recorded block count.
    TruncateFork {
        file_id: CatalogNodeId,
        fork: ForkKind,
        incorrect_blocks: u32,
        correct_blocks: u32,
    },
    /// Clamp an extent descriptor that reaches past the volume.
    ClampBadExtent {
        file_id: CatalogNodeId,
        fork: ForkKind,
        index: u8,
        incorrect: ExtentDescriptor,
        correct: ExtentDescriptor,
    },
}

impl RepairOrder {
    /// Short description used in events; never a final user string.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::FolderValence { folder_id, .. } => format!("folder {folder_id} valence"),
            Self::FinderFlags { id, .. } => format!("finder flags of {id}"),
            Self::DeleteOrphanedNode { file_id } => format!("orphaned node {file_id}"),
            Self::LinkChainPrev { file_id, .. } => format!("link {file_id} previous id"),
            Self::LinkChainNext { file_id, .. } => format!("link {file_id} next id"),
            Self::LinkChainFirst { inode_id, .. } => format!("inode {inode_id} first link"),
            Self::RenameIllegalName { parent_id, incorrect, .. } => {
                format!("illegal name {incorrect:?} under {parent_id}")
            }
            Self::TruncateFork { file_id, .. } => format!("fork truncation of {file_id}"),
            Self::ClampBadExtent { file_id, index, .. } => {
                format!("extent {index} of {file_id}")
            }
        }
    }
}

// ── Queue ───────────────────────────────────────────────────────────────────

/// FIFO of pending orders, with requeue-at-the-back for false successes.
#[derive(Debug, Default)]
pub struct RepairQueue {
    items: VecDeque<(RepairOrder, bool)>,
}

impl RepairQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_orders(orders: Vec<RepairOrder>) -> Self {
        Self {
            items: orders.into_iter().map(|o| (o, false)).collect(),
        }
    }

    pub fn push(&mut self, order: RepairOrder) {
        self.items.push_back((order, false));
    }

    fn requeue(&mut self, order: RepairOrder) {
        self.items.push_back((order, true));
    }

    fn pop(&mut self) -> Option<(RepairOrder, bool)> {
        self.items.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────────

/// Per-order result. `AlreadyCorrect` is success without a second
/// mutation, which keeps re-runs and the requeue path idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    AlreadyCorrect,
    FalseSuccess,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub repaired: u32,
    pub failed: u32,
    pub requeued: u32,
}

/// Run every order currently on the queue exactly once. False successes
/// on first attempt are requeued for the caller's next pass; on retry
/// they are dropped as failures. A value-mismatch is fatal to its order
/// only; I/O and cancellation abort the pass.
pub fn run_queue(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    queue: &mut RepairQueue,
    sink: &mut dyn ReportSink,
) -> Result<QueueStats> {
    let mut stats = QueueStats::default();
    if queue.is_empty() {
        return Ok(stats);
    }

    let mut cat = vol.catalog()?;
    let mut ext = vol.open_tree(TreeKind::Extents).ok();
    let alloc = vol.allocator();
    let block_size = vol.block_size();

    let initial = queue.len();
    for _ in 0..initial {
        ctx.checkpoint()?;
        let Some((order, retried)) = queue.pop() else {
            break;
        };
        let applied = apply_order(
            &order,
            &mut cat,
            ext.as_mut(),
            &mut vol.header,
            &alloc,
            block_size,
        );
        match applied {
            Ok(Applied::Done) => {
                debug!(order = %order.describe(), "order applied");
                stats.repaired += 1;
                ctx.status.catalog_dirty = true;
            }
            Ok(Applied::AlreadyCorrect) => {
                debug!(order = %order.describe(), "order target already correct");
                stats.repaired += 1;
            }
            Ok(Applied::FalseSuccess) => {
                if retried {
                    warn!(order = %order.describe(), "target gone after retry; dropping order");
                    sink.report(RepairEvent::OrderDropped {
                        description: order.describe(),
                    });
                    stats.failed += 1;
                } else {
                    sink.report(RepairEvent::OrderRequeued {
                        description: order.describe(),
                    });
                    queue.requeue(order);
                    stats.requeued += 1;
                }
            }
            // A value or shape mismatch means the engine's own picture of
            // this record was wrong: fatal to the order, not the pass.
            Err(err @ (PfxError::Internal(_) | PfxError::Format(_))) => {
                warn!(order = %order.describe(), error = %err, "order failed");
                sink.report(RepairEvent::OrderFailed {
                    description: order.describe(),
                    error: err.to_string(),
                });
                stats.failed += 1;
            }
            Err(fatal) => return Err(fatal),
        }
    }
    Ok(stats)
}

fn mismatch<T: std::fmt::Debug>(what: &str, on_disk: T, expected: T) -> PfxError {
    PfxError::Internal(format!(
        "{what}: on-disk value {on_disk:?} does not match recorded incorrect value {expected:?}"
    ))
}

fn apply_order(
    order: &RepairOrder,
    cat: &mut Tree<'_>,
    ext: Option<&mut Tree<'_>>,
    header: &mut VolumeHeader,
    alloc: &Allocator<'_>,
    block_size: u32,
) -> Result<Applied> {
    match order {
        RepairOrder::FolderValence {
            folder_id,
            incorrect,
            correct,
        } => {
            let Some((key, record)) = lookup_by_id(cat, *folder_id)? else {
                return Ok(Applied::FalseSuccess);
            };
            let CatalogRecord::Folder(mut folder) = record else {
                return Err(PfxError::Internal(format!(
                    "valence target {folder_id} is not a folder"
                )));
            };
            if folder.valence == *correct {
                return Ok(Applied::AlreadyCorrect);
            }
            if folder.valence != *incorrect {
                return Err(mismatch("folder valence", folder.valence, *incorrect));
            }
            folder.valence = *correct;
            replace_record(cat, &key, &CatalogRecord::Folder(folder))?;
            Ok(Applied::Done)
        }

        RepairOrder::FinderFlags {
            id,
            incorrect,
            correct,
        } => {
            let Some((key, mut record)) = lookup_by_id(cat, *id)? else {
                return Ok(Applied::FalseSuccess);
            };
            let finder_info = match &mut record {
                CatalogRecord::Folder(folder) => &mut folder.finder_info,
                CatalogRecord::File(file) => &mut file.finder_info,
                CatalogRecord::Thread(_) => {
                    return Err(PfxError::Internal(format!(
                        "finder-flag target {id} resolved to a thread"
                    )));
                }
            };
            // fdFlags is the u16 at offset 8 of the finder info.
            let on_disk = read_be_u16(finder_info, 8)?;
            if on_disk == *correct {
                return Ok(Applied::AlreadyCorrect);
            }
            if on_disk != *incorrect {
                return Err(mismatch("finder flags", on_disk, *incorrect));
            }
            write_be_u16(finder_info, 8, *correct);
            replace_record(cat, &key, &record)?;
            Ok(Applied::Done)
        }

        RepairOrder::DeleteOrphanedNode { file_id } => {
            let Some((key, record)) = lookup_by_id(cat, *file_id)? else {
                return Ok(Applied::FalseSuccess);
            };
            let CatalogRecord::File(file) = record else {
                return Err(PfxError::Internal(format!(
                    "orphan-delete target {file_id} is not a file"
                )));
            };
            for fork in [&file.data_fork, &file.resource_fork] {
                for desc in fork.extents.active() {
                    alloc.release(BlockNumber(desc.start_block), desc.block_count)?;
                }
            }
            if let Some(ext) = ext {
                release_overflow_extents(ext, alloc, *file_id, None, 0)?;
            }
            delete_record(cat, &key)?;
            delete_record(cat, &CatalogKey::thread(*file_id))?;
            bump_valence(cat, key.parent_id, -1)?;
            header.file_count = header.file_count.saturating_sub(1);
            Ok(Applied::Done)
        }

        RepairOrder::LinkChainPrev {
            file_id,
            incorrect,
            correct,
        } => fix_link_field(cat, *file_id, "previous link id", *incorrect, *correct, |f| {
            &mut f.prev_link_id
        }),

        RepairOrder::LinkChainNext {
            file_id,
            incorrect,
            correct,
        } => fix_link_field(cat, *file_id, "next link id", *incorrect, *correct, |f| {
            &mut f.next_link_id
        }),

        RepairOrder::LinkChainFirst {
            inode_id,
            incorrect,
            correct,
        } => fix_link_field(cat, *inode_id, "first link id", *incorrect, *correct, |f| {
            &mut f.prev_link_id
        }),

        RepairOrder::RenameIllegalName {
            parent_id,
            incorrect,
            correct,
        } => {
            let old_key = CatalogKey::new(*parent_id, CatName::from_str(incorrect)?);
            let new_key = CatalogKey::new(*parent_id, CatName::from_str(correct)?);
            let Some(record) = find_record(cat, &old_key)? else {
                // Renamed already, or the target vanished with its thread.
                return match find_record(cat, &new_key)? {
                    Some(CatalogRecord::File(_) | CatalogRecord::Folder(_)) => {
                        Ok(Applied::AlreadyCorrect)
                    }
                    _ => Ok(Applied::FalseSuccess),
                };
            };
            let id = record.id().ok_or_else(|| {
                PfxError::Internal(format!(
                    "rename target {incorrect:?} under {parent_id} is a thread"
                ))
            })?;
            delete_record(cat, &old_key)?;
            insert_renamed(cat, &new_key, &record)?;
            // Keep the id-to-name mapping in step.
            replace_record(
                cat,
                &CatalogKey::thread(id),
                &CatalogRecord::Thread(pfx_ondisk::ThreadRecord {
                    is_folder: record.is_folder(),
                    parent_id: *parent_id,
                    name: new_key.name.clone(),
                }),
            )?;
            Ok(Applied::Done)
        }

        RepairOrder::TruncateFork {
            file_id,
            fork,
            incorrect_blocks,
            correct_blocks,
        } => {
            let Some((key, record)) = lookup_by_id(cat, *file_id)? else {
                return Ok(Applied::FalseSuccess);
            };
            let CatalogRecord::File(mut file) = record else {
                return Err(PfxError::Internal(format!(
                    "truncate target {file_id} is not a file"
                )));
            };
            let fork_data = file.fork_mut(*fork);
            if fork_data.total_blocks == *correct_blocks {
                return Ok(Applied::AlreadyCorrect);
            }
            if fork_data.total_blocks != *incorrect_blocks {
                return Err(mismatch(
                    "fork block count",
                    fork_data.total_blocks,
                    *incorrect_blocks,
                ));
            }
            let mut kept = 0_u32;
            for desc in fork_data.extents.0.iter_mut() {
                if desc.is_empty() {
                    continue;
                }
                if kept >= *correct_blocks {
                    alloc.release(BlockNumber(desc.start_block), desc.block_count)?;
                    *desc = ExtentDescriptor::default();
                } else if kept + desc.block_count > *correct_blocks {
                    let keep = *correct_blocks - kept;
                    alloc.release(
                        BlockNumber(desc.start_block + keep),
                        desc.block_count - keep,
                    )?;
                    desc.block_count = keep;
                    kept = *correct_blocks;
                } else {
                    kept += desc.block_count;
                }
            }
            fork_data.total_blocks = *correct_blocks;
            fork_data.logical_size = u64::from(*correct_blocks) * u64::from(block_size);
            if let Some(ext) = ext {
                release_overflow_extents(ext, alloc, *file_id, Some(*fork), *correct_blocks)?;
            }
            replace_record(cat, &key, &CatalogRecord::File(file))?;
            Ok(Applied::Done)
        }

        RepairOrder::ClampBadExtent {
            file_id,
            fork,
            index,
            incorrect,
            correct,
        } => {
            let Some((key, record)) = lookup_by_id(cat, *file_id)? else {
                return Ok(Applied::FalseSuccess);
            };
            let CatalogRecord::File(mut file) = record else {
                return Err(PfxError::Internal(format!(
                    "extent-clamp target {file_id} is not a file"
                )));
            };
            let fork_data = file.fork_mut(*fork);
            let Some(desc) = fork_data.extents.0.get_mut(usize::from(*index)) else {
                return Err(PfxError::Internal(format!(
                    "extent index {index} out of range"
                )));
            };
            if *desc == *correct {
                return Ok(Applied::AlreadyCorrect);
            }
            if *desc != *incorrect {
                return Err(mismatch("extent descriptor", *desc, *incorrect));
            }
            // Return the clamped-off tail to the bitmap when the fix only
            // shortens the run.
            if correct.start_block == incorrect.start_block
                && correct.block_count < incorrect.block_count
            {
                let trimmed = incorrect.block_count - correct.block_count;
                alloc.release(
                    BlockNumber(correct.start_block + correct.block_count),
                    trimmed,
                )?;
                fork_data.total_blocks = fork_data.total_blocks.saturating_sub(trimmed);
            }
            let desc = fork_data
                .extents
                .0
                .get_mut(usize::from(*index))
                .ok_or_else(|| PfxError::Internal("extent index vanished".into()))?;
            *desc = *correct;
            replace_record(cat, &key, &CatalogRecord::File(file))?;
            Ok(Applied::Done)
        }
    }
}

/// Shared handler for the three link-chain id fields.
fn fix_link_field(
    cat: &mut Tree<'_>,
    id: CatalogNodeId,
    what: &str,
    incorrect: u32,
    correct: u32,
    field: impl Fn(&mut pfx_ondisk::FileRecord) -> &mut u32,
) -> Result<Applied> {
    let Some((key, record)) = lookup_by_id(cat, id)? else {
        return Ok(Applied::FalseSuccess);
    };
    let CatalogRecord::File(mut file) = record else {
        return Err(PfxError::Internal(format!(
            "link-chain target {id} is not a file"
        )));
    };
    let slot = field(&mut file);
    if *slot == correct {
        return Ok(Applied::AlreadyCorrect);
    }
    if *slot != incorrect {
        return Err(mismatch(what, *slot, incorrect));
    }
    *slot = correct;
    replace_record(cat, &key, &CatalogRecord::File(file))?;
    Ok(Applied::Done)
}

/// Delete overflow extent records of `file_id` (optionally one fork,
/// starting at a file block), releasing their blocks. `start_from == 0`
/// with `fork == None` clears every overflow record of the file.
fn release_overflow_extents(
    ext: &mut Tree<'_>,
    alloc: &Allocator<'_>,
    file_id: CatalogNodeId,
    fork: Option<ForkKind>,
    start_from: u32,
) -> Result<()> {
    let mut doomed = Vec::new();
    for (key_bytes, data) in ext.collect_records()? {
        let Ok(key) = ExtentKey::decode(&key_bytes) else {
            continue;
        };
        if key.file_id != file_id {
            continue;
        }
        if let Some(fork) = fork {
            if key.fork != fork {
                continue;
            }
        }
        if key.start_block < start_from {
            continue;
        }
        let record = ExtentRecord::parse(&data, 0)?;
        doomed.push((key_bytes, record));
    }
    for (key_bytes, record) in doomed {
        for desc in record.active() {
            alloc.release(BlockNumber(desc.start_block), desc.block_count)?;
        }
        ext.delete(&key_bytes)?;
    }
    Ok(())
}

/// Insert a file/folder record under a new key, refusing thread records.
fn insert_renamed(cat: &mut Tree<'_>, key: &CatalogKey, record: &CatalogRecord) -> Result<()> {
    if record.is_thread() {
        return Err(PfxError::Internal("cannot rename a thread record".into()));
    }
    crate::catalog_ops::insert_record(cat, key, record)
}
