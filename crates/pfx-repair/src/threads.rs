//! Orphan/thread consistency engine: one full catalog pass that makes the
//! file/folder-to-thread mapping a bijection, then straightens hard-link
//! chains.
//!
//! This pass must succeed completely; an unexpected record type or an
//! unreachable parent is an internal-logic error that aborts the whole
//! repair run, because every later pass assumes thread lookups work.

use crate::catalog_ops::{
    bump_valence, delete_record, ensure_folder, find_record, insert_record, lookup_by_id,
    lookup_thread, replace_record, LOST_FOUND_DIR, MAX_LINK_CHAIN, PRIVATE_METADATA_DIR,
};
use crate::context::RepairContext;
use crate::orders::{RepairOrder, RepairQueue};
use crate::report::{RepairEvent, ReportSink};
use crate::volume::Volume;
use pfx_btree::Tree;
use pfx_error::{PfxError, Result};
use pfx_ondisk::{CatName, CatalogKey, CatalogRecord, FileRecord, ThreadRecord};
use pfx_types::{CatalogNodeId, ROOT_FOLDER_ID, ROOT_PARENT_ID};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadOutcome {
    pub synthesized: u32,
    pub orphans_deleted: u32,
    pub links_deleted: u32,
    pub inodes_relocated: u32,
}

fn internal(msg: String) -> PfxError {
    PfxError::Internal(msg)
}

fn decode_entry(key_bytes: &[u8], data: &[u8]) -> Result<(CatalogKey, CatalogRecord)> {
    let key = CatalogKey::decode(key_bytes)
        .map_err(|e| internal(format!("undecodable catalog key in consistency pass: {e}")))?;
    let record = CatalogRecord::decode(data)
        .map_err(|e| internal(format!("undecodable catalog record in consistency pass: {e}")))?;
    Ok((key, record))
}

/// Run the full consistency pass. Link-chain pointer fixes are expressed
/// as orders appended to `queue`; the dispatcher applies them afterwards,
/// now that every target is reachable through its thread.
pub fn repair_threads(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    queue: &mut RepairQueue,
    sink: &mut dyn ReportSink,
) -> Result<ThreadOutcome> {
    ctx.checkpoint()?;
    let mut cat = vol.catalog()?;
    let mut outcome = ThreadOutcome::default();
    let batch = usize::try_from(ctx.options.batch_size.max(1)).unwrap_or(64);

    let entries = cat.collect_records()?;
    debug!(records = entries.len(), "thread pass snapshot taken");

    // ── Pass A: every file/folder record has a matching thread ─────────
    for (i, (key_bytes, data)) in entries.iter().enumerate() {
        if i % batch == 0 {
            ctx.checkpoint()?;
        }
        let (key, record) = decode_entry(key_bytes, data)?;
        let (id, is_folder) = match &record {
            CatalogRecord::Folder(folder) => (folder.folder_id, true),
            CatalogRecord::File(file) => (file.file_id, false),
            CatalogRecord::Thread(_) => continue,
        };

        let wanted = ThreadRecord {
            is_folder,
            parent_id: key.parent_id,
            name: key.name.clone(),
        };
        let case_sensitive = vol.header.is_case_sensitive();
        match lookup_thread(&cat, id)? {
            None => {
                // Missing: synthesize from the record's own key.
                insert_record(&mut cat, &CatalogKey::thread(id), &CatalogRecord::Thread(wanted))?;
                outcome.synthesized += 1;
                ctx.status.catalog_dirty = true;
                sink.report(RepairEvent::ThreadSynthesized { id: id.0 });
            }
            Some(existing) => {
                let matches = existing.is_folder == is_folder
                    && existing.parent_id == key.parent_id
                    && existing.name.eq_fold(&key.name, case_sensitive);
                if !matches {
                    // Stale: replace with a correct one.
                    replace_record(
                        &mut cat,
                        &CatalogKey::thread(id),
                        &CatalogRecord::Thread(wanted),
                    )?;
                    outcome.synthesized += 1;
                    ctx.status.catalog_dirty = true;
                    sink.report(RepairEvent::ThreadSynthesized { id: id.0 });
                }
            }
        }
    }

    // ── Pass B: every thread resolves to a matching record ─────────────
    for (i, (key_bytes, data)) in entries.iter().enumerate() {
        if i % batch == 0 {
            ctx.checkpoint()?;
        }
        let (key, record) = decode_entry(key_bytes, data)?;
        if !record.is_thread() || !key.name.is_empty() {
            continue;
        }
        let id = key.parent_id;
        // Re-read: pass A may have replaced this thread already.
        let Some(thread) = lookup_thread(&cat, id)? else {
            continue;
        };
        let target_key = CatalogKey::new(thread.parent_id, thread.name.clone());
        let target_matches = match find_record(&cat, &target_key)? {
            None => false,
            Some(CatalogRecord::Folder(folder)) => {
                thread.is_folder && folder.folder_id == id
            }
            Some(CatalogRecord::File(file)) => !thread.is_folder && file.file_id == id,
            Some(CatalogRecord::Thread(_)) => {
                return Err(internal(format!(
                    "thread record found under named key {} / {:?}",
                    target_key.parent_id,
                    target_key.name.to_string_lossy()
                )));
            }
        };
        if !target_matches {
            delete_record(&mut cat, &CatalogKey::thread(id))?;
            outcome.orphans_deleted += 1;
            ctx.status.catalog_dirty = true;
            sink.report(RepairEvent::OrphanThreadDeleted { id: id.0 });
        }
    }

    // ── Pass C: every surviving record's parent is reachable ───────────
    for (i, (key_bytes, data)) in entries.iter().enumerate() {
        if i % batch == 0 {
            ctx.checkpoint()?;
        }
        let (key, record) = decode_entry(key_bytes, data)?;
        if record.is_thread() {
            continue;
        }
        if key.parent_id == ROOT_PARENT_ID {
            continue;
        }
        match lookup_by_id(&cat, key.parent_id)? {
            Some((_, CatalogRecord::Folder(_))) => {}
            Some(_) | None => {
                return Err(internal(format!(
                    "record {:?} has unreachable parent {}",
                    key.name.to_string_lossy(),
                    key.parent_id
                )));
            }
        }
    }

    // ── Pass D: hard-link chains ────────────────────────────────────────
    repair_links(ctx, vol, &mut cat, queue, sink, &mut outcome)?;

    info!(
        synthesized = outcome.synthesized,
        orphans_deleted = outcome.orphans_deleted,
        links_deleted = outcome.links_deleted,
        inodes_relocated = outcome.inodes_relocated,
        "thread consistency pass complete"
    );
    Ok(outcome)
}

struct LinkEntry {
    id: CatalogNodeId,
    key: CatalogKey,
    inode_id: CatalogNodeId,
    prev: u32,
    next: u32,
}

/// Cross-validate link entries against their target inodes. Pointer fixes
/// become queued orders; a link with no inode is deleted; an inode with no
/// links moves to `lost+found`.
fn repair_links(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    cat: &mut Tree<'_>,
    queue: &mut RepairQueue,
    sink: &mut dyn ReportSink,
    outcome: &mut ThreadOutcome,
) -> Result<()> {
    ctx.checkpoint()?;
    let entries = cat.collect_records()?;

    let private_dir = match find_record(
        cat,
        &CatalogKey::new(ROOT_FOLDER_ID, CatName::from_str(PRIVATE_METADATA_DIR)?),
    )? {
        Some(CatalogRecord::Folder(folder)) => Some(folder.folder_id),
        _ => None,
    };

    let mut inodes: BTreeMap<CatalogNodeId, FileRecord> = BTreeMap::new();
    let mut links: Vec<LinkEntry> = Vec::new();
    for (key_bytes, data) in &entries {
        let (key, record) = decode_entry(key_bytes, data)?;
        let CatalogRecord::File(file) = record else {
            continue;
        };
        if Some(key.parent_id) == private_dir {
            inodes.insert(file.file_id, file);
        } else if file.has_link_chain() && file.bsd.special != 0 {
            links.push(LinkEntry {
                id: file.file_id,
                key,
                inode_id: CatalogNodeId(file.bsd.special),
                prev: file.prev_link_id,
                next: file.next_link_id,
            });
        }
    }
    if private_dir.is_none() && links.is_empty() {
        return Ok(());
    }

    // Links whose inode is gone are deleted outright.
    let mut live_links: BTreeMap<CatalogNodeId, Vec<LinkEntry>> = BTreeMap::new();
    for link in links {
        if inodes.contains_key(&link.inode_id) {
            live_links.entry(link.inode_id).or_default().push(link);
        } else {
            delete_record(cat, &link.key)?;
            delete_record(cat, &CatalogKey::thread(link.id))?;
            bump_valence(cat, link.key.parent_id, -1)?;
            vol.header.file_count = vol.header.file_count.saturating_sub(1);
            outcome.links_deleted += 1;
            ctx.status.catalog_dirty = true;
            sink.report(RepairEvent::LinkEntryDeleted {
                link_id: link.id.0,
                inode_id: link.inode_id.0,
            });
        }
    }

    for (inode_id, inode) in &inodes {
        ctx.checkpoint()?;
        let mut chain = live_links.remove(inode_id).unwrap_or_default();
        chain.sort_by_key(|link| link.id);
        if chain.len() > MAX_LINK_CHAIN {
            return Err(internal(format!(
                "inode {inode_id} claims {} links, above the chain bound",
                chain.len()
            )));
        }

        if chain.is_empty() {
            relocate_inode(ctx, vol, cat, *inode_id, sink)?;
            outcome.inodes_relocated += 1;
            continue;
        }

        // Canonical chain order is ascending link id; every divergent
        // pointer becomes one order for the dispatcher.
        let first = chain[0].id.0;
        if inode.prev_link_id != first {
            queue.push(RepairOrder::LinkChainFirst {
                inode_id: *inode_id,
                incorrect: inode.prev_link_id,
                correct: first,
            });
        }
        for (i, link) in chain.iter().enumerate() {
            let want_prev = if i == 0 { 0 } else { chain[i - 1].id.0 };
            let want_next = if i + 1 == chain.len() {
                0
            } else {
                chain[i + 1].id.0
            };
            if link.prev != want_prev {
                queue.push(RepairOrder::LinkChainPrev {
                    file_id: link.id,
                    incorrect: link.prev,
                    correct: want_prev,
                });
            }
            if link.next != want_next {
                queue.push(RepairOrder::LinkChainNext {
                    file_id: link.id,
                    incorrect: link.next,
                    correct: want_next,
                });
            }
        }
    }
    Ok(())
}

/// Move a link target with no remaining links into `lost+found`, where the
/// user can find its data.
fn relocate_inode(
    ctx: &mut RepairContext,
    vol: &mut Volume<'_>,
    cat: &mut Tree<'_>,
    inode_id: CatalogNodeId,
    sink: &mut dyn ReportSink,
) -> Result<()> {
    let Some((old_key, record)) = lookup_by_id(cat, inode_id)? else {
        return Err(internal(format!(
            "inode {inode_id} lost its thread during the link pass"
        )));
    };
    let (lost_found, created) =
        ensure_folder(cat, &mut vol.header, ROOT_FOLDER_ID, LOST_FOUND_DIR)?;
    if created {
        sink.report(RepairEvent::LostFoundCreated);
    }

    let new_name = CatName::from_str(&format!("file_{}", inode_id.0))?;
    let new_key = CatalogKey::new(lost_found, new_name.clone());
    delete_record(cat, &old_key)?;
    insert_record(cat, &new_key, &record)?;
    replace_record(
        cat,
        &CatalogKey::thread(inode_id),
        &CatalogRecord::Thread(ThreadRecord {
            is_folder: false,
            parent_id: lost_found,
            name: new_name,
        }),
    )?;
    bump_valence(cat, old_key.parent_id, -1)?;
    bump_valence(cat, lost_found, 1)?;
    ctx.status.catalog_dirty = true;
    sink.report(RepairEvent::InodeRelocated {
        inode_id: inode_id.0,
    });
    Ok(())
}
