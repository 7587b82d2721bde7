//! Catalog helpers shared by the repair phases.
//!
//! Object identity is the on-disk id, never an in-memory address: every
//! helper here re-fetches records through id-indexed lookups (thread record
//! first, then the keyed record), so repair passes that run back to back
//! always see the latest persisted state.

use pfx_alloc::Allocator;
use pfx_block::BlockDevice;
use pfx_btree::Tree;
use pfx_error::{PfxError, Result};
use pfx_ondisk::{
    BsdInfo, CatName, CatalogKey, CatalogRecord, FileRecord, FolderRecord, ForkData, ThreadRecord,
    FLAG_THREAD_EXISTS,
};
use pfx_ondisk::catalog::{S_IFDIR, S_IFLNK, S_IFREG};
use pfx_ondisk::VolumeHeader;
use pfx_types::{CatalogNodeId, ROOT_FOLDER_ID};

/// Well-known recovery directory for files whose data was relocated.
pub const DAMAGED_FILES_DIR: &str = "DamagedFiles";
/// Well-known recovery directory for orphaned link targets.
pub const LOST_FOUND_DIR: &str = "lost+found";
/// Hidden directory holding hard-link target (inode) files.
pub const PRIVATE_METADATA_DIR: &str = "\u{0}\u{0}\u{0}\u{0}HFS+ Private Data";

/// Hard-link chains are id chases over on-disk fields; this bounds the
/// walk so a corrupted cycle cannot spin forever.
pub const MAX_LINK_CHAIN: usize = 32_767;
/// Bound on ancestor walks when reconstructing a path.
pub const MAX_PATH_DEPTH: usize = 80;

// ── Lookups ─────────────────────────────────────────────────────────────────

pub fn find_record(cat: &Tree<'_>, key: &CatalogKey) -> Result<Option<CatalogRecord>> {
    match cat.search(&key.encode())? {
        Some(data) => Ok(Some(CatalogRecord::decode(&data)?)),
        None => Ok(None),
    }
}

/// The thread record for `id`, when one exists and is in fact a thread.
pub fn lookup_thread(cat: &Tree<'_>, id: CatalogNodeId) -> Result<Option<ThreadRecord>> {
    match find_record(cat, &CatalogKey::thread(id))? {
        Some(CatalogRecord::Thread(thread)) => Ok(Some(thread)),
        Some(_) | None => Ok(None),
    }
}

/// Resolve an id to its keyed file/folder record via its thread record.
/// `None` when the thread is missing or dangling, the situation the
/// dispatcher's false-success protocol exists for.
pub fn lookup_by_id(
    cat: &Tree<'_>,
    id: CatalogNodeId,
) -> Result<Option<(CatalogKey, CatalogRecord)>> {
    let Some(thread) = lookup_thread(cat, id)? else {
        return Ok(None);
    };
    let key = CatalogKey::new(thread.parent_id, thread.name);
    match find_record(cat, &key)? {
        Some(record) if record.id() == Some(id) => Ok(Some((key, record))),
        Some(_) | None => Ok(None),
    }
}

/// Reconstruct the path of `id` relative to the root folder by chasing
/// thread records upward. `None` when any ancestor thread is missing.
pub fn path_from_root(cat: &Tree<'_>, id: CatalogNodeId) -> Result<Option<String>> {
    let mut components = Vec::new();
    let mut current = id;
    for _ in 0..MAX_PATH_DEPTH {
        if current == ROOT_FOLDER_ID {
            components.reverse();
            return Ok(Some(components.join("/")));
        }
        let Some(thread) = lookup_thread(cat, current)? else {
            return Ok(None);
        };
        components.push(thread.name.to_string_lossy());
        current = thread.parent_id;
    }
    Ok(None)
}

// ── Mutations ───────────────────────────────────────────────────────────────

pub fn insert_record(cat: &mut Tree<'_>, key: &CatalogKey, record: &CatalogRecord) -> Result<()> {
    cat.insert(&key.encode(), &record.encode())
}

pub fn replace_record(cat: &mut Tree<'_>, key: &CatalogKey, record: &CatalogRecord) -> Result<()> {
    cat.replace(&key.encode(), &record.encode())
}

pub fn delete_record(cat: &mut Tree<'_>, key: &CatalogKey) -> Result<()> {
    cat.delete(&key.encode())
}

/// Adjust a folder's child count by `delta`, located by id.
pub fn bump_valence(cat: &mut Tree<'_>, folder_id: CatalogNodeId, delta: i32) -> Result<()> {
    let Some((key, CatalogRecord::Folder(mut folder))) = lookup_by_id(cat, folder_id)? else {
        return Err(PfxError::Internal(format!(
            "valence update target {folder_id} is not a reachable folder"
        )));
    };
    folder.valence = folder.valence.saturating_add_signed(delta);
    replace_record(cat, &key, &CatalogRecord::Folder(folder))
}

fn take_next_id(header: &mut VolumeHeader) -> CatalogNodeId {
    let id = header.next_catalog_id;
    header.next_catalog_id = CatalogNodeId(id.0 + 1);
    id
}

/// Find a folder by name under `parent`, creating it (record + thread,
/// parent valence, header folder count) when absent. Returns the folder id
/// and whether it was created.
pub fn ensure_folder(
    cat: &mut Tree<'_>,
    header: &mut VolumeHeader,
    parent_id: CatalogNodeId,
    name: &str,
) -> Result<(CatalogNodeId, bool)> {
    let name = CatName::from_str(name)?;
    let key = CatalogKey::new(parent_id, name.clone());
    match find_record(cat, &key)? {
        Some(CatalogRecord::Folder(folder)) => return Ok((folder.folder_id, false)),
        Some(_) => {
            return Err(PfxError::Internal(format!(
                "recovery directory name {name} is taken by a non-folder"
            )));
        }
        None => {}
    }

    let id = take_next_id(header);
    let folder = FolderRecord {
        flags: FLAG_THREAD_EXISTS,
        folder_id: id,
        create_date: header.modify_date,
        content_mod_date: header.modify_date,
        bsd: BsdInfo {
            file_mode: S_IFDIR | 0o755,
            ..BsdInfo::default()
        },
        ..FolderRecord::default()
    };
    insert_record(cat, &key, &CatalogRecord::Folder(folder))?;
    insert_record(
        cat,
        &CatalogKey::thread(id),
        &CatalogRecord::Thread(ThreadRecord {
            is_folder: true,
            parent_id,
            name,
        }),
    )?;
    bump_valence(cat, parent_id, 1)?;
    header.folder_count = header.folder_count.saturating_add(1);
    Ok((id, true))
}

/// What a recovery file should hold.
pub enum RecoveryPayload<'a> {
    /// A symlink whose data fork holds the target path.
    Symlink(&'a str),
    /// An empty placeholder marking the file's presence.
    Placeholder,
}

/// Create a file entry (record + thread, parent valence, header file
/// count). Symlink payloads get a freshly allocated data fork holding the
/// target path bytes.
pub fn create_recovery_file(
    dev: &dyn BlockDevice,
    alloc: &Allocator<'_>,
    cat: &mut Tree<'_>,
    header: &mut VolumeHeader,
    parent_id: CatalogNodeId,
    name: &str,
    payload: RecoveryPayload<'_>,
) -> Result<CatalogNodeId> {
    let name = CatName::from_str(name)?;
    let key = CatalogKey::new(parent_id, name.clone());
    if find_record(cat, &key)?.is_some() {
        return Err(PfxError::DuplicateRecord);
    }

    let block_size = header.block_size;
    let (mode, data_fork) = match payload {
        RecoveryPayload::Symlink(target) => {
            let bytes = target.as_bytes();
            let blocks = (bytes.len() as u32).div_ceil(block_size).max(1);
            let start = alloc.allocate_contiguous(blocks)?;
            dev.write(u64::from(start.0) * u64::from(block_size), bytes)?;
            let mut fork = ForkData::contiguous(start.0, blocks, block_size);
            fork.logical_size = bytes.len() as u64;
            (S_IFLNK | 0o777, fork)
        }
        RecoveryPayload::Placeholder => (S_IFREG | 0o644, ForkData::default()),
    };

    let id = take_next_id(header);
    let file = FileRecord {
        flags: FLAG_THREAD_EXISTS,
        file_id: id,
        create_date: header.modify_date,
        content_mod_date: header.modify_date,
        bsd: BsdInfo {
            file_mode: mode,
            ..BsdInfo::default()
        },
        data_fork,
        ..FileRecord::default()
    };
    insert_record(cat, &key, &CatalogRecord::File(file))?;
    insert_record(
        cat,
        &CatalogKey::thread(id),
        &CatalogRecord::Thread(ThreadRecord {
            is_folder: false,
            parent_id,
            name,
        }),
    )?;
    bump_valence(cat, parent_id, 1)?;
    header.file_count = header.file_count.saturating_add(1);
    Ok(id)
}

/// Recount files and folders from the catalog. The folder count excludes
/// the root folder, matching what the volume header stores.
pub fn recount(cat: &Tree<'_>) -> Result<(u32, u32)> {
    let mut files = 0_u32;
    let mut folders = 0_u32;
    cat.for_each(|_, data| {
        match CatalogRecord::decode(data)? {
            CatalogRecord::File(_) => files += 1,
            CatalogRecord::Folder(folder) => {
                if folder.folder_id != ROOT_FOLDER_ID {
                    folders += 1;
                }
            }
            CatalogRecord::Thread(_) => {}
        }
        Ok(())
    })?;
    Ok((files, folders))
}
