//! Shared in-memory volume scaffolding for the integration tests.
#![allow(dead_code)]

use pfx_alloc::Allocator;
use pfx_block::{BlockDevice, MemDevice};
use pfx_btree::Tree;
use pfx_ondisk::{
    catalog_key_cmp_folded, extent_key_cmp, BsdInfo, CatName, CatalogKey, CatalogRecord,
    FileRecord, FolderRecord, ForkData, ForkMap, ThreadRecord, VolumeHeader, FLAG_THREAD_EXISTS,
    SIGNATURE_PLUS,
};
use pfx_ondisk::catalog::{S_IFDIR, S_IFREG};
use pfx_ondisk::volume::ATTR_INCONSISTENT;
use pfx_repair::Volume;
use pfx_types::{BlockNumber, CatalogNodeId, ROOT_FOLDER_ID, ROOT_PARENT_ID};

pub const BLOCK_SIZE: u32 = 512;
pub const TOTAL_BLOCKS: u32 = 512;
pub const CATALOG_NODE_SIZE: u16 = 1024;
pub const VOLUME_NAME: &str = "TestVol";

pub const CATALOG_START: u32 = 16;
pub const CATALOG_BLOCKS: u32 = 64;

/// Build a small, structurally valid volume: header (plus alternate),
/// allocation bitmap, empty extents tree, and a catalog holding the root
/// folder and its thread.
pub fn build_device() -> MemDevice {
    let dev = MemDevice::new((TOTAL_BLOCKS * BLOCK_SIZE) as usize);

    let allocation_fork = ForkData::contiguous(3, 1, BLOCK_SIZE);
    let extents_fork = ForkData::contiguous(8, 8, BLOCK_SIZE);
    let catalog_fork = ForkData::contiguous(CATALOG_START, CATALOG_BLOCKS, BLOCK_SIZE);

    Tree::format(
        &dev,
        ForkMap::new(&extents_fork, BLOCK_SIZE),
        512,
        extent_key_cmp,
        0,
    )
    .unwrap();
    let mut cat = Tree::format(
        &dev,
        ForkMap::new(&catalog_fork, BLOCK_SIZE),
        CATALOG_NODE_SIZE,
        catalog_key_cmp_folded,
        0,
    )
    .unwrap();

    // Root folder record and its thread.
    let root_key = CatalogKey::new(ROOT_PARENT_ID, CatName::from_str(VOLUME_NAME).unwrap());
    let root = FolderRecord {
        flags: FLAG_THREAD_EXISTS,
        folder_id: ROOT_FOLDER_ID,
        bsd: BsdInfo {
            file_mode: S_IFDIR | 0o755,
            ..BsdInfo::default()
        },
        ..FolderRecord::default()
    };
    cat.insert(&root_key.encode(), &CatalogRecord::Folder(root).encode())
        .unwrap();
    cat.insert(
        &CatalogKey::thread(ROOT_FOLDER_ID).encode(),
        &CatalogRecord::Thread(ThreadRecord {
            is_folder: true,
            parent_id: ROOT_PARENT_ID,
            name: CatName::from_str(VOLUME_NAME).unwrap(),
        })
        .encode(),
    )
    .unwrap();
    drop(cat);

    // Mark the metadata regions allocated.
    let alloc = Allocator::new(&dev, &allocation_fork, BLOCK_SIZE, TOTAL_BLOCKS);
    alloc.capture(BlockNumber(0), 4).unwrap();
    alloc.capture(BlockNumber(8), 8).unwrap();
    alloc
        .capture(BlockNumber(CATALOG_START), CATALOG_BLOCKS)
        .unwrap();
    alloc.capture(BlockNumber(TOTAL_BLOCKS - 2), 2).unwrap();

    let header = VolumeHeader {
        signature: SIGNATURE_PLUS,
        version: 4,
        attributes: ATTR_INCONSISTENT,
        last_mounted_version: 0,
        journal_info_block: 0,
        create_date: 3_600_000_000,
        modify_date: 3_600_000_000,
        backup_date: 0,
        checked_date: 0,
        file_count: 0,
        folder_count: 0,
        block_size: BLOCK_SIZE,
        total_blocks: TOTAL_BLOCKS,
        free_blocks: alloc.count_free().unwrap(),
        next_allocation: 0,
        rsrc_clump_size: BLOCK_SIZE,
        data_clump_size: BLOCK_SIZE,
        next_catalog_id: CatalogNodeId(16),
        write_count: 0,
        encodings_bitmap: 1,
        finder_info: [0; 8],
        allocation_fork,
        extents_fork,
        catalog_fork,
        attributes_fork: ForkData::default(),
        startup_fork: ForkData::default(),
    };
    let bytes = header.to_bytes();
    dev.write(1024, &bytes).unwrap();
    dev.write(VolumeHeader::alternate_offset(dev.len()), &bytes)
        .unwrap();
    dev
}

pub fn open(dev: &MemDevice) -> Volume<'_> {
    Volume::open(dev).unwrap()
}

pub fn key(parent: u32, name: &str) -> CatalogKey {
    CatalogKey::new(CatalogNodeId(parent), CatName::from_str(name).unwrap())
}

pub fn folder(id: u32) -> CatalogRecord {
    CatalogRecord::Folder(FolderRecord {
        flags: FLAG_THREAD_EXISTS,
        folder_id: CatalogNodeId(id),
        bsd: BsdInfo {
            file_mode: S_IFDIR | 0o755,
            ..BsdInfo::default()
        },
        ..FolderRecord::default()
    })
}

pub fn file_with_extent(id: u32, start: u32, blocks: u32) -> CatalogRecord {
    let mut record = FileRecord {
        flags: FLAG_THREAD_EXISTS,
        file_id: CatalogNodeId(id),
        bsd: BsdInfo {
            file_mode: S_IFREG | 0o644,
            ..BsdInfo::default()
        },
        ..FileRecord::default()
    };
    if blocks > 0 {
        record.data_fork = ForkData::contiguous(start, blocks, BLOCK_SIZE);
    }
    CatalogRecord::File(record)
}

pub fn thread(is_folder: bool, parent: u32, name: &str) -> CatalogRecord {
    CatalogRecord::Thread(ThreadRecord {
        is_folder,
        parent_id: CatalogNodeId(parent),
        name: CatName::from_str(name).unwrap(),
    })
}

/// Insert a record under (parent, name); optionally its thread record too.
pub fn add_entry(
    vol: &Volume<'_>,
    parent: u32,
    name: &str,
    record: &CatalogRecord,
    with_thread: bool,
) {
    let mut cat = vol.catalog().unwrap();
    cat.insert(&key(parent, name).encode(), &record.encode())
        .unwrap();
    if with_thread {
        let id = record.id().expect("only file/folder entries get threads");
        cat.insert(
            &CatalogKey::thread(id).encode(),
            &thread(record.is_folder(), parent, name).encode(),
        )
        .unwrap();
    }
}

/// Assert the file/folder <-> thread mapping is a bijection.
pub fn assert_thread_bijection(vol: &Volume<'_>) {
    let cat = vol.catalog().unwrap();
    let case_sensitive = vol.header.is_case_sensitive();
    let entries = cat.collect_records().unwrap();
    for (key_bytes, data) in &entries {
        let key = CatalogKey::decode(key_bytes).unwrap();
        match CatalogRecord::decode(data).unwrap() {
            CatalogRecord::Folder(folder) => {
                let t = pfx_repair::catalog_ops::lookup_thread(&cat, folder.folder_id)
                    .unwrap()
                    .expect("folder must have a thread");
                assert!(t.is_folder);
                assert_eq!(t.parent_id, key.parent_id);
                assert!(t.name.eq_fold(&key.name, case_sensitive));
            }
            CatalogRecord::File(file) => {
                let t = pfx_repair::catalog_ops::lookup_thread(&cat, file.file_id)
                    .unwrap()
                    .expect("file must have a thread");
                assert!(!t.is_folder);
                assert_eq!(t.parent_id, key.parent_id);
                assert!(t.name.eq_fold(&key.name, case_sensitive));
            }
            CatalogRecord::Thread(t) => {
                let target = CatalogKey::new(t.parent_id, t.name.clone());
                let record = pfx_repair::catalog_ops::find_record(&cat, &target)
                    .unwrap()
                    .expect("thread must resolve to a record");
                assert_eq!(record.id(), Some(key.parent_id));
                assert_eq!(record.is_folder(), t.is_folder);
            }
        }
    }
}
