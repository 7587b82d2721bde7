//! Dispatcher, thread-consistency, and overlap-resolution integration
//! tests driven through the full `repair_volume` pipeline.

mod common;

use common::{
    add_entry, assert_thread_bijection, build_device, file_with_extent, folder, key, open,
    BLOCK_SIZE,
};
use pfx_block::BlockDevice;
use pfx_error::PfxError;
use pfx_ondisk::{CatalogKey, CatalogRecord, ExtentDescriptor, ForkKind};
use pfx_repair::catalog_ops::{find_record, lookup_by_id, lookup_thread, DAMAGED_FILES_DIR};
use pfx_repair::{
    repair_volume, EventLog, ExtentInfo, RepairContext, RepairEvent, RepairOrder, RepairPlan,
    Volume,
};
use pfx_types::{BlockNumber, CatalogNodeId, ROOT_FOLDER_ID};

fn run(
    dev: &pfx_block::MemDevice,
    plan: RepairPlan,
) -> (pfx_repair::RepairSummary, EventLog) {
    let mut ctx = RepairContext::default();
    let mut log = EventLog::new();
    let mut vol = open(dev);
    let summary = repair_volume(&mut ctx, &mut vol, plan, &mut log).unwrap();
    (summary, log)
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

#[test]
fn valence_order_fixes_mismatched_count() {
    let dev = build_device();
    let vol = open(&dev);
    add_entry(&vol, 2, "docs", &folder(20), true);

    // The folder claims 7 children; it has none.
    {
        let mut cat = vol.catalog().unwrap();
        let Some((k, CatalogRecord::Folder(mut f))) =
            lookup_by_id(&cat, CatalogNodeId(20)).unwrap()
        else {
            panic!("folder 20 must be reachable");
        };
        f.valence = 7;
        cat.replace(&k.encode(), &CatalogRecord::Folder(f).encode())
            .unwrap();
    }

    let plan = RepairPlan {
        orders: vec![RepairOrder::FolderValence {
            folder_id: CatalogNodeId(20),
            incorrect: 7,
            correct: 0,
        }],
        ..RepairPlan::default()
    };
    let (summary, _log) = run(&dev, plan);
    assert_eq!(summary.orders_repaired, 1);
    assert_eq!(summary.orders_failed, 0);
    assert!(summary.is_clean());

    let vol = open(&dev);
    let cat = vol.catalog().unwrap();
    let Some((_, CatalogRecord::Folder(f))) = lookup_by_id(&cat, CatalogNodeId(20)).unwrap()
    else {
        panic!("folder 20 vanished");
    };
    assert_eq!(f.valence, 0);
}

#[test]
fn already_correct_order_is_a_safe_noop_twice() {
    let dev = build_device();
    let vol = open(&dev);
    add_entry(&vol, 2, "docs", &folder(20), true);

    let order = RepairOrder::FolderValence {
        folder_id: CatalogNodeId(20),
        incorrect: 7,
        correct: 0,
    };
    // Valence is already 0: both runs must succeed without mutating.
    for _ in 0..2 {
        let plan = RepairPlan {
            orders: vec![order.clone()],
            ..RepairPlan::default()
        };
        let (summary, _log) = run(&dev, plan);
        assert_eq!(summary.orders_repaired, 1);
        assert_eq!(summary.orders_unresolved, 0);
    }
}

#[test]
fn value_mismatch_fails_that_order_only() {
    let dev = build_device();
    let vol = open(&dev);
    add_entry(&vol, 2, "a", &folder(20), true);
    add_entry(&vol, 2, "b", &folder(21), true);

    let plan = RepairPlan {
        orders: vec![
            // On-disk valence is 0, neither 5 nor 3: internal mismatch.
            RepairOrder::FolderValence {
                folder_id: CatalogNodeId(20),
                incorrect: 5,
                correct: 3,
            },
            // A perfectly fine sibling order.
            RepairOrder::FinderFlags {
                id: CatalogNodeId(21),
                incorrect: 0,
                correct: 0x4000,
            },
        ],
        ..RepairPlan::default()
    };
    let (summary, log) = run(&dev, plan);
    assert_eq!(summary.orders_failed, 1);
    assert_eq!(summary.orders_repaired, 1);
    assert_eq!(
        log.count_matching(|e| matches!(e, RepairEvent::OrderFailed { .. })),
        1
    );
}

#[test]
fn missing_thread_requeues_then_applies_after_thread_repair() {
    let dev = build_device();
    let vol = open(&dev);
    // File record WITHOUT a thread: the order cannot find it by id until
    // the orphan/thread engine has run.
    add_entry(&vol, 2, "notes", &file_with_extent(30, 0, 0), false);

    let plan = RepairPlan {
        orders: vec![RepairOrder::FinderFlags {
            id: CatalogNodeId(30),
            incorrect: 0,
            correct: 0x0010,
        }],
        ..RepairPlan::default()
    };
    let (summary, log) = run(&dev, plan);

    assert_eq!(summary.orders_repaired, 1, "order must land on second pass");
    assert_eq!(summary.orders_unresolved, 0);
    assert!(summary.threads_synthesized >= 1);
    assert_eq!(
        log.count_matching(|e| matches!(e, RepairEvent::OrderRequeued { .. })),
        1
    );

    let vol = open(&dev);
    let cat = vol.catalog().unwrap();
    let Some((_, CatalogRecord::File(f))) = lookup_by_id(&cat, CatalogNodeId(30)).unwrap()
    else {
        panic!("file 30 must be reachable after thread repair");
    };
    assert_eq!(u16::from_be_bytes([f.finder_info[8], f.finder_info[9]]), 0x0010);
}

#[test]
fn second_false_success_drops_the_order() {
    let dev = build_device();
    let plan = RepairPlan {
        // Nothing with id 99 exists anywhere.
        orders: vec![RepairOrder::FolderValence {
            folder_id: CatalogNodeId(99),
            incorrect: 1,
            correct: 0,
        }],
        ..RepairPlan::default()
    };
    let (summary, log) = run(&dev, plan);
    assert_eq!(summary.orders_repaired, 0);
    assert_eq!(summary.orders_failed, 1);
    assert_eq!(summary.orders_unresolved, 0);
    assert!(!summary.is_clean());
    assert_eq!(
        log.count_matching(|e| matches!(e, RepairEvent::OrderRequeued { .. })),
        1
    );
    assert_eq!(
        log.count_matching(|e| matches!(e, RepairEvent::OrderDropped { .. })),
        1
    );
}

#[test]
fn truncate_fork_releases_tail_blocks() {
    let dev = build_device();
    let vol = open(&dev);
    add_entry(&vol, 2, "big", &file_with_extent(31, 200, 8), true);
    vol.allocator().capture(BlockNumber(200), 8).unwrap();

    let plan = RepairPlan {
        orders: vec![RepairOrder::TruncateFork {
            file_id: CatalogNodeId(31),
            fork: ForkKind::Data,
            incorrect_blocks: 8,
            correct_blocks: 3,
        }],
        ..RepairPlan::default()
    };
    let (summary, _log) = run(&dev, plan);
    assert_eq!(summary.orders_repaired, 1);

    let vol = open(&dev);
    let cat = vol.catalog().unwrap();
    let Some((_, CatalogRecord::File(f))) = lookup_by_id(&cat, CatalogNodeId(31)).unwrap()
    else {
        panic!("file 31 must survive truncation");
    };
    assert_eq!(f.data_fork.total_blocks, 3);
    assert_eq!(f.data_fork.extents.0[0], ExtentDescriptor::new(200, 3));

    let alloc = vol.allocator();
    for block in 200..203 {
        assert!(alloc.is_allocated(BlockNumber(block)).unwrap());
    }
    for block in 203..208 {
        assert!(!alloc.is_allocated(BlockNumber(block)).unwrap());
    }
}

// ── Orphan/thread engine ────────────────────────────────────────────────────

#[test]
fn thread_pass_restores_bijection() {
    let dev = build_device();
    let vol = open(&dev);

    // Folder without a thread.
    add_entry(&vol, 2, "missing-thread", &folder(40), false);
    // File whose thread points at the wrong parent and name.
    add_entry(&vol, 2, "mismatched", &file_with_extent(41, 0, 0), false);
    {
        let mut cat = vol.catalog().unwrap();
        cat.insert(
            &CatalogKey::thread(CatalogNodeId(41)).encode(),
            &common::thread(false, 9, "stale-name").encode(),
        )
        .unwrap();
        // Orphan thread: no record anywhere for id 55.
        cat.insert(
            &CatalogKey::thread(CatalogNodeId(55)).encode(),
            &common::thread(false, 2, "ghost").encode(),
        )
        .unwrap();
    }

    let (summary, _log) = run(&dev, RepairPlan::default());
    assert_eq!(summary.threads_synthesized, 2);
    assert_eq!(summary.orphan_threads_deleted, 1);

    let vol = open(&dev);
    assert_thread_bijection(&vol);
    let cat = vol.catalog().unwrap();
    assert!(lookup_thread(&cat, CatalogNodeId(55)).unwrap().is_none());
    let t = lookup_thread(&cat, CatalogNodeId(41)).unwrap().unwrap();
    assert_eq!(t.parent_id, ROOT_FOLDER_ID);
    assert_eq!(t.name.to_string_lossy(), "mismatched");
}

#[test]
fn counts_are_recomputed_after_catalog_changes() {
    let dev = build_device();
    let vol = open(&dev);
    add_entry(&vol, 2, "d1", &folder(40), false);
    add_entry(&vol, 2, "f1", &file_with_extent(41, 0, 0), false);
    add_entry(&vol, 2, "f2", &file_with_extent(42, 0, 0), false);

    let (summary, _log) = run(&dev, RepairPlan::default());
    assert!(summary.threads_synthesized >= 3);

    let vol = open(&dev);
    assert_eq!(vol.header.file_count, 2);
    // Root is excluded from the folder count.
    assert_eq!(vol.header.folder_count, 1);
}

// ── Overlapping extents ─────────────────────────────────────────────────────

/// Carve the free space so two 4-block requests succeed and one 100-block
/// request cannot.
fn constrain_free_space(vol: &Volume<'_>) {
    let alloc = vol.allocator();
    // Data claimed by the three files below.
    alloc.capture(BlockNumber(200), 4).unwrap();
    alloc.capture(BlockNumber(210), 4).unwrap();
    alloc.capture(BlockNumber(220), 100).unwrap();
    // Shrink everything else: free runs at 100..108, 204..210, 320..330.
    alloc.capture(BlockNumber(80), 20).unwrap();
    alloc.capture(BlockNumber(108), 92).unwrap();
    alloc.capture(BlockNumber(330), 180).unwrap();
}

#[test]
fn overlap_partial_success_accounting() {
    let dev = build_device();
    let vol = open(&dev);
    add_entry(&vol, 2, "one.dat", &file_with_extent(20, 200, 4), true);
    add_entry(&vol, 2, "two.dat", &file_with_extent(21, 210, 4), true);
    add_entry(&vol, 2, "three.dat", &file_with_extent(22, 220, 100), true);
    constrain_free_space(&vol);

    // Distinctive payloads to prove the copy happened.
    dev.write(200 * u64::from(BLOCK_SIZE), &[0xA1; 4 * 512]).unwrap();
    dev.write(210 * u64::from(BLOCK_SIZE), &[0xB2; 4 * 512]).unwrap();

    let plan = RepairPlan {
        overlaps: vec![
            ExtentInfo::new(CatalogNodeId(20), ForkKind::Data, 200, 4),
            ExtentInfo::new(CatalogNodeId(21), ForkKind::Data, 210, 4),
            ExtentInfo::new(CatalogNodeId(22), ForkKind::Data, 220, 100),
        ],
        ..RepairPlan::default()
    };
    let (summary, log) = run(&dev, plan);

    // Partial success is success; disk-full is still surfaced.
    assert_eq!(summary.overlaps_repaired, 2);
    assert_eq!(summary.overlaps_failed, 1);
    assert!(summary.disk_full);
    assert_eq!(
        log.count_matching(|e| matches!(e, RepairEvent::DiskFull { .. })),
        1
    );
    assert_eq!(
        log.count_matching(|e| matches!(e, RepairEvent::FileRelocated { .. })),
        2
    );

    let vol = open(&dev);
    let cat = vol.catalog().unwrap();
    let alloc = vol.allocator();

    // Repaired records point at their new runs and the data moved along.
    for (id, fill) in [(20_u32, 0xA1_u8), (21, 0xB2)] {
        let Some((_, CatalogRecord::File(f))) = lookup_by_id(&cat, CatalogNodeId(id)).unwrap()
        else {
            panic!("file {id} must survive");
        };
        let desc = f.data_fork.extents.0[0];
        assert_ne!(desc.start_block, if id == 20 { 200 } else { 210 });
        assert_eq!(desc.block_count, 4);
        let data = dev
            .read(u64::from(desc.start_block) * u64::from(BLOCK_SIZE), 4 * 512)
            .unwrap();
        assert!(data.iter().all(|&b| b == fill));
        for b in desc.start_block..desc.end_block() {
            assert!(alloc.is_allocated(BlockNumber(b)).unwrap());
        }
    }

    // The failed item keeps its original blocks: not leaked, not freed.
    let Some((_, CatalogRecord::File(f3))) = lookup_by_id(&cat, CatalogNodeId(22)).unwrap()
    else {
        panic!("file 22 must survive");
    };
    assert_eq!(f3.data_fork.extents.0[0], ExtentDescriptor::new(220, 100));
    for b in 220..320 {
        assert!(alloc.is_allocated(BlockNumber(b)).unwrap());
    }
    // Old runs of the repaired items were released.
    for b in 200..204 {
        assert!(!alloc.is_allocated(BlockNumber(b)).unwrap());
    }
    for b in 210..214 {
        assert!(!alloc.is_allocated(BlockNumber(b)).unwrap());
    }
    assert_eq!(vol.header.free_blocks, alloc.count_free().unwrap());

    // No two files share a block afterwards.
    let mut runs: Vec<ExtentDescriptor> = Vec::new();
    cat.for_each(|_, data| {
        if let CatalogRecord::File(f) = CatalogRecord::decode(data)? {
            runs.extend(f.data_fork.extents.active().copied());
        }
        Ok(())
    })
    .unwrap();
    for (i, a) in runs.iter().enumerate() {
        for b in &runs[i + 1..] {
            assert!(!a.overlaps(b), "extents {a:?} and {b:?} overlap");
        }
    }
}

#[test]
fn relocated_files_get_damaged_files_pointers() {
    let dev = build_device();
    let vol = open(&dev);
    add_entry(&vol, 2, "moved.dat", &file_with_extent(20, 200, 4), true);
    vol.allocator().capture(BlockNumber(200), 4).unwrap();

    let plan = RepairPlan {
        overlaps: vec![ExtentInfo::new(CatalogNodeId(20), ForkKind::Data, 200, 4)],
        ..RepairPlan::default()
    };
    let (summary, log) = run(&dev, plan);
    assert_eq!(summary.overlaps_repaired, 1);
    assert!(!summary.disk_full);
    assert_eq!(
        log.count_matching(|e| matches!(e, RepairEvent::DamagedFilesCreated)),
        1
    );

    let vol = open(&dev);
    let cat = vol.catalog().unwrap();
    let Some(CatalogRecord::Folder(dir)) =
        find_record(&cat, &key(2, DAMAGED_FILES_DIR)).unwrap()
    else {
        panic!("DamagedFiles directory must exist");
    };
    let Some(CatalogRecord::File(pointer)) = find_record(
        &cat,
        &CatalogKey::new(dir.folder_id, pfx_ondisk::CatName::from_str("20 moved.dat").unwrap()),
    )
    .unwrap()
    else {
        panic!("pointer entry must exist");
    };
    // The pointer is a symlink whose data fork holds the original path.
    assert!(pointer.bsd.is_symlink());
    let desc = pointer.data_fork.extents.0[0];
    let target = dev
        .read(
            u64::from(desc.start_block) * u64::from(BLOCK_SIZE),
            pointer.data_fork.logical_size as usize,
        )
        .unwrap();
    assert_eq!(target, b"moved.dat");

    // Everything the resolver created is thread-consistent.
    assert_thread_bijection(&vol);
}

#[test]
fn cancellation_stops_the_run() {
    let dev = build_device();
    let mut ctx = RepairContext::default();
    ctx.request_abort();
    let mut log = EventLog::new();
    let mut vol = open(&dev);
    let err = repair_volume(&mut ctx, &mut vol, RepairPlan::default(), &mut log).unwrap_err();
    assert!(matches!(err, PfxError::Cancelled));
}
