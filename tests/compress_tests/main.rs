//! Tests for online space reclamation
//!
//! These tests verify:
//! - Space converges to one data page after deleting everything
//! - Purge leaves uncommitted deletes alone
//! - Defragment waits for, and times out on, other transactions' locks
//! - Truncate only returns trailing free pages
//! - Row contents survive records being moved

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;
use std::fs;

use common::{boot, keyed_row, reboot, setup_temp_db};
use pagevault::store::container_path;
use pagevault::{CompressOptions, Config, ContainerId, Database, PageSize, Row, RowId, VaultError, WalSyncStrategy};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn insert_rows(db: &Database, c: ContainerId, count: u32, payload: usize) -> Vec<RowId> {
    let txn = db.begin().unwrap();
    let ids = (0..count).map(|k| db.insert(txn, c, keyed_row(k, payload)).unwrap()).collect();
    db.commit(txn).unwrap();
    ids
}

fn delete_rows<'a>(db: &Database, ids: impl IntoIterator<Item = &'a RowId>) {
    let txn = db.begin().unwrap();
    for id in ids {
        db.delete(txn, *id).unwrap();
    }
    db.commit(txn).unwrap();
}

/// Rows keyed by their first column
fn contents(db: &Database, c: ContainerId) -> BTreeMap<u32, Row> {
    let txn = db.begin().unwrap();
    let rows = db.scan(txn, c).unwrap();
    db.commit(txn).unwrap();
    rows.into_iter()
        .map(|(_, row)| {
            let key = u32::from_le_bytes(row.columns[0].clone().try_into().unwrap());
            (key, row)
        })
        .collect()
}

fn file_len(db: &Database, c: ContainerId) -> u64 {
    fs::metadata(container_path(db.data_dir(), c)).unwrap().len()
}

// =============================================================================
// Convergence Tests
// =============================================================================

#[test]
fn test_space_converges_after_deleting_everything() {
    for count in [0u32, 1, 50, 400] {
        let (_temp_dir, db) = setup_temp_db();
        let c = db.create_container("t", None).unwrap();

        let ids = insert_rows(&db, c, count, 200);
        delete_rows(&db, &ids);
        db.wait_for_post_commit().unwrap();

        let info = db.run_compress(c, CompressOptions::all()).unwrap();
        assert_eq!(info.allocated, 1, "rows: {count}");
        assert_eq!(info.free, 0, "rows: {count}");
        assert_eq!(info.unfilled, 0, "rows: {count}");
        assert_eq!(info.extents, 1, "rows: {count}");
        db.check_consistency(c).unwrap();

        // Allocation page plus control page
        db.checkpoint().unwrap();
        assert_eq!(file_len(&db, c), 2 * 4096, "rows: {count}");
    }
}

#[test]
fn test_emptied_extents_are_dropped() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .pages_per_extent(8)
        .lock_timeout_ms(200)
        .build();
    let db = boot(config.clone());
    let c = db.create_container("t", Some(PageSize::K4)).unwrap();

    let ids = insert_rows(&db, c, 400, 200);
    let before = db.space_info(c).unwrap();
    assert!(before.extents >= 3, "{before:?}");
    delete_rows(&db, &ids);
    db.wait_for_post_commit().unwrap();

    let info = db.run_compress(c, CompressOptions::all()).unwrap();
    assert_eq!(info.allocated, 1, "{info:?}");
    assert_eq!(info.free, 0, "{info:?}");
    assert_eq!(info.extents, 1, "{info:?}");
    assert_eq!(info.released, 7, "{info:?}");
    assert_eq!(file_len(&db, c), 2 * 4096);
    db.check_consistency(c).unwrap();
    drop(db);

    let db = boot(config);
    let recovered = db.space_info(c).unwrap();
    assert_eq!(recovered.allocated, 1);
    assert_eq!(recovered.free, 0);
    assert_eq!(recovered.extents, 1);
    assert_eq!(recovered.released, 7);
    assert_eq!(file_len(&db, c), 2 * 4096);
    db.check_consistency(c).unwrap();

    // The chain grows again past the dropped extents
    insert_rows(&db, c, 400, 200);
    let grown = db.space_info(c).unwrap();
    assert!(grown.extents >= 3, "{grown:?}");
    assert_eq!(grown.released, 0);
    assert_eq!(contents(&db, c).len(), 400);
    db.check_consistency(c).unwrap();
}

#[test]
fn test_released_pages_come_back_after_restart() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = insert_rows(&db, c, 100, 300);
    delete_rows(&db, &ids);
    db.wait_for_post_commit().unwrap();

    let info = db.run_compress(c, CompressOptions::all()).unwrap();
    assert!(info.released > 0);
    drop(db);

    let db = reboot(temp_dir.path());
    let recovered = db.space_info(c).unwrap();
    assert_eq!(recovered.allocated, 1);
    assert_eq!(recovered.released, info.released);
    assert_eq!(file_len(&db, c), 2 * 4096);

    // Released slots are handed out again
    let ids = insert_rows(&db, c, 30, 300);
    assert!(ids.iter().all(|id| id.page < 2 + info.released));
    let grown = db.space_info(c).unwrap();
    assert!(grown.released < info.released);
    db.check_consistency(c).unwrap();
}

// =============================================================================
// Purge Tests
// =============================================================================

#[test]
fn test_purge_skips_uncommitted_deletes() {
    let (_temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = insert_rows(&db, c, 100, 200);
    let before = db.space_info(c).unwrap();

    let txn = db.begin().unwrap();
    for id in &ids {
        db.delete(txn, *id).unwrap();
    }

    let first = db.run_compress(c, CompressOptions::purge_only()).unwrap();
    let second = db.run_compress(c, CompressOptions::purge_only()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.allocated, before.allocated);

    // The deletes can still be undone
    db.abort(txn).unwrap();
    assert_eq!(contents(&db, c).len(), 100);
    db.check_consistency(c).unwrap();
}

#[test]
fn test_purge_removes_committed_deletes() {
    let (_temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = insert_rows(&db, c, 120, 200);

    // Every other row: no page empties, so post-commit leaves them alone
    delete_rows(&db, ids.iter().step_by(2));
    db.wait_for_post_commit().unwrap();
    let before = db.space_info(c).unwrap();

    let after = db.run_compress(c, CompressOptions::purge_only()).unwrap();
    assert_eq!(after.allocated, before.allocated);
    assert!(after.unfilled >= before.unfilled);
    assert_eq!(contents(&db, c).len(), 60);
    db.check_consistency(c).unwrap();
}

// =============================================================================
// Defragment Tests
// =============================================================================

#[test]
fn test_defragment_times_out_behind_reader() {
    let (_temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = insert_rows(&db, c, 60, 200);
    delete_rows(&db, ids.iter().take(30));
    db.wait_for_post_commit().unwrap();

    // A fetch leaves an intent lock on the container until commit
    let reader = db.begin().unwrap();
    db.fetch(reader, ids[40]).unwrap();

    let options = CompressOptions::new(false, true, false);
    let err = db.run_compress(c, options).unwrap_err();
    assert!(matches!(err, VaultError::LockTimeout { .. }), "{err}");
    assert!(err.is_retryable());
    // Nothing moved and the compress transaction is gone
    assert_eq!(db.fetch(reader, ids[40]).unwrap(), keyed_row(40, 200));
    db.commit(reader).unwrap();
    db.wait_for_post_commit().unwrap();
    assert_eq!(db.active_transactions(), 0);

    db.run_compress(c, options).unwrap();
    assert_eq!(contents(&db, c).len(), 30);
    db.check_consistency(c).unwrap();
}

#[test]
fn test_defragment_keeps_row_contents() {
    let (_temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();

    let txn = db.begin().unwrap();
    let mut ids = Vec::new();
    for k in 0..80u32 {
        let row = match k % 10 {
            // Long column
            0 => Row::new(vec![k.to_le_bytes().to_vec(), vec![k as u8; 6000]]),
            // Row split over several records
            5 => Row::new(vec![k.to_le_bytes().to_vec(), vec![1; 900], vec![2; 900], vec![3; 900], vec![4; 900], vec![5; 900]]),
            _ => keyed_row(k, 300),
        };
        ids.push((k, db.insert(txn, c, row).unwrap()));
    }
    db.commit(txn).unwrap();
    let expected: BTreeMap<u32, Row> = contents(&db, c)
        .into_iter()
        .filter(|(k, _)| k % 3 != 0)
        .collect();

    delete_rows(&db, ids.iter().filter(|(k, _)| k % 3 == 0).map(|(_, id)| id));
    db.wait_for_post_commit().unwrap();
    let before = db.space_info(c).unwrap();

    let info = db.run_compress(c, CompressOptions::all()).unwrap();
    assert!(info.allocated < before.allocated);
    assert_eq!(contents(&db, c), expected);
    db.check_consistency(c).unwrap();

    // Still intact after a restart
    let dir = db.data_dir().to_path_buf();
    drop(db);
    let db = reboot(&dir);
    assert_eq!(contents(&db, c), expected);
    db.check_consistency(c).unwrap();
}

#[test]
fn test_defragment_into_pages_with_wide_row_ids() {
    let (_temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();

    // First data page ends up with row ids past 63
    let small = insert_rows(&db, c, 150, 1);
    assert!(small.iter().any(|id| id.row >= 64));
    delete_rows(&db, small.iter().take(140));
    db.wait_for_post_commit().unwrap();

    let txn = db.begin().unwrap();
    for k in 1000..1040u32 {
        db.insert(txn, c, keyed_row(k, 700)).unwrap();
    }
    db.commit(txn).unwrap();
    let expected = contents(&db, c);
    assert_eq!(expected.len(), 50);

    let info = db.run_compress(c, CompressOptions::all()).unwrap();
    assert_eq!(contents(&db, c), expected);
    assert!(info.allocated >= 1 + 40 * 720 / 4028);
    db.check_consistency(c).unwrap();
}

// =============================================================================
// Truncate Tests
// =============================================================================

#[test]
fn test_truncate_without_trailing_free_pages_is_a_no_op() {
    let (_temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = insert_rows(&db, c, 100, 500);

    // Empty the first pages only
    let first_page = ids[0].page;
    delete_rows(&db, ids.iter().filter(|id| id.page == first_page));
    db.wait_for_post_commit().unwrap();
    let before = db.space_info(c).unwrap();
    assert_eq!(before.free, 1);
    db.checkpoint().unwrap();
    let len = file_len(&db, c);

    let info = db.run_compress(c, CompressOptions::new(false, false, true)).unwrap();
    assert_eq!(info, before);
    assert_eq!(info.released, 0);
    assert_eq!(file_len(&db, c), len);
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_delete_every_third_row_on_32k_pages() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .wal_sync_strategy(WalSyncStrategy::EveryNEntries { count: 1000 })
        .log_file_size(16 * 1024 * 1024)
        .lock_timeout_ms(200)
        .build();
    let db = boot(config);
    let c = db.create_container("big", Some(PageSize::K32)).unwrap();

    // About 25 rows per page
    let ids = insert_rows(&db, c, 4000, 1280);
    let full = db.space_info(c).unwrap();
    assert!(full.allocated > 150);

    delete_rows(&db, ids.iter().step_by(3));
    db.wait_for_post_commit().unwrap();
    let remaining = 4000 - ids.iter().step_by(3).count() as u64;

    let info = db.run_compress(c, CompressOptions::all()).unwrap();
    assert!(info.allocated < full.allocated);
    // Never fewer pages than the remaining rows need at 25 per page
    assert!(info.allocated >= 1 + remaining.div_ceil(25));
    assert_eq!(info.free, 0);
    assert_eq!(contents(&db, c).len() as u64, remaining);
    db.check_consistency(c).unwrap();
}
