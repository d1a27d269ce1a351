//! Tests for crash recovery
//!
//! A dropped `Database` is a crash: nothing is flushed beyond what the log
//! already holds. These tests verify:
//! - Committed work survives, uncommitted work is rolled back
//! - Uncommitted changes that reached the container file are undone
//! - Repeated restarts and restarts after checkpoints
//! - A torn log tail
//! - Log exhaustion is fatal, and recoverable with a higher limit
//! - A failed log sync at commit is fatal and keeps the transaction's locks

#[path = "../common/mod.rs"]
mod common;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{boot, keyed_row, reboot, setup_temp_db};
use pagevault::wal::{list_log_files, log_file_path};
use pagevault::{
    Config, ContainerId, CrashPoint, Database, FaultInjector, Row, RowId, VaultError,
    WalSyncStrategy,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn committed_rows(db: &Database, c: ContainerId, keys: std::ops::Range<u32>) -> Vec<RowId> {
    let txn = db.begin().unwrap();
    let ids = keys.map(|k| db.insert(txn, c, keyed_row(k, 120)).unwrap()).collect();
    db.commit(txn).unwrap();
    ids
}

fn row_count(db: &Database, c: ContainerId) -> usize {
    let txn = db.begin().unwrap();
    let count = db.scan(txn, c).unwrap().len();
    db.commit(txn).unwrap();
    count
}

fn fetch(db: &Database, row_id: RowId) -> pagevault::Result<Row> {
    let txn = db.begin().unwrap();
    let row = db.fetch(txn, row_id);
    db.commit(txn).unwrap();
    row
}

fn small_log_config(dir: &Path, max_file_number: u32) -> Config {
    Config::builder()
        .data_dir(dir)
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .log_file_size(4096)
        .max_log_file_number(max_file_number)
        .lock_timeout_ms(200)
        .build()
}

// =============================================================================
// Redo / Undo Tests
// =============================================================================

#[test]
fn test_committed_rows_survive_crash() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = committed_rows(&db, c, 0..50);
    drop(db);

    let db = reboot(temp_dir.path());
    db.check_consistency(c).unwrap();
    for (k, id) in ids.iter().enumerate() {
        assert_eq!(fetch(&db, *id).unwrap(), keyed_row(k as u32, 120));
    }
    // Control page plus data pages 2..=last
    assert_eq!(db.space_info(c).unwrap().allocated, ids.last().unwrap().page);
}

#[test]
fn test_uncommitted_rows_rolled_back() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let kept = committed_rows(&db, c, 0..10);

    let txn = db.begin().unwrap();
    let lost: Vec<RowId> = (10..40).map(|k| db.insert(txn, c, keyed_row(k, 120)).unwrap()).collect();
    db.delete(txn, kept[0]).unwrap();
    drop(db);

    let db = reboot(temp_dir.path());
    db.check_consistency(c).unwrap();
    assert_eq!(row_count(&db, c), 10);
    assert_eq!(fetch(&db, kept[0]).unwrap(), keyed_row(0, 120));
    for id in lost {
        assert!(matches!(fetch(&db, id), Err(VaultError::RowNotFound(_))));
    }
}

#[test]
fn test_uncommitted_update_on_disk_is_undone() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = committed_rows(&db, c, 0..5);

    let txn = db.begin().unwrap();
    db.update(txn, ids[2], keyed_row(77, 3000)).unwrap();
    db.update(txn, ids[3], keyed_row(78, 5)).unwrap();
    // The checkpoint writes the uncommitted pages to the container file
    db.checkpoint().unwrap();
    drop(db);

    let db = reboot(temp_dir.path());
    db.check_consistency(c).unwrap();
    assert_eq!(fetch(&db, ids[2]).unwrap(), keyed_row(2, 120));
    assert_eq!(fetch(&db, ids[3]).unwrap(), keyed_row(3, 120));
    assert_eq!(row_count(&db, c), 5);
}

#[test]
fn test_restart_twice() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    let ids = committed_rows(&db, c, 0..20);
    let txn = db.begin().unwrap();
    db.delete(txn, ids[5]).unwrap();
    db.insert(txn, c, keyed_row(99, 10)).unwrap();
    drop(db);

    let db = reboot(temp_dir.path());
    let after_first = db.space_info(c).unwrap();
    drop(db);

    let db = reboot(temp_dir.path());
    let after_second = db.space_info(c).unwrap();
    assert_eq!(after_first.allocated, after_second.allocated);
    assert_eq!(after_first.free, after_second.free);
    assert_eq!(row_count(&db, c), 20);
    db.check_consistency(c).unwrap();

    // New transactions get fresh ids and work normally
    let more = committed_rows(&db, c, 100..110);
    assert_eq!(fetch(&db, more[0]).unwrap(), keyed_row(100, 120));
}

#[test]
fn test_crash_after_checkpoint() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    committed_rows(&db, c, 0..50);

    // A transaction that spans the checkpoint
    let open = db.begin().unwrap();
    db.insert(open, c, keyed_row(500, 120)).unwrap();
    db.checkpoint().unwrap();
    db.insert(open, c, keyed_row(501, 120)).unwrap();

    let ids = committed_rows(&db, c, 50..100);
    let deleter = db.begin().unwrap();
    db.delete(deleter, ids[0]).unwrap();
    db.commit(deleter).unwrap();
    drop(db);

    let db = reboot(temp_dir.path());
    db.check_consistency(c).unwrap();
    assert_eq!(row_count(&db, c), 99);
    assert!(matches!(fetch(&db, ids[0]), Err(VaultError::RowNotFound(_))));
}

#[test]
fn test_close_then_boot_is_clean() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    committed_rows(&db, c, 0..30);
    db.close().unwrap();

    let db = reboot(temp_dir.path());
    assert_eq!(row_count(&db, c), 30);
    // Only the log files from the last checkpoint on are kept
    assert_eq!(list_log_files(&temp_dir.path().join("log")).unwrap().len(), 1);
}

// =============================================================================
// Torn Tail Tests
// =============================================================================

#[test]
fn test_torn_log_tail_at_boot() {
    let (temp_dir, db) = setup_temp_db();
    let c = db.create_container("t", None).unwrap();
    committed_rows(&db, c, 0..10);
    drop(db);

    let log_dir = temp_dir.path().join("log");
    let last = *list_log_files(&log_dir).unwrap().last().unwrap();
    let mut file = OpenOptions::new()
        .append(true)
        .open(log_file_path(&log_dir, last))
        .unwrap();
    // Half a frame header
    file.write_all(&[0x11; 7]).unwrap();
    drop(file);

    let db = reboot(temp_dir.path());
    assert_eq!(row_count(&db, c), 10);
    committed_rows(&db, c, 10..20);
    drop(db);

    let db = reboot(temp_dir.path());
    assert_eq!(row_count(&db, c), 20);
}

// =============================================================================
// Log Exhaustion Tests
// =============================================================================

#[test]
fn test_log_exhaustion_is_fatal() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let db = boot(small_log_config(temp_dir.path(), 4));
    let c = db.create_container("t", None).unwrap();

    let mut committed = 0u32;
    let err = loop {
        let txn = match db.begin() {
            Ok(txn) => txn,
            Err(err) => break err,
        };
        match db.insert(txn, c, keyed_row(committed, 120)).and_then(|_| db.commit(txn)) {
            Ok(()) => committed += 1,
            Err(err) => break err,
        }
        assert!(committed < 10_000, "log never filled up");
    };
    assert!(matches!(err, VaultError::LogExhausted { max: 4, .. }), "{err}");
    assert!(err.is_fatal());
    assert!(committed > 0);

    assert!(matches!(db.begin(), Err(VaultError::DatabaseFatal(_))));
    assert!(matches!(db.checkpoint(), Err(VaultError::DatabaseFatal(_))));
    assert!(matches!(db.create_container("u", None), Err(VaultError::DatabaseFatal(_))));
    drop(db);

    // More log file numbers let the database come back
    let db = boot(small_log_config(temp_dir.path(), 1000));
    assert_eq!(row_count(&db, c), committed as usize);
    db.check_consistency(c).unwrap();
}

/// Fails every log sync once armed
#[derive(Default)]
struct FailingSync {
    armed: AtomicBool,
}

impl FaultInjector for FailingSync {
    fn check(&self, _point: CrashPoint) -> pagevault::Result<()> {
        Ok(())
    }

    fn log_sync(&self) -> pagevault::Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(VaultError::Io(io::Error::other("disk went away")));
        }
        Ok(())
    }
}

#[test]
fn test_failed_commit_sync_is_fatal() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let faults = Arc::new(FailingSync::default());
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .wal_sync_strategy(WalSyncStrategy::EveryNEntries { count: 1000 })
        .lock_timeout_ms(200)
        .fault_injector(faults.clone())
        .build();
    let db = boot(config);
    let c = db.create_container("t", None).unwrap();
    let ids = committed_rows(&db, c, 0..20);

    let txn = db.begin().unwrap();
    db.update(txn, ids[3], keyed_row(1000, 120)).unwrap();
    faults.armed.store(true, Ordering::SeqCst);
    let err = db.commit(txn).unwrap_err();
    assert!(matches!(err, VaultError::Io(_)), "{err}");

    // Nothing else runs, and the writer still holds what it locked
    assert!(matches!(db.begin(), Err(VaultError::DatabaseFatal(_))));
    assert!(db.lock_table().iter().any(|lock| lock.txn == txn && lock.granted));
    assert_eq!(db.active_transactions(), 1);
    drop(db);

    // Recovery decides: the update either committed or it did not
    let db = reboot(temp_dir.path());
    let row = fetch(&db, ids[3]).unwrap();
    assert!(row == keyed_row(1000, 120) || row == keyed_row(3, 120));
    assert_eq!(row_count(&db, c), 20);
    db.check_consistency(c).unwrap();
    committed_rows(&db, c, 20..30);
    assert_eq!(row_count(&db, c), 30);
}

#[test]
fn test_invalid_config_rejected() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .pages_per_extent(0)
        .build();
    assert!(matches!(
        Database::boot(config, pagevault::BootRequest::new()),
        Err(VaultError::Config(_))
    ));
}
