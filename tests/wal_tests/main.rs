//! Tests for the write-ahead log
//!
//! These tests verify:
//! - Append and scan across file switches
//! - Torn tail detection and truncation
//! - Log exhaustion at the maximum file number
//! - A failed sync makes the log unusable
//! - The control file and removal of old log files
//! - Redo/undo recovery against a recording target

#[path = "../common/mod.rs"]
mod common;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use pagevault::page::PageOp;
use pagevault::wal::{
    list_log_files, log_file_path, LogBody, LogControl, LogManager, LogOptions, LogReader,
    LogRecord, LogWriter, Lsn, Recovery, RecoveryTarget,
};
use pagevault::{
    Config, ContainerId, CrashPoint, FaultInjector, PageNumber, Result, VaultError,
    WalSyncStrategy,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn options(file_size: u64, max_file_number: u32) -> LogOptions {
    LogOptions {
        file_size,
        max_file_number,
        sync_strategy: WalSyncStrategy::EveryWrite,
    }
}

fn setup_temp_writer(file_size: u64) -> (TempDir, LogWriter) {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let writer = LogWriter::open(temp_dir.path(), Lsn::ZERO, options(file_size, 1000)).unwrap();
    (temp_dir, writer)
}

fn insert(row_id: u16, fill: u8) -> PageOp {
    PageOp::InsertRecord {
        row_id,
        bytes: vec![fill; 40],
    }
}

fn page_record(txn: u64, prev: Option<Lsn>, page: PageNumber, op: PageOp) -> LogRecord {
    LogRecord::new(
        txn,
        prev,
        LogBody::Page {
            container: 1,
            page,
            op,
        },
    )
}

fn last_log_file(dir: &Path) -> std::path::PathBuf {
    let numbers = list_log_files(dir).unwrap();
    log_file_path(dir, *numbers.last().unwrap())
}

/// Remembers page LSNs and every applied operation
#[derive(Default)]
struct RecordingTarget {
    lsns: HashMap<(ContainerId, PageNumber), u64>,
    applied: Vec<(PageNumber, PageOp, Lsn)>,
}

impl RecoveryTarget for RecordingTarget {
    fn page_lsn(&mut self, container: ContainerId, page: PageNumber) -> Result<u64> {
        Ok(self.lsns.get(&(container, page)).copied().unwrap_or(0))
    }

    fn apply(&mut self, container: ContainerId, page: PageNumber, op: &PageOp, lsn: Lsn) -> Result<()> {
        self.lsns.insert((container, page), lsn.0);
        self.applied.push((page, op.clone(), lsn));
        Ok(())
    }
}

// =============================================================================
// Append / Scan Tests
// =============================================================================

#[test]
fn test_append_and_scan_in_order() {
    let (temp_dir, mut writer) = setup_temp_writer(1024 * 1024);

    let mut lsns = Vec::new();
    for txn in 1..=5 {
        lsns.push(writer.append(&LogRecord::new(txn, None, LogBody::Commit)).unwrap());
    }
    assert!(lsns.windows(2).all(|w| w[0] < w[1]));
    let end = writer.end_lsn();
    drop(writer);

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    assert_eq!(scan.records.len(), 5);
    assert_eq!(scan.end, end);
    assert_eq!(scan.truncated_bytes, 0);
    for (i, (lsn, record)) in scan.records.iter().enumerate() {
        assert_eq!(*lsn, lsns[i]);
        assert_eq!(record.txn, i as u64 + 1);
        assert_eq!(record.body, LogBody::Commit);
    }
}

#[test]
fn test_file_switch_and_scan_from_middle() {
    let (temp_dir, mut writer) = setup_temp_writer(4096);

    let mut lsns = Vec::new();
    for i in 0..200u16 {
        let lsn = writer
            .append(&page_record(1, lsns.last().copied(), 2, insert(i, i as u8)))
            .unwrap();
        lsns.push(lsn);
    }
    assert!(writer.file_number() > 1);
    assert!(list_log_files(temp_dir.path()).unwrap().len() > 1);
    drop(writer);

    let from = lsns[150];
    let scan = LogReader::scan(temp_dir.path(), from).unwrap();
    assert_eq!(scan.records.len(), 50);
    assert_eq!(scan.records[0].0, from);
    assert_eq!(scan.records[0].1.prev_lsn, Some(lsns[149]));
}

#[test]
fn test_reopen_continues_after_last_record() {
    let (temp_dir, mut writer) = setup_temp_writer(4096);
    for txn in 1..=3 {
        writer.append(&LogRecord::new(txn, None, LogBody::Abort)).unwrap();
    }
    drop(writer);

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    let mut writer = LogWriter::open(temp_dir.path(), scan.end, options(4096, 1000)).unwrap();
    let lsn = writer.append(&LogRecord::new(4, None, LogBody::Commit)).unwrap();
    assert_eq!(lsn, scan.end);
    drop(writer);

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    assert_eq!(scan.records.len(), 4);
}

// =============================================================================
// Torn Tail Tests
// =============================================================================

#[test]
fn test_torn_tail_is_truncated() {
    let (temp_dir, mut writer) = setup_temp_writer(1024 * 1024);
    for txn in 1..=3 {
        writer.append(&LogRecord::new(txn, None, LogBody::Commit)).unwrap();
    }
    let end = writer.end_lsn();
    drop(writer);

    let path = last_log_file(temp_dir.path());
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xAB; 11]).unwrap();
    drop(file);

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    assert_eq!(scan.records.len(), 3);
    assert_eq!(scan.truncated_bytes, 11);
    assert_eq!(scan.end, end);
    assert_eq!(fs::metadata(&path).unwrap().len(), end.offset() as u64);
}

#[test]
fn test_flipped_byte_in_last_frame_is_a_torn_write() {
    let (temp_dir, mut writer) = setup_temp_writer(1024 * 1024);
    writer.append(&LogRecord::new(1, None, LogBody::Commit)).unwrap();
    let second = writer.append(&LogRecord::new(2, None, LogBody::Commit)).unwrap();
    drop(writer);

    let path = last_log_file(temp_dir.path());
    let mut data = fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    assert_eq!(scan.records.len(), 1);
    assert_eq!(scan.end, second);
}

#[test]
fn test_damage_before_the_last_file_is_corruption() {
    let (temp_dir, mut writer) = setup_temp_writer(4096);
    for i in 0..100u16 {
        writer.append(&page_record(1, None, 2, insert(i, 7))).unwrap();
    }
    drop(writer);
    let first = log_file_path(temp_dir.path(), list_log_files(temp_dir.path()).unwrap()[0]);
    let mut data = fs::read(&first).unwrap();
    data[20] ^= 0xFF;
    fs::write(&first, &data).unwrap();

    assert!(matches!(
        LogReader::scan(temp_dir.path(), Lsn::ZERO),
        Err(VaultError::LogCorruption(_))
    ));
}

// =============================================================================
// Exhaustion Tests
// =============================================================================

#[test]
fn test_max_file_number_is_fatal() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let writer = LogWriter::open(temp_dir.path(), Lsn::ZERO, options(4096, 2)).unwrap();
    let log = LogManager::new(temp_dir.path(), writer);

    let mut result = Ok(Lsn::ZERO);
    for i in 0..1000u16 {
        result = log.append(&page_record(1, None, 2, insert(i, 1)));
        if result.is_err() {
            break;
        }
    }
    let err = result.unwrap_err();
    assert!(matches!(err, VaultError::LogExhausted { max: 2, .. }));
    assert!(err.is_fatal());
    assert!(!err.is_retryable());

    // Nothing is accepted afterwards
    assert!(matches!(
        log.append(&LogRecord::new(9, None, LogBody::Commit)),
        Err(VaultError::DatabaseFatal(_))
    ));
    assert!(log.fatal_reason().is_some());
}

struct SyncAlwaysFails;

impl FaultInjector for SyncAlwaysFails {
    fn check(&self, _point: CrashPoint) -> Result<()> {
        Ok(())
    }

    fn log_sync(&self) -> Result<()> {
        Err(VaultError::Io(io::Error::other("fsync failed")))
    }
}

#[test]
fn test_failed_sync_is_fatal() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(1024 * 1024, 10);
    opts.sync_strategy = WalSyncStrategy::EveryNEntries { count: 1000 };
    let writer = LogWriter::open(temp_dir.path(), Lsn::ZERO, opts).unwrap();
    let faults = Config::builder()
        .fault_injector(Arc::new(SyncAlwaysFails))
        .build()
        .faults;
    let log = LogManager::new(temp_dir.path(), writer).with_faults(faults);

    let lsn = log.append(&page_record(1, None, 2, insert(0, 1))).unwrap();
    assert!(log.fatal_reason().is_none());
    assert!(matches!(log.flush_to(lsn), Err(VaultError::Io(_))));
    assert!(log.fatal_reason().unwrap().contains("log sync failed"));

    assert!(matches!(
        log.append(&LogRecord::new(9, None, LogBody::Commit)),
        Err(VaultError::DatabaseFatal(_))
    ));
    assert!(matches!(log.sync(), Err(VaultError::DatabaseFatal(_))));
}

// =============================================================================
// Control File Tests
// =============================================================================

#[test]
fn test_control_file_round_trip_and_old_files_removed() {
    let (temp_dir, mut writer) = setup_temp_writer(4096);
    let mut lsns = Vec::new();
    for i in 0..200u16 {
        lsns.push(writer.append(&page_record(1, None, 2, insert(i, 3))).unwrap());
    }
    let before = list_log_files(temp_dir.path()).unwrap();
    assert!(before.len() > 2);
    let log = LogManager::new(temp_dir.path(), writer);

    assert_eq!(LogControl::load(temp_dir.path()).unwrap(), LogControl::default());

    let keep = lsns[190];
    let control = LogControl {
        checkpoint: Some(keep),
        scan_start: keep,
    };
    let removed = log.complete_checkpoint(control).unwrap();
    assert_eq!(removed, (keep.file_number() - before[0]) as usize);
    assert_eq!(LogControl::load(temp_dir.path()).unwrap(), control);
    assert_eq!(list_log_files(temp_dir.path()).unwrap()[0], keep.file_number());
    assert_eq!(log.bytes_since_checkpoint(), 0);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_recovery_redoes_winners_and_undoes_losers() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let mut writer = LogWriter::open(temp_dir.path(), Lsn::ZERO, options(1024 * 1024, 10)).unwrap();

    let w1 = writer.append(&page_record(1, None, 2, insert(0, 1))).unwrap();
    writer.append(&LogRecord::new(1, Some(w1), LogBody::Commit)).unwrap();
    let l1 = writer.append(&page_record(2, None, 3, insert(0, 2))).unwrap();
    let l2 = writer.append(&page_record(2, Some(l1), 3, insert(1, 2))).unwrap();
    drop(writer);

    // First pass
    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    let writer = LogWriter::open(temp_dir.path(), scan.end, options(1024 * 1024, 10)).unwrap();
    let log = LogManager::new(temp_dir.path(), writer);
    let mut target = RecordingTarget::default();
    let report = Recovery::run(&scan, None, &log, &mut target).unwrap();

    assert_eq!(report.redone, 3);
    assert_eq!(report.undone, 2);
    assert_eq!(report.losers, vec![2]);
    assert_eq!(report.next_txn, 3);
    // Undo runs newest first, as inverses
    let undone: Vec<&PageOp> = target.applied[3..].iter().map(|(_, op, _)| op).collect();
    assert_eq!(undone[0], &insert(1, 2).inverse().unwrap());
    assert_eq!(undone[1], &insert(0, 2).inverse().unwrap());
    assert!(target.applied[3].2 > l2);
    drop(log);

    // Second pass over the same pages: nothing to redo, nothing to undo
    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    let writer = LogWriter::open(temp_dir.path(), scan.end, options(1024 * 1024, 10)).unwrap();
    let log = LogManager::new(temp_dir.path(), writer);
    let applied_before = target.applied.len();
    let report = Recovery::run(&scan, None, &log, &mut target).unwrap();
    assert_eq!(report.redone, 0);
    assert_eq!(report.undone, 0);
    assert!(report.losers.is_empty());
    assert_eq!(target.applied.len(), applied_before);
}

#[test]
fn test_recovery_replays_onto_stale_pages() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let mut writer = LogWriter::open(temp_dir.path(), Lsn::ZERO, options(1024 * 1024, 10)).unwrap();
    let a = writer.append(&page_record(1, None, 2, insert(0, 1))).unwrap();
    let b = writer.append(&page_record(1, Some(a), 2, insert(1, 1))).unwrap();
    writer.append(&LogRecord::new(1, Some(b), LogBody::Commit)).unwrap();
    drop(writer);

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    let writer = LogWriter::open(temp_dir.path(), scan.end, options(1024 * 1024, 10)).unwrap();
    let log = LogManager::new(temp_dir.path(), writer);

    // The page already holds the first change
    let mut target = RecordingTarget::default();
    target.lsns.insert((1, 2), a.0);
    let report = Recovery::run(&scan, None, &log, &mut target).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.redone, 1);
    assert_eq!(target.applied, vec![(2, insert(1, 1), b)]);
}

#[test]
fn test_recovery_skips_nested_top_action() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let mut writer = LogWriter::open(temp_dir.path(), Lsn::ZERO, options(1024 * 1024, 10)).unwrap();

    let before = writer.append(&page_record(5, None, 2, insert(0, 9))).unwrap();
    let inside = writer.append(&page_record(5, Some(before), 3, insert(0, 8))).unwrap();
    let nta = writer
        .append(&LogRecord::new(
            5,
            Some(inside),
            LogBody::NestedTopAction {
                undo_next: Some(before),
            },
        ))
        .unwrap();
    writer.append(&page_record(5, Some(nta), 3, insert(1, 7))).unwrap();
    drop(writer);

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    let writer = LogWriter::open(temp_dir.path(), scan.end, options(1024 * 1024, 10)).unwrap();
    let log = LogManager::new(temp_dir.path(), writer);
    let mut target = RecordingTarget::default();
    let report = Recovery::run(&scan, None, &log, &mut target).unwrap();

    // The change inside the nested top action survives
    assert_eq!(report.undone, 2);
    let undone: Vec<PageOp> = target.applied[3..].iter().map(|(_, op, _)| op.clone()).collect();
    assert_eq!(
        undone,
        vec![insert(1, 7).inverse().unwrap(), insert(0, 9).inverse().unwrap()]
    );
}

#[test]
fn test_missing_checkpoint_record_is_corruption() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let mut writer = LogWriter::open(temp_dir.path(), Lsn::ZERO, options(1024 * 1024, 10)).unwrap();
    let lsn = writer.append(&LogRecord::new(1, None, LogBody::Commit)).unwrap();
    drop(writer);

    let scan = LogReader::scan(temp_dir.path(), Lsn::ZERO).unwrap();
    let writer = LogWriter::open(temp_dir.path(), scan.end, options(1024 * 1024, 10)).unwrap();
    let log = LogManager::new(temp_dir.path(), writer);
    let mut target = RecordingTarget::default();
    assert!(matches!(
        Recovery::run(&scan, Some(lsn), &log, &mut target),
        Err(VaultError::LogCorruption(_))
    ));
}
