//! Crash Recovery
//!
//! Repeats history from the last checkpoint, then rolls back every
//! transaction that has neither a commit nor an abort record.
//!
//! 1. Analysis: walk the scanned records and rebuild the set of unfinished
//!    transactions with their last LSN.
//! 2. Redo: from the checkpoint's redo LSN, apply every page change whose LSN
//!    is newer than the page's own LSN (older ones are already on the page).
//! 3. Undo: walk the losers' records newest first. Each undone change writes a
//!    compensation record pointing past it, so a crash during undo never
//!    undoes the same change twice.

use std::collections::{BinaryHeap, HashMap};

use tracing::{debug, info, warn};

use super::{LogBody, LogManager, LogRecord, LogScan, Lsn};
use crate::error::{Result, VaultError};
use crate::page::PageOp;
use crate::{ContainerId, PageNumber, TxnId};

/// Where recovery reads page LSNs and applies operations
pub trait RecoveryTarget {
    /// LSN stamped on a page (0 for a page that was never written)
    fn page_lsn(&mut self, container: ContainerId, page: PageNumber) -> Result<u64>;

    /// Apply `op` to a page and stamp it with `lsn`
    fn apply(&mut self, container: ContainerId, page: PageNumber, op: &PageOp, lsn: Lsn) -> Result<()>;
}

/// Outcome of a recovery pass
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Records read from the log
    pub records_scanned: usize,

    /// Page changes applied during redo
    pub redone: usize,

    /// Page changes already present on their page
    pub skipped: usize,

    /// Page changes rolled back
    pub undone: usize,

    /// Transactions rolled back
    pub losers: Vec<TxnId>,

    /// Next unused transaction id
    pub next_txn: TxnId,

    /// Bytes of torn tail removed from the log
    pub truncated_bytes: u64,
}

/// Redo/undo driver
pub struct Recovery;

impl Recovery {
    /// Recover from `scan`, which must start at or before both the
    /// checkpoint's redo LSN and the first record of every transaction the
    /// checkpoint saw as active.
    pub fn run(
        scan: &LogScan,
        checkpoint: Option<Lsn>,
        log: &LogManager,
        target: &mut dyn RecoveryTarget,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            records_scanned: scan.records.len(),
            truncated_bytes: scan.truncated_bytes,
            next_txn: 1,
            ..Default::default()
        };

        // Step 1: Analysis
        let mut redo_from = Lsn::ZERO;
        let mut last_lsn: HashMap<TxnId, Lsn> = HashMap::new();
        let mut max_txn: TxnId = 0;
        let mut found_checkpoint = checkpoint.is_none();

        for (lsn, record) in &scan.records {
            max_txn = max_txn.max(record.txn);
            match &record.body {
                LogBody::Page { .. }
                | LogBody::Compensation { .. }
                | LogBody::NestedTopAction { .. } => {
                    last_lsn.insert(record.txn, *lsn);
                }
                LogBody::Commit | LogBody::Abort => {
                    last_lsn.remove(&record.txn);
                }
                LogBody::Checkpoint {
                    redo_lsn, next_txn, ..
                } if Some(*lsn) == checkpoint => {
                    found_checkpoint = true;
                    redo_from = *redo_lsn;
                    report.next_txn = report.next_txn.max(*next_txn);
                }
                LogBody::EncryptionBegin { epoch } | LogBody::EncryptionSwitch { epoch } => {
                    debug!(%lsn, epoch, "encryption marker in log");
                }
                _ => {}
            }
        }
        if !found_checkpoint {
            return Err(VaultError::LogCorruption(format!(
                "checkpoint record {} not found in the log",
                checkpoint.unwrap_or_default()
            )));
        }
        report.next_txn = report.next_txn.max(max_txn + 1);

        // Step 2: Redo
        for (lsn, record) in &scan.records {
            if *lsn < redo_from {
                continue;
            }
            let Some((container, page, op)) = record.page_change() else {
                continue;
            };
            let page_lsn = target.page_lsn(container, page).map_err(|e| inconsistent(*lsn, e))?;
            if page_lsn >= lsn.0 {
                report.skipped += 1;
                continue;
            }
            target
                .apply(container, page, op, *lsn)
                .map_err(|e| inconsistent(*lsn, e))?;
            report.redone += 1;
        }

        // Step 3: Undo
        let index: HashMap<Lsn, &LogRecord> = scan.records.iter().map(|(l, r)| (*l, r)).collect();
        let mut heap: BinaryHeap<(Lsn, TxnId)> = last_lsn.iter().map(|(t, l)| (*l, *t)).collect();
        report.losers = last_lsn.keys().copied().collect();
        report.losers.sort_unstable();
        if !report.losers.is_empty() {
            warn!(losers = ?report.losers, "rolling back unfinished transactions");
        }

        while let Some((lsn, txn)) = heap.pop() {
            let record = index.get(&lsn).ok_or_else(|| VaultError::RecoveryInconsistent {
                lsn,
                reason: format!("record of transaction {txn} is not in the scanned log"),
            })?;

            let next = match &record.body {
                LogBody::Compensation { undo_next, .. }
                | LogBody::NestedTopAction { undo_next } => *undo_next,
                LogBody::Page {
                    container,
                    page,
                    op,
                } => {
                    if let Some(inverse) = op.inverse() {
                        let prev = last_lsn.get(&txn).copied();
                        let clr = LogRecord::new(
                            txn,
                            prev,
                            LogBody::Compensation {
                                container: *container,
                                page: *page,
                                op: inverse.clone(),
                                undo_next: record.prev_lsn,
                            },
                        );
                        let clr_lsn = log.append(&clr)?;
                        target
                            .apply(*container, *page, &inverse, clr_lsn)
                            .map_err(|e| inconsistent(lsn, e))?;
                        last_lsn.insert(txn, clr_lsn);
                        report.undone += 1;
                    }
                    record.prev_lsn
                }
                _ => record.prev_lsn,
            };

            match next {
                Some(next) => heap.push((next, txn)),
                None => {
                    let prev = last_lsn.get(&txn).copied();
                    log.append(&LogRecord::new(txn, prev, LogBody::Abort))?;
                }
            }
        }
        log.sync()?;

        info!(
            scanned = report.records_scanned,
            redone = report.redone,
            skipped = report.skipped,
            undone = report.undone,
            losers = report.losers.len(),
            "recovery complete"
        );
        Ok(report)
    }
}

fn inconsistent(lsn: Lsn, err: VaultError) -> VaultError {
    match err {
        VaultError::Io(_) | VaultError::RecoveryInconsistent { .. } => err,
        other => VaultError::RecoveryInconsistent {
            lsn,
            reason: other.to_string(),
        },
    }
}
