//! Transaction Module
//!
//! Transaction bookkeeping, locking and deferred post-commit work.
//!
//! ## Responsibilities
//! - Hand out transaction ids and track every active transaction
//! - Chain each transaction's log records through `prev_lsn`
//! - Keep the in-memory undo list used by a runtime rollback
//! - Nested top actions: changes that survive a rollback of their transaction
//! - Remember pages whose rows a transaction deleted, for post-commit reclaim
//!
//! ## Log Chain
//! ```text
//! txn 7:  Page ──► Page ──► NestedTopAction ──► Page ──► Commit
//!          ▲                  │ undo_next
//!          └──────────────────┘ (the NTA's own records are skipped on undo)
//! ```

mod lock;
pub(crate) mod post_commit;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::page::PageOp;
use crate::wal::{ActiveTxn, LogBody, LogManager, LogRecord, Lsn};
use crate::{ContainerId, PageNumber, TxnId};

pub use lock::{LockError, LockGrant, LockInfo, LockManager, LockMode, LockResource};

// =============================================================================
// Transaction State
// =============================================================================

/// A logged change the transaction can still roll back
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub lsn: Lsn,
    /// Record logged before this one by the same transaction
    pub prev_lsn: Option<Lsn>,
    pub container: ContainerId,
    pub page: PageNumber,
    /// The operation as logged; its inverse is applied on rollback
    pub op: PageOp,
}

#[derive(Debug)]
struct Transaction {
    /// Started by the engine itself (container creation, reclaim, compress)
    internal: bool,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
    undo: Vec<UndoEntry>,
    /// Pages holding rows this transaction deleted
    reclaim: BTreeSet<(ContainerId, PageNumber)>,
}

/// Position in a transaction's undo list where a nested top action began
#[derive(Debug, Clone, Copy)]
pub struct NestedTopAction {
    undo_len: usize,
    undo_next: Option<Lsn>,
}

/// What is left of a transaction once it leaves the table
#[derive(Debug, Default)]
pub struct FinishedTxn {
    pub last_lsn: Option<Lsn>,
    pub reclaim: Vec<(ContainerId, PageNumber)>,
}

/// Every active transaction
///
/// ## Concurrency:
/// - `txns`: one Mutex. Appending a record and advancing the transaction's
///   `last_lsn` happen under it so the `prev_lsn` chain never forks.
/// - Lock order: container latch, then `txns`, then the log writer.
#[derive(Debug)]
pub struct TransactionTable {
    next_id: AtomicU64,
    txns: Mutex<HashMap<TxnId, Transaction>>,
}

impl TransactionTable {
    /// `next_id` comes from recovery: one past the highest id in the log
    pub fn new(next_id: TxnId) -> Self {
        Self {
            next_id: AtomicU64::new(next_id.max(1)),
            txns: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, internal: bool) -> TxnId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.txns.lock().insert(
            id,
            Transaction {
                internal,
                first_lsn: None,
                last_lsn: None,
                undo: Vec::new(),
                reclaim: BTreeSet::new(),
            },
        );
        debug!(txn = id, internal, "transaction started");
        id
    }

    pub fn next_id(&self) -> TxnId {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, txn: TxnId) -> bool {
        self.txns.lock().contains_key(&txn)
    }

    /// Unknown for ids never handed out, not active for finished ones
    pub fn require_active(&self, txn: TxnId) -> Result<()> {
        if self.is_active(txn) {
            Ok(())
        } else if txn == 0 || txn >= self.next_id() {
            Err(VaultError::UnknownTransaction(txn))
        } else {
            Err(VaultError::TransactionNotActive(txn))
        }
    }

    /// Number of active transactions, optionally excluding internal ones
    pub fn active_count(&self, include_internal: bool) -> usize {
        self.txns
            .lock()
            .values()
            .filter(|t| include_internal || !t.internal)
            .count()
    }

    /// Transactions that have logged something, for the checkpoint record
    pub fn active_snapshot(&self) -> Vec<ActiveTxn> {
        let txns = self.txns.lock();
        let mut active: Vec<ActiveTxn> = txns
            .iter()
            .filter_map(|(id, t)| {
                Some(ActiveTxn {
                    txn: *id,
                    first_lsn: t.first_lsn?,
                    last_lsn: t.last_lsn?,
                })
            })
            .collect();
        active.sort_by_key(|a| a.txn);
        active
    }

    /// Append a record for `txn`, chained to its previous one
    fn append(
        &self,
        log: &LogManager,
        txn: TxnId,
        body: LogBody,
        undo: Option<(ContainerId, PageNumber, &PageOp)>,
    ) -> Result<Lsn> {
        let mut txns = self.txns.lock();
        let state = txns
            .get_mut(&txn)
            .ok_or(VaultError::TransactionNotActive(txn))?;
        let prev_lsn = state.last_lsn;
        let lsn = log.append(&LogRecord::new(txn, prev_lsn, body))?;
        state.first_lsn.get_or_insert(lsn);
        state.last_lsn = Some(lsn);
        if let Some((container, page, op)) = undo {
            state.undo.push(UndoEntry {
                lsn,
                prev_lsn,
                container,
                page,
                op: op.clone(),
            });
        }
        Ok(lsn)
    }

    fn note_reclaim(&self, txn: TxnId, container: ContainerId, page: PageNumber) {
        if let Some(state) = self.txns.lock().get_mut(&txn) {
            state.reclaim.insert((container, page));
        }
    }

    /// Take the undo list for a rollback, newest entry last
    pub fn take_undo(&self, txn: TxnId) -> Result<Vec<UndoEntry>> {
        let mut txns = self.txns.lock();
        let state = txns
            .get_mut(&txn)
            .ok_or(VaultError::TransactionNotActive(txn))?;
        Ok(std::mem::take(&mut state.undo))
    }

    pub fn last_lsn(&self, txn: TxnId) -> Option<Lsn> {
        self.txns.lock().get(&txn).and_then(|t| t.last_lsn)
    }

    /// Drop a finished transaction
    pub fn finish(&self, txn: TxnId) -> Option<FinishedTxn> {
        self.txns.lock().remove(&txn).map(|t| FinishedTxn {
            last_lsn: t.last_lsn,
            reclaim: t.reclaim.into_iter().collect(),
        })
    }
}

// =============================================================================
// Transaction Logger
// =============================================================================

/// Logs page changes on behalf of one transaction
#[derive(Clone, Copy)]
pub struct TxnLogger<'a> {
    log: &'a LogManager,
    txns: &'a TransactionTable,
    txn: TxnId,
}

impl<'a> TxnLogger<'a> {
    pub fn new(log: &'a LogManager, txns: &'a TransactionTable, txn: TxnId) -> Self {
        Self { log, txns, txn }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn log(&self) -> &'a LogManager {
        self.log
    }

    /// Log a page change before it is applied
    pub fn log_page_op(&self, container: ContainerId, page: PageNumber, op: &PageOp) -> Result<Lsn> {
        let undo = op.inverse().map(|_| (container, page, op));
        self.txns.append(
            self.log,
            self.txn,
            LogBody::Page {
                container,
                page,
                op: op.clone(),
            },
            undo,
        )
    }

    /// Log the compensation for `entry` before its inverse is applied
    pub fn log_compensation(&self, entry: &UndoEntry, inverse: &PageOp) -> Result<Lsn> {
        self.txns.append(
            self.log,
            self.txn,
            LogBody::Compensation {
                container: entry.container,
                page: entry.page,
                op: inverse.clone(),
                undo_next: entry.prev_lsn,
            },
            None,
        )
    }

    /// Mark where a nested top action starts
    pub fn begin_nested(&self) -> NestedTopAction {
        let txns = self.txns.txns.lock();
        let state = txns.get(&self.txn);
        NestedTopAction {
            undo_len: state.map_or(0, |t| t.undo.len()),
            undo_next: state.and_then(|t| t.last_lsn),
        }
    }

    /// Close a nested top action; its changes no longer roll back with the
    /// transaction
    pub fn end_nested(&self, nta: NestedTopAction) -> Result<()> {
        self.txns.append(
            self.log,
            self.txn,
            LogBody::NestedTopAction {
                undo_next: nta.undo_next,
            },
            None,
        )?;
        if let Some(state) = self.txns.txns.lock().get_mut(&self.txn) {
            state.undo.truncate(nta.undo_len);
        }
        Ok(())
    }

    /// Queue `page` for reclaim once the transaction commits
    pub fn note_reclaim(&self, container: ContainerId, page: PageNumber) {
        self.txns.note_reclaim(self.txn, container, page);
    }

    /// Log the commit record; None for a transaction that logged nothing
    pub fn log_commit(&self) -> Result<Option<Lsn>> {
        if self.txns.last_lsn(self.txn).is_none() {
            return Ok(None);
        }
        self.txns
            .append(self.log, self.txn, LogBody::Commit, None)
            .map(Some)
    }

    /// Log the abort record once every change has been compensated
    pub fn log_abort(&self) -> Result<()> {
        if self.txns.last_lsn(self.txn).is_some() {
            self.txns.append(self.log, self.txn, LogBody::Abort, None)?;
        }
        Ok(())
    }
}
