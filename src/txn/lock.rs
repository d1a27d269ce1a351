//! Lock Manager
//!
//! Hierarchical locks on containers, rows and container allocation state.
//!
//! ## Modes
//! ```text
//!        IS   IX   S    X
//!   IS   ok   ok   ok   -
//!   IX   ok   ok   -    -
//!   S    ok   -    ok   -
//!   X    -    -    -    -
//! ```
//! A transaction may hold several modes on one resource. Requests are granted
//! in arrival order: a new request also waits behind earlier waiters it
//! conflicts with, so an exclusive request is never starved by a stream of
//! shared ones.
//!
//! Waiting is bounded by a timeout (zero means "try once"). Before every wait
//! the waits-for graph is checked; a requester that would close a cycle is
//! refused with a deadlock error and the others keep waiting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::VaultError;
use crate::{ContainerId, RowId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    const ALL: [LockMode; 4] = [
        LockMode::IntentShared,
        LockMode::IntentExclusive,
        LockMode::Shared,
        LockMode::Exclusive,
    ];

    fn bit(self) -> u8 {
        match self {
            LockMode::IntentShared => 0b0001,
            LockMode::IntentExclusive => 0b0010,
            LockMode::Shared => 0b0100,
            LockMode::Exclusive => 0b1000,
        }
    }

    pub fn is_compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentShared, IntentShared)
                | (IntentShared, IntentExclusive)
                | (IntentShared, Shared)
                | (IntentExclusive, IntentShared)
                | (IntentExclusive, IntentExclusive)
                | (Shared, IntentShared)
                | (Shared, Shared)
        )
    }

    /// Whether holding `self` already implies `requested`
    fn covers(self, requested: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(requested, Shared | IntentShared),
            IntentExclusive => matches!(requested, IntentExclusive | IntentShared),
            IntentShared => requested == IntentShared,
        }
    }
}

/// Something that can be locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    Container(ContainerId),
    Row(RowId),
    /// A container's allocation state (freeing pages)
    Allocation(ContainerId),
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Container(id) => write!(f, "container {id}"),
            LockResource::Row(row) => write!(f, "row {row}"),
            LockResource::Allocation(id) => write!(f, "allocation of container {id}"),
        }
    }
}

/// Outcome of a successful lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// Newly granted
    Granted,
    /// Already implied by a lock the transaction holds
    AlreadyHeld,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    Timeout { txn: TxnId, resource: LockResource },
    Deadlock { txn: TxnId },
}

impl From<LockError> for VaultError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { txn, resource } => VaultError::LockTimeout {
                txn,
                resource: resource.to_string(),
            },
            LockError::Deadlock { txn } => VaultError::Deadlock { txn },
        }
    }
}

/// One entry of the lock table snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub txn: TxnId,
    pub resource: LockResource,
    pub mode: LockMode,
    pub granted: bool,
}

#[derive(Debug, Default)]
struct LockQueue {
    /// Granted modes per transaction (bit set)
    held: HashMap<TxnId, u8>,
    /// Waiting requests in arrival order
    waiting: VecDeque<(TxnId, LockMode)>,
}

impl LockQueue {
    /// Transactions whose granted locks conflict with `mode`
    fn conflicting_holders(&self, txn: TxnId, mode: LockMode) -> Vec<TxnId> {
        self.held
            .iter()
            .filter(|(holder, _)| **holder != txn)
            .filter(|(_, bits)| {
                LockMode::ALL
                    .iter()
                    .any(|m| *bits & m.bit() != 0 && !m.is_compatible(mode))
            })
            .map(|(holder, _)| *holder)
            .collect()
    }

    /// Earlier waiters of other transactions whose request conflicts with `mode`
    fn conflicting_waiters_ahead(&self, txn: TxnId, mode: LockMode) -> Vec<TxnId> {
        let mut ahead = Vec::new();
        for (waiter, wanted) in &self.waiting {
            if *waiter == txn {
                break;
            }
            if !wanted.is_compatible(mode) {
                ahead.push(*waiter);
            }
        }
        ahead
    }

    /// Who `txn` has to wait for. Lock upgrades skip the queue.
    fn blockers(&self, txn: TxnId, mode: LockMode) -> Vec<TxnId> {
        let mut blockers = self.conflicting_holders(txn, mode);
        if !self.held.contains_key(&txn) {
            blockers.extend(self.conflicting_waiters_ahead(txn, mode));
        }
        blockers
    }

    fn covers(&self, txn: TxnId, mode: LockMode) -> bool {
        self.held.get(&txn).is_some_and(|bits| {
            LockMode::ALL
                .iter()
                .any(|m| *bits & m.bit() != 0 && m.covers(mode))
        })
    }

    fn is_empty(&self) -> bool {
        self.held.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    queues: HashMap<LockResource, LockQueue>,
    /// Resources each transaction holds something on
    owned: HashMap<TxnId, HashSet<LockResource>>,
    /// Waits-for edges of currently waiting transactions
    waits_for: HashMap<TxnId, Vec<TxnId>>,
}

impl LockTable {
    fn grant(&mut self, txn: TxnId, resource: LockResource, mode: LockMode) {
        let queue = self.queues.entry(resource).or_default();
        *queue.held.entry(txn).or_insert(0) |= mode.bit();
        self.owned.entry(txn).or_default().insert(resource);
    }

    fn remove_waiter(&mut self, txn: TxnId, resource: LockResource) {
        self.waits_for.remove(&txn);
        if let Some(queue) = self.queues.get_mut(&resource) {
            if let Some(pos) = queue.waiting.iter().position(|(t, _)| *t == txn) {
                queue.waiting.remove(pos);
            }
            if queue.is_empty() {
                self.queues.remove(&resource);
            }
        }
    }

    /// Depth-first search for a path from `from` back to `target`
    fn reaches(&self, from: TxnId, target: TxnId, visited: &mut HashSet<TxnId>) -> bool {
        if !visited.insert(from) {
            return false;
        }
        if let Some(next) = self.waits_for.get(&from) {
            for txn in next {
                if *txn == target || self.reaches(*txn, target, visited) {
                    return true;
                }
            }
        }
        false
    }
}

/// Grants and releases locks for transactions
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `mode` on `resource`, waiting at most `timeout`
    pub fn lock(
        &self,
        txn: TxnId,
        resource: LockResource,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGrant, LockError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();

        let queue = table.queues.entry(resource).or_default();
        if queue.covers(txn, mode) {
            return Ok(LockGrant::AlreadyHeld);
        }
        if queue.blockers(txn, mode).is_empty() {
            table.grant(txn, resource, mode);
            return Ok(LockGrant::Granted);
        }
        if timeout.is_zero() {
            if table.queues.get(&resource).is_some_and(LockQueue::is_empty) {
                table.queues.remove(&resource);
            }
            return Err(LockError::Timeout { txn, resource });
        }

        table
            .queues
            .entry(resource)
            .or_default()
            .waiting
            .push_back((txn, mode));
        debug!(txn, %resource, ?mode, "waiting for lock");

        loop {
            let blockers = table
                .queues
                .get(&resource)
                .map(|q| q.blockers(txn, mode))
                .unwrap_or_default();
            if blockers.is_empty() {
                table.remove_waiter(txn, resource);
                table.grant(txn, resource, mode);
                // Waiters queued behind us may now be grantable too
                self.released.notify_all();
                return Ok(LockGrant::Granted);
            }

            table.waits_for.insert(txn, blockers);
            if table.reaches(txn, txn, &mut HashSet::new()) {
                warn!(txn, %resource, "deadlock detected, requester is the victim");
                table.remove_waiter(txn, resource);
                self.released.notify_all();
                return Err(LockError::Deadlock { txn });
            }

            if self.released.wait_until(&mut table, deadline).timed_out() {
                let still_blocked = table
                    .queues
                    .get(&resource)
                    .map(|q| !q.blockers(txn, mode).is_empty())
                    .unwrap_or(false);
                if still_blocked {
                    warn!(txn, %resource, ?timeout, "lock wait timed out");
                    table.remove_waiter(txn, resource);
                    self.released.notify_all();
                    return Err(LockError::Timeout { txn, resource });
                }
            }
        }
    }

    /// Drop one mode on one resource (instant-duration locks)
    pub fn release(&self, txn: TxnId, resource: LockResource, mode: LockMode) {
        let mut table = self.table.lock();
        let mut now_empty = false;
        if let Some(queue) = table.queues.get_mut(&resource) {
            if let Some(bits) = queue.held.get_mut(&txn) {
                *bits &= !mode.bit();
                if *bits == 0 {
                    queue.held.remove(&txn);
                    now_empty = true;
                }
            }
            if queue.is_empty() {
                table.queues.remove(&resource);
            }
        }
        if now_empty {
            if let Some(owned) = table.owned.get_mut(&txn) {
                owned.remove(&resource);
                if owned.is_empty() {
                    table.owned.remove(&txn);
                }
            }
        }
        self.released.notify_all();
    }

    /// Release everything `txn` holds or waits for
    pub fn release_all(&self, txn: TxnId) {
        let mut table = self.table.lock();
        table.waits_for.remove(&txn);
        let owned = table.owned.remove(&txn).unwrap_or_default();
        for resource in owned {
            if let Some(queue) = table.queues.get_mut(&resource) {
                queue.held.remove(&txn);
                if queue.is_empty() {
                    table.queues.remove(&resource);
                }
            }
        }
        self.released.notify_all();
    }

    /// Whether `txn` holds anything at all
    pub fn holds_any(&self, txn: TxnId) -> bool {
        self.table.lock().owned.contains_key(&txn)
    }

    /// Snapshot of every granted and waiting lock
    pub fn lock_table(&self) -> Vec<LockInfo> {
        let table = self.table.lock();
        let mut out = Vec::new();
        for (resource, queue) in &table.queues {
            for (txn, bits) in &queue.held {
                for mode in LockMode::ALL {
                    if bits & mode.bit() != 0 {
                        out.push(LockInfo {
                            txn: *txn,
                            resource: *resource,
                            mode,
                            granted: true,
                        });
                    }
                }
            }
            for (txn, mode) in &queue.waiting {
                out.push(LockInfo {
                    txn: *txn,
                    resource: *resource,
                    mode: *mode,
                    granted: false,
                });
            }
        }
        out.sort_by_key(|info| (info.txn, !info.granted));
        out
    }
}
