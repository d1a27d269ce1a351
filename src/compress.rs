//! Online Space Reclamation
//!
//! Three phases that each run in their own internal transaction:
//!
//! ```text
//! ┌───────────┬───────────────────────────┬────────────────────────────────┐
//! │ Phase     │ Locks                     │ Effect                         │
//! ├───────────┼───────────────────────────┼────────────────────────────────┤
//! │ Purge     │ container IX, row X (try) │ removes committed deletes      │
//! │ Defragment│ container X, allocation X │ moves records forward, frees   │
//! │           │                           │ emptied pages                  │
//! │ Truncate  │ container X, allocation X │ releases trailing free pages   │
//! └───────────┴───────────────────────────┴────────────────────────────────┘
//! ```
//!
//! Row locks in purge are only tried, never waited for: a deleted record
//! whose lock is held belongs to a transaction that may still roll back, and
//! is left alone.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::container::{outgoing_refs, Container, ContainerState};
use crate::error::{Result, VaultError};
use crate::page::{Field, PageOp, PieceRef, Record};
use crate::txn::{LockError, LockManager, LockMode, LockResource, TxnLogger};
use crate::{PageNumber, RowId};

/// Which compress phases to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressOptions {
    pub purge: bool,
    pub defragment: bool,
    pub truncate: bool,
}

impl CompressOptions {
    pub fn new(purge: bool, defragment: bool, truncate: bool) -> Self {
        Self {
            purge,
            defragment,
            truncate,
        }
    }

    /// Purge, defragment and truncate
    pub fn all() -> Self {
        Self::new(true, true, true)
    }

    pub fn purge_only() -> Self {
        Self::new(true, false, false)
    }
}

/// What one phase runs against
pub(crate) struct CompressContext<'a> {
    pub container: &'a Container,
    pub locks: &'a LockManager,
    pub log: TxnLogger<'a>,
    pub lock_timeout: Duration,
}

impl CompressContext<'_> {
    fn lock(&self, resource: LockResource, mode: LockMode, timeout: Duration) -> Result<()> {
        self.locks
            .lock(self.log.txn(), resource, mode, timeout)
            .map(|_| ())
            .map_err(VaultError::from)
    }

    fn try_lock(&self, resource: LockResource, mode: LockMode) -> bool {
        match self.locks.lock(self.log.txn(), resource, mode, Duration::ZERO) {
            Ok(_) => true,
            Err(LockError::Timeout { .. }) | Err(LockError::Deadlock { .. }) => false,
        }
    }

    fn row_resource(&self, at: PieceRef) -> LockResource {
        LockResource::Row(RowId::new(self.container.id(), at.page, at.row))
    }

    /// Container X plus the allocation lock, waiting up to the lock timeout
    fn lock_exclusive(&self) -> Result<()> {
        let id = self.container.id();
        self.lock(LockResource::Container(id), LockMode::Exclusive, self.lock_timeout)?;
        self.lock(LockResource::Allocation(id), LockMode::Exclusive, self.lock_timeout)
    }
}

// =============================================================================
// Purge
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PageOutcome {
    pub purged: usize,
    pub freed: bool,
}

/// Purge the deleted records of one page whose locks can be had right away.
/// With `free_if_empty` the page is freed once nothing is left on it.
fn purge_page(ctx: &CompressContext<'_>, page: PageNumber, free_if_empty: bool) -> Result<PageOutcome> {
    let deleted = {
        let mut state = ctx.container.latch();
        match state.slot_state(page)? {
            Some(slot) if slot.is_in_use() => state.deleted_records(page)?,
            _ => return Ok(PageOutcome::default()),
        }
    };

    // No latch while locking
    let locked: Vec<PieceRef> = deleted
        .into_iter()
        .filter(|at| ctx.try_lock(ctx.row_resource(*at), LockMode::Exclusive))
        .collect();

    let mut outcome = PageOutcome::default();
    let mut state = ctx.container.latch();
    for at in locked {
        if state.purge_record(&ctx.log, at)? {
            outcome.purged += 1;
        }
    }
    if free_if_empty && state.is_empty_page(page)? {
        outcome.freed = state.free_page(&ctx.log, page)?;
    }
    Ok(outcome)
}

/// Remove committed-deleted records from every page. Never frees a page.
pub(crate) fn purge(ctx: &CompressContext<'_>) -> Result<usize> {
    let id = ctx.container.id();
    ctx.lock(LockResource::Container(id), LockMode::IntentExclusive, ctx.lock_timeout)?;

    let pages = ctx.container.latch().pages_in_use()?;
    let mut purged = 0;
    for page in pages {
        purged += purge_page(ctx, page, false)?.purged;
    }
    info!(container = id, purged, "purge phase complete");
    Ok(purged)
}

/// Post-commit reclaim of one page: purge it and free it if that empties it.
/// Gives up quietly when any lock is busy.
pub(crate) fn reclaim_page(ctx: &CompressContext<'_>, page: PageNumber) -> Result<bool> {
    let id = ctx.container.id();
    if !ctx.try_lock(LockResource::Container(id), LockMode::IntentExclusive)
        || !ctx.try_lock(LockResource::Allocation(id), LockMode::Exclusive)
    {
        debug!(container = id, page, "reclaim skipped, container busy");
        return Ok(false);
    }
    let outcome = purge_page(ctx, page, true)?;
    debug!(container = id, page, purged = outcome.purged, freed = outcome.freed, "page reclaimed");
    Ok(outcome.freed)
}

// =============================================================================
// Defragment
// =============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DefragmentStats {
    pub purged: usize,
    pub moved: usize,
    pub freed: usize,
}

/// Lowest page below the source that takes `record` as encoded there
fn find_destination(state: &mut ContainerState, candidates: &[PageNumber], record: &Record) -> Result<Option<PageNumber>> {
    for &page in candidates {
        if state.page_accepts(page, record)? {
            return Ok(Some(page));
        }
    }
    Ok(None)
}

/// Point `referrer` at `to` instead of `from`. Pointers are fixed width, so
/// the record keeps its length.
fn repoint(state: &mut ContainerState, log: &TxnLogger, referrer: PieceRef, from: PieceRef, to: PieceRef) -> Result<()> {
    let mut record = state.record_at(referrer)?;
    if record.next == Some(from) {
        record.set_next(Some(to));
    }
    for field in &mut record.fields {
        if let Field::Long { first, .. } = field {
            if *first == from {
                *first = to;
            }
        }
    }
    let before = state
        .data_page(referrer.page)?
        .record_bytes(referrer.row)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let after = record.encode(referrer.row);
    state.apply_logged(
        log,
        referrer.page,
        PageOp::ReplaceRecord {
            row_id: referrer.row,
            before,
            after,
        },
    )?;
    Ok(())
}

/// Move records from the end of the container toward the front and free the
/// pages this empties. Row ids of moved rows change.
pub(crate) fn defragment(ctx: &CompressContext<'_>) -> Result<DefragmentStats> {
    ctx.lock_exclusive()?;
    let log = &ctx.log;
    let mut stats = DefragmentStats::default();
    let mut state = ctx.container.latch();

    // Step 1: nobody else can hold a row lock now; purge every delete
    for page in state.pages_in_use()? {
        for at in state.deleted_records(page)? {
            if state.purge_record(log, at)? {
                stats.purged += 1;
            }
        }
    }

    // Step 2: who points at each piece and chunk
    let pages = state.pages_in_use()?;
    let mut referrers: HashMap<PieceRef, PieceRef> = HashMap::new();
    for &page in &pages {
        let records = state
            .data_page(page)?
            .records()
            .map_err(|e| VaultError::PageCorrupt {
                container: ctx.container.id(),
                page,
                reason: e.0,
            })?;
        for (row, record) in records {
            for target in outgoing_refs(&record) {
                referrers.insert(target, PieceRef { page, row });
            }
        }
    }

    // Step 3: walk sources from the tail, fill the lowest pages first
    for (index, &source) in pages.iter().enumerate().rev() {
        let rows: Vec<u16> = state
            .data_page(source)?
            .headers()
            .into_iter()
            .map(|(row, _)| row)
            .collect();
        for row in rows {
            let from = PieceRef { page: source, row };
            let record = state.record_at(from)?;
            if record.is_control() {
                continue;
            }
            let Some(dest) = find_destination(&mut state, &pages[..index], &record)? else {
                continue;
            };
            let to = state.insert_record_at(log, dest, &record)?;
            if let Some(referrer) = referrers.remove(&from) {
                repoint(&mut state, log, referrer, from, to)?;
            }
            for target in outgoing_refs(&record) {
                referrers.insert(target, to);
            }
            state.remove_record(log, from)?;
            stats.moved += 1;
        }
        if state.is_empty_page(source)? && state.free_page(log, source)? {
            stats.freed += 1;
        }
    }

    info!(
        container = ctx.container.id(),
        purged = stats.purged,
        moved = stats.moved,
        freed = stats.freed,
        "defragment phase complete"
    );
    Ok(stats)
}

// =============================================================================
// Truncate
// =============================================================================

/// Mark the trailing free pages released. The caller commits, checkpoints,
/// and then shrinks the file.
pub(crate) fn release_tail(ctx: &CompressContext<'_>) -> Result<Vec<PageNumber>> {
    ctx.lock_exclusive()?;
    let released = ctx.container.latch().release_trailing_free(&ctx.log)?;
    info!(
        container = ctx.container.id(),
        released = released.len(),
        "truncate phase released pages"
    );
    Ok(released)
}
