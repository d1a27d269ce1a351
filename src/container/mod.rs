//! Container Module
//!
//! The allocation manager: one container file, its extents and a page cache.
//!
//! ## Responsibilities
//! - Cache pages and apply logged operations to them (log first, then page)
//! - Allocate pages: free slots first, then released or unused slots of the
//!   last extent, then a new extent
//! - Free pages, release trailing free pages to the file system
//! - Keep the unfilled hint of each page in step with its free space
//! - Space reporting and counter consistency checks
//! - Row placement with overflow pieces and long columns (`overflow`)
//!
//! ## Container Geometry
//! ```text
//! page:  0      1        2 .. c    c+1     c+2 ..
//!       ┌──────┬────────┬────────┬───────┬────────┐
//!       │Alloc │Control │ Data   │ Alloc │ Data   │ ...
//!       │ ext 0│ page   │ pages  │ ext 1 │ pages  │
//!       └──────┴────────┴────────┴───────┴────────┘
//! extent e: allocation page at e*(c+1), slot s is page e*(c+1)+1+s
//! ```
//!
//! ## Concurrency:
//! - One latch (`Mutex<ContainerState>`) per container, held only for the
//!   duration of a physical operation. Never wait for a lock while holding it.

mod overflow;

pub(crate) use overflow::outgoing_refs;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::encryption::PageCipher;
use crate::error::{Result, VaultError};
use crate::page::{
    AllocPage, Page, PageOp, PageSize, Record, SlotState, StoredPage, DATA_HEADER_SIZE, MAX_ROW_ID,
};
use crate::store::ContainerFile;
use crate::txn::{TxnLogger, UndoEntry};
use crate::wal::{LogManager, Lsn};
use crate::{ContainerId, PageNumber};

/// Allocation page of the first extent
pub const FIRST_ALLOC_PAGE: PageNumber = 0;

/// Page carrying the reserved control row; never freed
pub const CONTROL_PAGE: PageNumber = 1;

// =============================================================================
// Public Types
// =============================================================================

/// A row: an ordered list of opaque column values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Vec<u8>>,
}

impl Row {
    pub fn new(columns: Vec<Vec<u8>>) -> Self {
        Self { columns }
    }

    /// Total bytes across all columns
    pub fn data_len(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }
}

/// Page usage of one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    /// Pages in use, including unfilled ones (allocation pages excluded)
    pub allocated: u64,
    /// Pages in the file but not in use
    pub free: u64,
    /// In-use pages with at least half their space left
    pub unfilled: u64,
    /// Pages handed back to the file system
    pub released: u64,
    /// Allocation extents (one allocation page each)
    pub extents: u64,
    pub page_size: usize,
    /// Bytes a truncate could return if every free page were at the end
    pub estimated_savings: u64,
}

// =============================================================================
// Container
// =============================================================================

/// One open container
pub struct Container {
    id: ContainerId,
    name: String,
    page_size: PageSize,
    state: Mutex<ContainerState>,
}

impl Container {
    pub(crate) fn new(name: &str, state: ContainerState) -> Self {
        Self {
            id: state.id,
            name: name.to_string(),
            page_size: state.size,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Take the container latch
    pub(crate) fn latch(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock()
    }
}

struct CachedPage {
    page: Page,
    dirty: bool,
}

/// Everything behind a container's latch
pub(crate) struct ContainerState {
    id: ContainerId,
    size: PageSize,
    capacity: u32,
    max_pages: u64,
    file: ContainerFile,
    cipher: Option<Arc<PageCipher>>,
    cache: HashMap<PageNumber, CachedPage>,
    /// Pages the cache holds before clean data pages are evicted
    cache_limit: usize,
    /// Page that took the last head piece
    insert_hint: Option<PageNumber>,
}

fn corrupt(container: ContainerId, page: PageNumber, reason: impl Into<String>) -> VaultError {
    VaultError::PageCorrupt {
        container,
        page,
        reason: reason.into(),
    }
}

impl ContainerState {
    pub(crate) fn new(
        file: ContainerFile,
        capacity: u32,
        max_pages: u64,
        cache_limit: usize,
        cipher: Option<Arc<PageCipher>>,
    ) -> Self {
        Self {
            id: file.id(),
            size: file.page_size(),
            capacity,
            max_pages,
            file,
            cipher,
            cache: HashMap::new(),
            cache_limit: cache_limit.max(1),
            insert_hint: None,
        }
    }

    pub(crate) fn id(&self) -> ContainerId {
        self.id
    }

    pub(crate) fn page_size(&self) -> PageSize {
        self.size
    }

    // -------------------------------------------------------------------------
    // Page Cache
    // -------------------------------------------------------------------------

    fn load(&mut self, page: PageNumber) -> Result<&mut CachedPage> {
        let id = self.id;
        if !self.cache.contains_key(&page) {
            let buffer = self.file.read_page(page, self.cipher.as_deref())?;
            let loaded =
                Page::from_buffer(self.size, page, buffer).map_err(|e| corrupt(id, page, e.0))?;
            if loaded.page_number() != page {
                return Err(corrupt(
                    id,
                    page,
                    format!("frame holds page {}", loaded.page_number()),
                ));
            }
            if self.cache.len() >= self.cache_limit {
                self.evict(page);
            }
            self.cache.insert(
                page,
                CachedPage {
                    page: loaded,
                    dirty: false,
                },
            );
        }
        self.cache
            .get_mut(&page)
            .ok_or_else(|| corrupt(id, page, "page vanished from the cache"))
    }

    /// Drop clean data pages until a quarter of the cache is free. Dirty
    /// pages and allocation pages stay until the next checkpoint.
    fn evict(&mut self, keep: PageNumber) {
        let target = self.cache_limit - self.cache_limit / 4;
        let excess = (self.cache.len() + 1).saturating_sub(target);
        let victims: Vec<PageNumber> = self
            .cache
            .iter()
            .filter(|(page, cached)| {
                **page != keep && !cached.dirty && !matches!(cached.page, Page::Alloc(_))
            })
            .map(|(page, _)| *page)
            .take(excess)
            .collect();
        for page in &victims {
            self.cache.remove(page);
        }
        debug!(
            container = self.id,
            evicted = victims.len(),
            cached = self.cache.len(),
            "page cache trimmed"
        );
    }

    /// Pages currently held in the cache
    pub(crate) fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn page(&mut self, page: PageNumber) -> Result<&Page> {
        Ok(&self.load(page)?.page)
    }

    pub(crate) fn data_page(&mut self, page: PageNumber) -> Result<&StoredPage> {
        let id = self.id;
        self.page(page)?
            .as_data()
            .ok_or_else(|| corrupt(id, page, "expected a data page"))
    }

    fn alloc_page(&mut self, page: PageNumber) -> Result<&AllocPage> {
        let id = self.id;
        self.page(page)?
            .as_alloc()
            .ok_or_else(|| corrupt(id, page, "expected an allocation page"))
    }

    pub(crate) fn page_lsn(&mut self, page: PageNumber) -> Result<u64> {
        Ok(self.page(page)?.lsn())
    }

    /// Log `op` for the transaction, then apply it
    ///
    /// The operation is tried on a copy first, so a change that cannot be
    /// applied is never logged.
    pub(crate) fn apply_logged(&mut self, log: &TxnLogger, page: PageNumber, op: PageOp) -> Result<Lsn> {
        let id = self.id;
        // A page about to be formatted is not read back from the file
        if matches!(op, PageOp::FormatData { .. } | PageOp::FormatAlloc { .. })
            && !self.cache.contains_key(&page)
        {
            self.cache.insert(
                page,
                CachedPage {
                    page: Page::Fresh {
                        page_number: page,
                        size: self.size,
                    },
                    dirty: false,
                },
            );
        }
        let cached = self.load(page)?;
        let mut staged = cached.page.clone();
        staged.apply(&op, 0).map_err(|e| corrupt(id, page, e.0))?;
        let lsn = log.log_page_op(id, page, &op)?;
        staged.set_lsn(lsn.0);
        cached.page = staged;
        cached.dirty = true;
        Ok(lsn)
    }

    /// Roll back one change of a transaction
    pub(crate) fn compensate(&mut self, log: &TxnLogger, entry: &UndoEntry) -> Result<()> {
        let Some(inverse) = entry.op.inverse() else {
            return Ok(());
        };
        let id = self.id;
        let cached = self.load(entry.page)?;
        let mut staged = cached.page.clone();
        staged
            .apply(&inverse, 0)
            .map_err(|e| corrupt(id, entry.page, format!("cannot undo {}: {}", entry.lsn, e.0)))?;
        let lsn = log.log_compensation(entry, &inverse)?;
        staged.set_lsn(lsn.0);
        cached.page = staged;
        cached.dirty = true;
        self.refresh_fill_hint(entry.page)
    }

    /// Apply a logged operation during recovery
    pub(crate) fn redo(&mut self, page: PageNumber, op: &PageOp, lsn: Lsn) -> Result<()> {
        let id = self.id;
        let cached = self.load(page)?;
        cached
            .page
            .apply(op, lsn.0)
            .map_err(|e| corrupt(id, page, e.0))?;
        cached.dirty = true;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Geometry
    // -------------------------------------------------------------------------

    fn extent_stride(&self) -> u64 {
        self.capacity as u64 + 1
    }

    /// Allocation page and slot managing a data page (None for allocation pages)
    fn slot_of(&self, page: PageNumber) -> Option<(PageNumber, u32)> {
        let stride = self.extent_stride();
        let alloc = page / stride * stride;
        if page == alloc {
            None
        } else {
            Some((alloc, (page - alloc - 1) as u32))
        }
    }

    /// Allocation pages in chain order
    pub(crate) fn extents(&mut self) -> Result<Vec<PageNumber>> {
        let mut extents = Vec::new();
        let mut next = Some(FIRST_ALLOC_PAGE);
        while let Some(alloc) = next {
            if extents.len() as u64 > self.max_pages / self.extent_stride() + 1 {
                return Err(corrupt(self.id, alloc, "extent chain does not terminate"));
            }
            next = self.alloc_page(alloc)?.next_extent();
            extents.push(alloc);
        }
        Ok(extents)
    }

    /// Allocation state of a data page (None for allocation pages)
    pub(crate) fn slot_state(&mut self, page: PageNumber) -> Result<Option<SlotState>> {
        let Some((alloc, slot)) = self.slot_of(page) else {
            return Ok(None);
        };
        if self.extents()?.contains(&alloc) {
            Ok(Some(self.alloc_page(alloc)?.state(slot)))
        } else {
            Ok(Some(SlotState::Unused))
        }
    }

    /// Data pages in use, ascending
    pub(crate) fn pages_in_use(&mut self) -> Result<Vec<PageNumber>> {
        let mut pages = Vec::new();
        for alloc in self.extents()? {
            let extent = self.alloc_page(alloc)?;
            for slot in 0..extent.capacity() {
                if extent.state(slot).is_in_use() {
                    pages.push(extent.page_for_slot(slot));
                }
            }
        }
        Ok(pages)
    }

    fn check_limit(&self, page: PageNumber) -> Result<()> {
        if page >= self.max_pages {
            return Err(VaultError::SpaceExhausted {
                container: self.id,
                reason: format!("page {page} would exceed the limit of {} pages", self.max_pages),
            });
        }
        Ok(())
    }

    fn set_slot_state(&mut self, log: &TxnLogger, page: PageNumber, after: SlotState) -> Result<()> {
        let (alloc, slot) = self
            .slot_of(page)
            .ok_or_else(|| corrupt(self.id, page, "allocation pages have no slot"))?;
        let before = self.alloc_page(alloc)?.state(slot);
        if before != after {
            self.apply_logged(log, alloc, PageOp::SetSlotState { slot, before, after })?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Formatting
    // -------------------------------------------------------------------------

    /// Whether the first extent and the control page exist
    pub(crate) fn is_formatted(&mut self) -> Result<bool> {
        Ok(match self.page(FIRST_ALLOC_PAGE)? {
            Page::Alloc(extent) => extent.state(0) != SlotState::Unused,
            _ => false,
        })
    }

    /// Lay out a new container: first extent, control page, control row
    pub(crate) fn format_new(&mut self, log: &TxnLogger) -> Result<()> {
        self.check_limit(CONTROL_PAGE)?;
        self.apply_logged(
            log,
            FIRST_ALLOC_PAGE,
            PageOp::FormatAlloc {
                first_page: CONTROL_PAGE,
                capacity: self.capacity,
            },
        )?;
        self.set_slot_state(log, CONTROL_PAGE, SlotState::Allocated)?;
        self.apply_logged(
            log,
            CONTROL_PAGE,
            PageOp::FormatData {
                next_row_id: 0,
                control: true,
            },
        )?;
        self.apply_logged(
            log,
            CONTROL_PAGE,
            PageOp::InsertRecord {
                row_id: 0,
                bytes: Record::control().encode(0),
            },
        )?;
        info!(container = self.id, capacity = self.capacity, "container formatted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate and format a data page
    ///
    /// Runs as a nested top action: the page stays allocated even if the
    /// calling transaction rolls back.
    pub(crate) fn allocate_page(&mut self, log: &TxnLogger) -> Result<PageNumber> {
        let nta = log.begin_nested();
        let (page, next_row_id) = self.allocate_slot(log)?;
        self.apply_logged(
            log,
            page,
            PageOp::FormatData {
                next_row_id,
                control: false,
            },
        )?;
        log.end_nested(nta)?;
        debug!(container = self.id, page, next_row_id, "page allocated");
        Ok(page)
    }

    /// Pick a slot and mark it in use; returns the page and the row id its
    /// data page starts from
    fn allocate_slot(&mut self, log: &TxnLogger) -> Result<(PageNumber, u16)> {
        let extents = self.extents()?;

        // Step 1: lowest free slot of any extent
        for &alloc in &extents {
            let extent = self.alloc_page(alloc)?;
            if let Some(slot) = extent.first_in_state(SlotState::Free) {
                let page = extent.page_for_slot(slot);
                let next_row_id = match self.page(page)? {
                    Page::Data(data) if data.next_row_id() < MAX_ROW_ID => data.next_row_id(),
                    _ => 0,
                };
                self.set_slot_state(log, page, SlotState::Unfilled)?;
                return Ok((page, next_row_id));
            }
        }

        // Step 2: released, then unused slots of the last extent
        let last = *extents
            .last()
            .ok_or_else(|| corrupt(self.id, FIRST_ALLOC_PAGE, "container has no extent"))?;
        let extent = self.alloc_page(last)?;
        let candidate = extent
            .first_in_state(SlotState::Released)
            .or_else(|| extent.first_in_state(SlotState::Unused))
            .map(|slot| extent.page_for_slot(slot));
        if let Some(page) = candidate {
            self.check_limit(page)?;
            self.set_slot_state(log, page, SlotState::Unfilled)?;
            return Ok((page, 0));
        }

        // Step 3: chain a new extent
        let alloc = last + self.extent_stride();
        let first = alloc + 1;
        self.check_limit(first)?;
        self.apply_logged(
            log,
            alloc,
            PageOp::FormatAlloc {
                first_page: first,
                capacity: self.capacity,
            },
        )?;
        self.apply_logged(log, last, PageOp::ChainExtent { next: alloc })?;
        self.set_slot_state(log, first, SlotState::Unfilled)?;
        info!(container = self.id, extent = alloc, "container grew by one extent");
        Ok((first, 0))
    }

    /// Mark an empty page free. The caller holds the container's allocation
    /// lock. Returns false for the control page and pages not in use.
    pub(crate) fn free_page(&mut self, log: &TxnLogger, page: PageNumber) -> Result<bool> {
        if page == CONTROL_PAGE {
            return Ok(false);
        }
        match self.slot_state(page)? {
            Some(state) if state.is_in_use() => {}
            _ => return Ok(false),
        }
        if !self.data_page(page)?.has_no_rows() {
            return Err(corrupt(self.id, page, "cannot free a page that still holds rows"));
        }
        self.set_slot_state(log, page, SlotState::Free)?;
        if self.insert_hint == Some(page) {
            self.insert_hint = None;
        }
        debug!(container = self.id, page, "page freed");
        Ok(true)
    }

    /// Hand the free pages at the end of the container back to the file
    /// system. Walks extents from the last one: its trailing free slots
    /// become released, and an extent left with no page in the file is cut
    /// from the chain together with its allocation page. Returns every page
    /// that leaves the file.
    pub(crate) fn release_trailing_free(&mut self, log: &TxnLogger) -> Result<Vec<PageNumber>> {
        let extents = self.extents()?;
        let mut gone = Vec::new();
        for (index, &alloc) in extents.iter().enumerate().rev() {
            let extent = self.alloc_page(alloc)?;
            let pages: Vec<PageNumber> = extent
                .trailing_free_slots()
                .into_iter()
                .map(|slot| extent.page_for_slot(slot))
                .collect();
            for &page in &pages {
                self.set_slot_state(log, page, SlotState::Released)?;
            }
            gone.extend(pages);

            // The first extent holds the control page and always stays
            if index == 0 || !self.alloc_page(alloc)?.is_empty() {
                break;
            }
            let previous = extents[index - 1];
            self.apply_logged(log, previous, PageOp::UnchainExtent { next: alloc })?;
            gone.push(alloc);
            info!(container = self.id, extent = alloc, "empty extent dropped");
        }
        Ok(gone)
    }

    /// Update a page's unfilled hint from its free space. Not logged: the
    /// hint only steers placement.
    pub(crate) fn refresh_fill_hint(&mut self, page: PageNumber) -> Result<()> {
        let Some((alloc, slot)) = self.slot_of(page) else {
            return Ok(());
        };
        let usable = self.size.body_len() - DATA_HEADER_SIZE;
        let unfilled = match self.page(page)? {
            Page::Data(data) => data.free_space() * 2 >= usable,
            _ => return Ok(()),
        };
        let cached = self.load(alloc)?;
        let Some(extent) = cached.page.as_alloc_mut() else {
            return Ok(());
        };
        let current = extent.state(slot);
        if !current.is_in_use() {
            return Ok(());
        }
        let wanted = if unfilled {
            SlotState::Unfilled
        } else {
            SlotState::Allocated
        };
        if current != wanted {
            let before = extent.counts();
            extent.set_state(slot, wanted);
            let after = extent.counts();
            // Both states count as in use; only the split between them moves
            debug_assert_eq!(
                before.allocated + before.unfilled,
                after.allocated + after.unfilled
            );
            debug_assert!(extent.check_counts());
            cached.dirty = true;
            debug!(container = self.id, page, from = ?current, to = ?wanted, "fill hint changed");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    pub(crate) fn space_info(&mut self) -> Result<SpaceInfo> {
        let mut info = SpaceInfo {
            page_size: self.size.bytes(),
            ..SpaceInfo::default()
        };
        for alloc in self.extents()? {
            let counts = self.alloc_page(alloc)?.counts();
            info.allocated += counts.in_use() as u64;
            info.free += counts.free as u64;
            info.unfilled += counts.unfilled as u64;
            info.released += counts.released as u64;
            info.extents += 1;
        }
        info.estimated_savings = info.free * info.page_size as u64;
        Ok(info)
    }

    /// Verify extent counters, in-use pages and the control row
    pub(crate) fn check_consistency(&mut self) -> Result<()> {
        let id = self.id;
        for alloc in self.extents()? {
            let extent = self.alloc_page(alloc)?;
            if !extent.check_counts() {
                return Err(corrupt(id, alloc, "extent counters disagree with slot states"));
            }
        }
        for page in self.pages_in_use()? {
            let data = self.data_page(page)?;
            data.records().map_err(|e| corrupt(id, page, e.0))?;
        }
        let control = self.data_page(CONTROL_PAGE)?;
        let has_control_row = control
            .record(0)
            .map_err(|e| corrupt(id, CONTROL_PAGE, e.0))?
            .is_some_and(|r| r.is_control());
        if !control.is_control_page() || !has_control_row {
            return Err(corrupt(id, CONTROL_PAGE, "control row is missing"));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Flushing and the File
    // -------------------------------------------------------------------------

    /// Whether `page` is part of the file as the allocation state has it
    fn is_kept(&mut self, chain: &[PageNumber], page: PageNumber) -> Result<bool> {
        match self.slot_of(page) {
            None => Ok(chain.contains(&page)),
            Some((alloc, slot)) if chain.contains(&alloc) => {
                Ok(self.alloc_page(alloc)?.state(slot) != SlotState::Released)
            }
            Some(_) => Ok(false),
        }
    }

    /// Write every dirty page, log first. Pages that left the file (released
    /// slots, dropped extents) are discarded instead of written; clean data
    /// pages leave the cache.
    pub(crate) fn flush(&mut self, log: &LogManager) -> Result<usize> {
        let mut dirty: Vec<PageNumber> = self
            .cache
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(page, _)| *page)
            .collect();
        dirty.sort_unstable();
        let chain = if dirty.is_empty() {
            Vec::new()
        } else {
            self.extents()?
        };

        let mut written = 0;
        for page in dirty {
            if !self.is_kept(&chain, page)? {
                self.cache.remove(&page);
                continue;
            }
            let Some(cached) = self.cache.get(&page) else {
                continue;
            };
            log.flush_to(Lsn(cached.page.lsn()))?;
            let buffer = cached.page.to_buffer();
            self.file.write_page(page, &buffer, self.cipher.as_deref())?;
            if let Some(cached) = self.cache.get_mut(&page) {
                cached.dirty = false;
            }
            written += 1;
        }
        self.file.sync()?;
        self.cache
            .retain(|_, cached| cached.dirty || matches!(cached.page, Page::Alloc(_)));
        debug!(container = self.id, written, "container flushed");
        Ok(written)
    }

    /// Shrink the file to the last page the allocation state keeps in it
    pub(crate) fn shrink_file(&mut self) -> Result<bool> {
        let mut end = 0;
        for alloc in self.extents()? {
            let extent = self.alloc_page(alloc)?;
            end = end.max(alloc + 1);
            if let Some(slot) = extent.last_slot_in_file() {
                end = end.max(extent.page_for_slot(slot) + 1);
            }
        }
        let count = self.file.page_count()?;
        if count > end {
            self.file.set_page_count(end)?;
            info!(container = self.id, from = count, to = end, "container file shrunk");
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn file_page_count(&self) -> Result<u64> {
        self.file.page_count()
    }

    pub(crate) fn file_mut(&mut self) -> &mut ContainerFile {
        &mut self.file
    }

    pub(crate) fn cipher(&self) -> Option<&Arc<PageCipher>> {
        self.cipher.as_ref()
    }

    /// Swap in a rewritten file and the key it is encrypted with
    pub(crate) fn install(&mut self, file: ContainerFile, cipher: Option<Arc<PageCipher>>) {
        self.file = file;
        self.cipher = cipher;
    }
}
