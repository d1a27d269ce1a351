//! Allocation page
//!
//! The first page of every extent. It records the state of each page slot
//! the extent manages and keeps per-state counters next to them.
//!
//! ```text
//! ┌────────────┬────────────┬──────────────┬─────────────┬──────────────────┬───────────┐
//! │ Common (24)│ first u64  │ capacity u32 │ next u64    │ counts 4 x u32   │ pad (4)   │
//! ├────────────┴────────────┴──────────────┴─────────────┴──────────────────┴───────────┤
//! │ slot state bytes (capacity)                                                         │
//! └─────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Released` slots were handed back to the file system by truncation. They
//! only ever occur at the tail of the last extent, and re-allocating them
//! extends the file page by page from its current end.

use serde::{Deserialize, Serialize};

use super::{ApplyError, PageBuffer, PageOp, PageSize, KIND_ALLOC, TRAILER_SIZE};
use crate::PageNumber;

/// Allocation page header size, including the common header
pub const ALLOC_HEADER_SIZE: usize = 64;

const FIRST_PAGE_AT: usize = 24;
const CAPACITY_AT: usize = 32;
const NEXT_EXTENT_AT: usize = 36;
const COUNTS_AT: usize = 44;

/// State of one page slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    /// Never part of the file
    Unused,
    /// In use and (nearly) full
    Allocated,
    /// Not in use, still part of the file
    Free,
    /// In use with plenty of room left
    Unfilled,
    /// Returned to the file system by truncation
    Released,
}

impl SlotState {
    fn to_byte(self) -> u8 {
        match self {
            SlotState::Unused => 0,
            SlotState::Allocated => 1,
            SlotState::Free => 2,
            SlotState::Unfilled => 3,
            SlotState::Released => 4,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SlotState::Unused),
            1 => Some(SlotState::Allocated),
            2 => Some(SlotState::Free),
            3 => Some(SlotState::Unfilled),
            4 => Some(SlotState::Released),
            _ => None,
        }
    }

    /// The slot holds a page in use
    pub fn is_in_use(self) -> bool {
        matches!(self, SlotState::Allocated | SlotState::Unfilled)
    }

    /// The slot's page exists in the file
    pub fn is_in_file(self) -> bool {
        matches!(self, SlotState::Allocated | SlotState::Unfilled | SlotState::Free)
    }
}

/// Per-state counters of one extent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentCounts {
    pub allocated: u32,
    pub free: u32,
    pub unfilled: u32,
    pub released: u32,
}

impl ExtentCounts {
    fn slot_mut(&mut self, state: SlotState) -> Option<&mut u32> {
        match state {
            SlotState::Allocated => Some(&mut self.allocated),
            SlotState::Free => Some(&mut self.free),
            SlotState::Unfilled => Some(&mut self.unfilled),
            SlotState::Released => Some(&mut self.released),
            SlotState::Unused => None,
        }
    }

    /// Pages in use (allocated or unfilled)
    pub fn in_use(&self) -> u32 {
        self.allocated + self.unfilled
    }
}

/// The allocation page of one extent
#[derive(Debug, Clone)]
pub struct AllocPage {
    size: PageSize,
    lsn: u64,
    page_number: PageNumber,
    first_page: PageNumber,
    next_extent: Option<PageNumber>,
    counts: ExtentCounts,
    slots: Vec<SlotState>,
}

impl AllocPage {
    /// Largest number of slots one allocation page can track
    pub fn max_capacity(size: PageSize) -> u32 {
        (size.body_len() - ALLOC_HEADER_SIZE) as u32
    }

    pub fn new(
        size: PageSize,
        page_number: PageNumber,
        first_page: PageNumber,
        capacity: u32,
    ) -> Result<Self, ApplyError> {
        if capacity == 0 || capacity > Self::max_capacity(size) {
            return Err(ApplyError(format!(
                "extent capacity {capacity} out of range for {size:?} pages"
            )));
        }
        Ok(Self {
            size,
            lsn: 0,
            page_number,
            first_page,
            next_extent: None,
            counts: ExtentCounts::default(),
            slots: vec![SlotState::Unused; capacity as usize],
        })
    }

    pub fn from_buffer(buf: &PageBuffer) -> Result<Self, ApplyError> {
        let size = PageSize::from_bytes(buf.len() + TRAILER_SIZE)
            .ok_or_else(|| ApplyError(format!("bad allocation page length {}", buf.len())))?;
        let capacity = buf.read_u32(CAPACITY_AT);
        if capacity == 0 || capacity > Self::max_capacity(size) {
            return Err(ApplyError(format!(
                "allocation page {} has capacity {capacity}",
                buf.page_number()
            )));
        }
        let next = buf.read_u64(NEXT_EXTENT_AT);
        let counts = ExtentCounts {
            allocated: buf.read_u32(COUNTS_AT),
            free: buf.read_u32(COUNTS_AT + 4),
            unfilled: buf.read_u32(COUNTS_AT + 8),
            released: buf.read_u32(COUNTS_AT + 12),
        };
        let mut slots = Vec::with_capacity(capacity as usize);
        for i in 0..capacity as usize {
            let byte = buf.as_bytes()[ALLOC_HEADER_SIZE + i];
            let state = SlotState::from_byte(byte).ok_or_else(|| {
                ApplyError(format!(
                    "allocation page {} slot {i} has state byte {byte}",
                    buf.page_number()
                ))
            })?;
            slots.push(state);
        }
        let page = Self {
            size,
            lsn: buf.lsn(),
            page_number: buf.page_number(),
            first_page: buf.read_u64(FIRST_PAGE_AT),
            next_extent: if next == 0 { None } else { Some(next) },
            counts,
            slots,
        };
        if !page.check_counts() {
            return Err(ApplyError(format!(
                "allocation page {} counters disagree with its slots",
                page.page_number
            )));
        }
        Ok(page)
    }

    pub fn to_buffer(&self) -> PageBuffer {
        let mut buf = PageBuffer::zeroed(self.size);
        buf.write_header(KIND_ALLOC, self.lsn, self.page_number);
        buf.write_u64(FIRST_PAGE_AT, self.first_page);
        buf.write_u32(CAPACITY_AT, self.capacity());
        buf.write_u64(NEXT_EXTENT_AT, self.next_extent.unwrap_or(0));
        buf.write_u32(COUNTS_AT, self.counts.allocated);
        buf.write_u32(COUNTS_AT + 4, self.counts.free);
        buf.write_u32(COUNTS_AT + 8, self.counts.unfilled);
        buf.write_u32(COUNTS_AT + 12, self.counts.released);
        for (i, state) in self.slots.iter().enumerate() {
            buf.as_mut_bytes()[ALLOC_HEADER_SIZE + i] = state.to_byte();
        }
        buf
    }

    pub fn size(&self) -> PageSize {
        self.size
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub(crate) fn set_lsn(&mut self, lsn: u64) {
        self.lsn = lsn;
    }

    pub fn page_number(&self) -> PageNumber {
        self.page_number
    }

    pub fn first_page(&self) -> PageNumber {
        self.first_page
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn next_extent(&self) -> Option<PageNumber> {
        self.next_extent
    }

    pub fn is_last(&self) -> bool {
        self.next_extent.is_none()
    }

    pub fn counts(&self) -> ExtentCounts {
        self.counts
    }

    pub fn state(&self, slot: u32) -> SlotState {
        self.slots[slot as usize]
    }

    pub fn page_for_slot(&self, slot: u32) -> PageNumber {
        self.first_page + slot as u64
    }

    /// Slot managing `page`, if this extent manages it
    pub fn slot_for_page(&self, page: PageNumber) -> Option<u32> {
        if page < self.first_page {
            return None;
        }
        let slot = page - self.first_page;
        if slot < self.capacity() as u64 {
            Some(slot as u32)
        } else {
            None
        }
    }

    /// Recount the slots and compare with the stored counters
    pub fn check_counts(&self) -> bool {
        let mut actual = ExtentCounts::default();
        for state in &self.slots {
            if let Some(count) = actual.slot_mut(*state) {
                *count += 1;
            }
        }
        actual == self.counts
    }

    /// Change one slot, keeping the counters in step
    pub(crate) fn set_state(&mut self, slot: u32, state: SlotState) {
        let old = self.slots[slot as usize];
        if old == state {
            return;
        }
        if let Some(count) = self.counts.slot_mut(old) {
            *count -= 1;
        }
        if let Some(count) = self.counts.slot_mut(state) {
            *count += 1;
        }
        self.slots[slot as usize] = state;
    }

    pub fn first_in_state(&self, state: SlotState) -> Option<u32> {
        self.slots.iter().position(|s| *s == state).map(|i| i as u32)
    }

    /// Slots in the given state, lowest first
    pub fn slots_in_state(&self, state: SlotState) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(move |(_, s)| **s == state)
            .map(|(i, _)| i as u32)
    }

    /// Highest slot whose page is still part of the file
    pub fn last_slot_in_file(&self) -> Option<u32> {
        self.slots.iter().rposition(|s| s.is_in_file()).map(|i| i as u32)
    }

    /// No slot of this extent has a page in the file
    pub fn is_empty(&self) -> bool {
        self.last_slot_in_file().is_none()
    }

    /// The run of free slots at the end of the file part of this extent
    pub fn trailing_free_slots(&self) -> Vec<u32> {
        let mut run = Vec::new();
        let Some(last) = self.last_slot_in_file() else {
            return run;
        };
        let mut slot = last as i64;
        while slot >= 0 && self.slots[slot as usize] == SlotState::Free {
            run.push(slot as u32);
            slot -= 1;
        }
        run
    }

    pub(crate) fn apply(&mut self, op: &PageOp) -> Result<(), ApplyError> {
        match op {
            PageOp::SetSlotState { slot, after, .. } => {
                if *slot >= self.capacity() {
                    return Err(ApplyError(format!(
                        "slot {slot} beyond capacity {} of allocation page {}",
                        self.capacity(),
                        self.page_number
                    )));
                }
                self.set_state(*slot, *after);
                Ok(())
            }
            PageOp::ChainExtent { next } => {
                self.next_extent = Some(*next);
                Ok(())
            }
            PageOp::UnchainExtent { next } => {
                if self.next_extent != Some(*next) {
                    return Err(ApplyError(format!(
                        "allocation page {} does not link to extent {next}",
                        self.page_number
                    )));
                }
                self.next_extent = None;
                Ok(())
            }
            other => Err(ApplyError(format!(
                "{} is not an allocation page operation",
                other.name()
            ))),
        }
    }
}
