//! Page Module
//!
//! Fixed-size page buffers and the two page formats built on them.
//!
//! ## Responsibilities
//! - Page sizes and the on-disk frame geometry
//! - The common page header (kind, page LSN, page number)
//! - Slotted data pages holding records (`StoredPage`)
//! - Allocation pages tracking one extent of page slots (`AllocPage`)
//! - The physical page operations the log records and replays (`PageOp`)
//!
//! ## Frame Layout
//! ```text
//! ┌──────────────────────────────────────────────┬───────────────────────────┐
//! │ Body (page_size - 36)                        │ Trailer (36)              │
//! │ ┌──────────────────┬───────────────────────┐ │ epoch | nonce | tag | crc │
//! │ │ Header (24)      │ Format-specific data  │ │                           │
//! │ └──────────────────┴───────────────────────┘ │                           │
//! └──────────────────────────────────────────────┴───────────────────────────┘
//! header := [kind u8][reserved 3][page_lsn u64][page_number u64][reserved 4]
//! ```

mod alloc;
mod record;
mod stored;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::PageNumber;

pub use alloc::{AllocPage, ExtentCounts, SlotState, ALLOC_HEADER_SIZE};
pub use record::{
    peek_header, row_id_width, Field, PieceRef, Record, MAX_ROW_ID, MIN_RECORD_LEN,
    STATUS_CONTROL, STATUS_DELETED, STATUS_HAS_NEXT, STATUS_LONG_CHUNK, STATUS_PIECE,
};
pub use stored::{StoredPage, DATA_HEADER_SIZE, SLOT_SIZE};

// =============================================================================
// Shared Constants
// =============================================================================

/// Bytes reserved at the end of every frame for the key epoch, nonce, tag and crc
pub const TRAILER_SIZE: usize = 36;

/// Common header shared by every page format
pub const PAGE_HEADER_SIZE: usize = 24;

pub(crate) const KIND_FRESH: u8 = 0;
pub(crate) const KIND_ALLOC: u8 = 1;
pub(crate) const KIND_DATA: u8 = 2;

/// Supported page sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageSize {
    K4,
    K8,
    K16,
    K32,
}

impl PageSize {
    /// Frame size in bytes
    pub fn bytes(self) -> usize {
        match self {
            PageSize::K4 => 4 * 1024,
            PageSize::K8 => 8 * 1024,
            PageSize::K16 => 16 * 1024,
            PageSize::K32 => 32 * 1024,
        }
    }

    /// Usable body bytes (frame minus trailer)
    pub fn body_len(self) -> usize {
        self.bytes() - TRAILER_SIZE
    }

    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            4096 => Some(PageSize::K4),
            8192 => Some(PageSize::K8),
            16384 => Some(PageSize::K16),
            32768 => Some(PageSize::K32),
            _ => None,
        }
    }
}

// =============================================================================
// Page Buffer
// =============================================================================

/// Plaintext body of one page, exactly `page_size - TRAILER_SIZE` bytes
#[derive(Clone, PartialEq, Eq)]
pub struct PageBuffer {
    bytes: Vec<u8>,
}

impl PageBuffer {
    /// A zeroed (fresh) body
    pub fn zeroed(size: PageSize) -> Self {
        Self {
            bytes: vec![0; size.body_len()],
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn kind(&self) -> u8 {
        self.bytes[0]
    }

    pub fn lsn(&self) -> u64 {
        self.read_u64(4)
    }

    pub fn page_number(&self) -> PageNumber {
        self.read_u64(12)
    }

    pub(crate) fn write_header(&mut self, kind: u8, lsn: u64, page_number: PageNumber) {
        self.bytes[0] = kind;
        self.bytes[1..4].fill(0);
        self.write_u64(4, lsn);
        self.write_u64(12, page_number);
        self.bytes[20..24].fill(0);
    }

    pub(crate) fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    pub(crate) fn write_u16(&mut self, at: usize, value: u16) {
        self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_u32(&self, at: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[at..at + 4]);
        u32::from_le_bytes(raw)
    }

    pub(crate) fn write_u32(&mut self, at: usize, value: u32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_u64(&self, at: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[at..at + 8]);
        u64::from_le_bytes(raw)
    }

    pub(crate) fn write_u64(&mut self, at: usize, value: u64) {
        self.bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("kind", &self.kind())
            .field("lsn", &self.lsn())
            .field("page_number", &self.page_number())
            .field("len", &self.bytes.len())
            .finish()
    }
}

// =============================================================================
// Page Operations
// =============================================================================

/// A physical change to one page. Every page mutation goes through one of
/// these, first as a log record and then through `Page::apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageOp {
    /// Format a data page, carrying over the next row id of a recycled page
    FormatData { next_row_id: u16, control: bool },
    /// Format the allocation page of a new extent
    FormatAlloc { first_page: PageNumber, capacity: u32 },
    /// Add an encoded record
    InsertRecord { row_id: u16, bytes: Vec<u8> },
    /// Remove an encoded record and reclaim its space
    RemoveRecord { row_id: u16, bytes: Vec<u8> },
    /// Flip the deleted flag of a record
    SetDeleted { row_id: u16, deleted: bool },
    /// Swap a record's encoding
    ReplaceRecord {
        row_id: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// Change the allocation state of one slot of an extent
    SetSlotState {
        slot: u32,
        before: SlotState,
        after: SlotState,
    },
    /// Link an allocation page to the next extent
    ChainExtent { next: PageNumber },
    /// Cut the link to the next extent, which truncation emptied
    UnchainExtent { next: PageNumber },
}

impl PageOp {
    /// The operation that undoes this one, or None for redo-only operations
    pub fn inverse(&self) -> Option<PageOp> {
        match self {
            PageOp::FormatData { .. } | PageOp::FormatAlloc { .. } | PageOp::ChainExtent { .. } => {
                None
            }
            PageOp::InsertRecord { row_id, bytes } => Some(PageOp::RemoveRecord {
                row_id: *row_id,
                bytes: bytes.clone(),
            }),
            PageOp::RemoveRecord { row_id, bytes } => Some(PageOp::InsertRecord {
                row_id: *row_id,
                bytes: bytes.clone(),
            }),
            PageOp::SetDeleted { row_id, deleted } => Some(PageOp::SetDeleted {
                row_id: *row_id,
                deleted: !*deleted,
            }),
            PageOp::ReplaceRecord {
                row_id,
                before,
                after,
            } => Some(PageOp::ReplaceRecord {
                row_id: *row_id,
                before: after.clone(),
                after: before.clone(),
            }),
            PageOp::SetSlotState {
                slot,
                before,
                after,
            } => Some(PageOp::SetSlotState {
                slot: *slot,
                before: *after,
                after: *before,
            }),
            PageOp::UnchainExtent { next } => Some(PageOp::ChainExtent { next: *next }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PageOp::FormatData { .. } => "format-data",
            PageOp::FormatAlloc { .. } => "format-alloc",
            PageOp::InsertRecord { .. } => "insert",
            PageOp::RemoveRecord { .. } => "remove",
            PageOp::SetDeleted { .. } => "set-deleted",
            PageOp::ReplaceRecord { .. } => "replace",
            PageOp::SetSlotState { .. } => "set-slot-state",
            PageOp::ChainExtent { .. } => "chain-extent",
            PageOp::UnchainExtent { .. } => "unchain-extent",
        }
    }
}

/// Why an operation could not be applied to a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyError(pub String);

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Page
// =============================================================================

/// A page as held in a container's cache
#[derive(Debug, Clone)]
pub enum Page {
    /// Never formatted (zeroed, or beyond the end of the file)
    Fresh { page_number: PageNumber, size: PageSize },
    Data(StoredPage),
    Alloc(AllocPage),
}

impl Page {
    /// Interpret a plaintext body
    pub fn from_buffer(size: PageSize, page_number: PageNumber, buffer: PageBuffer) -> Result<Self, ApplyError> {
        match buffer.kind() {
            KIND_FRESH => Ok(Page::Fresh { page_number, size }),
            KIND_DATA => Ok(Page::Data(StoredPage::from_buffer(buffer)?)),
            KIND_ALLOC => Ok(Page::Alloc(AllocPage::from_buffer(&buffer)?)),
            kind => Err(ApplyError(format!("unknown page kind {kind}"))),
        }
    }

    /// Serialize for writing
    pub fn to_buffer(&self) -> PageBuffer {
        match self {
            Page::Fresh { size, .. } => PageBuffer::zeroed(*size),
            Page::Data(page) => page.buffer().clone(),
            Page::Alloc(page) => page.to_buffer(),
        }
    }

    pub fn lsn(&self) -> u64 {
        match self {
            Page::Fresh { .. } => 0,
            Page::Data(page) => page.lsn(),
            Page::Alloc(page) => page.lsn(),
        }
    }

    pub fn page_number(&self) -> PageNumber {
        match self {
            Page::Fresh { page_number, .. } => *page_number,
            Page::Data(page) => page.page_number(),
            Page::Alloc(page) => page.page_number(),
        }
    }

    /// Apply a logged operation and stamp the page with its LSN
    pub fn apply(&mut self, op: &PageOp, lsn: u64) -> Result<(), ApplyError> {
        let page_number = self.page_number();
        match op {
            PageOp::FormatData {
                next_row_id,
                control,
            } => {
                let size = self.size();
                *self = Page::Data(StoredPage::format(size, page_number, *next_row_id, *control));
            }
            PageOp::FormatAlloc {
                first_page,
                capacity,
            } => {
                let size = self.size();
                *self = Page::Alloc(AllocPage::new(size, page_number, *first_page, *capacity)?);
            }
            PageOp::InsertRecord { .. }
            | PageOp::RemoveRecord { .. }
            | PageOp::SetDeleted { .. }
            | PageOp::ReplaceRecord { .. } => match self {
                Page::Data(page) => page.apply(op)?,
                _ => {
                    return Err(ApplyError(format!(
                        "{} on page {page_number}, which is not a data page",
                        op.name()
                    )))
                }
            },
            PageOp::SetSlotState { .. }
            | PageOp::ChainExtent { .. }
            | PageOp::UnchainExtent { .. } => match self {
                Page::Alloc(page) => page.apply(op)?,
                _ => {
                    return Err(ApplyError(format!(
                        "{} on page {page_number}, which is not an allocation page",
                        op.name()
                    )))
                }
            },
        }
        self.set_lsn(lsn);
        Ok(())
    }

    pub(crate) fn set_lsn(&mut self, lsn: u64) {
        match self {
            Page::Fresh { .. } => {}
            Page::Data(page) => page.set_lsn(lsn),
            Page::Alloc(page) => page.set_lsn(lsn),
        }
    }

    pub fn size(&self) -> PageSize {
        match self {
            Page::Fresh { size, .. } => *size,
            Page::Data(page) => page.size(),
            Page::Alloc(page) => page.size(),
        }
    }

    pub fn as_data(&self) -> Option<&StoredPage> {
        match self {
            Page::Data(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_alloc(&self) -> Option<&AllocPage> {
        match self {
            Page::Alloc(page) => Some(page),
            _ => None,
        }
    }

    pub(crate) fn as_alloc_mut(&mut self) -> Option<&mut AllocPage> {
        match self {
            Page::Alloc(page) => Some(page),
            _ => None,
        }
    }
}
