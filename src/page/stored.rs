//! Slotted data page
//!
//! ```text
//! ┌────────────┬─────────────────────┬───────────┬──────────────────────────┐
//! │ Header (32)│ Slot dir (4 / slot) │ Free space│ Records (grow downward)  │
//! └────────────┴─────────────────────┴───────────┴──────────────────────────┘
//! data header := common (24) | slot_count u16 | next_row_id u16 | data_start u16 | flags u16
//! slot        := offset u16 | length u16
//! ```
//!
//! Records are always packed against the end of the body; removing or
//! resizing a record re-packs the area so free space is one contiguous run.

use super::record::{peek_header, Record, MAX_ROW_ID, STATUS_CONTROL, STATUS_DELETED};
use super::{ApplyError, PageBuffer, PageOp, PageSize, KIND_DATA, TRAILER_SIZE};
use crate::PageNumber;

/// Data page header size, including the common header
pub const DATA_HEADER_SIZE: usize = 32;

/// Size of one slot directory entry
pub const SLOT_SIZE: usize = 4;

const SLOT_COUNT_AT: usize = 24;
const NEXT_ROW_ID_AT: usize = 26;
const DATA_START_AT: usize = 28;
const FLAGS_AT: usize = 30;

const FLAG_CONTROL_PAGE: u16 = 0x1;

/// A data page holding records
#[derive(Debug, Clone)]
pub struct StoredPage {
    size: PageSize,
    buf: PageBuffer,
}

impl StoredPage {
    /// Format an empty data page
    pub fn format(size: PageSize, page_number: PageNumber, next_row_id: u16, control: bool) -> Self {
        let mut buf = PageBuffer::zeroed(size);
        buf.write_header(KIND_DATA, 0, page_number);
        buf.write_u16(SLOT_COUNT_AT, 0);
        buf.write_u16(NEXT_ROW_ID_AT, next_row_id);
        buf.write_u16(DATA_START_AT, size.body_len() as u16);
        buf.write_u16(FLAGS_AT, if control { FLAG_CONTROL_PAGE } else { 0 });
        Self { size, buf }
    }

    /// Wrap a body read from disk, validating the header
    pub fn from_buffer(buf: PageBuffer) -> Result<Self, ApplyError> {
        let size = PageSize::from_bytes(buf.len() + TRAILER_SIZE)
            .ok_or_else(|| ApplyError(format!("bad data page length {}", buf.len())))?;
        let page = Self { size, buf };
        let dir_end = DATA_HEADER_SIZE + page.slot_count() as usize * SLOT_SIZE;
        let data_start = page.data_start();
        if dir_end > data_start || data_start > page.buf.len() {
            return Err(ApplyError(format!(
                "data page {} has slot directory end {} past data start {}",
                page.page_number(),
                dir_end,
                data_start
            )));
        }
        Ok(page)
    }

    /// Largest record an empty page of this size can hold
    pub fn max_record_len(size: PageSize) -> usize {
        size.body_len() - DATA_HEADER_SIZE - SLOT_SIZE
    }

    pub fn buffer(&self) -> &PageBuffer {
        &self.buf
    }

    pub fn size(&self) -> PageSize {
        self.size
    }

    pub fn lsn(&self) -> u64 {
        self.buf.lsn()
    }

    pub(crate) fn set_lsn(&mut self, lsn: u64) {
        self.buf.write_u64(4, lsn);
    }

    pub fn page_number(&self) -> PageNumber {
        self.buf.page_number()
    }

    pub fn slot_count(&self) -> u16 {
        self.buf.read_u16(SLOT_COUNT_AT)
    }

    /// Row id the next inserted record will receive
    pub fn next_row_id(&self) -> u16 {
        self.buf.read_u16(NEXT_ROW_ID_AT)
    }

    pub fn is_control_page(&self) -> bool {
        self.buf.read_u16(FLAGS_AT) & FLAG_CONTROL_PAGE != 0
    }

    fn data_start(&self) -> usize {
        self.buf.read_u16(DATA_START_AT) as usize
    }

    /// Contiguous free bytes between the slot directory and the records
    pub fn free_space(&self) -> usize {
        self.data_start() - (DATA_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE)
    }

    fn slot(&self, index: usize) -> (usize, usize) {
        let at = DATA_HEADER_SIZE + index * SLOT_SIZE;
        (self.buf.read_u16(at) as usize, self.buf.read_u16(at + 2) as usize)
    }

    /// Encoded bytes of the record in slot `index`
    pub fn slot_bytes(&self, index: usize) -> &[u8] {
        let (offset, len) = self.slot(index);
        &self.buf.as_bytes()[offset..offset + len]
    }

    /// Slot index holding `row_id`
    pub fn find_slot(&self, row_id: u16) -> Option<usize> {
        (0..self.slot_count() as usize)
            .find(|&i| matches!(peek_header(self.slot_bytes(i)), Ok((_, id)) if id == row_id))
    }

    /// Encoded bytes of the record with `row_id`
    pub fn record_bytes(&self, row_id: u16) -> Option<&[u8]> {
        self.find_slot(row_id).map(|i| self.slot_bytes(i))
    }

    /// Decoded record with `row_id`
    pub fn record(&self, row_id: u16) -> Result<Option<Record>, ApplyError> {
        match self.record_bytes(row_id) {
            Some(bytes) => Record::decode(bytes).map(|(_, r)| Some(r)).map_err(ApplyError),
            None => Ok(None),
        }
    }

    /// All records in slot order, with their row ids
    pub fn records(&self) -> Result<Vec<(u16, Record)>, ApplyError> {
        (0..self.slot_count() as usize)
            .map(|i| Record::decode(self.slot_bytes(i)).map_err(ApplyError))
            .collect()
    }

    /// Row ids and status bytes of every record
    pub fn headers(&self) -> Vec<(u16, u8)> {
        (0..self.slot_count() as usize)
            .filter_map(|i| peek_header(self.slot_bytes(i)).ok())
            .map(|(status, row_id)| (row_id, status))
            .collect()
    }

    /// True when the page holds nothing but (at most) the control row
    pub fn has_no_rows(&self) -> bool {
        self.headers()
            .iter()
            .all(|(_, status)| status & STATUS_CONTROL != 0)
    }

    /// True when every non-control record is marked deleted
    pub fn all_rows_deleted(&self) -> bool {
        self.headers()
            .iter()
            .filter(|(_, status)| status & STATUS_CONTROL == 0)
            .all(|(_, status)| status & STATUS_DELETED != 0)
    }

    /// Whether a record of `len` encoded bytes can be added
    pub fn can_accept(&self, len: usize) -> bool {
        self.next_row_id() <= MAX_ROW_ID && self.free_space() >= len + SLOT_SIZE
    }

    /// Bytes `record` needs on this page, sized with this page's next row id
    pub fn encoded_len_here(&self, record: &Record) -> usize {
        record.encoded_len(self.next_row_id())
    }

    /// Whether `record` fits on this page once given this page's next row id
    pub fn fits(&self, record: &Record) -> bool {
        self.can_accept(self.encoded_len_here(record))
    }

    pub(crate) fn apply(&mut self, op: &PageOp) -> Result<(), ApplyError> {
        match op {
            PageOp::InsertRecord { row_id, bytes } => self.insert(*row_id, bytes),
            PageOp::RemoveRecord { row_id, .. } => {
                let index = self.require_slot(*row_id)?;
                self.repack(Some(index), None);
                Ok(())
            }
            PageOp::SetDeleted { row_id, deleted } => {
                let index = self.require_slot(*row_id)?;
                let (offset, _) = self.slot(index);
                let status = &mut self.buf.as_mut_bytes()[offset];
                if *deleted {
                    *status |= STATUS_DELETED;
                } else {
                    *status &= !STATUS_DELETED;
                }
                Ok(())
            }
            PageOp::ReplaceRecord { row_id, after, .. } => {
                let index = self.require_slot(*row_id)?;
                let (_, old_len) = self.slot(index);
                if self.free_space() + old_len < after.len() {
                    return Err(ApplyError(format!(
                        "replacement of row {row_id} needs {} bytes, page {} has {}",
                        after.len(),
                        self.page_number(),
                        self.free_space() + old_len
                    )));
                }
                self.repack(None, Some((index, after.clone())));
                Ok(())
            }
            other => Err(ApplyError(format!(
                "{} is not a data page operation",
                other.name()
            ))),
        }
    }

    fn require_slot(&self, row_id: u16) -> Result<usize, ApplyError> {
        self.find_slot(row_id).ok_or_else(|| {
            ApplyError(format!("row {row_id} not on page {}", self.page_number()))
        })
    }

    fn insert(&mut self, row_id: u16, bytes: &[u8]) -> Result<(), ApplyError> {
        if self.find_slot(row_id).is_some() {
            return Err(ApplyError(format!(
                "row {row_id} already on page {}",
                self.page_number()
            )));
        }
        if self.free_space() < bytes.len() + SLOT_SIZE {
            return Err(ApplyError(format!(
                "record of {} bytes does not fit on page {} ({} free)",
                bytes.len(),
                self.page_number(),
                self.free_space()
            )));
        }
        let offset = self.data_start() - bytes.len();
        self.buf.as_mut_bytes()[offset..offset + bytes.len()].copy_from_slice(bytes);
        let count = self.slot_count() as usize;
        let at = DATA_HEADER_SIZE + count * SLOT_SIZE;
        self.buf.write_u16(at, offset as u16);
        self.buf.write_u16(at + 2, bytes.len() as u16);
        self.buf.write_u16(SLOT_COUNT_AT, (count + 1) as u16);
        self.buf.write_u16(DATA_START_AT, offset as u16);
        if row_id >= self.next_row_id() {
            self.buf.write_u16(NEXT_ROW_ID_AT, row_id + 1);
        }
        Ok(())
    }

    /// Rewrite the record area, optionally dropping one slot or replacing one
    fn repack(&mut self, remove: Option<usize>, replace: Option<(usize, Vec<u8>)>) {
        let mut records: Vec<Vec<u8>> = Vec::with_capacity(self.slot_count() as usize);
        for i in 0..self.slot_count() as usize {
            if remove == Some(i) {
                continue;
            }
            match &replace {
                Some((index, bytes)) if *index == i => records.push(bytes.clone()),
                _ => records.push(self.slot_bytes(i).to_vec()),
            }
        }

        let body_len = self.size.body_len();
        let dir_start = DATA_HEADER_SIZE;
        self.buf.as_mut_bytes()[dir_start..body_len].fill(0);

        let mut offset = body_len;
        for (i, bytes) in records.iter().enumerate() {
            offset -= bytes.len();
            self.buf.as_mut_bytes()[offset..offset + bytes.len()].copy_from_slice(bytes);
            let at = dir_start + i * SLOT_SIZE;
            self.buf.write_u16(at, offset as u16);
            self.buf.write_u16(at + 2, bytes.len() as u16);
        }
        self.buf.write_u16(SLOT_COUNT_AT, records.len() as u16);
        self.buf.write_u16(DATA_START_AT, offset as u16);
    }
}
