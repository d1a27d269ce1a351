//! Row placement
//!
//! Turns rows into records and back.
//!
//! ```text
//! head (row id) ──next──► piece ──next──► piece
//!   │ Long{len, first}
//!   ▼
//! chunk ──next──► chunk ──next──► chunk
//! ```
//!
//! - A column longer than a quarter of the page body becomes a long column:
//!   a chain of chunk records, referenced from the row by a fixed-size pointer.
//! - A row whose record does not fit on one page is split into a head piece
//!   and overflow pieces. Pieces are placed tail first so every record is
//!   written once, already pointing at its successor.
//! - Fit is always decided with the destination page's next row id, since a
//!   page with 64 or more row ids encodes every new id in two bytes.

use std::collections::HashSet;

use super::{corrupt, ContainerState, Row, CONTROL_PAGE};
use crate::error::{Result, VaultError};
use crate::page::{
    Field, PageOp, PieceRef, Record, SlotState, StoredPage, MAX_ROW_ID, STATUS_CONTROL,
    STATUS_DELETED, STATUS_LONG_CHUNK, STATUS_PIECE,
};
use crate::txn::TxnLogger;
use crate::{PageNumber, RowId};

/// Room left in a long column chunk for its own header and pointer
const LONG_CHUNK_OVERHEAD: usize = 32;

/// Pointers a record holds to other records (overflow piece, long columns)
pub(crate) fn outgoing_refs(record: &Record) -> Vec<PieceRef> {
    let mut refs: Vec<PieceRef> = record.next.into_iter().collect();
    for field in &record.fields {
        if let Field::Long { first, .. } = field {
            refs.push(*first);
        }
    }
    refs
}

impl ContainerState {
    fn max_record_len(&self) -> usize {
        StoredPage::max_record_len(self.size)
    }

    fn long_column_threshold(&self) -> usize {
        self.size.body_len() / 4
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Whether `record` can go on `page` as it stands
    pub(crate) fn page_accepts(&mut self, page: PageNumber, record: &Record) -> Result<bool> {
        match self.slot_state(page)? {
            Some(state) if state.is_in_use() => {}
            _ => return Ok(false),
        }
        Ok(self.page(page)?.as_data().is_some_and(|data| data.fits(record)))
    }

    /// Find a page for `record`: the last insert page, then unfilled pages,
    /// then a newly allocated one
    fn choose_page(&mut self, log: &TxnLogger, record: &Record) -> Result<PageNumber> {
        if let Some(hint) = self.insert_hint {
            if self.page_accepts(hint, record)? {
                return Ok(hint);
            }
        }
        for alloc in self.extents()? {
            let extent = self.alloc_page(alloc)?;
            let unfilled: Vec<PageNumber> = extent
                .slots_in_state(SlotState::Unfilled)
                .map(|slot| extent.page_for_slot(slot))
                .collect();
            for page in unfilled {
                if Some(page) != self.insert_hint && self.page_accepts(page, record)? {
                    return Ok(page);
                }
            }
        }

        let page = self.allocate_page(log)?;
        if self.page_accepts(page, record)? {
            return Ok(page);
        }
        Err(VaultError::SpaceExhausted {
            container: self.id,
            reason: format!(
                "record of {} bytes does not fit on an empty page",
                record.encoded_len(MAX_ROW_ID)
            ),
        })
    }

    /// Insert `record` on `page`, which must accept it
    pub(crate) fn insert_record_at(
        &mut self,
        log: &TxnLogger,
        page: PageNumber,
        record: &Record,
    ) -> Result<PieceRef> {
        let row_id = self.data_page(page)?.next_row_id();
        let bytes = record.encode(row_id);
        self.apply_logged(log, page, PageOp::InsertRecord { row_id, bytes })?;
        self.refresh_fill_hint(page)?;
        Ok(PieceRef { page, row: row_id })
    }

    fn place_record(&mut self, log: &TxnLogger, record: &Record) -> Result<PieceRef> {
        let page = self.choose_page(log, record)?;
        self.insert_record_at(log, page, record)
    }

    /// Store one long column as a chunk chain
    fn store_long_column(&mut self, log: &TxnLogger, bytes: &[u8]) -> Result<Field> {
        let chunk_len = self.max_record_len() - LONG_CHUNK_OVERHEAD;
        let mut next = None;
        for chunk in bytes.chunks(chunk_len).rev() {
            let record = Record::new(STATUS_LONG_CHUNK, vec![Field::Inline(chunk.to_vec())], next);
            next = Some(self.place_record(log, &record)?);
        }
        let first = next.ok_or_else(|| corrupt(self.id, 0, "empty long column"))?;
        Ok(Field::Long {
            len: bytes.len() as u64,
            first,
        })
    }

    fn store_columns(&mut self, log: &TxnLogger, columns: &[Vec<u8>]) -> Result<Vec<Field>> {
        let threshold = self.long_column_threshold();
        let mut fields = Vec::with_capacity(columns.len());
        for column in columns {
            if column.len() > threshold {
                fields.push(self.store_long_column(log, column)?);
            } else {
                fields.push(Field::Inline(column.clone()));
            }
        }
        Ok(fields)
    }

    /// Split fields into groups that each fit one record, sized for the
    /// widest row id and an overflow pointer
    fn split_fields(&self, fields: Vec<Field>) -> Vec<Vec<Field>> {
        let max = self.max_record_len();
        if Record::encoded_len_of(&fields, false, MAX_ROW_ID) <= max {
            return vec![fields];
        }
        let mut groups = Vec::new();
        let mut current: Vec<Field> = Vec::new();
        for field in fields {
            current.push(field);
            if current.len() > 1 && Record::encoded_len_of(&current, true, MAX_ROW_ID) > max {
                if let Some(field) = current.pop() {
                    groups.push(std::mem::take(&mut current));
                    current.push(field);
                }
            }
        }
        groups.push(current);
        groups
    }

    /// Place fields as a chain, tail first. The first record gets `first_status`,
    /// the rest are overflow pieces.
    fn place_fields(&mut self, log: &TxnLogger, fields: Vec<Field>, first_status: u8) -> Result<PieceRef> {
        let groups = self.split_fields(fields);
        let mut next = None;
        for (index, group) in groups.into_iter().enumerate().rev() {
            let status = if index == 0 { first_status } else { STATUS_PIECE };
            let record = Record::new(status, group, next);
            next = Some(self.place_record(log, &record)?);
        }
        next.ok_or_else(|| corrupt(self.id, 0, "row produced no record"))
    }

    // -------------------------------------------------------------------------
    // Row Operations
    // -------------------------------------------------------------------------

    /// Store a new row and return where its head landed
    pub(crate) fn insert_row(&mut self, log: &TxnLogger, row: &Row) -> Result<RowId> {
        let fields = self.store_columns(log, &row.columns)?;
        let head = self.place_fields(log, fields, 0)?;
        self.insert_hint = Some(head.page);
        Ok(RowId::new(self.id, head.page, head.row))
    }

    /// The live head record of a row
    fn head_record(&mut self, row_id: RowId) -> Result<Record> {
        if row_id.container != self.id {
            return Err(VaultError::RowNotFound(row_id));
        }
        match self.slot_state(row_id.page)? {
            Some(state) if state.is_in_use() => {}
            _ => return Err(VaultError::RowNotFound(row_id)),
        }
        let id = self.id;
        let record = self
            .data_page(row_id.page)?
            .record(row_id.row)
            .map_err(|e| corrupt(id, row_id.page, e.0))?;
        match record {
            Some(record) if record.is_head() && !record.is_deleted() => Ok(record),
            _ => Err(VaultError::RowNotFound(row_id)),
        }
    }

    pub(crate) fn record_at(&mut self, at: PieceRef) -> Result<Record> {
        let id = self.id;
        self.data_page(at.page)?
            .record(at.row)
            .map_err(|e| corrupt(id, at.page, e.0))?
            .ok_or_else(|| corrupt(id, at.page, format!("piece {at} is missing")))
    }

    /// Every piece and chunk reachable from `record`
    fn collect_chain(&mut self, record: &Record) -> Result<Vec<PieceRef>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = outgoing_refs(record);
        while let Some(at) = pending.pop() {
            if !seen.insert(at) {
                return Err(corrupt(self.id, at.page, format!("piece {at} is linked twice")));
            }
            let piece = self.record_at(at)?;
            pending.extend(outgoing_refs(&piece));
            chain.push(at);
        }
        Ok(chain)
    }

    /// Pieces and chunks owned by a live row (head excluded)
    pub(crate) fn row_chain(&mut self, row_id: RowId) -> Result<Vec<PieceRef>> {
        let head = self.head_record(row_id)?;
        self.collect_chain(&head)
    }

    fn read_long_column(&mut self, len: u64, first: PieceRef) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(len as usize);
        let mut seen = HashSet::new();
        let mut next = Some(first);
        while let Some(at) = next {
            if !seen.insert(at) {
                return Err(corrupt(self.id, at.page, "long column chain loops"));
            }
            let chunk = self.record_at(at)?;
            for field in chunk.fields {
                if let Field::Inline(part) = field {
                    bytes.extend_from_slice(&part);
                }
            }
            next = chunk.next;
        }
        if bytes.len() as u64 != len {
            return Err(corrupt(
                self.id,
                first.page,
                format!("long column holds {} bytes, expected {len}", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    /// Read a row back, following overflow pieces and long columns
    pub(crate) fn fetch_row(&mut self, row_id: RowId) -> Result<Row> {
        let head = self.head_record(row_id)?;
        let mut fields = head.fields;
        let mut seen = HashSet::new();
        let mut next = head.next;
        while let Some(at) = next {
            if !seen.insert(at) {
                return Err(corrupt(self.id, at.page, "overflow chain loops"));
            }
            let piece = self.record_at(at)?;
            fields.extend(piece.fields);
            next = piece.next;
        }

        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            match field {
                Field::Inline(bytes) => columns.push(bytes),
                Field::Long { len, first } => columns.push(self.read_long_column(len, first)?),
            }
        }
        Ok(Row { columns })
    }

    /// Row ids of every live row, in page order
    pub(crate) fn live_rows(&mut self) -> Result<Vec<RowId>> {
        let id = self.id;
        let mut rows = Vec::new();
        for page in self.pages_in_use()? {
            for (row, status) in self.data_page(page)?.headers() {
                let is_head = status & (STATUS_PIECE | STATUS_LONG_CHUNK | STATUS_CONTROL) == 0;
                if is_head && status & STATUS_DELETED == 0 {
                    rows.push(RowId::new(id, page, row));
                }
            }
        }
        rows.sort_unstable();
        Ok(rows)
    }

    /// Mark a row deleted. Space comes back when the delete is purged.
    pub(crate) fn delete_row(&mut self, log: &TxnLogger, row_id: RowId) -> Result<()> {
        self.head_record(row_id)?;
        self.apply_logged(
            log,
            row_id.page,
            PageOp::SetDeleted {
                row_id: row_id.row,
                deleted: true,
            },
        )?;
        if self.data_page(row_id.page)?.all_rows_deleted() {
            log.note_reclaim(self.id, row_id.page);
        }
        Ok(())
    }

    /// Replace a row's columns, keeping its row id
    ///
    /// The old pieces and chunks are marked deleted; the caller must already
    /// hold exclusive locks on them (see `row_chain`).
    pub(crate) fn update_row(&mut self, log: &TxnLogger, row_id: RowId, row: &Row) -> Result<()> {
        let head = self.head_record(row_id)?;
        let old_chain = self.collect_chain(&head)?;
        let fields = self.store_columns(log, &row.columns)?;

        let in_place = Record::new(0, fields.clone(), None);
        let new_len = in_place.encoded_len(row_id.row);
        let room = {
            let page = self.data_page(row_id.page)?;
            let old_len = page.record_bytes(row_id.row).map_or(0, <[u8]>::len);
            old_len + page.free_space()
        };
        let new_head = if new_len <= room && new_len <= self.max_record_len() {
            in_place
        } else {
            // Head keeps only a pointer; it never outgrows the old record
            let first = self.place_fields(log, fields, STATUS_PIECE)?;
            Record::new(0, Vec::new(), Some(first))
        };

        let before = self
            .data_page(row_id.page)?
            .record_bytes(row_id.row)
            .map(<[u8]>::to_vec)
            .ok_or(VaultError::RowNotFound(row_id))?;
        self.apply_logged(
            log,
            row_id.page,
            PageOp::ReplaceRecord {
                row_id: row_id.row,
                before,
                after: new_head.encode(row_id.row),
            },
        )?;
        self.refresh_fill_hint(row_id.page)?;

        for at in old_chain {
            self.apply_logged(
                log,
                at.page,
                PageOp::SetDeleted {
                    row_id: at.row,
                    deleted: true,
                },
            )?;
            if self.data_page(at.page)?.all_rows_deleted() {
                log.note_reclaim(self.id, at.page);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Purge
    // -------------------------------------------------------------------------

    /// Records on `page` that are marked deleted
    pub(crate) fn deleted_records(&mut self, page: PageNumber) -> Result<Vec<PieceRef>> {
        Ok(self
            .data_page(page)?
            .headers()
            .into_iter()
            .filter(|(_, status)| status & STATUS_DELETED != 0)
            .map(|(row, _)| PieceRef { page, row })
            .collect())
    }

    /// Remove a deleted record for good. A deleted head takes its whole
    /// chain with it; a deleted piece left behind by an update goes alone.
    /// Returns false if the record is gone or no longer deleted.
    pub(crate) fn purge_record(&mut self, log: &TxnLogger, at: PieceRef) -> Result<bool> {
        let id = self.id;
        let record = self
            .data_page(at.page)?
            .record(at.row)
            .map_err(|e| corrupt(id, at.page, e.0))?;
        let Some(record) = record else {
            return Ok(false);
        };
        if !record.is_deleted() || record.is_control() {
            return Ok(false);
        }
        let owned = if record.is_head() {
            self.collect_chain(&record)?
        } else {
            Vec::new()
        };
        self.remove_record(log, at)?;
        for piece in owned {
            self.remove_record(log, piece)?;
        }
        Ok(true)
    }

    pub(crate) fn remove_record(&mut self, log: &TxnLogger, at: PieceRef) -> Result<()> {
        let id = self.id;
        let bytes = self
            .data_page(at.page)?
            .record_bytes(at.row)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| corrupt(id, at.page, format!("piece {at} is missing")))?;
        self.apply_logged(log, at.page, PageOp::RemoveRecord { row_id: at.row, bytes })?;
        self.refresh_fill_hint(at.page)
    }

    /// Whether `page` is a data page in use with nothing left but the control row
    pub(crate) fn is_empty_page(&mut self, page: PageNumber) -> Result<bool> {
        if page == CONTROL_PAGE {
            return Ok(false);
        }
        match self.slot_state(page)? {
            Some(state) if state.is_in_use() => Ok(self.data_page(page)?.has_no_rows()),
            _ => Ok(false),
        }
    }
}
