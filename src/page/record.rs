//! Record codec
//!
//! A record is one row piece as it sits on a data page.
//!
//! ```text
//! ┌────────┬──────────────┬──────────────────────┬────────────┬──────────────┐
//! │Status 1│ RowId (1|2)  │ Next piece (8+2)     │ Fields (2) │ Field data...│
//! │        │              │ only if HAS_NEXT     │            │              │
//! └────────┴──────────────┴──────────────────────┴────────────┴──────────────┘
//! field := [tag u8] Inline: [len u32][bytes]  Long: [len u64][page u64][row u16]
//! ```
//!
//! Row ids below 64 take one byte, larger ids take two. The width therefore
//! depends on the page the record is written to, not on the record itself:
//! always size a record with the destination page's next row id.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::PageNumber;

/// Record is marked deleted (space reclaimed by purge)
pub const STATUS_DELETED: u8 = 0x01;
/// Record continues in another piece
pub const STATUS_HAS_NEXT: u8 = 0x02;
/// Record is a non-head piece of an overflowed row
pub const STATUS_PIECE: u8 = 0x04;
/// Record is a chunk of a long column
pub const STATUS_LONG_CHUNK: u8 = 0x08;
/// Reserved control row of a container's first page
pub const STATUS_CONTROL: u8 = 0x10;

/// Largest encodable row id (two-byte form)
pub const MAX_ROW_ID: u16 = 0x3FFF;

/// Every record reserves at least this many bytes so an update can always
/// leave an overflow pointer behind in place.
pub const MIN_RECORD_LEN: usize = 16;

const POINTER_LEN: usize = 8 + 2;
const TAG_INLINE: u8 = 0;
const TAG_LONG: u8 = 1;

/// Encoded width of a row id
pub fn row_id_width(row_id: u16) -> usize {
    if row_id < 64 {
        1
    } else {
        2
    }
}

/// Location of another record piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceRef {
    pub page: PageNumber,
    pub row: u16,
}

impl fmt::Display for PieceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.row)
    }
}

/// One column as stored in a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Column bytes stored in the record
    Inline(Vec<u8>),
    /// Column stored as a chain of long-column chunks
    Long { len: u64, first: PieceRef },
}

impl Field {
    pub fn encoded_len(&self) -> usize {
        match self {
            Field::Inline(bytes) => 1 + 4 + bytes.len(),
            Field::Long { .. } => 1 + 8 + POINTER_LEN,
        }
    }
}

/// A decoded record (row piece)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub status: u8,
    pub next: Option<PieceRef>,
    pub fields: Vec<Field>,
}

impl Record {
    pub fn new(status: u8, fields: Vec<Field>, next: Option<PieceRef>) -> Self {
        let mut record = Self {
            status,
            next: None,
            fields,
        };
        record.set_next(next);
        record
    }

    /// The reserved control row
    pub fn control() -> Self {
        Self::new(STATUS_CONTROL, Vec::new(), None)
    }

    pub fn set_next(&mut self, next: Option<PieceRef>) {
        self.next = next;
        if next.is_some() {
            self.status |= STATUS_HAS_NEXT;
        } else {
            self.status &= !STATUS_HAS_NEXT;
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status & STATUS_DELETED != 0
    }

    pub fn is_control(&self) -> bool {
        self.status & STATUS_CONTROL != 0
    }

    /// Head pieces are the records a row id points at
    pub fn is_head(&self) -> bool {
        self.status & (STATUS_PIECE | STATUS_LONG_CHUNK | STATUS_CONTROL) == 0
    }

    /// Bytes this record occupies when written with `row_id`
    pub fn encoded_len(&self, row_id: u16) -> usize {
        Self::encoded_len_of(&self.fields, self.next.is_some(), row_id)
    }

    /// Bytes a record with these fields would occupy when written with `row_id`
    pub fn encoded_len_of(fields: &[Field], has_next: bool, row_id: u16) -> usize {
        let mut len = 1 + row_id_width(row_id) + 2;
        if has_next {
            len += POINTER_LEN;
        }
        len += fields.iter().map(Field::encoded_len).sum::<usize>();
        len.max(MIN_RECORD_LEN)
    }

    /// Encode with the given row id
    pub fn encode(&self, row_id: u16) -> Vec<u8> {
        let len = self.encoded_len(row_id);
        let mut buf = Vec::with_capacity(len);
        buf.put_u8(self.status);
        put_row_id(&mut buf, row_id);
        if let Some(next) = self.next {
            buf.put_u64_le(next.page);
            buf.put_u16_le(next.row);
        }
        buf.put_u16_le(self.fields.len() as u16);
        for field in &self.fields {
            match field {
                Field::Inline(bytes) => {
                    buf.put_u8(TAG_INLINE);
                    buf.put_u32_le(bytes.len() as u32);
                    buf.put_slice(bytes);
                }
                Field::Long { len, first } => {
                    buf.put_u8(TAG_LONG);
                    buf.put_u64_le(*len);
                    buf.put_u64_le(first.page);
                    buf.put_u16_le(first.row);
                }
            }
        }
        buf.resize(len, 0);
        buf
    }

    /// Decode a record, returning it with its row id
    pub fn decode(bytes: &[u8]) -> Result<(u16, Record), String> {
        let mut buf = bytes;
        if buf.remaining() < 2 {
            return Err("record shorter than its header".to_string());
        }
        let status = buf.get_u8();
        let row_id = get_row_id(&mut buf)?;
        let next = if status & STATUS_HAS_NEXT != 0 {
            if buf.remaining() < POINTER_LEN {
                return Err("truncated overflow pointer".to_string());
            }
            Some(PieceRef {
                page: buf.get_u64_le(),
                row: buf.get_u16_le(),
            })
        } else {
            None
        };
        if buf.remaining() < 2 {
            return Err("truncated field count".to_string());
        }
        let count = buf.get_u16_le() as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 1 {
                return Err("truncated field tag".to_string());
            }
            match buf.get_u8() {
                TAG_INLINE => {
                    if buf.remaining() < 4 {
                        return Err("truncated field length".to_string());
                    }
                    let len = buf.get_u32_le() as usize;
                    if buf.remaining() < len {
                        return Err("truncated field data".to_string());
                    }
                    fields.push(Field::Inline(buf[..len].to_vec()));
                    buf.advance(len);
                }
                TAG_LONG => {
                    if buf.remaining() < 8 + POINTER_LEN {
                        return Err("truncated long column pointer".to_string());
                    }
                    let len = buf.get_u64_le();
                    let first = PieceRef {
                        page: buf.get_u64_le(),
                        row: buf.get_u16_le(),
                    };
                    fields.push(Field::Long { len, first });
                }
                tag => return Err(format!("unknown field tag {tag}")),
            }
        }
        Ok((row_id, Record { status, next, fields }))
    }
}

/// Read only the status byte and row id of an encoded record
pub fn peek_header(bytes: &[u8]) -> Result<(u8, u16), String> {
    let mut buf = bytes;
    if buf.remaining() < 2 {
        return Err("record shorter than its header".to_string());
    }
    let status = buf.get_u8();
    let row_id = get_row_id(&mut buf)?;
    Ok((status, row_id))
}

fn put_row_id(buf: &mut Vec<u8>, row_id: u16) {
    debug_assert!(row_id <= MAX_ROW_ID);
    if row_id < 64 {
        buf.put_u8(row_id as u8);
    } else {
        buf.put_u8(0x40 | (row_id >> 8) as u8);
        buf.put_u8((row_id & 0xFF) as u8);
    }
}

fn get_row_id(buf: &mut &[u8]) -> Result<u16, String> {
    let first = buf.get_u8();
    match first & 0xC0 {
        0x00 => Ok(first as u16),
        0x40 => {
            if buf.remaining() < 1 {
                return Err("truncated row id".to_string());
            }
            Ok((((first & 0x3F) as u16) << 8) | buf.get_u8() as u16)
        }
        _ => Err(format!("invalid row id prefix {first:#04x}")),
    }
}
