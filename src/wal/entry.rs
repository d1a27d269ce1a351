//! Log Record definitions
//!
//! Defines the structure of individual log records and their on-disk frame.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::page::PageOp;
use crate::{ContainerId, PageNumber, TxnId};

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Log Sequence Number: `(file number << 32) | byte offset`
///
/// File numbers start at 1, so every real LSN is greater than any page LSN
/// of a page that was never logged (0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(file_number: u64, offset: u32) -> Self {
        Lsn((file_number << 32) | offset as u64)
    }

    pub fn file_number(self) -> u64 {
        self.0 >> 32
    }

    pub fn offset(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_number(), self.offset())
    }
}

/// A transaction active when a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTxn {
    pub txn: TxnId,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
}

/// One log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Owning transaction (0 for records outside any transaction)
    pub txn: TxnId,

    /// Previous record of the same transaction
    pub prev_lsn: Option<Lsn>,

    pub body: LogBody,
}

/// What a log record describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogBody {
    /// A physical page change, undoable through `PageOp::inverse`
    Page {
        container: ContainerId,
        page: PageNumber,
        op: PageOp,
    },

    /// Redo-only record written while undoing; `undo_next` is the next
    /// record of the transaction still to be undone
    Compensation {
        container: ContainerId,
        page: PageNumber,
        op: PageOp,
        undo_next: Option<Lsn>,
    },

    /// End of a nested top action: the changes logged since `undo_next`
    /// survive a rollback of the enclosing transaction
    NestedTopAction { undo_next: Option<Lsn> },

    Commit,

    Abort,

    /// Fuzzy checkpoint: every page change before `redo_lsn` is on disk
    Checkpoint {
        redo_lsn: Lsn,
        active: Vec<ActiveTxn>,
        next_txn: TxnId,
    },

    /// Encryption rewrite began moving to key `epoch` (0 = plaintext)
    EncryptionBegin { epoch: u32 },

    /// A container's shadow file is complete and durable
    ContainerRewritten { container: ContainerId },

    /// The rewrite switched the active key
    EncryptionSwitch { epoch: u32 },
}

impl LogRecord {
    pub fn new(txn: TxnId, prev_lsn: Option<Lsn>, body: LogBody) -> Self {
        Self {
            txn,
            prev_lsn,
            body,
        }
    }

    /// Page and operation for records that change a page
    pub fn page_change(&self) -> Option<(ContainerId, PageNumber, &PageOp)> {
        match &self.body {
            LogBody::Page {
                container,
                page,
                op,
            }
            | LogBody::Compensation {
                container,
                page,
                op,
                ..
            } => Some((*container, *page, op)),
            _ => None,
        }
    }

    /// Encode as a frame positioned at `lsn`
    pub fn encode_frame(&self, lsn: Lsn) -> Result<Vec<u8>> {
        let data = bincode::serialize(self)?;
        let crc = frame_crc(lsn, &data);
        let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
        frame.extend_from_slice(&lsn.0.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(&data);
        Ok(frame)
    }

    /// Decode a frame body after its header was validated
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| VaultError::LogCorruption(e.to_string()))
    }
}

/// CRC over the LSN and data, so a stale frame left at the same offset by an
/// older incarnation of the file never validates
pub fn frame_crc(lsn: Lsn, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.0.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}
