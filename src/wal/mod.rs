//! Write-Ahead Log (WAL) Module
//!
//! Provides durability and atomicity for every page change.
//!
//! ## Responsibilities
//! - Append log records before the page they describe is changed
//! - CRC32 checksums for corruption and torn-write detection
//! - Log Sequence Numbers (LSN) that double as page LSNs
//! - Switch to a new file at a size limit; refuse to go past the last
//!   allowed file number
//! - Remember the last checkpoint in a small control file
//! - Crash recovery (redo/undo)
//!
//! ## File Format
//! ```text
//! log/log{n}.dat
//! ┌─────────────────────────────────────────┐
//! │ Frame 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Frame 2 ...                             │
//! └─────────────────────────────────────────┘
//! log/log.ctrl: [CRC (4)][Len (4)][bincode(LogControl)]
//! ```

mod entry;
mod reader;
mod recovery;
mod writer;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Faults;
use crate::error::{Result, VaultError};
use crate::store::sync_dir;

pub use entry::{ActiveTxn, LogBody, LogRecord, Lsn, HEADER_SIZE};
pub use reader::{list_log_files, log_file_path, LogReader, LogScan};
pub use recovery::{Recovery, RecoveryReport, RecoveryTarget};
pub use writer::{LogOptions, LogWriter};

const CONTROL_FILE: &str = "log.ctrl";

// =============================================================================
// Control File
// =============================================================================

/// Where recovery starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogControl {
    /// LSN of the last complete checkpoint record
    pub checkpoint: Option<Lsn>,

    /// Oldest LSN recovery has to read: the checkpoint's redo LSN or the first
    /// record of a transaction that was active at the checkpoint
    pub scan_start: Lsn,
}

impl LogControl {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONTROL_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read(&path)?;
        if raw.len() < 8 {
            return Err(VaultError::LogCorruption("log control file is truncated".to_string()));
        }
        let crc = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        let payload = raw
            .get(8..8 + len)
            .ok_or_else(|| VaultError::LogCorruption("log control file is truncated".to_string()))?;
        if crc32fast::hash(payload) != crc {
            return Err(VaultError::LogCorruption(
                "log control file checksum mismatch".to_string(),
            ));
        }
        Ok(bincode::deserialize(payload)?)
    }

    /// Replace the control file atomically
    pub fn save(&self, dir: &Path) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let mut raw = Vec::with_capacity(8 + payload.len());
        raw.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&payload);

        let tmp = dir.join(format!("{CONTROL_FILE}.tmp"));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(CONTROL_FILE))?;
        sync_dir(dir)
    }
}

// =============================================================================
// Log Manager
// =============================================================================

/// Shared handle on the log
///
/// ## Concurrency:
/// - `writer`: one Mutex; appends are serialized, LSNs are handed out in
///   append order
/// - `fatal`: set once the log can no longer be trusted (exhausted file
///   numbers, a failed append or a failed sync); every later append is refused
pub struct LogManager {
    dir: PathBuf,
    writer: Mutex<LogWriter>,
    fatal: Mutex<Option<String>>,
    faults: Faults,
}

impl LogManager {
    pub fn new(dir: &Path, writer: LogWriter) -> Self {
        Self {
            dir: dir.to_path_buf(),
            writer: Mutex::new(writer),
            fatal: Mutex::new(None),
            faults: Faults::default(),
        }
    }

    /// Route log syncs through a fault injector
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fail with `DatabaseFatal` once the log is unusable
    pub fn check_usable(&self) -> Result<()> {
        match self.fatal.lock().as_ref() {
            Some(reason) => Err(VaultError::DatabaseFatal(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Mark the database unusable
    pub fn set_fatal(&self, reason: String) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            error!(%reason, "database marked fatal");
            *fatal = Some(reason);
        }
    }

    /// Append a record
    ///
    /// Running out of log file numbers, or any failure while writing, leaves
    /// the tail of the log unknown; both make the database fatal.
    pub fn append(&self, record: &LogRecord) -> Result<Lsn> {
        self.check_usable()?;
        let result = self.writer.lock().append(record);
        match result {
            Ok(lsn) => Ok(lsn),
            Err(err @ VaultError::LogExhausted { .. }) => {
                self.set_fatal(err.to_string());
                Err(err)
            }
            Err(err) => {
                self.set_fatal(format!("log append failed: {err}"));
                Err(err)
            }
        }
    }

    /// Make the record at `lsn` durable
    ///
    /// A failed sync leaves it unknown which records reached the disk, so it
    /// makes the database fatal just like a failed append.
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        self.check_usable()?;
        let mut writer = self.writer.lock();
        if lsn < writer.durable_lsn() {
            return Ok(());
        }
        let result = self.sync_hook().and_then(|()| writer.flush_to(lsn));
        drop(writer);
        self.poison_on_error(result)
    }

    pub fn sync(&self) -> Result<()> {
        self.check_usable()?;
        let result = self.sync_hook().and_then(|()| self.writer.lock().sync());
        self.poison_on_error(result)
    }

    fn sync_hook(&self) -> Result<()> {
        match &self.faults.0 {
            Some(faults) => faults.log_sync(),
            None => Ok(()),
        }
    }

    fn poison_on_error(&self, result: Result<()>) -> Result<()> {
        if let Err(err) = &result {
            self.set_fatal(format!("log sync failed: {err}"));
        }
        result
    }

    pub fn end_lsn(&self) -> Lsn {
        self.writer.lock().end_lsn()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.writer.lock().durable_lsn()
    }

    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.writer.lock().bytes_since_checkpoint()
    }

    /// Record a finished checkpoint and drop log files recovery no longer needs
    pub fn complete_checkpoint(&self, control: LogControl) -> Result<usize> {
        control.save(&self.dir)?;
        let current = {
            let mut writer = self.writer.lock();
            writer.reset_checkpoint_counter();
            writer.file_number()
        };

        let keep_from = control.scan_start.file_number().min(current);
        let mut removed = 0;
        for number in list_log_files(&self.dir)? {
            if number < keep_from {
                fs::remove_file(log_file_path(&self.dir, number))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, keep_from, "removed old log files");
        }
        Ok(removed)
    }
}
