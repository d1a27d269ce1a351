//! Log Writer
//!
//! Appends frames to the current log file and switches to the next file
//! once the configured size is reached.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::reader::log_file_path;
use super::{LogRecord, Lsn, HEADER_SIZE};
use crate::config::{Config, WalSyncStrategy};
use crate::error::{Result, VaultError};
use crate::store::sync_dir;

/// Writer settings taken from `Config`
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    pub file_size: u64,
    pub max_file_number: u32,
    pub sync_strategy: WalSyncStrategy,
}

impl From<&Config> for LogOptions {
    fn from(config: &Config) -> Self {
        Self {
            file_size: config.log_file_size,
            max_file_number: config.max_log_file_number,
            sync_strategy: config.wal_sync_strategy,
        }
    }
}

/// Writes frames to the log files
pub struct LogWriter {
    dir: PathBuf,
    file: BufWriter<File>,
    file_number: u64,
    offset: u64,
    options: LogOptions,
    /// Records appended since the last fsync
    unsynced: usize,
    /// Every record below this LSN is on stable storage
    durable: Lsn,
    bytes_since_checkpoint: u64,
}

impl LogWriter {
    /// Open the log for appending at `end`, the position after the last valid
    /// frame. `Lsn::ZERO` means there is no log yet.
    pub fn open(dir: &Path, end: Lsn, options: LogOptions) -> Result<Self> {
        let (file_number, offset) = if end == Lsn::ZERO {
            (1, 0)
        } else {
            (end.file_number(), end.offset() as u64)
        };
        if file_number > options.max_file_number as u64 {
            return Err(VaultError::LogExhausted {
                file_number,
                max: options.max_file_number,
            });
        }

        let path = log_file_path(dir, file_number);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(offset)?;
        file.sync_all()?;
        sync_dir(dir)?;

        let mut file = BufWriter::new(file);
        file.seek(SeekFrom::Start(offset))?;

        let durable = Lsn::new(file_number, offset as u32);
        debug!(file_number, offset, "log opened for append");
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            file_number,
            offset,
            options,
            unsynced: 0,
            durable,
            bytes_since_checkpoint: 0,
        })
    }

    /// Append a record and return its LSN
    pub fn append(&mut self, record: &LogRecord) -> Result<Lsn> {
        // Size the frame first so a file switch happens before it is placed
        let frame_len = HEADER_SIZE as u64 + bincode::serialized_size(record)?;
        if self.offset > 0 && self.offset + frame_len > self.options.file_size {
            self.switch_file()?;
        }

        let lsn = Lsn::new(self.file_number, self.offset as u32);
        let frame = record.encode_frame(lsn)?;
        self.file.write_all(&frame)?;
        self.offset += frame.len() as u64;
        self.bytes_since_checkpoint += frame.len() as u64;
        self.unsynced += 1;

        match self.options.sync_strategy {
            WalSyncStrategy::EveryWrite => self.sync()?,
            WalSyncStrategy::EveryNEntries { count } => {
                if self.unsynced >= count.max(1) {
                    self.sync()?;
                }
            }
        }
        Ok(lsn)
    }

    /// Force everything appended so far to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.unsynced = 0;
        self.durable = self.end_lsn();
        Ok(())
    }

    /// Make sure the record at `lsn` is durable
    pub fn flush_to(&mut self, lsn: Lsn) -> Result<()> {
        if lsn >= self.durable {
            self.sync()?;
        }
        Ok(())
    }

    /// LSN the next record will receive (unless a file switch intervenes)
    pub fn end_lsn(&self) -> Lsn {
        Lsn::new(self.file_number, self.offset as u32)
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.bytes_since_checkpoint
    }

    pub fn reset_checkpoint_counter(&mut self) {
        self.bytes_since_checkpoint = 0;
    }

    fn switch_file(&mut self) -> Result<()> {
        let next = self.file_number + 1;
        if next > self.options.max_file_number as u64 {
            return Err(VaultError::LogExhausted {
                file_number: next,
                max: self.options.max_file_number,
            });
        }
        self.sync()?;

        let path = log_file_path(&self.dir, next);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;
        sync_dir(&self.dir)?;

        self.file = BufWriter::new(file);
        self.file_number = next;
        self.offset = 0;
        self.durable = self.end_lsn();
        info!(file_number = next, "switched to new log file");
        Ok(())
    }
}
