//! Log Reader
//!
//! Scans log files forward from a starting LSN and repairs a torn tail.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::entry::frame_crc;
use super::{LogRecord, Lsn, HEADER_SIZE};
use crate::error::{Result, VaultError};

/// Path of log file `n`
pub fn log_file_path(dir: &Path, file_number: u64) -> PathBuf {
    dir.join(format!("log{file_number}.dat"))
}

/// Parse the file number out of "log{n}.dat"
fn parse_file_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("log")?.strip_suffix(".dat")?.parse().ok()
}

/// Numbers of all log files in `dir`, ascending
pub fn list_log_files(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    if !dir.exists() {
        return Ok(numbers);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(n) = parse_file_number(&path) {
                numbers.push(n);
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Result of a forward scan
#[derive(Debug, Default)]
pub struct LogScan {
    /// Valid records in LSN order
    pub records: Vec<(Lsn, LogRecord)>,

    /// Position after the last valid frame (`Lsn::ZERO` if there is no log)
    pub end: Lsn,

    /// Bytes cut off the last file because they held a partial frame
    pub truncated_bytes: u64,
}

/// Why a frame could not be read
enum FrameError {
    /// The bytes end before the frame does
    Short,
    /// The frame is complete but does not validate
    Invalid(String),
}

/// Reads log files
pub struct LogReader;

impl LogReader {
    /// Read every record at or after `from`. `Lsn::ZERO` starts at the oldest
    /// file. A damaged frame in the last file is treated as a torn write: the
    /// file is truncated there. Damage anywhere else is corruption.
    pub fn scan(dir: &Path, from: Lsn) -> Result<LogScan> {
        let files = list_log_files(dir)?;
        let mut scan = LogScan::default();
        let Some(&last_file) = files.last() else {
            if from != Lsn::ZERO {
                return Err(VaultError::LogCorruption(format!(
                    "scan start {from} but no log files exist"
                )));
            }
            return Ok(scan);
        };

        let start_file = if from == Lsn::ZERO {
            files[0]
        } else {
            from.file_number()
        };
        if !files.contains(&start_file) {
            return Err(VaultError::LogCorruption(format!(
                "log file {start_file} needed from {from} is missing"
            )));
        }

        let mut expected = start_file;
        for &number in files.iter().filter(|n| **n >= start_file) {
            if number != expected {
                return Err(VaultError::LogCorruption(format!(
                    "log file {expected} is missing (found {number})"
                )));
            }
            expected += 1;

            let path = log_file_path(dir, number);
            let data = fs::read(&path)?;
            let mut offset = if number == start_file {
                from.offset() as usize
            } else {
                0
            };

            while offset < data.len() {
                let lsn = Lsn::new(number, offset as u32);
                match read_frame(&data[offset..], lsn) {
                    Ok((record, frame_len)) => {
                        scan.records.push((lsn, record));
                        offset += frame_len;
                    }
                    Err(err) if number == last_file => {
                        let reason = match err {
                            FrameError::Short => "partial frame".to_string(),
                            FrameError::Invalid(reason) => reason,
                        };
                        let cut = (data.len() - offset) as u64;
                        warn!(file = number, offset, cut, %reason, "truncating torn log tail");
                        let file = OpenOptions::new().write(true).open(&path)?;
                        file.set_len(offset as u64)?;
                        file.sync_all()?;
                        scan.truncated_bytes = cut;
                        break;
                    }
                    Err(FrameError::Short) => {
                        return Err(VaultError::LogCorruption(format!(
                            "log file {number} ends inside the frame at {lsn}"
                        )))
                    }
                    Err(FrameError::Invalid(reason)) => {
                        return Err(VaultError::LogCorruption(format!(
                            "frame at {lsn}: {reason}"
                        )))
                    }
                }
            }
            scan.end = Lsn::new(number, offset.min(data.len()) as u32);
        }

        debug!(records = scan.records.len(), end = %scan.end, "log scanned");
        Ok(scan)
    }
}

fn read_frame(bytes: &[u8], lsn: Lsn) -> std::result::Result<(LogRecord, usize), FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::Short);
    }
    let stored_lsn = u64::from_le_bytes(bytes[0..8].try_into().map_err(|_| FrameError::Short)?);
    let crc = u32::from_le_bytes(bytes[8..12].try_into().map_err(|_| FrameError::Short)?);
    let len = u32::from_le_bytes(bytes[12..16].try_into().map_err(|_| FrameError::Short)?) as usize;
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameError::Short);
    }
    if stored_lsn != lsn.0 {
        return Err(FrameError::Invalid(format!(
            "frame claims LSN {}",
            Lsn(stored_lsn)
        )));
    }
    let data = &bytes[HEADER_SIZE..HEADER_SIZE + len];
    if frame_crc(lsn, data) != crc {
        return Err(FrameError::Invalid("checksum mismatch".to_string()));
    }
    let record = LogRecord::decode(data).map_err(|e| FrameError::Invalid(e.to_string()))?;
    Ok((record, HEADER_SIZE + len))
}
