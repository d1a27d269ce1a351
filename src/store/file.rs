//! Container File
//!
//! A container file is a flat array of page frames; page `n` lives at byte
//! offset `n * page_size`. Reads past the end of the file, and frames that
//! were never written, come back as zeroed (fresh) bodies.
//!
//! ```text
//! ┌───────────────────────────────┬──────────┬───────────┬─────────┬─────────┐
//! │ Body (page_size - 36)         │ Epoch (4)│ Nonce (12)│ Tag (16)│ CRC (4) │
//! └───────────────────────────────┴──────────┴───────────┴─────────┴─────────┘
//! epoch 0 = plaintext body; CRC covers everything before it
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::encryption::{PageCipher, NONCE_SIZE, TAG_SIZE};
use crate::error::{Result, VaultError};
use crate::page::{PageBuffer, PageSize};
use crate::{ContainerId, PageNumber};

/// Offset of the key epoch within the trailer
pub const FRAME_EPOCH_AT: usize = 0;
const NONCE_AT: usize = 4;
const TAG_AT: usize = NONCE_AT + NONCE_SIZE;
const CRC_AT: usize = TAG_AT + TAG_SIZE;

/// Page frames of one container on disk
#[derive(Debug)]
pub struct ContainerFile {
    id: ContainerId,
    path: PathBuf,
    size: PageSize,
    file: File,
}

impl ContainerFile {
    /// Create an empty container file, replacing any existing one
    pub fn create(id: ContainerId, path: &Path, size: PageSize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.sync_all()?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            size,
            file,
        })
    }

    /// Open an existing container file
    pub fn open(id: ContainerId, path: &Path, size: PageSize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            size,
            file,
        })
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> PageSize {
        self.size
    }

    /// Number of whole frames in the file
    pub fn page_count(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / self.size.bytes() as u64)
    }

    /// Read the plaintext body of one page
    pub fn read_page(&mut self, page_number: PageNumber, cipher: Option<&PageCipher>) -> Result<PageBuffer> {
        let Some(mut frame) = self.read_frame(page_number)? else {
            return Ok(PageBuffer::zeroed(self.size));
        };
        if frame.iter().all(|b| *b == 0) {
            return Ok(PageBuffer::zeroed(self.size));
        }

        let body_len = self.size.body_len();
        let (body, trailer) = frame.split_at_mut(body_len);

        let stored_crc = read_u32(trailer, CRC_AT);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        hasher.update(&trailer[..CRC_AT]);
        if hasher.finalize() != stored_crc {
            return Err(self.corrupt(page_number, "checksum mismatch".to_string()));
        }

        let epoch = read_u32(trailer, FRAME_EPOCH_AT);
        if epoch != 0 {
            let cipher = match cipher {
                Some(c) if c.epoch() == epoch => c,
                Some(c) => {
                    return Err(self.corrupt(
                        page_number,
                        format!("written with key epoch {epoch}, active key is epoch {}", c.epoch()),
                    ))
                }
                None => {
                    return Err(self.corrupt(
                        page_number,
                        format!("written with key epoch {epoch} but no key is loaded"),
                    ))
                }
            };
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&trailer[NONCE_AT..TAG_AT]);
            let mut tag = [0u8; TAG_SIZE];
            tag.copy_from_slice(&trailer[TAG_AT..CRC_AT]);
            cipher
                .open(page_number, body, &nonce, &tag)
                .map_err(|reason| self.corrupt(page_number, reason))?;
        } else if cipher.is_some() {
            return Err(self.corrupt(
                page_number,
                "plaintext frame in an encrypted container".to_string(),
            ));
        }

        frame.truncate(body_len);
        Ok(PageBuffer::from_vec(frame))
    }

    /// Write one page, encrypting it when a cipher is given
    pub fn write_page(
        &mut self,
        page_number: PageNumber,
        buffer: &PageBuffer,
        cipher: Option<&PageCipher>,
    ) -> Result<()> {
        let body_len = self.size.body_len();
        if buffer.len() != body_len {
            return Err(self.corrupt(
                page_number,
                format!("body of {} bytes, expected {}", buffer.len(), body_len),
            ));
        }

        let mut frame = Vec::with_capacity(self.size.bytes());
        frame.extend_from_slice(buffer.as_bytes());
        frame.resize(self.size.bytes(), 0);
        let (body, trailer) = frame.split_at_mut(body_len);

        if let Some(cipher) = cipher {
            let (nonce, tag) = cipher.seal(page_number, body)?;
            trailer[FRAME_EPOCH_AT..NONCE_AT].copy_from_slice(&cipher.epoch().to_le_bytes());
            trailer[NONCE_AT..TAG_AT].copy_from_slice(&nonce);
            trailer[TAG_AT..CRC_AT].copy_from_slice(&tag);
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        hasher.update(&trailer[..CRC_AT]);
        let crc = hasher.finalize();
        trailer[CRC_AT..].copy_from_slice(&crc.to_le_bytes());

        self.file.seek(SeekFrom::Start(self.offset(page_number)))?;
        self.file.write_all(&frame)?;
        debug!(container = self.id, page = page_number, "page written");
        Ok(())
    }

    /// Key epoch a stored frame was written with (None for a missing frame)
    pub fn frame_epoch(&mut self, page_number: PageNumber) -> Result<Option<u32>> {
        let Some(frame) = self.read_frame(page_number)? else {
            return Ok(None);
        };
        Ok(Some(read_u32(&frame[self.size.body_len()..], FRAME_EPOCH_AT)))
    }

    /// Shrink or grow the file to exactly `pages` frames
    pub fn set_page_count(&mut self, pages: u64) -> Result<()> {
        self.file.set_len(pages * self.size.bytes() as u64)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn offset(&self, page_number: PageNumber) -> u64 {
        page_number * self.size.bytes() as u64
    }

    fn read_frame(&mut self, page_number: PageNumber) -> Result<Option<Vec<u8>>> {
        let frame_len = self.size.bytes();
        let offset = self.offset(page_number);
        if offset + frame_len as u64 > self.file.metadata()?.len() {
            return Ok(None);
        }
        let mut frame = vec![0u8; frame_len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut frame)?;
        Ok(Some(frame))
    }

    fn corrupt(&self, page: PageNumber, reason: String) -> VaultError {
        VaultError::PageCorrupt {
            container: self.id,
            page,
            reason,
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}
