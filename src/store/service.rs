//! Service File
//!
//! Small metadata file describing the database as a whole. It is rewritten
//! in full on every change (temp file, fsync, rename), so a reader always
//! sees either the old or the new version.
//!
//! ```text
//! ┌───────────┬─────────┬─────────┬──────────────────────┐
//! │ Magic (4) │ CRC (4) │ Len (4) │ bincode(ServiceMeta) │
//! └───────────┴─────────┴─────────┴──────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{sync_dir, SERVICE_FILE};
use crate::encryption::EncryptionMeta;
use crate::error::{Result, VaultError};
use crate::page::PageSize;
use crate::ContainerId;

const MAGIC: &[u8; 4] = b"PVSF";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 12;

/// Catalog entry of one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ContainerDescriptor {
    pub name: String,
    pub page_size: PageSize,
    pub pages_per_extent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServiceMeta {
    pub format_version: u32,
    pub containers: BTreeMap<ContainerId, ContainerDescriptor>,
    pub next_container_id: ContainerId,
    pub encryption: EncryptionMeta,
}

impl ServiceMeta {
    pub(crate) fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            containers: BTreeMap::new(),
            next_container_id: 1,
            encryption: EncryptionMeta::default(),
        }
    }

    /// Read the service file, or None for a new database
    pub(crate) fn load(data_dir: &Path) -> Result<Option<Self>> {
        let path = data_dir.join(SERVICE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        if raw.len() < HEADER_SIZE || &raw[0..4] != MAGIC {
            return Err(VaultError::Serialization(format!(
                "{} is not a service file",
                path.display()
            )));
        }
        let crc = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let len = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
        let payload = raw
            .get(HEADER_SIZE..HEADER_SIZE + len)
            .ok_or_else(|| VaultError::Serialization("service file is truncated".to_string()))?;
        if crc32fast::hash(payload) != crc {
            return Err(VaultError::Serialization(
                "service file checksum mismatch".to_string(),
            ));
        }
        let meta: ServiceMeta = bincode::deserialize(payload)?;
        if meta.format_version != FORMAT_VERSION {
            return Err(VaultError::Serialization(format!(
                "unsupported service file version {}",
                meta.format_version
            )));
        }
        Ok(Some(meta))
    }

    /// Atomically replace the service file
    pub(crate) fn save(&self, data_dir: &Path) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let mut raw = Vec::with_capacity(HEADER_SIZE + payload.len());
        raw.extend_from_slice(MAGIC);
        raw.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&payload);

        let path = data_dir.join(SERVICE_FILE);
        let tmp = data_dir.join(format!("{SERVICE_FILE}.tmp"));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(data_dir)?;
        debug!(containers = self.containers.len(), "service file saved");
        Ok(())
    }

    pub(crate) fn container_by_name(&self, name: &str) -> Option<ContainerId> {
        self.containers
            .iter()
            .find(|(_, desc)| desc.name == name)
            .map(|(id, _)| *id)
    }
}
