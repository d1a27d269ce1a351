//! Store Module
//!
//! Everything that touches the data directory outside of the log.
//!
//! ## Responsibilities
//! - Whole-frame reads and writes of container pages (`ContainerFile`)
//! - Encryption and checksumming of frames on their way to disk
//! - The service file: container catalog and encryption markers
//!
//! ## Directory Layout
//! ```text
//! {data_dir}/
//!   ├── service.dat            catalog + encryption markers (replaced atomically)
//!   ├── seg0/
//!   │     ├── c{id}.dat        container pages
//!   │     └── c{id}.dat.new    shadow written while re-keying
//!   └── log/
//!         ├── log{n}.dat
//!         └── log.ctrl
//! ```

mod file;
mod service;

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::ContainerId;

pub use file::{ContainerFile, FRAME_EPOCH_AT};
pub(crate) use service::{ContainerDescriptor, ServiceMeta};

/// Container files directory
pub const SEG_DIR: &str = "seg0";

/// Log files directory
pub const LOG_DIR: &str = "log";

/// Service file name
pub const SERVICE_FILE: &str = "service.dat";

/// Path of a container's file
pub fn container_path(data_dir: &Path, id: ContainerId) -> PathBuf {
    data_dir.join(SEG_DIR).join(format!("c{id}.dat"))
}

/// Path of a container's shadow file during an encryption rewrite
pub fn shadow_path(data_dir: &Path, id: ContainerId) -> PathBuf {
    data_dir.join(SEG_DIR).join(format!("c{id}.dat.new"))
}

/// Make renames and file creations in `dir` durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    // Directories cannot be opened for syncing on every platform
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}
