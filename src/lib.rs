//! # PageVault
//!
//! A page-oriented storage engine with:
//! - Fixed-size pages grouped into containers, tracked by allocation extents
//! - Write-ahead logging with checkpoints and redo/undo crash recovery
//! - Row and container locking with timeouts and deadlock detection
//! - Online space reclamation (purge, defragment, truncate)
//! - Crash-safe boot-time encryption, re-keying and decryption
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Database                             │
//! │        (transactions, row operations, compress, boot)        │
//! └──────┬──────────────────┬──────────────────┬────────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌─────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ LockManager │   │   Container   │   │  LogManager  │
//! │  (IS/IX/S/X)│   │ (alloc, rows) │   │ (WAL, ctrl)  │
//! └─────────────┘   └───────┬───────┘   └──────┬───────┘
//!                           │                  │
//!                           ▼                  ▼
//!                   ┌───────────────┐   ┌──────────────┐
//!                   │ ContainerFile │   │   Recovery   │
//!                   │ (page frames) │   │ (redo/undo)  │
//!                   └───────────────┘   └──────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod page;
pub mod store;
pub mod wal;
pub mod txn;
pub mod container;
pub mod compress;
pub mod encryption;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, VaultError};
pub use config::{Config, ConfigBuilder, WalSyncStrategy};
pub use compress::CompressOptions;
pub use container::{Row, SpaceInfo};
pub use encryption::{
    BootRequest, CrashAt, CrashPoint, Credential, EncryptionChange, EncryptionState,
    FaultInjector,
};
pub use engine::Database;
pub use page::PageSize;
pub use txn::{LockInfo, LockMode, LockResource};
pub use wal::Lsn;

// =============================================================================
// Identifiers
// =============================================================================

/// Container identifier, assigned at creation
pub type ContainerId = u32;

/// Page number within a container
pub type PageNumber = u64;

/// Transaction identifier
pub type TxnId = u64;

/// Location of a row's head piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub container: ContainerId,
    pub page: PageNumber,
    pub row: u16,
}

impl RowId {
    pub fn new(container: ContainerId, page: PageNumber, row: u16) -> Self {
        Self {
            container,
            page,
            row,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.container, self.page, self.row)
    }
}

// =============================================================================
// Version Info
// =============================================================================

/// Current version of PageVault
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
