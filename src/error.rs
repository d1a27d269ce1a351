//! Error types for PageVault
//!
//! Provides a unified error type for all operations. Variants follow the
//! engine's failure taxonomy so callers can match on the failure class
//! instead of inspecting messages.

use thiserror::Error;

use crate::encryption::CrashPoint;
use crate::wal::Lsn;
use crate::{ContainerId, RowId, TxnId};

/// Result type alias using VaultError
pub type Result<T> = std::result::Result<T, VaultError>;

/// Unified error type for PageVault operations
#[derive(Debug, Error)]
pub enum VaultError {
    // -------------------------------------------------------------------------
    // I/O Faults
    // -------------------------------------------------------------------------
    #[error("I/O fault: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {page} of container {container} is corrupt: {reason}")]
    PageCorrupt {
        container: ContainerId,
        page: u64,
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Space Errors
    // -------------------------------------------------------------------------
    #[error("no space left in container {container}: {reason}")]
    SpaceExhausted { container: ContainerId, reason: String },

    // -------------------------------------------------------------------------
    // Locking Errors
    // -------------------------------------------------------------------------
    #[error("transaction {txn} timed out waiting for lock on {resource}")]
    LockTimeout { txn: TxnId, resource: String },

    #[error("transaction {txn} chosen as deadlock victim")]
    Deadlock { txn: TxnId },

    // -------------------------------------------------------------------------
    // Log / Recovery Errors
    // -------------------------------------------------------------------------
    #[error("log corruption detected: {0}")]
    LogCorruption(String),

    #[error("log file number {file_number} exceeds the maximum {max}")]
    LogExhausted { file_number: u64, max: u32 },

    #[error("recovery cannot apply log record {lsn}: {reason}")]
    RecoveryInconsistent { lsn: Lsn, reason: String },

    #[error("database is unusable after a fatal error: {0}")]
    DatabaseFatal(String),

    // -------------------------------------------------------------------------
    // Encryption Errors
    // -------------------------------------------------------------------------
    #[error("encryption rewrite failed during {step}")]
    EncryptionTransition {
        step: &'static str,
        #[source]
        source: Box<VaultError>,
    },

    #[error("the supplied credential does not match the database key")]
    CredentialMismatch,

    #[error("database is encrypted and no credential was supplied")]
    CredentialRequired,

    #[error("invalid encryption transition: {0}")]
    InvalidTransition(String),

    #[error("injected crash at {0:?}")]
    InjectedCrash(CrashPoint),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("unknown container {0}")]
    UnknownContainer(ContainerId),

    #[error("container {0:?} already exists")]
    ContainerExists(String),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxnId),

    #[error("transaction {0} is not active")]
    TransactionNotActive(TxnId),

    #[error("row {0} not found")]
    RowNotFound(RowId),

    #[error("configuration error: {0}")]
    Config(String),
}

impl VaultError {
    /// Lock timeouts and deadlocks can be retried in a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::LockTimeout { .. } | VaultError::Deadlock { .. })
    }

    /// Errors after which the database refuses further work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VaultError::LogExhausted { .. }
                | VaultError::RecoveryInconsistent { .. }
                | VaultError::DatabaseFatal(_)
        )
    }
}

impl From<bincode::Error> for VaultError {
    fn from(err: bincode::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}
