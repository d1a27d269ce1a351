//! Encryption Module
//!
//! At-rest page encryption and the boot-time rewrite controller.
//!
//! ## Responsibilities
//! - Credentials and the key slots they unlock
//! - Page body encryption (`PageCipher`)
//! - The durable encryption markers kept in the service file
//! - Encrypting, re-keying and decrypting every container at boot, with
//!   crash points that tests can fire through a `FaultInjector`
//!
//! ## Transition Phases
//! ```text
//! Begun ──► PagesRewritten ──► Switched ──► Checkpointed ──► OldKeyDeleted ──► (cleared)
//!   └──── roll back on restart ─────┘└────────── roll forward on restart ──────────┘
//! ```
//! The switch is a single atomic replace of the service file. Before it the
//! old key is authoritative and shadow files are discarded; from it on the
//! new key is authoritative and shadow files are installed.

mod cipher;
pub(crate) mod controller;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

pub use cipher::{KeySlot, PageCipher, KEY_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE};

// =============================================================================
// Credentials and Boot Requests
// =============================================================================

/// A secret supplied at boot. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Requested change of the database's encryption
#[derive(Debug, Clone)]
pub enum EncryptionChange {
    /// Encrypt a plaintext database under a new credential
    Encrypt(Credential),
    /// Re-key an encrypted database under a new credential
    Reencrypt(Credential),
    /// Turn an encrypted database back into plaintext
    Decrypt,
}

impl EncryptionChange {
    pub(crate) fn kind(&self) -> TransitionKind {
        match self {
            EncryptionChange::Encrypt(_) => TransitionKind::Encrypt,
            EncryptionChange::Reencrypt(_) => TransitionKind::Reencrypt,
            EncryptionChange::Decrypt => TransitionKind::Decrypt,
        }
    }
}

/// What a caller hands to `Database::boot`
#[derive(Debug, Clone, Default)]
pub struct BootRequest {
    /// Credential of the currently active key, if the database is encrypted
    pub credential: Option<Credential>,
    /// Encryption change to perform once the database is open
    pub change: Option<EncryptionChange>,
}

impl BootRequest {
    /// Boot a plaintext database
    pub fn new() -> Self {
        Self::default()
    }

    /// Boot an encrypted database
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Some(credential),
            change: None,
        }
    }

    /// Request an encryption change during this boot
    pub fn change(mut self, change: EncryptionChange) -> Self {
        self.change = Some(change);
        self
    }
}

// =============================================================================
// Durable State
// =============================================================================

/// Observable encryption state of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionState {
    Plain,
    Encrypting,
    Encrypted,
    ReEncrypting,
    Decrypting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum TransitionKind {
    Encrypt,
    Reencrypt,
    Decrypt,
}

/// Last durably completed step of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) enum TransitionPhase {
    Begun,
    PagesRewritten,
    Switched,
    Checkpointed,
    OldKeyDeleted,
}

impl TransitionPhase {
    /// Whether the new key has become authoritative
    pub(crate) fn is_switched(self) -> bool {
        self >= TransitionPhase::Switched
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Transition {
    pub kind: TransitionKind,
    pub phase: TransitionPhase,
    /// Key the transition moves to (None when decrypting)
    pub target: Option<KeySlot>,
    /// Key the transition moves away from, kept until the old key is deleted
    pub previous: Option<KeySlot>,
}

/// Encryption markers persisted in the service file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct EncryptionMeta {
    /// Key that currently encrypts the container files
    pub active: Option<KeySlot>,
    /// Highest key epoch ever issued
    pub last_epoch: u32,
    pub transition: Option<Transition>,
}

impl EncryptionMeta {
    pub(crate) fn state(&self) -> EncryptionState {
        match (&self.transition, &self.active) {
            (Some(t), _) => match t.kind {
                TransitionKind::Encrypt => EncryptionState::Encrypting,
                TransitionKind::Reencrypt => EncryptionState::ReEncrypting,
                TransitionKind::Decrypt => EncryptionState::Decrypting,
            },
            (None, Some(_)) => EncryptionState::Encrypted,
            (None, None) => EncryptionState::Plain,
        }
    }

    /// Unlock the active key with the boot credential
    pub(crate) fn unlock(&self, credential: Option<&Credential>) -> Result<Option<PageCipher>> {
        match (&self.active, credential) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(VaultError::CredentialMismatch),
            (Some(_), None) => Err(VaultError::CredentialRequired),
            (Some(slot), Some(credential)) => slot.unlock(credential).map(Some),
        }
    }
}

// =============================================================================
// Crash Points
// =============================================================================

/// Named locations in the rewrite sequence where a crash can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Both keys are durable, no page has been touched
    AfterBegin,
    /// The first container has been rewritten, others have not
    MidRewrite,
    /// Every container has a complete shadow file
    AfterRewrite,
    /// The new key is active, shadow files are not yet installed
    AfterSwitch,
    /// Shadow files are installed and a checkpoint was taken
    AfterCheckpoint,
    /// The old key material is gone, cleanup has not run
    AfterOldKeyDeleted,
}

impl CrashPoint {
    pub const ALL: [CrashPoint; 6] = [
        CrashPoint::AfterBegin,
        CrashPoint::MidRewrite,
        CrashPoint::AfterRewrite,
        CrashPoint::AfterSwitch,
        CrashPoint::AfterCheckpoint,
        CrashPoint::AfterOldKeyDeleted,
    ];

    /// Whether a crash here leaves the new key authoritative after restart
    pub fn is_after_switch(self) -> bool {
        matches!(
            self,
            CrashPoint::AfterSwitch | CrashPoint::AfterCheckpoint | CrashPoint::AfterOldKeyDeleted
        )
    }
}

/// Decides whether execution stops at a crash point
pub trait FaultInjector: Send + Sync {
    /// Return `Err(VaultError::InjectedCrash(point))` to simulate a crash
    fn check(&self, point: CrashPoint) -> Result<()>;

    /// Called before every log sync; an error stands in for a failed fsync
    fn log_sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Crashes at exactly one point
#[derive(Debug, Clone, Copy)]
pub struct CrashAt(pub CrashPoint);

impl FaultInjector for CrashAt {
    fn check(&self, point: CrashPoint) -> Result<()> {
        if point == self.0 {
            Err(VaultError::InjectedCrash(point))
        } else {
            Ok(())
        }
    }
}
