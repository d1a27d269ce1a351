//! Encryption Rewrite Controller
//!
//! Moves every container from one key (or plaintext) to another at boot.
//!
//! ## Sequence
//! 1. Begin: create the target key, persist both keys, log the start
//! 2. Rewrite: checkpoint, then copy every page of every container into a
//!    shadow file under the target key
//! 3. Switch: make the target key active in one service file replace
//! 4. Install: rename shadow files over the containers, checkpoint
//! 5. Delete the old key, then clear the transition
//!
//! A restart before step 3 finished rolls back (shadows are deleted); a
//! restart after it rolls forward (shadows are installed). Crash points sit
//! between the steps and fire through the configured `FaultInjector`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{
    CrashPoint, EncryptionChange, EncryptionMeta, EncryptionState, KeySlot, PageCipher, Transition,
    TransitionPhase,
};
use crate::container::Container;
use crate::error::{Result, VaultError};
use crate::store::{container_path, shadow_path, sync_dir, ContainerFile, ServiceMeta, SEG_DIR};
use crate::wal::{LogBody, LogManager, LogRecord};

/// What the controller needs from an open database
pub(crate) trait TransitionHost {
    fn data_dir(&self) -> &Path;
    fn log(&self) -> &LogManager;
    fn service(&self) -> &Mutex<ServiceMeta>;
    fn containers(&self) -> Vec<Arc<Container>>;
    /// Flush every dirty page and record a checkpoint
    fn checkpoint(&self) -> Result<()>;
    /// Stop here if a crash is injected at `point`
    fn crash_point(&self, point: CrashPoint) -> Result<()>;
    /// Key newly created containers are written with
    fn set_active_cipher(&self, cipher: Option<Arc<PageCipher>>);
}

/// Injected crashes pass through untouched so callers see where they fired
fn wrap(step: &'static str) -> impl FnOnce(VaultError) -> VaultError {
    move |err| match err {
        err @ VaultError::InjectedCrash(_) => err,
        err => VaultError::EncryptionTransition {
            step,
            source: Box::new(err),
        },
    }
}

fn check_change(meta: &EncryptionMeta, change: &EncryptionChange) -> Result<()> {
    let state = meta.state();
    let allowed = match change {
        EncryptionChange::Encrypt(_) => state == EncryptionState::Plain,
        EncryptionChange::Reencrypt(_) | EncryptionChange::Decrypt => {
            state == EncryptionState::Encrypted
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(VaultError::InvalidTransition(format!(
            "cannot {:?} a database that is {state:?}",
            change.kind()
        )))
    }
}

/// Persist a new phase, optionally editing the markers first
fn advance(
    host: &dyn TransitionHost,
    phase: TransitionPhase,
    edit: impl FnOnce(&mut EncryptionMeta),
) -> Result<()> {
    let mut meta = host.service().lock();
    edit(&mut meta.encryption);
    if let Some(transition) = meta.encryption.transition.as_mut() {
        transition.phase = phase;
    }
    meta.save(host.data_dir())
}

fn log_marker(log: &LogManager, body: LogBody) -> Result<()> {
    log.append(&LogRecord::new(0, None, body))?;
    log.sync()
}

// =============================================================================
// Rewrite
// =============================================================================

/// Run `change` against an open, recovered database
pub(crate) fn run(host: &dyn TransitionHost, change: &EncryptionChange) -> Result<()> {
    let kind = change.kind();
    let (previous, epoch) = {
        let meta = host.service().lock();
        check_change(&meta.encryption, change)?;
        (meta.encryption.active.clone(), meta.encryption.last_epoch + 1)
    };
    info!(?kind, "encryption transition starting");

    // Step 1: Begin
    let (target, cipher) = match change {
        EncryptionChange::Encrypt(credential) | EncryptionChange::Reencrypt(credential) => {
            let (slot, cipher) = KeySlot::create(credential, epoch).map_err(wrap("begin"))?;
            (Some(slot), Some(Arc::new(cipher)))
        }
        EncryptionChange::Decrypt => (None, None),
    };
    let target_epoch = target.as_ref().map_or(0, |slot| slot.epoch);
    {
        let mut meta = host.service().lock();
        if target.is_some() {
            meta.encryption.last_epoch = epoch;
        }
        meta.encryption.transition = Some(Transition {
            kind,
            phase: TransitionPhase::Begun,
            target: target.clone(),
            previous,
        });
        meta.save(host.data_dir()).map_err(wrap("begin"))?;
    }
    log_marker(host.log(), LogBody::EncryptionBegin { epoch: target_epoch }).map_err(wrap("begin"))?;
    host.crash_point(CrashPoint::AfterBegin)?;

    // Step 2: Rewrite every container into its shadow file
    host.checkpoint().map_err(wrap("rewrite"))?;
    let containers = host.containers();
    for (index, container) in containers.iter().enumerate() {
        rewrite_container(host.data_dir(), container, cipher.as_deref()).map_err(wrap("rewrite"))?;
        log_marker(
            host.log(),
            LogBody::ContainerRewritten {
                container: container.id(),
            },
        )
        .map_err(wrap("rewrite"))?;
        if index == 0 {
            host.crash_point(CrashPoint::MidRewrite)?;
        }
    }
    sync_dir(&host.data_dir().join(SEG_DIR)).map_err(wrap("rewrite"))?;
    advance(host, TransitionPhase::PagesRewritten, |_| {}).map_err(wrap("rewrite"))?;
    host.crash_point(CrashPoint::AfterRewrite)?;

    // Step 3: Switch
    advance(host, TransitionPhase::Switched, |meta| meta.active = target.clone())
        .map_err(wrap("switch"))?;
    log_marker(host.log(), LogBody::EncryptionSwitch { epoch: target_epoch }).map_err(wrap("switch"))?;
    host.crash_point(CrashPoint::AfterSwitch)?;

    // Step 4: Install the shadows and checkpoint under the new key
    for container in &containers {
        install_container(host.data_dir(), container, cipher.clone()).map_err(wrap("install"))?;
    }
    sync_dir(&host.data_dir().join(SEG_DIR)).map_err(wrap("install"))?;
    host.set_active_cipher(cipher);
    host.checkpoint().map_err(wrap("checkpoint"))?;
    advance(host, TransitionPhase::Checkpointed, |_| {}).map_err(wrap("checkpoint"))?;
    host.crash_point(CrashPoint::AfterCheckpoint)?;

    // Step 5: Drop the old key, then the transition itself
    advance(host, TransitionPhase::OldKeyDeleted, |meta| {
        if let Some(transition) = meta.transition.as_mut() {
            transition.previous = None;
        }
    })
    .map_err(wrap("delete old key"))?;
    host.crash_point(CrashPoint::AfterOldKeyDeleted)?;

    {
        let mut meta = host.service().lock();
        meta.encryption.transition = None;
        meta.save(host.data_dir()).map_err(wrap("cleanup"))?;
    }
    info!(?kind, epoch = target_epoch, "encryption transition complete");
    Ok(())
}

/// Copy every stored page of `container` into its shadow file
fn rewrite_container(data_dir: &Path, container: &Container, cipher: Option<&PageCipher>) -> Result<()> {
    let mut state = container.latch();
    let old_cipher = state.cipher().cloned();
    let pages = state.file_page_count()?;
    let mut shadow = ContainerFile::create(container.id(), &shadow_path(data_dir, container.id()), state.page_size())?;

    let mut written = 0u64;
    for page in 0..pages {
        let buffer = state.file_mut().read_page(page, old_cipher.as_deref())?;
        if buffer.as_bytes().iter().all(|b| *b == 0) {
            continue;
        }
        shadow.write_page(page, &buffer, cipher)?;
        written += 1;
    }
    shadow.set_page_count(pages)?;
    shadow.sync()?;
    info!(container = container.id(), pages, written, "container rewritten");
    Ok(())
}

fn install_container(data_dir: &Path, container: &Container, cipher: Option<Arc<PageCipher>>) -> Result<()> {
    let path = container_path(data_dir, container.id());
    fs::rename(shadow_path(data_dir, container.id()), &path)?;
    let file = ContainerFile::open(container.id(), &path, container.page_size())?;
    container.latch().install(file, cipher);
    Ok(())
}

// =============================================================================
// Restart
// =============================================================================

/// Finish or undo a transition a previous run left behind. Runs before any
/// container is opened.
pub(crate) fn resolve_pending(data_dir: &Path, meta: &mut ServiceMeta) -> Result<()> {
    let Some(transition) = meta.encryption.transition.clone() else {
        return Ok(());
    };

    if transition.phase.is_switched() {
        warn!(kind = ?transition.kind, phase = ?transition.phase, "rolling encryption transition forward");
        roll_forward(data_dir, meta).map_err(wrap("roll forward"))?;
    } else {
        warn!(kind = ?transition.kind, phase = ?transition.phase, "rolling encryption transition back");
        for id in meta.containers.keys() {
            let shadow = shadow_path(data_dir, *id);
            if shadow.exists() {
                fs::remove_file(&shadow).map_err(|e| wrap("roll back")(e.into()))?;
            }
        }
        sync_dir(&data_dir.join(SEG_DIR))?;
    }

    meta.encryption.transition = None;
    meta.save(data_dir)?;
    info!(state = ?meta.encryption.state(), "encryption transition resolved");
    Ok(())
}

/// Install remaining shadows and check that every container now carries
/// the active key
fn roll_forward(data_dir: &Path, meta: &ServiceMeta) -> Result<()> {
    let expected = meta.encryption.active.as_ref().map_or(0, |slot| slot.epoch);
    for (id, descriptor) in &meta.containers {
        let path = container_path(data_dir, *id);
        let shadow = shadow_path(data_dir, *id);
        if shadow.exists() {
            fs::rename(&shadow, &path)?;
        }
        if !path.exists() {
            continue;
        }
        let mut file = ContainerFile::open(*id, &path, descriptor.page_size)?;
        if let Some(epoch) = file.frame_epoch(0)? {
            if epoch != expected {
                return Err(VaultError::PageCorrupt {
                    container: *id,
                    page: 0,
                    reason: format!("written with key epoch {epoch}, expected {expected}"),
                });
            }
        }
    }
    sync_dir(&data_dir.join(SEG_DIR))
}
