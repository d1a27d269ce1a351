//! Engine Module
//!
//! The database handle that coordinates all components.
//!
//! ## Responsibilities
//! - Boot: resolve interrupted encryption transitions, unlock the key, open
//!   the log and containers, run recovery, checkpoint
//! - Transactions: begin, commit, abort (runtime rollback through the undo list)
//! - Row operations under container and row locks
//! - Compress phases, each in its own internal transaction
//! - Checkpoints (explicit and every `checkpoint_interval` log bytes)
//! - Post-commit reclaim of pages emptied by committed deletes
//!
//! ## Boot Sequence
//! ```text
//! service.dat ──► resolve transition ──► unlock key ──► scan log ──► open containers
//!                                                                       │
//!      daemon ◄── encryption change ◄── checkpoint + shrink ◄── recovery ┘
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::compress::{self, CompressContext, CompressOptions};
use crate::config::Config;
use crate::container::{Container, ContainerState, Row, SpaceInfo};
use crate::encryption::controller::{self, TransitionHost};
use crate::encryption::{BootRequest, CrashPoint, EncryptionState, PageCipher};
use crate::error::{Result, VaultError};
use crate::page::{AllocPage, PageOp, PageSize};
use crate::store::{
    container_path, sync_dir, ContainerDescriptor, ContainerFile, ServiceMeta, LOG_DIR, SEG_DIR,
};
use crate::txn::post_commit::{PostCommitDaemon, PostCommitTask, PostCommitWork};
use crate::txn::{
    LockGrant, LockInfo, LockManager, LockMode, LockResource, TransactionTable, TxnLogger,
};
use crate::wal::{
    LogBody, LogControl, LogManager, LogOptions, LogReader, LogRecord, LogWriter, Lsn, Recovery,
    RecoveryTarget,
};
use crate::{ContainerId, PageNumber, RowId, TxnId};

/// An open database
///
/// Cheap to share across threads by reference; every method takes `&self`.
/// Dropping the handle stops the post-commit daemon without a checkpoint,
/// which is indistinguishable from a crash; `close` checkpoints first.
pub struct Database {
    inner: Arc<DatabaseInner>,
}

/// State shared with the post-commit daemon
///
/// ## Concurrency:
/// - `service`: Mutex; the catalog and encryption markers change rarely and
///   are saved to disk while it is held
/// - `containers`: RwLock over the open containers; each container has its
///   own latch
/// - `checkpoint_lock`: serializes checkpoints
/// - Lock order: lock manager (no latch held), container latch, transaction
///   table, log writer
pub(crate) struct DatabaseInner {
    config: Config,
    data_dir: PathBuf,
    service: Mutex<ServiceMeta>,
    containers: RwLock<BTreeMap<ContainerId, Arc<Container>>>,
    /// Key new containers are written with
    cipher: RwLock<Option<Arc<PageCipher>>>,
    log: LogManager,
    txns: TransactionTable,
    locks: LockManager,
    daemon: PostCommitDaemon,
    checkpoint_lock: Mutex<()>,
}

/// Whether a failed operation rolls back its whole transaction
fn aborts_transaction(err: &VaultError) -> bool {
    err.is_retryable()
        || matches!(
            err,
            VaultError::SpaceExhausted { .. } | VaultError::Io(_) | VaultError::PageCorrupt { .. }
        )
}

impl Database {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open or create the database in `config.data_dir`
    pub fn boot(config: Config, request: BootRequest) -> Result<Self> {
        // Step 1: Directories
        config.validate()?;
        let data_dir = config.data_dir.clone();
        let log_dir = data_dir.join(LOG_DIR);
        fs::create_dir_all(data_dir.join(SEG_DIR))?;
        fs::create_dir_all(&log_dir)?;

        // Step 2: Catalog and encryption markers
        let mut service = match ServiceMeta::load(&data_dir)? {
            Some(service) => service,
            None => {
                info!(dir = %data_dir.display(), "creating new database");
                let service = ServiceMeta::new();
                service.save(&data_dir)?;
                service
            }
        };

        // Step 3: Finish or undo an interrupted encryption transition
        controller::resolve_pending(&data_dir, &mut service)?;

        // Step 4: Unlock the active key
        let cipher = service
            .encryption
            .unlock(request.credential.as_ref())?
            .map(Arc::new);

        // Step 5: Open the log where the last checkpoint says recovery starts
        let control = LogControl::load(&log_dir)?;
        let scan = LogReader::scan(&log_dir, control.scan_start)?;
        if scan.truncated_bytes > 0 {
            warn!(bytes = scan.truncated_bytes, "torn log tail removed");
        }
        let writer = LogWriter::open(&log_dir, scan.end, LogOptions::from(&config))?;
        let log = LogManager::new(&log_dir, writer).with_faults(config.faults.clone());

        // Step 6: Open every catalogued container
        let mut containers = BTreeMap::new();
        for (id, descriptor) in &service.containers {
            let path = container_path(&data_dir, *id);
            let file = if path.exists() {
                ContainerFile::open(*id, &path, descriptor.page_size)?
            } else {
                warn!(container = id, "container file missing, recreating it empty");
                ContainerFile::create(*id, &path, descriptor.page_size)?
            };
            let state = ContainerState::new(
                file,
                descriptor.pages_per_extent,
                config.max_container_pages,
                config.page_cache_pages,
                cipher.clone(),
            );
            containers.insert(*id, Arc::new(Container::new(&descriptor.name, state)));
        }

        // Step 7: Recovery
        let report = Recovery::run(
            &scan,
            control.checkpoint,
            &log,
            &mut RecoveryContainers {
                containers: &containers,
            },
        )?;

        let inner = Arc::new(DatabaseInner {
            txns: TransactionTable::new(report.next_txn),
            config,
            data_dir,
            service: Mutex::new(service),
            containers: RwLock::new(containers),
            cipher: RwLock::new(cipher),
            log,
            locks: LockManager::new(),
            daemon: PostCommitDaemon::new(),
            checkpoint_lock: Mutex::new(()),
        });

        // Step 8: Containers whose creation never finished
        for container in inner.container_list() {
            let formatted = container.latch().is_formatted()?;
            if !formatted {
                warn!(container = container.id(), "formatting unfinished container");
                inner.format_container(&container)?;
            }
        }

        // Step 9: Checkpoint, then drop pages a truncate released
        inner.checkpoint()?;
        for container in inner.container_list() {
            container.latch().shrink_file()?;
        }

        // Step 10: Requested encryption change
        if let Some(change) = &request.change {
            controller::run(inner.as_ref(), change)?;
        }

        // Step 11: Background work
        inner.daemon.start(Arc::downgrade(&inner))?;

        info!(
            dir = %inner.data_dir.display(),
            containers = inner.containers.read().len(),
            redone = report.redone,
            undone = report.undone,
            state = ?inner.encryption_state(),
            "database booted"
        );
        Ok(Self { inner })
    }

    /// Stop background work and checkpoint
    pub fn close(self) -> Result<()> {
        self.inner.daemon.shutdown();
        if self.inner.log.check_usable().is_ok() {
            self.inner.checkpoint()?;
        }
        info!(dir = %self.inner.data_dir.display(), "database closed");
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Create an empty container; `None` uses the configured page size
    pub fn create_container(&self, name: &str, page_size: Option<PageSize>) -> Result<ContainerId> {
        self.inner.create_container(name, page_size)
    }

    pub fn container_id(&self, name: &str) -> Option<ContainerId> {
        self.inner.service.lock().container_by_name(name)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin(&self) -> Result<TxnId> {
        self.inner.log.check_usable()?;
        Ok(self.inner.txns.begin(false))
    }

    /// Make the transaction durable and release its locks
    pub fn commit(&self, txn: TxnId) -> Result<()> {
        self.inner.txns.require_active(txn)?;
        self.inner.commit_txn(txn)
    }

    /// Roll back every change of the transaction
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        self.inner.txns.require_active(txn)?;
        self.inner.rollback(txn)
    }

    // =========================================================================
    // Row Operations
    // =========================================================================

    pub fn insert(&self, txn: TxnId, container: ContainerId, row: Row) -> Result<RowId> {
        let inner = &self.inner;
        inner.with_txn(txn, |log| {
            let container = inner.container(container)?;
            inner.lock(txn, LockResource::Container(container.id()), LockMode::IntentExclusive)?;
            let mut state = container.latch();
            let row_id = state.insert_row(log, &row)?;
            // Never waits: nobody else has seen this row id
            inner
                .locks
                .lock(txn, LockResource::Row(row_id), LockMode::Exclusive, Duration::ZERO)?;
            debug!(txn, %row_id, "row inserted");
            Ok(row_id)
        })
    }

    /// Replace a row's columns; the row keeps its id
    pub fn update(&self, txn: TxnId, row_id: RowId, row: Row) -> Result<()> {
        let inner = &self.inner;
        inner.with_txn(txn, |log| {
            let container = inner.container(row_id.container)?;
            inner.lock(txn, LockResource::Container(row_id.container), LockMode::IntentExclusive)?;
            inner.lock(txn, LockResource::Row(row_id), LockMode::Exclusive)?;

            // Old pieces become garbage on update; hold them so purge leaves
            // them alone until this transaction ends
            let chain = container.latch().row_chain(row_id)?;
            for piece in chain {
                let resource = LockResource::Row(RowId::new(row_id.container, piece.page, piece.row));
                inner
                    .locks
                    .lock(txn, resource, LockMode::Exclusive, Duration::ZERO)?;
            }

            container.latch().update_row(log, row_id, &row)?;
            debug!(txn, %row_id, "row updated");
            Ok(())
        })
    }

    pub fn delete(&self, txn: TxnId, row_id: RowId) -> Result<()> {
        let inner = &self.inner;
        inner.with_txn(txn, |log| {
            let container = inner.container(row_id.container)?;
            inner.lock(txn, LockResource::Container(row_id.container), LockMode::IntentExclusive)?;
            inner.lock(txn, LockResource::Row(row_id), LockMode::Exclusive)?;
            container.latch().delete_row(log, row_id)?;
            debug!(txn, %row_id, "row deleted");
            Ok(())
        })
    }

    /// Read one row under an instant shared lock
    pub fn fetch(&self, txn: TxnId, row_id: RowId) -> Result<Row> {
        let inner = &self.inner;
        inner.with_txn(txn, |_| {
            let container = inner.container(row_id.container)?;
            inner.lock(txn, LockResource::Container(row_id.container), LockMode::IntentShared)?;
            inner.read_row(txn, &container, row_id)
        })
    }

    /// Every live row of a container in page order. Rows deleted while the
    /// scan waits for their lock are skipped.
    pub fn scan(&self, txn: TxnId, container: ContainerId) -> Result<Vec<(RowId, Row)>> {
        let inner = &self.inner;
        inner.with_txn(txn, |_| {
            let container = inner.container(container)?;
            inner.lock(txn, LockResource::Container(container.id()), LockMode::IntentShared)?;
            let row_ids = container.latch().live_rows()?;
            let mut rows = Vec::with_capacity(row_ids.len());
            for row_id in row_ids {
                match inner.read_row(txn, &container, row_id) {
                    Ok(row) => rows.push((row_id, row)),
                    Err(VaultError::RowNotFound(_)) => continue,
                    Err(err) => return Err(err),
                }
            }
            Ok(rows)
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Run the selected compress phases, each in its own transaction
    pub fn run_compress(&self, container: ContainerId, options: CompressOptions) -> Result<SpaceInfo> {
        self.inner.run_compress(container, options)
    }

    pub fn space_info(&self, container: ContainerId) -> Result<SpaceInfo> {
        self.inner.container(container)?.latch().space_info()
    }

    /// Pages the container currently holds in its page cache
    pub fn cached_pages(&self, container: ContainerId) -> Result<usize> {
        Ok(self.inner.container(container)?.latch().cached_pages())
    }

    /// Flush every dirty page and record a checkpoint
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint()
    }

    /// Block until every queued post-commit task has run
    pub fn wait_for_post_commit(&self) -> Result<()> {
        self.inner.daemon.wait_idle()
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Granted and waiting locks
    pub fn lock_table(&self) -> Vec<LockInfo> {
        self.inner.locks.lock_table()
    }

    pub fn encryption_state(&self) -> EncryptionState {
        self.inner.encryption_state()
    }

    /// Verify extent counters, page layouts and the control row
    pub fn check_consistency(&self, container: ContainerId) -> Result<()> {
        self.inner.container(container)?.latch().check_consistency()
    }

    /// Number of transactions in flight, internal ones included
    pub fn active_transactions(&self) -> usize {
        self.inner.txns.active_count(true)
    }

    pub fn end_lsn(&self) -> Lsn {
        self.inner.log.end_lsn()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.daemon.shutdown();
    }
}

// =============================================================================
// Internals
// =============================================================================

impl DatabaseInner {
    fn container(&self, id: ContainerId) -> Result<Arc<Container>> {
        self.containers
            .read()
            .get(&id)
            .cloned()
            .ok_or(VaultError::UnknownContainer(id))
    }

    fn container_list(&self) -> Vec<Arc<Container>> {
        self.containers.read().values().cloned().collect()
    }

    fn encryption_state(&self) -> EncryptionState {
        self.service.lock().encryption.state()
    }

    fn lock(&self, txn: TxnId, resource: LockResource, mode: LockMode) -> Result<LockGrant> {
        self.locks
            .lock(txn, resource, mode, self.config.lock_timeout())
            .map_err(VaultError::from)
    }

    fn read_row(&self, txn: TxnId, container: &Container, row_id: RowId) -> Result<Row> {
        let resource = LockResource::Row(row_id);
        let grant = self.lock(txn, resource, LockMode::Shared)?;
        let row = container.latch().fetch_row(row_id);
        if grant == LockGrant::Granted {
            self.locks.release(txn, resource, LockMode::Shared);
        }
        row
    }

    /// Run a user statement; failures that leave the statement half done
    /// roll back the whole transaction
    fn with_txn<T>(&self, txn: TxnId, op: impl FnOnce(&TxnLogger<'_>) -> Result<T>) -> Result<T> {
        self.log.check_usable()?;
        self.txns.require_active(txn)?;
        let log = TxnLogger::new(&self.log, &self.txns, txn);
        let result = op(&log);
        if let Err(err) = &result {
            if aborts_transaction(err) {
                warn!(txn, error = %err, "rolling back transaction");
                if let Err(rollback_err) = self.rollback(txn) {
                    warn!(txn, error = %rollback_err, "rollback failed");
                }
            }
        }
        result
    }

    /// Run engine work in its own transaction, committed on success
    fn run_internal<T>(&self, work: impl FnOnce(TxnLogger<'_>) -> Result<T>) -> Result<T> {
        self.log.check_usable()?;
        let txn = self.txns.begin(true);
        match work(TxnLogger::new(&self.log, &self.txns, txn)) {
            Ok(value) => {
                self.commit_txn(txn)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(txn) {
                    warn!(txn, error = %rollback_err, "rollback of internal transaction failed");
                }
                Err(err)
            }
        }
    }

    fn commit_txn(&self, txn: TxnId) -> Result<()> {
        let logged = TxnLogger::new(&self.log, &self.txns, txn)
            .log_commit()
            .and_then(|lsn| match lsn {
                Some(lsn) => self.log.flush_to(lsn),
                None => Ok(()),
            });
        if let Err(err) = logged {
            // Whether the commit record is durable is unknown; the transaction
            // keeps its locks and recovery at the next boot settles it
            self.log.set_fatal(format!("commit of transaction {txn} failed: {err}"));
            warn!(txn, "commit not confirmed, transaction left in place");
            return Err(err);
        }
        self.locks.release_all(txn);
        let finished = self.txns.finish(txn).unwrap_or_default();

        debug!(txn, reclaim = finished.reclaim.len(), "transaction committed");
        for (container, page) in finished.reclaim {
            self.daemon
                .enqueue(PostCommitTask::ReclaimPage { container, page });
        }
        self.maybe_checkpoint();
        Ok(())
    }

    /// Undo the transaction's changes newest first, then end it
    fn rollback(&self, txn: TxnId) -> Result<()> {
        let log = TxnLogger::new(&self.log, &self.txns, txn);
        let result = self.txns.take_undo(txn).and_then(|undo| {
            let count = undo.len();
            for entry in undo.iter().rev() {
                self.container(entry.container)?
                    .latch()
                    .compensate(&log, entry)?;
            }
            log.log_abort()?;
            debug!(txn, undone = count, "transaction rolled back");
            Ok(())
        });
        self.locks.release_all(txn);
        self.txns.finish(txn);
        if let Err(err) = &result {
            // The pages no longer match the undo list; restart recovery finishes the job
            self.log
                .set_fatal(format!("rollback of transaction {txn} failed: {err}"));
        }
        result
    }

    // -------------------------------------------------------------------------
    // Containers
    // -------------------------------------------------------------------------

    fn create_container(&self, name: &str, page_size: Option<PageSize>) -> Result<ContainerId> {
        self.log.check_usable()?;
        let page_size = page_size.unwrap_or(self.config.default_page_size);
        let pages_per_extent = self
            .config
            .pages_per_extent
            .min(AllocPage::max_capacity(page_size));

        let id = {
            let mut service = self.service.lock();
            if service.container_by_name(name).is_some() {
                return Err(VaultError::ContainerExists(name.to_string()));
            }
            let id = service.next_container_id;
            service.next_container_id += 1;
            service.containers.insert(
                id,
                ContainerDescriptor {
                    name: name.to_string(),
                    page_size,
                    pages_per_extent,
                },
            );
            service.save(&self.data_dir)?;
            id
        };

        let file = ContainerFile::create(id, &container_path(&self.data_dir, id), page_size)?;
        sync_dir(&self.data_dir.join(SEG_DIR))?;
        let state = ContainerState::new(
            file,
            pages_per_extent,
            self.config.max_container_pages,
            self.config.page_cache_pages,
            self.cipher.read().clone(),
        );
        let container = Arc::new(Container::new(name, state));
        self.containers.write().insert(id, Arc::clone(&container));
        self.format_container(&container)?;

        info!(container = id, name, page_size = page_size.bytes(), "container created");
        Ok(id)
    }

    fn format_container(&self, container: &Container) -> Result<()> {
        self.run_internal(|log| container.latch().format_new(&log))
    }

    // -------------------------------------------------------------------------
    // Compress
    // -------------------------------------------------------------------------

    fn compress_context<'a>(&'a self, container: &'a Container, log: TxnLogger<'a>) -> CompressContext<'a> {
        CompressContext {
            container,
            locks: &self.locks,
            log,
            lock_timeout: self.config.lock_timeout(),
        }
    }

    fn run_compress(&self, id: ContainerId, options: CompressOptions) -> Result<SpaceInfo> {
        let container = self.container(id)?;
        info!(container = id, ?options, "compress starting");

        if options.purge {
            self.run_internal(|log| compress::purge(&self.compress_context(&container, log)))?;
        }
        if options.defragment {
            self.run_internal(|log| compress::defragment(&self.compress_context(&container, log)))?;
        }
        if options.truncate {
            let released =
                self.run_internal(|log| compress::release_tail(&self.compress_context(&container, log)))?;
            if !released.is_empty() {
                // Released pages are dropped at the checkpoint, then cut off
                self.checkpoint()?;
                container.latch().shrink_file()?;
            }
        }

        let info = container.latch().space_info()?;
        info!(
            container = id,
            allocated = info.allocated,
            free = info.free,
            released = info.released,
            "compress complete"
        );
        Ok(info)
    }

    // -------------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------------

    fn checkpoint(&self) -> Result<()> {
        let _guard = self.checkpoint_lock.lock();
        self.log.check_usable()?;

        // Step 1: Everything logged before here is applied to a cached page
        let redo_lsn = self.log.end_lsn();
        self.log.sync()?;

        // Step 2: Write dirty pages (each flushes the log up to its own LSN)
        let mut written = 0;
        for container in self.container_list() {
            written += container.latch().flush(&self.log)?;
        }

        // Step 3: Checkpoint record
        let active = self.txns.active_snapshot();
        let scan_start = active
            .iter()
            .map(|a| a.first_lsn)
            .min()
            .map_or(redo_lsn, |first| first.min(redo_lsn));
        let record = LogRecord::new(
            0,
            None,
            LogBody::Checkpoint {
                redo_lsn,
                active,
                next_txn: self.txns.next_id(),
            },
        );
        let lsn = self.log.append(&record)?;
        self.log.sync()?;

        // Step 4: Point recovery at it and drop older log files
        let removed = self.log.complete_checkpoint(LogControl {
            checkpoint: Some(lsn),
            scan_start,
        })?;
        info!(%lsn, %redo_lsn, pages = written, removed_logs = removed, "checkpoint complete");
        Ok(())
    }

    fn maybe_checkpoint(&self) {
        if self.log.bytes_since_checkpoint() < self.config.checkpoint_interval {
            return;
        }
        if let Err(err) = self.checkpoint() {
            warn!(error = %err, "automatic checkpoint failed");
        }
    }
}

impl PostCommitWork for DatabaseInner {
    fn reclaim_page(&self, container: ContainerId, page: PageNumber) -> Result<()> {
        if let Err(err) = self.log.check_usable() {
            warn!(container, page, error = %err, "page reclaim skipped, database is fatal");
            return Ok(());
        }
        let Ok(container) = self.container(container) else {
            debug!(container, page, "page reclaim skipped, container is gone");
            return Ok(());
        };
        self.run_internal(|log| compress::reclaim_page(&self.compress_context(&container, log), page))?;
        Ok(())
    }
}

impl TransitionHost for DatabaseInner {
    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn log(&self) -> &LogManager {
        &self.log
    }

    fn service(&self) -> &Mutex<ServiceMeta> {
        &self.service
    }

    fn containers(&self) -> Vec<Arc<Container>> {
        self.container_list()
    }

    fn checkpoint(&self) -> Result<()> {
        DatabaseInner::checkpoint(self)
    }

    fn crash_point(&self, point: CrashPoint) -> Result<()> {
        match &self.config.faults.0 {
            Some(injector) => injector.check(point),
            None => Ok(()),
        }
    }

    fn set_active_cipher(&self, cipher: Option<Arc<PageCipher>>) {
        *self.cipher.write() = cipher;
    }
}

/// Recovery's view of the open containers
struct RecoveryContainers<'a> {
    containers: &'a BTreeMap<ContainerId, Arc<Container>>,
}

impl RecoveryContainers<'_> {
    fn get(&self, id: ContainerId) -> Result<&Container> {
        self.containers
            .get(&id)
            .map(Arc::as_ref)
            .ok_or(VaultError::UnknownContainer(id))
    }
}

impl RecoveryTarget for RecoveryContainers<'_> {
    fn page_lsn(&mut self, container: ContainerId, page: PageNumber) -> Result<u64> {
        self.get(container)?.latch().page_lsn(page)
    }

    fn apply(&mut self, container: ContainerId, page: PageNumber, op: &PageOp, lsn: Lsn) -> Result<()> {
        self.get(container)?.latch().redo(page, op, lsn)
    }
}
