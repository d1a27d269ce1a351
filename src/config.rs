//! Configuration for PageVault
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::encryption::FaultInjector;
use crate::page::PageSize;

/// Main configuration for a PageVault database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── service.dat      (container catalog + encryption markers)
    ///     ├── seg0/            (container files)
    ///     └── log/             (log files + log.ctrl)
    pub data_dir: PathBuf,

    /// Page size used by `create_container` when none is given
    pub default_page_size: PageSize,

    /// Page slots managed by one allocation page
    pub pages_per_extent: u32,

    /// Hard cap on the number of pages in one container
    pub max_container_pages: u64,

    /// Pages one container keeps cached before clean data pages are evicted
    pub page_cache_pages: usize,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the log outside of commits
    pub wal_sync_strategy: WalSyncStrategy,

    /// Size in bytes after which the log switches to a new file
    pub log_file_size: u64,

    /// Highest log file number the database may use
    pub max_log_file_number: u32,

    /// Log bytes written between automatic checkpoints
    pub checkpoint_interval: u64,

    // -------------------------------------------------------------------------
    // Locking Configuration
    // -------------------------------------------------------------------------
    /// Lock wait timeout (milliseconds)
    pub lock_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Testing hooks
    // -------------------------------------------------------------------------
    /// Crash-point injection for the encryption rewrite controller
    pub faults: Faults,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced records (commits always sync)
    EveryNEntries { count: usize },
}

/// Optional fault injector carried by the config
#[derive(Clone, Default)]
pub struct Faults(pub(crate) Option<Arc<dyn FaultInjector>>);

impl fmt::Debug for Faults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Faults(installed)"),
            None => f.write_str("Faults(none)"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pagevault_data"),
            default_page_size: PageSize::K4,
            pages_per_extent: 512,
            max_container_pages: u32::MAX as u64,
            page_cache_pages: 1024,
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
            log_file_size: 1024 * 1024, // 1 MB
            max_log_file_number: (1 << 31) - 1,
            checkpoint_interval: 10 * 1024 * 1024, // 10 MB
            lock_timeout_ms: 5000,
            faults: Faults::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Lock wait timeout as a Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.pages_per_extent == 0 {
            return Err(crate::VaultError::Config(
                "pages_per_extent must be at least 1".to_string(),
            ));
        }
        if self.page_cache_pages == 0 {
            return Err(crate::VaultError::Config(
                "page_cache_pages must be at least 1".to_string(),
            ));
        }
        if self.max_log_file_number == 0 {
            return Err(crate::VaultError::Config(
                "max_log_file_number must be at least 1".to_string(),
            ));
        }
        // Offsets inside a log file are 32-bit and a file may overrun by one frame
        if self.log_file_size < 4096 || self.log_file_size > (u32::MAX / 2) as u64 {
            return Err(crate::VaultError::Config(format!(
                "log_file_size {} out of range",
                self.log_file_size
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the default container page size
    pub fn default_page_size(mut self, size: PageSize) -> Self {
        self.config.default_page_size = size;
        self
    }

    /// Set the number of page slots per allocation extent
    pub fn pages_per_extent(mut self, count: u32) -> Self {
        self.config.pages_per_extent = count;
        self
    }

    /// Set the maximum number of pages in a container
    pub fn max_container_pages(mut self, count: u64) -> Self {
        self.config.max_container_pages = count;
        self
    }

    /// Set the page cache capacity of each container (in pages)
    pub fn page_cache_pages(mut self, count: usize) -> Self {
        self.config.page_cache_pages = count;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the log file switch size (in bytes)
    pub fn log_file_size(mut self, size: u64) -> Self {
        self.config.log_file_size = size;
        self
    }

    /// Set the maximum log file number
    pub fn max_log_file_number(mut self, max: u32) -> Self {
        self.config.max_log_file_number = max;
        self
    }

    /// Set the automatic checkpoint interval (in log bytes)
    pub fn checkpoint_interval(mut self, bytes: u64) -> Self {
        self.config.checkpoint_interval = bytes;
        self
    }

    /// Set the lock wait timeout (in milliseconds)
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    /// Install a fault injector for crash-point testing
    pub fn fault_injector(mut self, injector: Arc<dyn FaultInjector>) -> Self {
        self.config.faults = Faults(Some(injector));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
