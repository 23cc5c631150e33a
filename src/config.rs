//! Run configuration

use std::path::PathBuf;
use std::time::Duration;

/// Default first port handed out by the port pool
pub const DEFAULT_BASE_PORT: u32 = 20000;

/// Default number of concurrent probe workers (and pool capacity)
pub const DEFAULT_WORKERS: usize = 32;

/// Default timeout for a single probe in seconds
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Default location of the blacklist store
pub const DEFAULT_DATABASE_PATH: &str = "configs/notworkers.db";

/// Default exclusion rules file; a missing file means no rules
pub const DEFAULT_EXCLUDE_PATH: &str = "configs/exclude_endpoints";

/// Configuration for a single batch run.
///
/// Values are usually filled from command line arguments, each of which can
/// also be supplied through a `PROXY_PROBE_*` environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    /// First port of the probe port range
    pub base_port: u32,
    /// Number of concurrent workers; also the requested pool capacity
    pub workers: usize,
    /// Blacklist store file path
    pub database_path: PathBuf,
    /// Timeout applied by the probe launcher to each probe
    pub probe_timeout: Duration,
    /// Drop blacklist entries not seen for this many days (0 disables)
    pub blacklist_ttl_days: i64,
    /// Keep at most this many blacklist entries (0 disables)
    pub blacklist_max_rows: i64,
    /// Optional file with exclusion rules
    pub exclude_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            workers: DEFAULT_WORKERS,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            blacklist_ttl_days: 0,
            blacklist_max_rows: 0,
            exclude_file: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_port(mut self, base_port: u32) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_blacklist_ttl_days(mut self, days: i64) -> Self {
        self.blacklist_ttl_days = days;
        self
    }

    pub fn with_blacklist_max_rows(mut self, max_rows: i64) -> Self {
        self.blacklist_max_rows = max_rows;
        self
    }

    pub fn with_exclude_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude_file = Some(path.into());
        self
    }
}
