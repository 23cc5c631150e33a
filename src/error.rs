//! Error types for the proxy-probe library.

use thiserror::Error;

/// Result type alias for proxy-probe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while probing endpoints or maintaining the blacklist.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite query or connection failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A probe process could not be started.
    #[error("Failed to launch probe on port {port}: {reason}")]
    LaunchFailed { port: u16, reason: String },

    /// A probe process could not be terminated.
    #[error("Failed to terminate probe process {pid}: {reason}")]
    TerminateFailed { pid: u32, reason: String },

    /// The configured port range yields no usable ports.
    #[error("Port pool is empty, no probe can be started")]
    PortPoolEmpty,

    /// A stored timestamp is not in the fixed `YYYY-MM-DDTHH:MM:SSZ` format.
    #[error("Corrupt timestamp in store: {0:?}")]
    CorruptTimestamp(String),
}
