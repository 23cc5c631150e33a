//! Blacklist of endpoints that failed a probe ("notworkers")

pub mod models;
pub mod store;
pub mod timestamp;

pub use models::{BlacklistEntry, BlacklistStats};
pub use store::{BlacklistStore, FLAT_SOURCE};

/// Default flat blacklist file imported by `migrate-from-flat`
pub const DEFAULT_FLAT_PATH: &str = "configs/notworkers";

/// Default destination of `export-flat`
pub const DEFAULT_EXPORT_PATH: &str = "configs/notworkers_from_db";
