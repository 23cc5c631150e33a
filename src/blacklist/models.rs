//! Blacklist records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An endpoint known to have failed a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Normalized endpoint identity
    pub key: String,
    /// Most recently observed descriptor line
    pub raw: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Number of recorded failures
    pub fail_count: i64,
    /// Where the failure was recorded from (`probe`, `flat`, ...)
    pub source: Option<String>,
}

/// Summary of the blacklist contents.
///
/// Timestamps are kept in their stored text form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistStats {
    pub total: i64,
    pub min_first_seen: Option<String>,
    pub max_last_seen: Option<String>,
}
