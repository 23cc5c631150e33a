//! Proxy module for parsing and probing endpoints
//!
//! This module provides functionality for:
//! - Parsing endpoint descriptors (URL style, HOST:PORT, USER:PASS@HOST:PORT, etc.)
//! - Filtering endpoints through exclusion rules
//! - Launching one probe process per endpoint on its own local port
//! - Driving a whole batch concurrently and recording failures

pub mod checker;
pub mod exclude;
pub mod launcher;
pub mod models;
pub mod parser;

pub use checker::{CheckSummary, CheckerConfig, ProxyChecker, PROBE_SOURCE};
pub use exclude::ExcludeRules;
pub use launcher::{CommandLauncher, Probe, ProbeLauncher};
pub use models::{Endpoint, ProbeResult, ProbeStatus, Target};
pub use parser::EndpointParser;
