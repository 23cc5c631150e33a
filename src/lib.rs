//! Proxy Probe - batch prober for proxy endpoint lists
//!
//! Launches one short-lived probe process per candidate endpoint, each bound
//! to a dedicated local port, and remembers failing endpoints so later runs
//! can skip them.
//!
//! The pieces that keep this safe under load and under interruption:
//! - [`runtime::PortPool`]: bounded set of reusable local ports
//! - [`runtime::ProcessRegistry`]: in-flight probes, drained atomically on shutdown
//! - [`runtime::ShutdownCoordinator`]: signal/exit driven cleanup
//! - [`blacklist::BlacklistStore`]: SQLite store with TTL and capacity pruning

pub mod blacklist;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod runtime;

pub use blacklist::{BlacklistEntry, BlacklistStats, BlacklistStore};
pub use config::Config;
pub use error::{Error, Result};
pub use proxy::*;
pub use runtime::{
    ExitGuard, PartialResults, PortLease, PortPool, ProcessHandle, ProcessRegistry, RunContext,
    ShutdownCoordinator, ShutdownReason, ShutdownReport,
};
