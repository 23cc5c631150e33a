//! Shared run state: port pool, process registry, stop flag and partial results.
//!
//! A single [`RunContext`] is built per batch run and shared through an `Arc`
//! by every probe worker and by the [`ShutdownCoordinator`].

mod pool;
mod registry;
mod shutdown;

pub use pool::{PortLease, PortPool};
pub use registry::{ProcessHandle, ProcessRegistry};
pub use shutdown::{ExitGuard, ShutdownCoordinator, ShutdownReason, ShutdownReport};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;

/// Marker inserted before the extension of the output path for partial results.
const PARTIAL_MARKER: &str = "-partial";

/// Held by a worker from just before it launches a probe until the probe
/// is registered.
pub type LaunchPermit<'a> = RwLockReadGuard<'a, ()>;

/// Process-scoped state of one batch run.
#[derive(Debug)]
pub struct RunContext {
    pool: Arc<PortPool>,
    registry: ProcessRegistry,
    results: PartialResults,
    stop: AtomicBool,
    launch_gate: RwLock<()>,
}

impl RunContext {
    /// Build the context for a run, sizing the port pool from the config.
    pub fn new(config: &Config, output_path: Option<PathBuf>) -> Arc<Self> {
        Self::with_pool(PortPool::new(config.base_port, config.workers), output_path)
    }

    /// Build the context around an existing pool.
    pub fn with_pool(pool: PortPool, output_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            pool: Arc::new(pool),
            registry: ProcessRegistry::new(),
            results: PartialResults::new(output_path),
            stop: AtomicBool::new(false),
            launch_gate: RwLock::new(()),
        })
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn results(&self) -> &PartialResults {
        &self.results
    }

    /// Ask workers to stop launching probes.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Permission to launch one probe, or `None` once stop was requested.
    ///
    /// Keep the permit until the probe is in the registry and do not hold
    /// it across an `.await`. A probe launched under a permit is therefore
    /// always visible to the drain that follows [`RunContext::wait_for_launches`].
    pub fn launch_permit(&self) -> Option<LaunchPermit<'_>> {
        let permit = self.launch_gate.read();
        if self.stop_requested() {
            None
        } else {
            Some(permit)
        }
    }

    /// Block until no launch permit is outstanding.
    ///
    /// Call after [`RunContext::request_stop`]: no new permit is granted
    /// afterwards, so every launched probe is registered on return.
    pub fn wait_for_launches(&self) {
        drop(self.launch_gate.write());
    }
}

/// Confirmed-good descriptors gathered while the run is in progress.
///
/// If the run ends without [`PartialResults::mark_complete`] being called,
/// the shutdown path writes them next to the intended output file.
#[derive(Debug)]
pub struct PartialResults {
    output_path: Option<PathBuf>,
    good: Mutex<Vec<String>>,
    complete: AtomicBool,
}

impl PartialResults {
    pub fn new(output_path: Option<PathBuf>) -> Self {
        Self {
            output_path,
            good: Mutex::new(Vec::new()),
            complete: AtomicBool::new(false),
        }
    }

    pub fn record(&self, descriptor: impl Into<String>) {
        self.good.lock().push(descriptor.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.good.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.good.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.good.lock().is_empty()
    }

    /// Mark that the final output has been written.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Sidecar path for an interrupted run, if an output path is known.
    pub fn partial_path(&self) -> Option<PathBuf> {
        self.output_path.as_deref().map(partial_path_for)
    }
}

/// Derive `<stem>-partial.<ext>` (or `<name>-partial`) next to `output`.
pub fn partial_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{stem}{PARTIAL_MARKER}.{}", ext.to_string_lossy()),
        None => format!("{stem}{PARTIAL_MARKER}"),
    };
    output.with_file_name(name)
}
