//! Shutdown coordination for interrupted or crashing runs.
//!
//! Detecting a termination request (a signal, or `main` unwinding) only flips
//! the run's stop flag. The cleanup itself runs once, as ordinary code:
//! drain the registry, kill every drained probe, give its port back, and
//! save whatever good results were gathered so far.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::RunContext;
use crate::proxy::launcher::ProbeLauncher;
use crate::proxy::parser::EndpointParser;

/// Exit status used after a signal-triggered shutdown (128 + SIGINT).
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// What started the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A termination signal such as SIGINT or SIGTERM.
    Signal(&'static str),
    /// The process is leaving `main`, normally or by unwinding.
    Exit,
}

/// Outcome of the one cleanup pass.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// Probes drained from the registry.
    pub drained: usize,
    /// Probes whose termination reported an error.
    pub terminate_failures: usize,
    /// Ports handed back to the pool.
    pub reclaimed_ports: usize,
    /// Sidecar file written with partial results, if any.
    pub partial_path: Option<PathBuf>,
}

/// Runs the cleanup sequence exactly once per run.
pub struct ShutdownCoordinator {
    ctx: Arc<RunContext>,
    launcher: Arc<dyn ProbeLauncher>,
    shutting_down: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(ctx: Arc<RunContext>, launcher: Arc<dyn ProbeLauncher>) -> Self {
        Self {
            ctx,
            launcher,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Move to the shutting-down state and clean up.
    ///
    /// Only the first call does anything; later calls return `None`.
    pub fn shutdown(&self, reason: ShutdownReason) -> Option<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!(?reason, "shutdown already in progress");
            return None;
        }

        self.ctx.request_stop();
        // A worker may be between spawning a process and registering it.
        self.ctx.wait_for_launches();

        let drained = self.ctx.registry().drain();
        let mut report = ShutdownReport {
            reason,
            drained: drained.len(),
            terminate_failures: 0,
            reclaimed_ports: 0,
            partial_path: None,
        };

        for (handle, port) in drained {
            if let Err(e) = self.launcher.terminate(&handle) {
                warn!(%handle, port, error = %e, "failed to terminate probe");
                report.terminate_failures += 1;
            }
            self.ctx.pool().give_back(port);
            report.reclaimed_ports += 1;
        }

        report.partial_path = self.flush_partial_results();

        info!(
            ?reason,
            drained = report.drained,
            reclaimed = report.reclaimed_ports,
            "shutdown cleanup finished"
        );
        Some(report)
    }

    fn flush_partial_results(&self) -> Option<PathBuf> {
        let results = self.ctx.results();
        if results.is_complete() {
            return None;
        }
        let path = results.partial_path()?;
        let good = results.snapshot();
        if good.is_empty() {
            return None;
        }

        match EndpointParser::write_lines(&path, &good) {
            Ok(()) => {
                println!("Partial results saved to {:?}", path);
                info!(path = %path.display(), count = good.len(), "partial results saved");
                Some(path)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to save partial results");
                None
            }
        }
    }

    /// Guard that runs the cleanup when dropped, covering early returns and
    /// panics that unwind out of `main`.
    pub fn exit_guard(self: &Arc<Self>) -> ExitGuard {
        ExitGuard {
            coordinator: Arc::clone(self),
        }
    }

    /// Listen for SIGINT/SIGTERM, clean up, and exit with status 130.
    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let signal = match wait_for_termination().await {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "could not install signal handlers");
                    return;
                }
            };

            coordinator.ctx.request_stop();
            eprintln!("\n[!] Received {signal}, shutting down...");

            if coordinator.shutdown(ShutdownReason::Signal(signal)).is_some() {
                std::process::exit(EXIT_CODE_INTERRUPTED);
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

/// Runs [`ShutdownCoordinator::shutdown`] with [`ShutdownReason::Exit`] on drop.
pub struct ExitGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("run aborted by panic, cleaning up probes");
        }
        if let Some(report) = self.coordinator.shutdown(ShutdownReason::Exit) {
            if report.drained > 0 {
                warn!(
                    drained = report.drained,
                    "probes were still running at exit and have been terminated"
                );
            }
        }
    }
}
