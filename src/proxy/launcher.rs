//! Probe launcher: starts and kills the per-endpoint probe process

use crate::error::{Error, Result};
use crate::proxy::models::{Endpoint, ProbeStatus};
use crate::runtime::ProcessHandle;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Default timeout for a single probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// How often a running probe is checked for exit
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Placeholder replaced by the endpoint descriptor in probe arguments
pub const ENDPOINT_PLACEHOLDER: &str = "{endpoint}";

/// Placeholder replaced by the local port in probe arguments
pub const PORT_PLACEHOLDER: &str = "{port}";

/// A launched probe: its handle plus a future resolving to the verdict
pub struct Probe {
    pub handle: ProcessHandle,
    pub outcome: BoxFuture<'static, ProbeStatus>,
}

/// Capability to run a probe for an endpoint on a local port.
///
/// `terminate` may be called from the shutdown path while the probe's
/// outcome future is still pending elsewhere; it must not block on it.
pub trait ProbeLauncher: Send + Sync {
    fn launch(&self, endpoint: &Endpoint, port: u16) -> Result<Probe>;

    fn terminate(&self, handle: &ProcessHandle) -> Result<()>;
}

/// Children that have not been reaped yet, by launch id.
///
/// A child is reaped only while this lock is held, and `terminate` kills only
/// children still in the map, so a kill never reaches a recycled pid.
type Children = Arc<Mutex<HashMap<Uuid, Child>>>;

/// Runs an external program per endpoint.
///
/// Exit status 0 within the timeout means the endpoint works. Arguments may
/// contain `{endpoint}` and `{port}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    children: Children,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of launched probes not yet reaped
    pub fn running(&self) -> usize {
        self.children.lock().len()
    }

    fn render_args(&self, endpoint: &Endpoint, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(ENDPOINT_PLACEHOLDER, &endpoint.key)
                    .replace(PORT_PLACEHOLDER, &port)
            })
            .collect()
    }
}

impl ProbeLauncher for CommandLauncher {
    fn launch(&self, endpoint: &Endpoint, port: u16) -> Result<Probe> {
        let child = Command::new(&self.program)
            .args(self.render_args(endpoint, port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::LaunchFailed {
                port,
                reason: format!("{}: {}", self.program, e),
            })?;

        let handle = ProcessHandle::new(child.id());
        debug!(%handle, port, endpoint = %endpoint, "probe launched");

        let id = handle.id();
        self.children.lock().insert(id, child);
        let outcome = watch_child(Arc::clone(&self.children), id, self.timeout).boxed();

        Ok(Probe { handle, outcome })
    }

    fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        // Gone from the map means already reaped (or already killed).
        let Some(mut child) = self.children.lock().remove(&handle.id()) else {
            return Ok(());
        };
        // Dropping the child afterwards leaves reaping to tokio.
        child.start_kill().map_err(|e| Error::TerminateFailed {
            pid: handle.pid().unwrap_or_default(),
            reason: e.to_string(),
        })
    }
}

async fn watch_child(children: Children, id: Uuid, timeout: Duration) -> ProbeStatus {
    let deadline = Instant::now() + timeout;

    loop {
        let polled = {
            let mut children = children.lock();
            let Some(child) = children.get_mut(&id) else {
                return ProbeStatus::Failed("probe terminated".to_string());
            };
            let polled = child.try_wait();
            if !matches!(polled, Ok(None)) {
                children.remove(&id);
            }
            polled
        };

        match polled {
            Ok(Some(status)) if status.success() => return ProbeStatus::Working,
            Ok(Some(status)) => return ProbeStatus::Failed(format!("probe exited with {}", status)),
            Err(e) => return ProbeStatus::Failed(e.to_string()),
            Ok(None) => {}
        }

        if Instant::now() >= deadline {
            let child = children.lock().remove(&id);
            if let Some(mut child) = child {
                let _ = child.start_kill();
                let _ = child.wait().await; // reap
            }
            return ProbeStatus::Timeout;
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("vless://id@1.2.3.4:443#DE", "vless://id@1.2.3.4:443")
    }

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let launcher = CommandLauncher::new(
            "probe",
            vec![
                "--listen=127.0.0.1:{port}".to_string(),
                "{endpoint}".to_string(),
                "-v".to_string(),
            ],
        );
        assert_eq!(
            launcher.render_args(&endpoint(), 20001),
            vec!["--listen=127.0.0.1:20001", "vless://id@1.2.3.4:443", "-v"]
        );
    }

    #[test]
    fn test_launch_missing_program_fails() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let launcher = CommandLauncher::new("/nonexistent/probe-binary", Vec::new());
            let result = launcher.launch(&endpoint(), 20000);
            assert!(matches!(result, Err(Error::LaunchFailed { port: 20000, .. })));
        });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_decides_outcome() {
        let ok = CommandLauncher::new("true", Vec::new());
        let probe = ok.launch(&endpoint(), 20000).unwrap();
        assert!(probe.handle.pid().is_some());
        assert_eq!(probe.outcome.await, ProbeStatus::Working);

        let bad = CommandLauncher::new("false", Vec::new());
        let probe = bad.launch(&endpoint(), 20000).unwrap();
        assert!(matches!(probe.outcome.await, ProbeStatus::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_probe() {
        let launcher = CommandLauncher::new("sleep", vec!["5".to_string()])
            .with_timeout(Duration::from_millis(100));
        let probe = launcher.launch(&endpoint(), 20000).unwrap();
        assert_eq!(probe.outcome.await, ProbeStatus::Timeout);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_running_probe() {
        let launcher = CommandLauncher::new("sleep", vec!["5".to_string()])
            .with_timeout(Duration::from_secs(30));
        let probe = launcher.launch(&endpoint(), 20000).unwrap();
        assert_eq!(launcher.running(), 1);

        launcher.terminate(&probe.handle).unwrap();
        assert_eq!(launcher.running(), 0);
        assert!(matches!(probe.outcome.await, ProbeStatus::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_after_exit_leaves_pid_alone() {
        let launcher = CommandLauncher::new("true", Vec::new());
        let probe = launcher.launch(&endpoint(), 20000).unwrap();
        let handle = probe.handle.clone();

        assert_eq!(probe.outcome.await, ProbeStatus::Working);
        assert_eq!(launcher.running(), 0);
        // The pid may already belong to another process; nothing is signalled.
        assert!(launcher.terminate(&handle).is_ok());
        assert!(launcher.terminate(&handle).is_ok());
    }

    #[test]
    fn test_terminate_unknown_handle_is_noop() {
        let launcher = CommandLauncher::new("probe", Vec::new());
        assert!(launcher.terminate(&ProcessHandle::new(Some(1))).is_ok());
        assert!(launcher.terminate(&ProcessHandle::new(None)).is_ok());
    }
}
