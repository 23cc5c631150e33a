//! Batch probe driver

use crate::blacklist::BlacklistStore;
use crate::error::{Error, Result};
use crate::proxy::exclude::ExcludeRules;
use crate::proxy::launcher::{Probe, ProbeLauncher};
use crate::proxy::models::{Endpoint, ProbeResult, ProbeStatus};
use crate::runtime::RunContext;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default pause before retrying when every port is in use
const DEFAULT_BACKOFF_MS: u64 = 50;

/// Source tag for blacklist entries recorded by a probe run
pub const PROBE_SOURCE: &str = "probe";

/// Configuration for the probe driver
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Pause before retrying when the port pool is exhausted
    pub backoff: Duration,
    /// Source recorded with blacklisted endpoints
    pub failure_source: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            failure_source: PROBE_SOURCE.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_failure_source(mut self, source: impl Into<String>) -> Self {
        self.failure_source = source.into();
        self
    }
}

/// Counts of one batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub good: usize,
    pub bad: usize,
    pub errors: usize,
    pub cancelled: usize,
    pub skipped_excluded: usize,
    pub skipped_blacklisted: usize,
}

impl CheckSummary {
    pub fn probed(&self) -> usize {
        self.good + self.bad + self.errors
    }
}

/// Probes endpoints concurrently, one port and one process per probe.
///
/// Concurrency equals the port pool capacity. Working endpoints are added
/// to the run's partial results as they come in; failing ones are recorded
/// in the blacklist store when one is attached.
pub struct ProxyChecker {
    ctx: Arc<RunContext>,
    launcher: Arc<dyn ProbeLauncher>,
    store: Option<BlacklistStore>,
    excludes: ExcludeRules,
    config: CheckerConfig,
}

impl ProxyChecker {
    pub fn new(ctx: Arc<RunContext>, launcher: Arc<dyn ProbeLauncher>) -> Self {
        Self {
            ctx,
            launcher,
            store: None,
            excludes: ExcludeRules::default(),
            config: CheckerConfig::default(),
        }
    }

    pub fn with_store(mut self, store: BlacklistStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_excludes(mut self, excludes: ExcludeRules) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_config(mut self, config: CheckerConfig) -> Self {
        self.config = config;
        self
    }

    /// Probe every endpoint that is neither excluded nor blacklisted.
    pub async fn check_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<CheckSummary> {
        let mut summary = CheckSummary::default();
        let pending = self.filter(endpoints, &mut summary).await?;
        if pending.is_empty() {
            return Ok(summary);
        }

        let concurrency = self.ctx.pool().capacity();
        if concurrency == 0 {
            return Err(Error::PortPoolEmpty);
        }

        info!(
            count = pending.len(),
            concurrency,
            excluded = summary.skipped_excluded,
            blacklisted = summary.skipped_blacklisted,
            "probing endpoints"
        );

        let mut results = stream::iter(pending)
            .map(|endpoint| self.check_endpoint(endpoint))
            .buffer_unordered(concurrency);

        while let Some(result) = results.next().await {
            self.record(&result, &mut summary).await;
        }

        Ok(summary)
    }

    /// Probe one endpoint: take a port, launch, await the verdict, give the port back.
    ///
    /// Once the probe is registered, whoever removes it from the registry owns
    /// its port. If the shutdown path drained it first, the result is
    /// [`ProbeStatus::Cancelled`] and the port is left to that path.
    pub async fn check_endpoint(&self, endpoint: Endpoint) -> ProbeResult {
        let lease = loop {
            if self.ctx.stop_requested() {
                return ProbeResult::cancelled(endpoint);
            }
            match self.ctx.pool().lease() {
                Some(lease) => break lease,
                None => tokio::time::sleep(self.config.backoff).await,
            }
        };

        let start = Instant::now();
        let registry = self.ctx.registry();

        // Launch and registration happen under one permit with no await in
        // between, so a concurrent shutdown either finds the process in the
        // registry or nothing is started at all.
        let (handle, outcome, port) = {
            let Some(_permit) = self.ctx.launch_permit() else {
                return ProbeResult::cancelled(endpoint);
            };
            let Probe { handle, outcome } = match self.launcher.launch(&endpoint, lease.port()) {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(endpoint = %endpoint, port = lease.port(), error = %e, "probe launch failed");
                    return ProbeResult::new(endpoint, ProbeStatus::Error(e.to_string()), None);
                }
            };
            let port = lease.into_port();
            registry.register(handle.clone(), port);
            (handle, outcome, port)
        };

        let status = outcome.await;
        let elapsed = start.elapsed().as_millis() as u64;

        if !registry.unregister(&handle, port) {
            debug!(%handle, port, "probe was drained by shutdown");
            return ProbeResult::cancelled(endpoint);
        }
        self.ctx.pool().give_back(port);

        debug!(endpoint = %endpoint, port, ?status, elapsed_ms = elapsed, "probe finished");
        ProbeResult::new(endpoint, status, Some(elapsed))
    }

    async fn filter(
        &self,
        endpoints: Vec<Endpoint>,
        summary: &mut CheckSummary,
    ) -> Result<Vec<Endpoint>> {
        let mut pending = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            if let Some(target) = &endpoint.target {
                if let Some(rule) = self.excludes.matches(&target.host, target.port) {
                    debug!(endpoint = %endpoint, %rule, "endpoint excluded");
                    summary.skipped_excluded += 1;
                    continue;
                }
            }
            if let Some(store) = &self.store {
                if store.contains(&endpoint.key).await? {
                    summary.skipped_blacklisted += 1;
                    continue;
                }
            }
            pending.push(endpoint);
        }

        Ok(pending)
    }

    async fn record(&self, result: &ProbeResult, summary: &mut CheckSummary) {
        match &result.status {
            ProbeStatus::Working => {
                self.ctx.results().record(result.endpoint.raw.clone());
                summary.good += 1;
            }
            status if status.is_endpoint_failure() => {
                summary.bad += 1;
                if let Some(store) = &self.store {
                    let endpoint = &result.endpoint;
                    if let Err(e) = store
                        .upsert(
                            &endpoint.key,
                            &endpoint.raw,
                            Some(self.config.failure_source.as_str()),
                            None,
                        )
                        .await
                    {
                        warn!(endpoint = %endpoint, error = %e, "failed to blacklist endpoint");
                    }
                }
            }
            ProbeStatus::Cancelled => summary.cancelled += 1,
            _ => summary.errors += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::parser::EndpointParser;
    use crate::runtime::{
        PortPool, ProcessHandle, ShutdownCoordinator, ShutdownReason, ShutdownReport,
    };
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::watch;

    /// Launcher with per-key verdicts; `hang` probes run until terminated.
    struct ScriptedLauncher {
        verdicts: HashMap<String, ProbeStatus>,
        launch_failures: HashSet<String>,
        hang: bool,
        launched: Mutex<Vec<(String, u16)>>,
        killed: watch::Sender<bool>,
    }

    impl ScriptedLauncher {
        fn new() -> Self {
            Self {
                verdicts: HashMap::new(),
                launch_failures: HashSet::new(),
                hang: false,
                launched: Mutex::new(Vec::new()),
                killed: watch::channel(false).0,
            }
        }

        fn verdict(mut self, key: &str, status: ProbeStatus) -> Self {
            self.verdicts.insert(key.to_string(), status);
            self
        }

        fn launch_failure(mut self, key: &str) -> Self {
            self.launch_failures.insert(key.to_string());
            self
        }

        fn launched_keys(&self) -> Vec<String> {
            self.launched.lock().iter().map(|(k, _)| k.clone()).collect()
        }
    }

    impl ProbeLauncher for ScriptedLauncher {
        fn launch(&self, endpoint: &Endpoint, port: u16) -> Result<Probe> {
            self.launched.lock().push((endpoint.key.clone(), port));
            if self.launch_failures.contains(&endpoint.key) {
                return Err(Error::LaunchFailed {
                    port,
                    reason: "no such binary".to_string(),
                });
            }

            let outcome = if self.hang {
                let mut killed = self.killed.subscribe();
                async move {
                    let _ = killed.wait_for(|k| *k).await;
                    ProbeStatus::Failed("killed".to_string())
                }
                .boxed()
            } else {
                let status = self
                    .verdicts
                    .get(&endpoint.key)
                    .cloned()
                    .unwrap_or(ProbeStatus::Working);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    status
                }
                .boxed()
            };

            Ok(Probe {
                handle: ProcessHandle::new(Some(port as u32)),
                outcome,
            })
        }

        fn terminate(&self, _handle: &ProcessHandle) -> Result<()> {
            self.killed.send_replace(true);
            Ok(())
        }
    }

    /// Launcher whose first launch fires a shutdown from another thread and
    /// waits until stop is requested before returning.
    struct InterruptingLauncher {
        ctx: Arc<RunContext>,
        coordinator: Mutex<Option<Arc<ShutdownCoordinator>>>,
        shutdown_thread: Mutex<Option<std::thread::JoinHandle<Option<ShutdownReport>>>>,
        killed: watch::Sender<bool>,
    }

    impl ProbeLauncher for InterruptingLauncher {
        fn launch(&self, _endpoint: &Endpoint, port: u16) -> Result<Probe> {
            if let Some(coordinator) = self.coordinator.lock().take() {
                let thread = std::thread::spawn(move || {
                    coordinator.shutdown(ShutdownReason::Signal("SIGTERM"))
                });
                *self.shutdown_thread.lock() = Some(thread);
                while !self.ctx.stop_requested() {
                    std::thread::yield_now();
                }
            }

            let mut killed = self.killed.subscribe();
            Ok(Probe {
                handle: ProcessHandle::new(Some(port as u32)),
                outcome: async move {
                    let _ = killed.wait_for(|k| *k).await;
                    ProbeStatus::Failed("killed".to_string())
                }
                .boxed(),
            })
        }

        fn terminate(&self, _handle: &ProcessHandle) -> Result<()> {
            self.killed.send_replace(true);
            Ok(())
        }
    }

    fn endpoints(lines: &[&str]) -> Vec<Endpoint> {
        lines
            .iter()
            .filter_map(|line| EndpointParser::parse_line(line))
            .collect()
    }

    fn fast_config() -> CheckerConfig {
        CheckerConfig::new().with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_all_ports_reclaimed_and_failures_blacklisted() {
        let ctx = RunContext::with_pool(PortPool::new(42000, 2), None);
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .verdict("10.0.0.2:80", ProbeStatus::Failed("exit 1".to_string()))
                .verdict("10.0.0.3:80", ProbeStatus::Timeout)
                .launch_failure("10.0.0.4:80"),
        );
        let store = BlacklistStore::in_memory().await.unwrap();
        let checker = ProxyChecker::new(Arc::clone(&ctx), launcher.clone())
            .with_store(store.clone())
            .with_config(fast_config());

        let summary = checker
            .check_endpoints(endpoints(&[
                "10.0.0.1:80#one",
                "10.0.0.2:80",
                "10.0.0.3:80",
                "10.0.0.4:80",
                "10.0.0.5:80",
                "10.0.0.6:80",
            ]))
            .await
            .unwrap();

        assert_eq!(summary.good, 3);
        assert_eq!(summary.bad, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.probed(), 6);

        assert_eq!(ctx.pool().available(), 2);
        assert!(ctx.registry().is_empty());
        for (_, port) in launcher.launched.lock().iter() {
            assert!((42000..42002).contains(port));
        }

        assert!(store.contains("10.0.0.2:80").await.unwrap());
        assert!(store.contains("10.0.0.3:80").await.unwrap());
        assert!(!store.contains("10.0.0.4:80").await.unwrap());
        let entry = store.get("10.0.0.2:80").await.unwrap().unwrap();
        assert_eq!(entry.source.as_deref(), Some(PROBE_SOURCE));

        let mut good = ctx.results().snapshot();
        good.sort();
        assert_eq!(good, vec!["10.0.0.1:80#one", "10.0.0.5:80", "10.0.0.6:80"]);
    }

    #[tokio::test]
    async fn test_excluded_and_blacklisted_are_skipped() {
        let ctx = RunContext::with_pool(PortPool::new(42100, 4), None);
        let launcher = Arc::new(ScriptedLauncher::new());
        let store = BlacklistStore::in_memory().await.unwrap();
        store
            .upsert("trojan://p@2.2.2.2:443", "trojan://p@2.2.2.2:443#x", Some("flat"), None)
            .await
            .unwrap();
        let checker = ProxyChecker::new(Arc::clone(&ctx), launcher.clone())
            .with_store(store)
            .with_excludes(ExcludeRules::parse_lines(["1.1.1.1:443", "evil.example"]))
            .with_config(fast_config());

        let summary = checker
            .check_endpoints(endpoints(&[
                "vless://u@1.1.1.1:443#excluded",
                "vless://u@1.1.1.1:8443#kept",
                "trojan://p@2.2.2.2:443#blacklisted",
                "ss://k@EVIL.example:8388",
            ]))
            .await
            .unwrap();

        assert_eq!(summary.skipped_excluded, 2);
        assert_eq!(summary.skipped_blacklisted, 1);
        assert_eq!(summary.good, 1);
        assert_eq!(launcher.launched_keys(), vec!["vless://u@1.1.1.1:8443"]);
    }

    #[tokio::test]
    async fn test_stop_before_run_launches_nothing() {
        let ctx = RunContext::with_pool(PortPool::new(42200, 2), None);
        let launcher = Arc::new(ScriptedLauncher::new());
        let checker =
            ProxyChecker::new(Arc::clone(&ctx), launcher.clone()).with_config(fast_config());

        ctx.request_stop();
        let summary = checker
            .check_endpoints(endpoints(&["10.0.0.1:80", "10.0.0.2:80"]))
            .await
            .unwrap();

        assert_eq!(summary.cancelled, 2);
        assert!(launcher.launched_keys().is_empty());
        assert_eq!(ctx.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_mid_run_cancels_and_reclaims() {
        let ctx = RunContext::with_pool(PortPool::new(42300, 2), None);
        let launcher = Arc::new(ScriptedLauncher {
            hang: true,
            ..ScriptedLauncher::new()
        });
        let store = BlacklistStore::in_memory().await.unwrap();
        let checker = ProxyChecker::new(Arc::clone(&ctx), launcher.clone())
            .with_store(store.clone())
            .with_config(fast_config());
        let coordinator = ShutdownCoordinator::new(Arc::clone(&ctx), launcher.clone());

        let run = checker.check_endpoints(endpoints(&[
            "10.0.0.1:80",
            "10.0.0.2:80",
            "10.0.0.3:80",
            "10.0.0.4:80",
        ]));
        let interrupt = async {
            while ctx.registry().len() < 2 {
                tokio::task::yield_now().await;
            }
            coordinator.shutdown(ShutdownReason::Signal("SIGINT"))
        };

        let (summary, report) = tokio::join!(run, interrupt);
        let summary = summary.unwrap();
        let report = report.unwrap();

        assert_eq!(report.drained, 2);
        assert_eq!(summary.cancelled, 4);
        assert_eq!(summary.bad, 0);
        assert_eq!(launcher.launched_keys().len(), 2);
        assert_eq!(ctx.pool().available(), 2);
        assert!(ctx.registry().is_empty());
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_launch_still_drains_launched_process() {
        let ctx = RunContext::with_pool(PortPool::new(42400, 1), None);
        let launcher = Arc::new(InterruptingLauncher {
            ctx: Arc::clone(&ctx),
            coordinator: Mutex::new(None),
            shutdown_thread: Mutex::new(None),
            killed: watch::channel(false).0,
        });
        let coordinator = Arc::new(ShutdownCoordinator::new(Arc::clone(&ctx), launcher.clone()));
        *launcher.coordinator.lock() = Some(coordinator);

        let checker =
            ProxyChecker::new(Arc::clone(&ctx), launcher.clone()).with_config(fast_config());
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            checker.check_endpoints(endpoints(&["10.0.0.1:80", "10.0.0.2:80"])),
        )
        .await
        .expect("launched process was left running")
        .unwrap();

        let thread = launcher.shutdown_thread.lock().take().unwrap();
        let report = thread.join().unwrap().unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.reclaimed_ports, 1);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(ctx.pool().available(), 1);
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pool_is_an_error() {
        let ctx = RunContext::with_pool(PortPool::new(70000, 4), None);
        let checker = ProxyChecker::new(ctx, Arc::new(ScriptedLauncher::new()));

        let result = checker.check_endpoints(endpoints(&["10.0.0.1:80"])).await;
        assert!(matches!(result, Err(Error::PortPoolEmpty)));

        let summary = checker.check_endpoints(Vec::new()).await.unwrap();
        assert_eq!(summary, CheckSummary::default());
    }

    #[test]
    fn test_checker_config_builder() {
        let config = CheckerConfig::new()
            .with_backoff(Duration::from_millis(5))
            .with_failure_source("manual");
        assert_eq!(config.backoff, Duration::from_millis(5));
        assert_eq!(config.failure_source, "manual");
    }
}
