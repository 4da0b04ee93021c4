//! Gateway start-up supervision
//!
//! [`GatewaySupervisor::ensure_running`] is safe to call from any number of
//! request tasks at once: callers that observe the gateway as not running
//! join a single in-flight start keyed on the gateway identity, and the
//! start itself runs on its own task so a caller going away never cancels it.

use crate::config::{GatewaySettings, SleepPolicy};
use crate::env::GatewayEnv;
use crate::gateway_config;
use crate::probe::{GatewayProcessInfo, GatewayStatus, ProcessProbe};
use crate::sandbox::{ProcessEntry, SharedSandbox, SpawnSpec};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Identity of the single gateway in the container
pub const GATEWAY_KEY: &str = "gateway";

/// Longest diagnostic carried in a startup error
const MAX_DIAGNOSTIC_BYTES: usize = 2000;

/// Why the gateway could not be brought up
#[derive(Debug, Clone, thiserror::Error)]
pub enum StartupError {
    #[error("failed to launch gateway: {0}")]
    Spawn(String),

    #[error("gateway process {pid} exited during startup: {diagnostic}")]
    Exited { pid: u32, diagnostic: String },

    #[error("gateway did not become ready within {secs}s")]
    Timeout { secs: u64, diagnostic: String },

    #[error("gateway start was aborted")]
    Aborted,
}

impl StartupError {
    /// Last known output of the gateway, if any
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            StartupError::Exited { diagnostic, .. } | StartupError::Timeout { diagnostic, .. }
                if !diagnostic.is_empty() =>
            {
                Some(diagnostic.as_str())
            }
            _ => None,
        }
    }

    /// Error text plus diagnostic, for response bodies
    pub fn details(&self) -> String {
        match (self, self.diagnostic()) {
            (StartupError::Timeout { .. }, Some(diagnostic)) => {
                format!("{}. Last output: {}", self, diagnostic)
            }
            _ => self.to_string(),
        }
    }
}

type StartOutcome = Shared<BoxFuture<'static, Result<GatewayProcessInfo, StartupError>>>;

struct InFlightStart {
    id: u64,
    outcome: StartOutcome,
}

/// Owns the gateway's start, restart and idle stop
pub struct GatewaySupervisor {
    sandbox: SharedSandbox,
    probe: ProcessProbe,
    settings: GatewaySettings,
    env: GatewayEnv,
    in_flight: DashMap<String, InFlightStart>,
    next_start_id: AtomicU64,
    spawn_count: AtomicU64,
    last_activity: Mutex<Instant>,
}

fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

impl GatewaySupervisor {
    pub fn new(sandbox: SharedSandbox, settings: GatewaySettings, env: GatewayEnv) -> Arc<Self> {
        let probe = ProcessProbe::new(Arc::clone(&sandbox), &settings);
        Arc::new(Self {
            sandbox,
            probe,
            settings,
            env,
            in_flight: DashMap::new(),
            next_start_id: AtomicU64::new(1),
            spawn_count: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn probe(&self) -> &ProcessProbe {
        &self.probe
    }

    pub fn sandbox(&self) -> &SharedSandbox {
        &self.sandbox
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn env(&self) -> &GatewayEnv {
        &self.env
    }

    /// Number of gateway processes this supervisor has launched
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::Relaxed)
    }

    pub fn is_starting(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Record traffic for the idle timer
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Return once the gateway is running, starting it at most once
    pub async fn ensure_running(self: &Arc<Self>) -> Result<GatewayProcessInfo, StartupError> {
        if let Some(info) = self.probe.probe().await {
            if info.is_running() {
                return Ok(info);
            }
        }
        self.start_flight().await
    }

    /// Kick off a start without waiting for it; failures are logged
    pub fn start_in_background(self: &Arc<Self>) {
        let outcome = self.start_flight();
        tokio::spawn(async move {
            match outcome.await {
                Ok(info) => debug!(pid = info.pid, "Background gateway start finished"),
                Err(e) => error!(error = %e, "Background gateway start failed"),
            }
        });
    }

    /// Join the in-flight start or begin a new one.
    ///
    /// The entry is removed by the start task itself after the readiness
    /// poll, so late callers keep joining until the outcome is known.
    fn start_flight(self: &Arc<Self>) -> StartOutcome {
        match self.in_flight.entry(GATEWAY_KEY.to_string()) {
            Entry::Occupied(existing) => {
                debug!("Joining in-flight gateway start");
                existing.get().outcome.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_start_id.fetch_add(1, Ordering::Relaxed);
                let supervisor = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    let result = supervisor.run_start().await;
                    supervisor
                        .in_flight
                        .remove_if(GATEWAY_KEY, |_, start| start.id == id);
                    result
                });
                let outcome = handle
                    .map(|joined| match joined {
                        Ok(result) => result,
                        Err(e) => {
                            error!(error = %e, "Gateway start task failed");
                            Err(StartupError::Aborted)
                        }
                    })
                    .boxed()
                    .shared();
                slot.insert(InFlightStart {
                    id,
                    outcome: outcome.clone(),
                });
                outcome
            }
        }
    }

    async fn run_start(&self) -> Result<GatewayProcessInfo, StartupError> {
        // One bound covers waiting on a stale process and the fresh spawn
        let deadline = Instant::now() + self.settings.startup_timeout();

        match self.probe.probe().await {
            Some(info) if info.is_running() => return Ok(info),
            Some(info) if info.status == GatewayStatus::Starting => {
                info!(pid = info.pid, "Gateway already starting, waiting for it");
                match self.wait_ready(info.pid, deadline).await {
                    Ok(info) => return Ok(info),
                    Err(e) => {
                        warn!(pid = info.pid, error = %e, "Existing gateway never became ready, replacing it");
                        self.kill(info.pid).await;
                    }
                }
            }
            _ => {}
        }

        if let Err(e) = gateway_config::materialize(&self.settings, &self.env) {
            warn!(error = %e, "Failed to write gateway config, starting with what is on disk");
        }
        self.remove_lock_files();

        let spec = self.spawn_spec()?;
        info!(
            command = %spec.redacted_command_line(),
            port = self.settings.port,
            "Starting gateway"
        );
        let entry = self
            .sandbox
            .start_process(spec)
            .await
            .map_err(|e| StartupError::Spawn(e.to_string()))?;
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let info = self.wait_ready(entry.pid, deadline).await?;
        info!(
            pid = info.pid,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Gateway ready"
        );
        Ok(info)
    }

    /// Poll the probe until `pid` is running, has exited, or `deadline` passes
    async fn wait_ready(
        &self,
        pid: u32,
        deadline: Instant,
    ) -> Result<GatewayProcessInfo, StartupError> {
        let interval = self.settings.ready_poll_interval();
        let poll = async {
            loop {
                match self.probe.probe().await {
                    Some(info) if info.is_running() => return Ok(info),
                    Some(info) if info.pid == pid && !info.is_alive() => {
                        return Err(StartupError::Exited {
                            pid,
                            diagnostic: self.diagnostic(pid).await,
                        });
                    }
                    _ => {}
                }
                tokio::time::sleep(interval).await;
            }
        };

        let timeout = self.settings.startup_timeout();
        match tokio::time::timeout_at(deadline.into(), poll).await {
            Ok(result) => result,
            Err(_) => {
                error!(pid, timeout_secs = timeout.as_secs(), "Gateway startup timeout exceeded");
                Err(StartupError::Timeout {
                    secs: timeout.as_secs(),
                    diagnostic: self.diagnostic(pid).await,
                })
            }
        }
    }

    async fn diagnostic(&self, pid: u32) -> String {
        match self.sandbox.process_logs(pid).await {
            Ok(logs) => tail(&logs.diagnostic(), MAX_DIAGNOSTIC_BYTES),
            Err(e) => {
                debug!(pid, error = %e, "No logs available for gateway process");
                String::new()
            }
        }
    }

    fn remove_lock_files(&self) {
        for path in &self.settings.lock_files {
            match std::fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "Removed stale lock file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove lock file"),
            }
        }
    }

    /// Program, arguments and environment for a gateway launch
    pub fn spawn_spec(&self) -> Result<SpawnSpec, StartupError> {
        let (program, mut args) = self.settings.command_parts().map_err(StartupError::Spawn)?;
        args.push("--port".to_string());
        args.push(self.settings.port.to_string());
        args.push("--bind".to_string());
        args.push(self.settings.bind_mode.clone());
        args.extend(self.settings.extra_args.iter().cloned());

        match self.env.gateway_token() {
            Some(token) => {
                args.push("--token".to_string());
                args.push(token.to_string());
            }
            None => info!("No gateway token configured, gateway will require device pairing"),
        }

        let mut env = self.env.container_env();
        env.extend(self.settings.env.clone());

        let mut spec = SpawnSpec::new(program).with_args(args).with_env(env);
        if self.settings.workspace_dir.is_dir() {
            spec.working_dir = Some(self.settings.workspace_dir.clone());
        }
        Ok(spec)
    }

    async fn kill(&self, pid: u32) {
        if let Err(e) = self
            .sandbox
            .kill_process(pid, self.settings.shutdown_grace_period())
            .await
        {
            warn!(pid, error = %e, "Failed to stop gateway process");
        }
    }

    async fn kill_all(&self, live: Vec<ProcessEntry>) -> usize {
        let count = live.len();
        for entry in live {
            self.kill(entry.pid).await;
        }
        count
    }

    /// Stop every gateway process and start a fresh one in the background
    pub async fn restart(self: &Arc<Self>) -> usize {
        let stopped = self.kill_all(self.probe.live_gateways().await).await;
        info!(stopped, "Restarting gateway");
        self.touch();
        self.start_in_background();
        stopped
    }

    /// Stop the gateway when it has been untouched for longer than `policy`
    pub async fn stop_if_idle(&self, policy: SleepPolicy) -> bool {
        let Some(limit) = policy.duration() else {
            return false;
        };
        if self.is_starting() {
            return false;
        }
        let idle = self.idle_for();
        if idle < limit {
            return false;
        }
        let live = self.probe.live_gateways().await;
        if live.is_empty() {
            return false;
        }
        info!(idle_secs = idle.as_secs(), "Gateway idle timeout reached, stopping");
        self.kill_all(live).await > 0
    }

    /// Stop every gateway process
    pub async fn stop(&self) {
        let stopped = self.kill_all(self.probe.live_gateways().await).await;
        if stopped > 0 {
            info!(stopped, "Gateway stopped");
        }
    }
}
