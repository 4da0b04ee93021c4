//! Gateway liveness classification
//!
//! The probe is re-run on every request and never cached: the container's
//! process table and the gateway port are the only sources of truth.

use crate::config::GatewaySettings;
use crate::sandbox::{ProcessEntry, ProcessStatus, SharedSandbox};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Lifecycle status of the gateway as observed by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    /// Process alive, port not accepting connections yet
    Starting,
    /// Process alive and port accepting connections
    Running,
    /// Process exited cleanly or was killed
    Stopped,
    /// Process exited with a failure status
    Crashed,
}

/// Snapshot of the gateway process
#[derive(Debug, Clone, Serialize)]
pub struct GatewayProcessInfo {
    pub pid: u32,
    pub status: GatewayStatus,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    pub command: String,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl GatewayProcessInfo {
    pub fn is_running(&self) -> bool {
        self.status == GatewayStatus::Running
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.status, GatewayStatus::Starting | GatewayStatus::Running)
    }
}

/// How the gateway shows up in the process table
#[derive(Debug, Clone)]
pub struct LaunchSignature {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl LaunchSignature {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        let include = include.into_iter().filter(|s| !s.trim().is_empty()).collect();
        let exclude = exclude.into_iter().filter(|s| !s.trim().is_empty()).collect();
        Self { include, exclude }
    }

    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self::new(settings.signature.clone(), settings.signature_exclude.clone())
    }

    pub fn matches(&self, command: &str) -> bool {
        self.include.iter().any(|s| command.contains(s.as_str()))
            && !self.exclude.iter().any(|s| command.contains(s.as_str()))
    }
}

/// Pick the gateway entry out of a process listing.
///
/// The newest live match wins; without one the newest exited match is
/// returned so callers can tell "crashed" from "never started".
pub fn select_gateway<'a>(
    entries: &'a [ProcessEntry],
    signature: &LaunchSignature,
) -> Option<&'a ProcessEntry> {
    let matching = entries.iter().filter(|e| signature.matches(&e.command));
    let mut newest_live: Option<&ProcessEntry> = None;
    let mut newest_exited: Option<&ProcessEntry> = None;

    for entry in matching {
        let slot = if entry.status.is_alive() {
            &mut newest_live
        } else {
            &mut newest_exited
        };
        if slot.map_or(true, |current| entry.started_at >= current.started_at) {
            *slot = Some(entry);
        }
    }

    newest_live.or(newest_exited)
}

fn exited_status(status: ProcessStatus) -> GatewayStatus {
    match status {
        ProcessStatus::Failed => GatewayStatus::Crashed,
        _ => GatewayStatus::Stopped,
    }
}

/// Inspects the container for the gateway process
#[derive(Clone)]
pub struct ProcessProbe {
    sandbox: SharedSandbox,
    signature: LaunchSignature,
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl ProcessProbe {
    pub fn new(sandbox: SharedSandbox, settings: &GatewaySettings) -> Self {
        Self {
            sandbox,
            signature: LaunchSignature::from_settings(settings),
            host: settings.host.clone(),
            port: settings.port,
            connect_timeout: settings.probe_connect_timeout(),
        }
    }

    pub fn signature(&self) -> &LaunchSignature {
        &self.signature
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Classify the gateway; `None` when no matching process exists.
    ///
    /// A failed process-list query is logged and treated as absent.
    pub async fn probe(&self) -> Option<GatewayProcessInfo> {
        let entries = match self.sandbox.list_processes().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Process list query failed, treating gateway as absent");
                return None;
            }
        };

        let entry = select_gateway(&entries, &self.signature)?;
        let status = if entry.status.is_alive() {
            if self.port_open().await {
                GatewayStatus::Running
            } else {
                GatewayStatus::Starting
            }
        } else {
            exited_status(entry.status)
        };

        debug!(pid = entry.pid, ?status, "Gateway probed");
        Some(GatewayProcessInfo {
            pid: entry.pid,
            status,
            started_at: entry.started_at,
            command: entry.command.clone(),
            exit_code: entry.exit_code,
        })
    }

    /// Every live gateway process, for restarts and idle stops
    pub async fn live_gateways(&self) -> Vec<ProcessEntry> {
        match self.sandbox.list_processes().await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.status.is_alive() && self.signature.matches(&e.command))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Process list query failed");
                Vec::new()
            }
        }
    }

    async fn port_open(&self) -> bool {
        let addr = format!("{}:{}", self.host, self.port);
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }
}
