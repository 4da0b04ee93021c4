//! Per-request readiness policy
//!
//! Classifies the request, asks the probe whether the gateway is running,
//! and decides between forwarding, serving the placeholder page while a
//! background start runs, or holding the request until the start resolves.

use crate::probe::GatewayProcessInfo;
use crate::supervisor::{GatewaySupervisor, StartupError};
use hyper::header::{HeaderMap, ACCEPT, UPGRADE};
use std::sync::Arc;
use tracing::debug;

/// What kind of client is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// WebSocket upgrade; cannot be shown a placeholder
    WebSocket,
    /// Top-level browser navigation accepting HTML
    BrowserNavigation,
    /// Anything else (fetch/XHR, CLI clients)
    Api,
}

impl RequestKind {
    pub fn classify(headers: &HeaderMap) -> Self {
        let is_websocket = headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if is_websocket {
            return RequestKind::WebSocket;
        }

        let accepts_html = headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/html"))
            .unwrap_or(false);
        if accepts_html {
            RequestKind::BrowserNavigation
        } else {
            RequestKind::Api
        }
    }
}

/// Branch taken for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Forward,
    /// Start in the background and answer with the loading page
    Placeholder,
    /// Hold the request until the start succeeds or fails
    AwaitStart,
}

pub fn dispatch(ready: bool, kind: RequestKind) -> Dispatch {
    match (ready, kind) {
        (true, _) => Dispatch::Forward,
        (false, RequestKind::BrowserNavigation) => Dispatch::Placeholder,
        (false, RequestKind::WebSocket | RequestKind::Api) => Dispatch::AwaitStart,
    }
}

/// Result of passing the gate
#[derive(Debug)]
pub enum Admission {
    Ready(GatewayProcessInfo),
    Placeholder,
    Failed(StartupError),
}

#[derive(Clone)]
pub struct ReadinessGate {
    supervisor: Arc<GatewaySupervisor>,
}

impl ReadinessGate {
    pub fn new(supervisor: Arc<GatewaySupervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<GatewaySupervisor> {
        &self.supervisor
    }

    pub async fn admit(&self, kind: RequestKind) -> Admission {
        self.supervisor.touch();

        let running = self
            .supervisor
            .probe()
            .probe()
            .await
            .filter(GatewayProcessInfo::is_running);

        match (dispatch(running.is_some(), kind), running) {
            (Dispatch::Forward, Some(info)) => Admission::Ready(info),
            (Dispatch::Placeholder, _) => {
                debug!("Gateway not ready, serving placeholder");
                self.supervisor.start_in_background();
                Admission::Placeholder
            }
            _ => {
                debug!(kind = ?kind, "Gateway not ready, waiting for start");
                match self.supervisor.ensure_running().await {
                    Ok(info) => Admission::Ready(info),
                    Err(e) => Admission::Failed(e),
                }
            }
        }
    }
}
