//! Routes answered by the proxy itself: health, status, debug and admin

use crate::backup::BackupReconciler;
use crate::error::{full_body, simple_error, ErrorResponse, json_error_response, ProxyBody, ProxyErrorCode};
use crate::forward::ForwardStats;
use crate::gateway_config;
use crate::sandbox::Sandbox;
use crate::supervisor::GatewaySupervisor;
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEBUG_PREFIX: &str = "/debug";
const ADMIN_PREFIX: &str = "/api/admin/";

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn not_found() -> Response<ProxyBody> {
    simple_error(ProxyErrorCode::NotFound, "Not found")
}

/// Which handler a path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteGroup {
    /// Answered before access verification
    Public,
    /// Diagnostics, only when explicitly enabled
    Debug,
    /// Storage and gateway management
    Admin,
    /// Everything else goes to the gateway
    Gateway,
}

pub fn route_group(method: &Method, path: &str) -> RouteGroup {
    match (method, path) {
        (&Method::GET, "/healthz") | (&Method::GET, "/api/status") => RouteGroup::Public,
        _ if path == DEBUG_PREFIX || path.starts_with("/debug/") => RouteGroup::Debug,
        _ if path.starts_with(ADMIN_PREFIX) => RouteGroup::Admin,
        _ => RouteGroup::Gateway,
    }
}

pub struct AdminRoutes {
    supervisor: Arc<GatewaySupervisor>,
    backup: Option<Arc<BackupReconciler>>,
    forward_stats: Arc<ForwardStats>,
}

impl AdminRoutes {
    pub fn new(
        supervisor: Arc<GatewaySupervisor>,
        backup: Option<Arc<BackupReconciler>>,
        forward_stats: Arc<ForwardStats>,
    ) -> Self {
        Self {
            supervisor,
            backup,
            forward_stats,
        }
    }

    pub async fn public(&self, path: &str) -> Response<ProxyBody> {
        match path {
            "/healthz" => json_response(
                StatusCode::OK,
                json!({ "status": "ok", "service": PKG_NAME, "version": VERSION }).to_string(),
            ),
            "/api/status" => self.gateway_status().await,
            _ => not_found(),
        }
    }

    async fn gateway_status(&self) -> Response<ProxyBody> {
        let body = match self.supervisor.probe().probe().await {
            Some(info) => json!({
                "ok": info.is_running(),
                "status": info.status,
                "processId": info.pid,
                "startedAt": info.started_at,
            }),
            None => json!({
                "ok": false,
                "status": if self.supervisor.is_starting() { "starting" } else { "not_running" },
            }),
        };
        json_response(StatusCode::OK, body.to_string())
    }

    pub async fn debug(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        if !self.supervisor.env().debug_routes() {
            return not_found();
        }
        debug!(%method, path, "Debug route");

        match (method, path) {
            (&Method::GET, "/debug/version") => {
                let settings = self.supervisor.settings();
                json_response(
                    StatusCode::OK,
                    json!({
                        "name": PKG_NAME,
                        "version": VERSION,
                        "gatewayCommand": settings.command,
                        "gatewayPort": settings.port,
                    })
                    .to_string(),
                )
            }
            (&Method::GET, "/debug/processes") => self.processes().await,
            (&Method::GET, "/debug/env") => {
                let env = self.supervisor.env();
                let vars: Map<String, Value> = env
                    .presence()
                    .into_iter()
                    .map(|(name, set)| (name.to_string(), Value::Bool(set)))
                    .collect();
                json_response(
                    StatusCode::OK,
                    json!({
                        "devMode": env.dev_mode(),
                        "hasProviderCredential": env.has_provider_credential(),
                        "vars": vars,
                    })
                    .to_string(),
                )
            }
            (&Method::GET, "/debug/gateway-config") => self.gateway_config().await,
            _ => not_found(),
        }
    }

    async fn processes(&self) -> Response<ProxyBody> {
        match self.supervisor.sandbox().list_processes().await {
            Ok(entries) => {
                let signature = self.supervisor.probe().signature();
                let processes: Vec<Value> = entries
                    .iter()
                    .map(|entry| {
                        json!({
                            "pid": entry.pid,
                            "command": entry.command,
                            "status": entry.status,
                            "exitCode": entry.exit_code,
                            "startedAt": entry.started_at,
                            "gateway": signature.matches(&entry.command),
                        })
                    })
                    .collect();
                json_response(
                    StatusCode::OK,
                    json!({ "count": processes.len(), "processes": processes }).to_string(),
                )
            }
            Err(e) => {
                warn!(error = %e, "Failed to list processes");
                json_error_response(
                    ProxyErrorCode::InternalError,
                    &ErrorResponse::new("Failed to list processes").with_details(e.to_string()),
                )
            }
        }
    }

    async fn gateway_config(&self) -> Response<ProxyBody> {
        let path = self.supervisor.settings().config_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                return json_error_response(
                    ProxyErrorCode::NotFound,
                    &ErrorResponse::new("Gateway config not found")
                        .with_details(format!("{}: {}", path.display(), e)),
                );
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(doc) => json_response(StatusCode::OK, gateway_config::redact(&doc).to_string()),
            Err(e) => json_error_response(
                ProxyErrorCode::InternalError,
                &ErrorResponse::new("Gateway config is not valid JSON").with_details(e.to_string()),
            ),
        }
    }

    pub async fn admin(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        let route = path.strip_prefix(ADMIN_PREFIX).unwrap_or("");
        debug!(%method, route, "Admin API request");

        match (method, route) {
            (&Method::GET, "storage") => match &self.backup {
                Some(backup) => json_response(
                    StatusCode::OK,
                    serde_json::to_string(&backup.status().await).unwrap_or_default(),
                ),
                None => json_response(StatusCode::OK, json!({ "configured": false }).to_string()),
            },
            (&Method::POST, "storage/sync") => match &self.backup {
                Some(backup) => {
                    let outcome = backup.push().await;
                    let status = if outcome.success {
                        StatusCode::OK
                    } else {
                        StatusCode::INTERNAL_SERVER_ERROR
                    };
                    json_response(status, serde_json::to_string(&outcome).unwrap_or_default())
                }
                None => json_error_response(
                    ProxyErrorCode::ConfigurationMissing,
                    &ErrorResponse::new("Backup storage is not configured")
                        .with_hint("Enable [backup] in the configuration file"),
                ),
            },
            (&Method::GET, "gateway") => {
                let process = self.supervisor.probe().probe().await;
                json_response(
                    StatusCode::OK,
                    json!({
                        "process": process,
                        "starting": self.supervisor.is_starting(),
                        "spawnCount": self.supervisor.spawn_count(),
                        "idleSecs": self.supervisor.idle_for().as_secs(),
                        "forwarded": {
                            "total": self.forward_stats.get_total_requests(),
                            "failed": self.forward_stats.get_failed_requests(),
                        },
                    })
                    .to_string(),
                )
            }
            (&Method::POST, "gateway/restart") => {
                let stopped = self.supervisor.restart().await;
                info!(stopped, "Gateway restart requested via admin API");
                json_response(
                    StatusCode::OK,
                    json!({ "ok": true, "stopped": stopped }).to_string(),
                )
            }
            _ => not_found(),
        }
    }
}
