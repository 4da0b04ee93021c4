use crate::access::{self, SharedVerifier};
use crate::admin::{route_group, AdminRoutes, RouteGroup};
use crate::backup::BackupReconciler;
use crate::config::Config;
use crate::error::{
    config_missing_response, empty_body, error_response, full_body, simple_error,
    startup_error_response, wants_html, ErrorResponse, ProxyBody, ProxyErrorCode,
};
use crate::forward::{ForwardClient, ForwardConfig};
use crate::gate::{Admission, ReadinessGate, RequestKind};
use crate::pages;
use crate::relay::{relay, ErrorRewriter};
use crate::supervisor::GatewaySupervisor;
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Interval at which a live WebSocket session counts as gateway activity
const SESSION_ACTIVITY_INTERVAL: Duration = Duration::from_secs(30);

/// Handshake headers regenerated for the gateway leg
const WS_HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
    "transfer-encoding",
];

/// Everything a request handler needs, shared across connections
pub struct ProxyState {
    supervisor: Arc<GatewaySupervisor>,
    gate: ReadinessGate,
    admin: AdminRoutes,
    access: SharedVerifier,
    forward: ForwardClient,
    required_env: Vec<String>,
    pairing_path: String,
    request_timeout: Duration,
}

impl ProxyState {
    pub fn new(
        config: &Config,
        supervisor: Arc<GatewaySupervisor>,
        backup: Option<Arc<BackupReconciler>>,
    ) -> Arc<Self> {
        let forward = ForwardClient::new(
            config.gateway.host.clone(),
            ForwardConfig {
                max_idle_per_host: config.server.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            },
        );
        let access = access::from_settings(&config.access, supervisor.env().dev_mode());
        Arc::new(Self {
            gate: ReadinessGate::new(Arc::clone(&supervisor)),
            admin: AdminRoutes::new(Arc::clone(&supervisor), backup, forward.stats()),
            supervisor,
            access,
            forward,
            required_env: config.server.required_env.clone(),
            pairing_path: config.server.pairing_path.clone(),
            request_timeout: config.server.request_timeout(),
        })
    }
}

/// The public-facing proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<ProxyState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let html = wants_html(req.headers());

    let group = route_group(&method, &path);
    if group == RouteGroup::Public {
        return Ok(state.admin.public(&path).await);
    }

    let dev_mode = state.supervisor.env().dev_mode();
    if let Err(e) = state.access.verify(req.headers()).await {
        warn!(path, error = %e, "Access denied");
        let body = ErrorResponse::new("Unauthorized").with_message(e.to_string());
        return Ok(error_response(ProxyErrorCode::Unauthorized, &body, html));
    }

    if group == RouteGroup::Debug {
        return Ok(state.admin.debug(&method, &path).await);
    }

    if !dev_mode {
        let missing = state.supervisor.env().missing(&state.required_env);
        if !missing.is_empty() {
            warn!(missing = ?missing, "Required configuration missing");
            return Ok(config_missing_response(&missing, html));
        }
    }

    if group == RouteGroup::Admin {
        return Ok(state.admin.admin(&method, &path).await);
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let kind = RequestKind::classify(req.headers());
    debug!(%method, uri = %req.uri(), request_id, kind = ?kind, "Incoming request");

    match state.gate.admit(kind).await {
        Admission::Ready(_) => {}
        Admission::Placeholder => return Ok(placeholder_response()),
        Admission::Failed(e) => {
            error!(request_id, error = %e, "Gateway failed to start");
            let has_credential = state.supervisor.env().has_provider_credential();
            return Ok(startup_error_response(&e, has_credential, html));
        }
    }

    // Overwrite rather than append: this proxy is the first hop the gateway trusts
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let port = state.supervisor.settings().port;

    if kind == RequestKind::WebSocket {
        return Ok(handle_websocket(req, state, port, request_id).await);
    }

    let result = tokio::time::timeout(state.request_timeout, state.forward.forward(req, port)).await;
    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(port, request_id, error = %e, "Failed to forward request to gateway");
            Ok(simple_error(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to gateway",
            ))
        }
        Err(_) => {
            warn!(
                port,
                request_id,
                timeout_secs = state.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(simple_error(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    state.request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn placeholder_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(full_body(pages::loading_page()))
        .expect("valid response builder")
}

/// Open the gateway leg, answer the caller with 101 and relay frames
async fn handle_websocket(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    port: u16,
    request_id: String,
) -> Response<ProxyBody> {
    let Some(accept_key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
    else {
        return simple_error(ProxyErrorCode::BadRequest, "Missing Sec-WebSocket-Key header");
    };

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let rewriter = ErrorRewriter::new(host, state.pairing_path.clone());

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = format!("ws://{}:{}{}", state.supervisor.settings().host, port, path);
    let mut gateway_req = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            error!(request_id, url, error = %e, "Invalid gateway WebSocket URL");
            return simple_error(ProxyErrorCode::UpgradeFailed, "Invalid gateway WebSocket URL");
        }
    };
    for (name, value) in req.headers() {
        if !WS_HANDSHAKE_HEADERS.contains(&name.as_str()) {
            gateway_req.headers_mut().append(name.clone(), value.clone());
        }
    }

    let connected = tokio::time::timeout(
        state.request_timeout,
        tokio_tungstenite::connect_async(gateway_req),
    )
    .await;
    let (gateway_ws, gateway_response) = match connected {
        Ok(Ok(pair)) => pair,
        Ok(Err(WsError::Http(rejection))) => {
            warn!(request_id, status = %rejection.status(), "Gateway rejected WebSocket upgrade");
            let body = rejection
                .body()
                .as_deref()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default();
            return Response::builder()
                .status(rejection.status())
                .header("X-Proxy-Error", ProxyErrorCode::UpgradeFailed.as_header_value())
                .body(full_body(body))
                .expect("valid response builder");
        }
        Ok(Err(e)) => {
            error!(request_id, port, error = %e, "WebSocket connection to gateway failed");
            return error_response(
                ProxyErrorCode::UpgradeFailed,
                &ErrorResponse::new("Failed to connect to gateway").with_details(e.to_string()),
                false,
            );
        }
        Err(_) => {
            warn!(request_id, port, "WebSocket connection to gateway timed out");
            return simple_error(
                ProxyErrorCode::RequestTimeout,
                "Timed out connecting to gateway",
            );
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key);
    if let Some(value) = gateway_response.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
        response = response.header(header::SEC_WEBSOCKET_PROTOCOL, value.clone());
    }
    let response = response
        .body(empty_body())
        .expect("valid response builder");

    info!(request_id, port, "WebSocket upgrade successful");

    let supervisor = Arc::clone(&state.supervisor);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let caller =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

                let activity = {
                    let supervisor = Arc::clone(&supervisor);
                    tokio::spawn(async move {
                        loop {
                            tokio::time::sleep(SESSION_ACTIVITY_INTERVAL).await;
                            supervisor.touch();
                        }
                    })
                };
                let summary = relay(caller, gateway_ws, rewriter).await;
                activity.abort();
                supervisor.touch();
                debug!(request_id, summary = ?summary, "WebSocket session finished");
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
                let mut gateway_ws = gateway_ws;
                let _ = gateway_ws.close(None).await;
            }
        }
    });

    response
}
