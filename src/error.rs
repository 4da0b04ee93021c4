//! Error handling and JSON/HTML error responses for the proxy

use crate::pages;
use crate::supervisor::StartupError;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, ACCEPT};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Gateway failed to start or never became ready
    GatewayStartFailed,
    /// Required environment is not set
    ConfigurationMissing,
    /// Upstream access verification rejected the request
    Unauthorized,
    /// Route does not exist (or is disabled)
    NotFound,
    /// Forwarding to the running gateway failed
    ConnectionFailed,
    /// Gateway did not answer in time
    RequestTimeout,
    /// WebSocket handshake with the gateway failed
    UpgradeFailed,
    /// Malformed request such as an upgrade without a key
    BadRequest,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::GatewayStartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConfigurationMissing => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::UpgradeFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::GatewayStartFailed => "GATEWAY_START_FAILED",
            ProxyErrorCode::ConfigurationMissing => "CONFIGURATION_MISSING",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: None,
            details: None,
            hint: None,
            missing: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_missing(mut self, missing: Vec<String>) -> Self {
        self.missing = Some(missing);
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"error":"{}"}}"#, self.error.replace('\"', "\\\""))
        })
    }
}

/// True when the client prefers an HTML page over JSON
pub fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false)
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, body: &ErrorResponse) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create an HTML error page with X-Proxy-Error header
pub fn html_error_response(code: ProxyErrorCode, body: &ErrorResponse) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/html; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(pages::error_page(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// JSON or HTML depending on what the client accepts
pub fn error_response(code: ProxyErrorCode, body: &ErrorResponse, html: bool) -> Response<ProxyBody> {
    if html {
        html_error_response(code, body)
    } else {
        json_error_response(code, body)
    }
}

/// Shorthand for errors that carry only a message
pub fn simple_error(code: ProxyErrorCode, error: impl Into<String>) -> Response<ProxyBody> {
    json_error_response(code, &ErrorResponse::new(error))
}

/// Operator guidance for a failed start
pub fn startup_hint(err: &StartupError, has_provider_credential: bool) -> String {
    let details = err.details().to_ascii_lowercase();
    if details.contains("out of memory") {
        "The gateway ran out of memory. Use a larger instance type, then reload.".to_string()
    } else if !has_provider_credential {
        "No model provider is configured. Set ANTHROPIC_API_KEY, OPENAI_API_KEY or the AI gateway variables, then reload."
            .to_string()
    } else {
        "Check the gateway logs for the cause, then reload the page to retry.".to_string()
    }
}

/// 500 for a gateway that could not be started
pub fn startup_error_response(
    err: &StartupError,
    has_provider_credential: bool,
    html: bool,
) -> Response<ProxyBody> {
    let body = ErrorResponse::new("Gateway failed to start")
        .with_details(err.details())
        .with_hint(startup_hint(err, has_provider_credential));
    error_response(ProxyErrorCode::GatewayStartFailed, &body, html)
}

/// 503 listing the unset required variables
pub fn config_missing_response(missing: &[&str], html: bool) -> Response<ProxyBody> {
    let body = ErrorResponse::new("Configuration missing")
        .with_message(format!(
            "Required settings are not configured: {}",
            missing.join(", ")
        ))
        .with_missing(missing.iter().map(|s| s.to_string()).collect());
    error_response(ProxyErrorCode::ConfigurationMissing, &body, html)
}
