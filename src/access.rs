//! Access verification seam
//!
//! Identity is established upstream. The proxy only checks that the
//! upstream left its claim on the request.

use crate::config::AccessSettings;
use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderName};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessDenied {
    #[error("request carries no '{0}' identity")]
    MissingClaim(String),

    #[error("identity header '{0}' is not valid text")]
    InvalidClaim(String),
}

/// Yields the authenticated user, `None` when access is not enforced
#[async_trait]
pub trait AccessVerifier: Send + Sync {
    async fn verify(&self, headers: &HeaderMap) -> Result<Option<String>, AccessDenied>;
}

pub type SharedVerifier = Arc<dyn AccessVerifier>;

/// Admits every request
pub struct AllowAll;

#[async_trait]
impl AccessVerifier for AllowAll {
    async fn verify(&self, _headers: &HeaderMap) -> Result<Option<String>, AccessDenied> {
        Ok(None)
    }
}

/// Requires a non-empty identity header set by the access proxy
pub struct HeaderClaim {
    header: HeaderName,
}

impl HeaderClaim {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

#[async_trait]
impl AccessVerifier for HeaderClaim {
    async fn verify(&self, headers: &HeaderMap) -> Result<Option<String>, AccessDenied> {
        let value = headers
            .get(&self.header)
            .ok_or_else(|| AccessDenied::MissingClaim(self.header.to_string()))?;
        let user = value
            .to_str()
            .map_err(|_| AccessDenied::InvalidClaim(self.header.to_string()))?
            .trim();
        if user.is_empty() {
            return Err(AccessDenied::MissingClaim(self.header.to_string()));
        }
        Ok(Some(user.to_string()))
    }
}

/// Verifier for the configured settings; dev mode admits everything
pub fn from_settings(settings: &AccessSettings, dev_mode: bool) -> SharedVerifier {
    if dev_mode {
        return Arc::new(AllowAll);
    }
    match settings.user_header.as_deref() {
        Some(name) => match HeaderName::try_from(name) {
            Ok(header) => Arc::new(HeaderClaim::new(header)),
            Err(e) => {
                warn!(header = name, error = %e, "Invalid access header name, access check disabled");
                Arc::new(AllowAll)
            }
        },
        None => Arc::new(AllowAll),
    }
}
