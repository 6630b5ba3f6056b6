//! Messages exchanged with the running tunnel process.
//!
//! The process hosts the certificate refresher, so everything the
//! certificate authenticator needs from the outside world goes through
//! these requests.

use super::error::TunnelError;
use crate::intent::VpnFeatures;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Request sent to the tunnel process.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderRequest {
    /// Fetch a fresh certificate for the given features.
    RefreshCertificate {
        /// Features the certificate should encode.
        features: VpnFeatures,
    },
    /// Hand the process a new API session.
    SetApiSelector {
        /// Session selector.
        selector: String,
        /// Session cookie, if the API needs one.
        session_cookie: Option<String>,
    },
    /// Stop scheduled certificate refreshes.
    CancelRefreshes,
    /// Resume scheduled certificate refreshes.
    RestartRefreshes,
    /// Ask which server the tunnel is connected to.
    GetCurrentLogicalAndServerId,
}

impl fmt::Debug for ProviderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderRequest::RefreshCertificate { features } => f
                .debug_struct("RefreshCertificate")
                .field("features", features)
                .finish(),
            ProviderRequest::SetApiSelector {
                selector,
                session_cookie,
            } => f
                .debug_struct("SetApiSelector")
                .field("selector", selector)
                .field("session_cookie", &session_cookie.as_ref().map(|_| "<redacted>"))
                .finish(),
            ProviderRequest::CancelRefreshes => f.write_str("CancelRefreshes"),
            ProviderRequest::RestartRefreshes => f.write_str("RestartRefreshes"),
            ProviderRequest::GetCurrentLogicalAndServerId => {
                f.write_str("GetCurrentLogicalAndServerId")
            }
        }
    }
}

/// Typed reply from the tunnel process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderResponse {
    /// Success, with an optional JSON payload.
    Ok(Option<Vec<u8>>),
    /// Application-level failure.
    Error(String),
    /// The process' API session is missing or expired.
    ErrorSessionExpired,
    /// The stored keys are unusable and must be regenerated.
    ErrorNeedKeyRegeneration,
    /// The certificate endpoint is rate limiting us.
    ErrorTooManyCertRequests {
        /// Earliest time a new request may succeed.
        retry_after: Option<Duration>,
    },
}

impl ProviderResponse {
    /// `Ok` carrying `value` encoded as JSON.
    pub fn ok_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(ProviderResponse::Ok(Some(serde_json::to_vec(value)?)))
    }
}

/// Sends provider requests with transient delivery failures retried.
#[async_trait]
pub trait ProviderMessenger: Send + Sync {
    /// Deliver `request` and return the process' reply.
    async fn send_provider_message(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, TunnelError>;
}
