//! Certificate authentication error types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why the authenticator declined to request a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WontRefreshReason {
    /// No certificate is stored.
    CertificateMissing,
    /// Keys were just generated, so any stored certificate is stale.
    KeysRegenerated,
}

impl fmt::Display for WontRefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WontRefreshReason::CertificateMissing => "certificate missing",
            WontRefreshReason::KeysRegenerated => "keys regenerated",
        })
    }
}

/// Failures loading or refreshing authentication data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertAuthError {
    /// A refresh was needed but not allowed for this load.
    #[error("Certificate refresh not attempted: {0}")]
    WontRefresh(WontRefreshReason),

    /// The certificate endpoint is rate limiting refreshes.
    #[error("Certificate refresh was rate limited{}", retry_hint(.retry_after))]
    RefreshWasRateLimited {
        /// Earliest time a new refresh may succeed.
        retry_after: Option<Duration>,
    },

    /// The tunnel process could not be reached.
    #[error("Tunnel IPC failed: {0}")]
    Ipc(String),

    /// The API session stayed expired after forking a new one.
    #[error("API session expired and could not be renewed")]
    SessionExpired,

    /// The tunnel process asked for new keys.
    #[error("Tunnel process requires new keys")]
    NeedNewKeys,

    /// The tunnel process reported a refresh failure.
    #[error("Certificate refresh failed: {0}")]
    Provider(String),

    /// A new API session could not be created.
    #[error("Failed to fork API session: {0}")]
    SessionFork(String),

    /// The credential store failed.
    #[error("Credential storage failed: {0}")]
    Storage(String),

    /// Keypair generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// The load was cancelled.
    #[error("Credential load cancelled")]
    Cancelled,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}s)", delay.as_secs()),
        None => String::new(),
    }
}

/// Failures of the credential store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("Credential store I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Stored data could not be encoded or decoded.
    #[error("Credential store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for CertAuthError {
    fn from(e: StoreError) -> Self {
        CertAuthError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_includes_hint() {
        let err = CertAuthError::RefreshWasRateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            err.to_string(),
            "Certificate refresh was rate limited (retry after 30s)"
        );

        let err = CertAuthError::RefreshWasRateLimited { retry_after: None };
        assert_eq!(err.to_string(), "Certificate refresh was rate limited");
    }
}
