//! API session forking.
//!
//! When the tunnel process reports its API session expired, a new session
//! is forked from the caller's own and its selector handed to the process
//! so it can authenticate refreshes independently.

use super::error::CertAuthError;
use async_trait::async_trait;
use std::fmt;

/// A session created for the tunnel process.
#[derive(Clone, PartialEq, Eq)]
pub struct ForkedSession {
    /// Session selector.
    pub selector: String,
    /// Session cookie, if the API needs one.
    pub session_cookie: Option<String>,
}

impl fmt::Debug for ForkedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkedSession")
            .field("selector", &self.selector)
            .field("session_cookie", &self.session_cookie.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Creates new API sessions on demand.
#[async_trait]
pub trait SessionForker: Send + Sync {
    /// Fork a session for the tunnel process.
    async fn fork_session(&self) -> Result<ForkedSession, CertAuthError>;
}

/// Hands out a pre-provisioned session from configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredSessionForker {
    session: Option<ForkedSession>,
}

impl ConfiguredSessionForker {
    /// Forker for the configured selector; `None` when none is configured.
    pub fn new(selector: Option<String>, session_cookie: Option<String>) -> Self {
        Self {
            session: selector
                .filter(|s| !s.is_empty())
                .map(|selector| ForkedSession {
                    selector,
                    session_cookie: session_cookie.filter(|c| !c.is_empty()),
                }),
        }
    }
}

#[async_trait]
impl SessionForker for ConfiguredSessionForker {
    async fn fork_session(&self) -> Result<ForkedSession, CertAuthError> {
        self.session
            .clone()
            .ok_or_else(|| CertAuthError::SessionFork("no API session configured".into()))
    }
}
