//! Tunnel error types.

use thiserror::Error;

/// Terminal tunnel failures carried in [`super::TunnelState::Disconnected`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// IPC to the tunnel process kept failing.
    #[error("Tunnel IPC failed after {attempts} attempts: {message}")]
    Ipc {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last delivery error.
        message: String,
    },

    /// The tunnel configuration could not be persisted.
    #[error("Failed to save tunnel configuration: {0}")]
    ConfigurationSave(String),

    /// The tunnel process refused to start.
    #[error("Failed to start tunnel process: {0}")]
    ProcessLaunch(String),

    /// The stop signal could not be delivered.
    #[error("Failed to stop tunnel process: {0}")]
    ProcessStop(String),

    /// The tunnel went down without being asked to.
    #[error("Tunnel terminated: {0}")]
    Terminated(String),
}

/// Failures of lifecycle calls on the tunnel process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The process (or its daemon) could not be reached.
    #[error("Tunnel daemon unavailable: {0}")]
    Unavailable(String),

    /// The process understood the request and refused it.
    #[error("Tunnel daemon rejected request: {0}")]
    Rejected(String),
}

/// Failures delivering a provider message.
///
/// These are transport problems; application-level errors come back as a
/// [`super::ProviderResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No running tunnel process to talk to.
    #[error("Tunnel process is not running")]
    NotRunning,

    /// The message or its reply was lost in transit.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No reply arrived in time.
    #[error("Timed out waiting for tunnel process response")]
    Timeout,

    /// A reply arrived but was not a provider response.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl DeliveryError {
    /// Whether sending again may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeliveryError::Malformed(_))
    }
}
