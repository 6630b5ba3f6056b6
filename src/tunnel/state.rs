//! Tunnel states: the raw process status and the controller's view of it.

use super::error::TunnelError;
use crate::intent::LogicalServerRef;
use serde::{Deserialize, Serialize};

/// Status as reported by the tunnel process itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    /// Not configured.
    Invalid,
    /// Down, with the process-provided reason if it stopped on its own.
    Disconnected {
        /// Why the process stopped.
        reason: Option<String>,
    },
    /// Establishing the tunnel.
    Connecting,
    /// Re-establishing after a network change.
    Reasserting,
    /// Up.
    Connected,
    /// Tearing down.
    Disconnecting,
}

impl ProcessStatus {
    /// Whether the process is up or trying to be.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Connecting | ProcessStatus::Reasserting | ProcessStatus::Connected
        )
    }
}

/// Tunnel state published by [`super::TunnelController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// Down; carries the error if it went down because of one.
    Disconnected(Option<TunnelError>),
    /// Coming up towards the pending server, if known.
    Connecting(Option<LogicalServerRef>),
    /// Up, connected to the reported server.
    Connected(LogicalServerRef),
    /// Going down at the caller's request.
    Disconnecting,
}

impl TunnelState {
    /// Whether the tunnel is fully down.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, TunnelState::Disconnected(_))
    }

    /// The error carried by a `Disconnected` state.
    pub fn error(&self) -> Option<&TunnelError> {
        match self {
            TunnelState::Disconnected(error) => error.as_ref(),
            _ => None,
        }
    }
}

impl Default for TunnelState {
    fn default() -> Self {
        TunnelState::Disconnected(None)
    }
}
