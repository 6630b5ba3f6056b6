//! Boundary to the privileged tunnel process.

use super::error::{DeliveryError, ProcessError};
use super::provider::{ProviderRequest, ProviderResponse};
use super::state::ProcessStatus;
use crate::directory::ServerHandle;
use crate::intent::{ServerConnectionIntent, VpnFeatures, VpnTransport};
use crate::stream::Subscription;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Configuration persisted for the tunnel process before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    /// Server to connect to.
    pub server: ServerHandle,
    /// Transport protocol.
    pub transport: VpnTransport,
    /// Requested features.
    pub features: VpnFeatures,
    /// Reconnect automatically when the tunnel drops.
    pub on_demand: bool,
}

impl TunnelConfiguration {
    /// Configuration for an intent resolved to `server`, with on-demand on.
    pub fn for_intent(server: ServerHandle, intent: &ServerConnectionIntent) -> Self {
        Self {
            server,
            transport: intent.transport,
            features: intent.features.clone(),
            on_demand: true,
        }
    }
}

/// Lifecycle and messaging interface of the out-of-process tunnel.
///
/// Status changes are observed through [`TunnelProcess::subscribe_status`],
/// never polled.
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// Persist the configuration the next start will use.
    async fn save_configuration(&self, config: &TunnelConfiguration) -> Result<(), ProcessError>;

    /// Signal the process to start.
    async fn start(&self) -> Result<(), ProcessError>;

    /// Signal the process to stop.
    async fn stop(&self) -> Result<(), ProcessError>;

    /// Stream of status changes, starting with the current status.
    fn subscribe_status(&self) -> Subscription<ProcessStatus>;

    /// Deliver one provider message, without retrying.
    async fn send_message(&self, request: ProviderRequest)
    -> Result<ProviderResponse, DeliveryError>;
}
