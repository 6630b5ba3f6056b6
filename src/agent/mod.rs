//! Control channel to the connected server.
//!
//! Once the tunnel is up, a control session is opened to the server's
//! entry hostname, authenticated with the same certificate and keys as the
//! tunnel. The server reports session state, negotiated features, the
//! addresses it sees and blocking statistics.
//!
//! - [`ControlChannelAgent`]: one session at a time, state plus events
//! - [`AgentConnector`] / [`AgentSession`]: the transport seam
//!   ([`TcpAgentConnector`] speaks framed JSON over TCP)
//! - [`AgentError`] / [`AgentErrorCode`]: failure taxonomy

mod controller;
mod error;
mod protocol;
mod session;

pub use controller::{AgentEvent, ControlChannelAgent, ControlChannelState};
pub use error::{AgentError, AgentErrorCode, CODE_TABLE};
pub use protocol::{
    AgentMessage, AgentState, AgentStatus, ConnectionDetails, FeatureStatistics,
    NegotiatedFeatures, decode_server_message,
};
pub use session::{
    AgentConnectParams, AgentConnector, AgentSession, DEFAULT_AGENT_PORT,
    DEFAULT_HANDSHAKE_TIMEOUT, TcpAgentConnector,
};
