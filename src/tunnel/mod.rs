//! Tunnel lifecycle management.
//!
//! The encrypted tunnel runs in a separate privileged process. This module
//! provides:
//!
//! - [`TunnelProcess`]: the boundary to that process (configure, start,
//!   stop, status notifications, provider messages)
//! - [`DaemonTunnelProcess`]: the process reached through the tunnel daemon
//!   over a Unix socket
//! - [`TunnelController`]: sequencing of connect/disconnect and the
//!   published [`TunnelState`] stream
//!
//! # Provider messages
//!
//! Provider messages (certificate refresh, API session hand-off, current
//! server query) are retried on transient delivery failures, 5 attempts
//! 1 second apart by default, before surfacing [`TunnelError::Ipc`].

mod controller;
pub mod daemon;
mod error;
mod process;
mod provider;
mod state;

pub use controller::TunnelController;
pub use daemon::DaemonTunnelProcess;
pub use error::{DeliveryError, ProcessError, TunnelError};
pub use process::{TunnelConfiguration, TunnelProcess};
pub use provider::{ProviderMessenger, ProviderRequest, ProviderResponse};
pub use state::{ProcessStatus, TunnelState};
