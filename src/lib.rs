//! vpnctl: VPN connection orchestration.
//!
//! This crate sequences a tunnel daemon, certificate-based authentication and
//! the server's control channel into a single connection with one observable
//! state.
//!
//! # Connection Model
//!
//! A connection is only `Connected` when the tunnel is up, credentials are
//! loaded and the control channel reports the session established. Any
//! subsystem's terminal error tears the whole connection down; errors the
//! server marks as recoverable trigger one credential refresh and a new
//! control-channel session.
//!
//! # Architecture
//!
//! - **Tunnel**: Lifecycle of the tunnel process and its provider message channel
//! - **CertAuth**: Key and certificate storage, refresh and rate limiting
//! - **Agent**: Control-channel sessions, wire protocol and error codes
//! - **Orchestrator**: The actor combining all three into a [`orchestrator::ConnectionState`]
//! - **Directory**: Server metadata lookups
//! - **Config**: Hierarchical TOML configuration

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod agent;
pub mod certauth;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod directory;
pub mod framing;
pub mod intent;
pub mod orchestrator;
pub mod retry;
pub mod stream;
pub mod tunnel;
