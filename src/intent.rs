//! Connection intent: what the caller asked to connect to, and how.
//!
//! A [`ServerConnectionIntent`] is built once per connect request and never
//! modified for the duration of that attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tunnel transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnTransport {
    /// Plain UDP.
    #[default]
    Udp,
    /// TCP, for networks that drop UDP.
    Tcp,
    /// TLS-wrapped TCP (stealth).
    Tls,
}

impl fmt::Display for VpnTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VpnTransport::Udp => "udp",
            VpnTransport::Tcp => "tcp",
            VpnTransport::Tls => "tls",
        })
    }
}

impl FromStr for VpnTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(VpnTransport::Udp),
            "tcp" => Ok(VpnTransport::Tcp),
            "tls" | "stealth" => Ok(VpnTransport::Tls),
            other => Err(format!("unknown transport '{other}' (expected udp, tcp or tls)")),
        }
    }
}

/// DNS-level blocking strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetShieldLevel {
    /// No blocking.
    #[default]
    Off,
    /// Block malware.
    Level1,
    /// Block malware, ads and trackers.
    Level2,
}

impl NetShieldLevel {
    /// Numeric level as used on the control channel.
    pub fn as_u8(self) -> u8 {
        match self {
            NetShieldLevel::Off => 0,
            NetShieldLevel::Level1 => 1,
            NetShieldLevel::Level2 => 2,
        }
    }

    /// Inverse of [`NetShieldLevel::as_u8`].
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(NetShieldLevel::Off),
            1 => Some(NetShieldLevel::Level1),
            2 => Some(NetShieldLevel::Level2),
            _ => None,
        }
    }
}

impl FromStr for NetShieldLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(NetShieldLevel::Off),
            "1" | "level1" => Ok(NetShieldLevel::Level1),
            "2" | "level2" => Ok(NetShieldLevel::Level2),
            other => Err(format!("unknown net-shield level '{other}' (expected off, 1 or 2)")),
        }
    }
}

/// NAT behaviour requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NatType {
    /// Randomized per-connection port mapping.
    #[default]
    Strict,
    /// Endpoint-independent mapping (gaming, p2p).
    Moderate,
}

impl NatType {
    /// Whether the server should randomize NAT mappings.
    pub fn randomized(self) -> bool {
        matches!(self, NatType::Strict)
    }
}

impl FromStr for NatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(NatType::Strict),
            "moderate" => Ok(NatType::Moderate),
            other => Err(format!("unknown NAT type '{other}' (expected strict or moderate)")),
        }
    }
}

/// Features requested for a connection.
///
/// Sent to the tunnel process with certificate refreshes (so the certificate
/// encodes them) and to the control channel on connect.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VpnFeatures {
    /// DNS blocking level.
    pub net_shield: NetShieldLevel,
    /// Server-side connection accelerator.
    pub vpn_accelerator: bool,
    /// NAT behaviour.
    pub nat_type: NatType,
    /// Safe mode, where the plan supports it.
    pub safe_mode: Option<bool>,
    /// Exit bouncing identifier, when pinned to a specific exit.
    pub bouncing: Option<String>,
}

/// Opaque (logical, server) id pair reported by the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalServerRef {
    /// Logical server id.
    pub logical_id: String,
    /// Physical server id within the logical.
    pub server_id: String,
}

impl LogicalServerRef {
    /// Build a reference from its parts.
    pub fn new(logical_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            server_id: server_id.into(),
        }
    }
}

impl fmt::Display for LogicalServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.logical_id, self.server_id)
    }
}

/// Which server the caller wants.
///
/// Without a `server_id` any server of the logical will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    /// Logical server id.
    pub logical_id: String,
    /// Specific physical server.
    pub server_id: Option<String>,
}

impl ServerTarget {
    /// Target any server of a logical.
    pub fn logical(logical_id: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            server_id: None,
        }
    }

    /// Target one physical server.
    pub fn exact(reference: LogicalServerRef) -> Self {
        Self {
            logical_id: reference.logical_id,
            server_id: Some(reference.server_id),
        }
    }
}

/// One connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnectionIntent {
    /// Target server.
    pub target: ServerTarget,
    /// Tunnel transport.
    pub transport: VpnTransport,
    /// Requested features.
    pub features: VpnFeatures,
}

impl ServerConnectionIntent {
    /// Intent with default transport and features.
    pub fn new(target: ServerTarget) -> Self {
        Self {
            target,
            transport: VpnTransport::default(),
            features: VpnFeatures::default(),
        }
    }
}
