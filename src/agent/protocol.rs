//! Control-channel wire protocol.
//!
//! Messages are JSON objects in length-prefixed frames (see
//! [`crate::framing`]). The client opens with a hello carrying its
//! credentials and requested features; the server answers with status and
//! error messages:
//!
//! ```json
//! {"type": "status", "state": "connected",
//!  "connection_details": {"device_ip": "...", "device_country": "CH", "server_ipv4": "..."},
//!  "features_statistics": {"netshield-level": 2, "DNSBL/2a": 12, "savedBytes": 4096}}
//! {"type": "error", "code": 86102, "description": "certificate expired"}
//! ```

use super::error::{AgentError, AgentErrorCode};
use crate::certauth::AuthenticationData;
use crate::intent::VpnFeatures;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// States reported by the control-channel server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Handshake in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Restricted by policy, partially.
    SoftJailed,
    /// Restricted by policy, fully.
    HardJailed,
    /// Session failed.
    ConnectionError,
    /// Endpoint unreachable.
    ServerUnreachable,
    /// Server certificate not trusted.
    ServerCertificateError,
    /// Our certificate was rejected.
    ClientCertificateError,
    /// Session closed.
    Disconnected,
}

impl FromStr for AgentState {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "connecting" => AgentState::Connecting,
            "connected" => AgentState::Connected,
            "soft-jailed" => AgentState::SoftJailed,
            "hard-jailed" => AgentState::HardJailed,
            "connection-error" => AgentState::ConnectionError,
            "server-unreachable" => AgentState::ServerUnreachable,
            "server-certificate-error" => AgentState::ServerCertificateError,
            "client-certificate-error" => AgentState::ClientCertificateError,
            "disconnected" => AgentState::Disconnected,
            other => return Err(AgentError::Decode(format!("unknown state '{other}'"))),
        })
    }
}

impl AgentState {
    /// The error a terminal or error state stands for.
    pub fn error(self) -> Option<AgentError> {
        match self {
            AgentState::SoftJailed => Some(AgentError::SoftJailed),
            AgentState::HardJailed => Some(AgentError::HardJailed),
            AgentState::ConnectionError => Some(AgentError::ConnectionError),
            AgentState::ServerUnreachable => Some(AgentError::ServerUnreachable),
            AgentState::ServerCertificateError => Some(AgentError::ServerCertificateError),
            AgentState::ClientCertificateError => Some(AgentError::ClientCertificateError),
            AgentState::Connecting | AgentState::Connected | AgentState::Disconnected => None,
        }
    }
}

/// Addresses seen by the server. All fields are required.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionDetails {
    /// Address traffic leaves from.
    #[serde(rename = "server_ipv4")]
    pub exit_ip: String,
    /// Address assigned to this device.
    pub device_ip: String,
    /// Country the device connects from.
    pub device_country: String,
}

/// Features the server actually enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFeatures {
    /// DNS blocking level.
    #[serde(rename = "netshield-level", default, skip_serializing_if = "Option::is_none")]
    pub netshield_level: Option<u8>,
    /// Connection accelerator.
    #[serde(rename = "vpn-accelerator", default, skip_serializing_if = "Option::is_none")]
    pub vpn_accelerator: Option<bool>,
    /// Randomized NAT (strict).
    #[serde(rename = "randomized-nat", default, skip_serializing_if = "Option::is_none")]
    pub randomized_nat: Option<bool>,
    /// Safe mode.
    #[serde(rename = "safe-mode", default, skip_serializing_if = "Option::is_none")]
    pub safe_mode: Option<bool>,
    /// Exit bouncing id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bouncing: Option<String>,
}

impl From<&VpnFeatures> for NegotiatedFeatures {
    fn from(features: &VpnFeatures) -> Self {
        Self {
            netshield_level: Some(features.net_shield.as_u8()),
            vpn_accelerator: Some(features.vpn_accelerator),
            randomized_nat: Some(features.nat_type.randomized()),
            safe_mode: features.safe_mode,
            bouncing: features.bouncing.clone(),
        }
    }
}

/// Blocking statistics. Counters may be absent; `bytes_saved` may not.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureStatistics {
    /// Active DNS blocking level.
    #[serde(rename = "netshield-level", default)]
    pub netshield_level: Option<u8>,
    /// Malware domains blocked.
    #[serde(rename = "DNSBL/1b", default)]
    pub malware_blocked: Option<u64>,
    /// Ad domains blocked.
    #[serde(rename = "DNSBL/2a", default)]
    pub ads_blocked: Option<u64>,
    /// Tracker domains blocked.
    #[serde(rename = "DNSBL/2b", default)]
    pub trackers_blocked: Option<u64>,
    /// Bytes not downloaded thanks to blocking.
    #[serde(rename = "savedBytes")]
    pub bytes_saved: u64,
}

/// Decoded status message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentStatus {
    /// Reported state.
    pub state: Option<AgentState>,
    /// Error code attached to the state.
    pub reason: Option<AgentErrorCode>,
    /// Negotiated features.
    pub features: Option<NegotiatedFeatures>,
    /// Connection details.
    pub connection_details: Option<ConnectionDetails>,
    /// Feature statistics.
    pub statistics: Option<FeatureStatistics>,
}

/// Decoded server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    /// State and data update.
    Status(AgentStatus),
    /// Standalone error.
    Error(AgentErrorCode),
}

#[derive(Debug, Deserialize)]
struct ErrorWire {
    code: u32,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerWire {
    Status {
        state: String,
        #[serde(default)]
        reason: Option<ErrorWire>,
        #[serde(default)]
        features: Option<NegotiatedFeatures>,
        #[serde(default)]
        connection_details: Option<ConnectionDetails>,
        #[serde(default)]
        features_statistics: Option<FeatureStatistics>,
    },
    Error(ErrorWire),
}

/// Client messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage<'a> {
    /// Opening message with credentials.
    Hello {
        /// PEM certificate.
        certificate: &'a str,
        /// PEM public key.
        public_key: &'a str,
        /// Requested features.
        features: NegotiatedFeatures,
    },
    /// Graceful close.
    Close,
}

impl<'a> ClientMessage<'a> {
    /// Hello for the given credentials and features.
    pub fn hello(auth: &'a AuthenticationData, features: &VpnFeatures) -> Self {
        ClientMessage::Hello {
            certificate: &auth.certificate.raw,
            public_key: auth.keys.public_key_pem(),
            features: NegotiatedFeatures::from(features),
        }
    }
}

/// Decode one server frame.
pub fn decode_server_message(payload: &[u8]) -> Result<AgentMessage, AgentError> {
    let wire: ServerWire =
        serde_json::from_slice(payload).map_err(|e| AgentError::Decode(e.to_string()))?;

    Ok(match wire {
        ServerWire::Status {
            state,
            reason,
            features,
            connection_details,
            features_statistics,
        } => AgentMessage::Status(AgentStatus {
            state: Some(state.parse()?),
            reason: reason.map(|r| {
                if let Some(description) = &r.description {
                    debug!("Server reason {}: {}", r.code, description);
                }
                AgentErrorCode::from_code(r.code)
            }),
            features,
            connection_details,
            statistics: features_statistics,
        }),
        ServerWire::Error(error) => {
            if let Some(description) = &error.description {
                debug!("Server error {}: {}", error.code, description);
            }
            AgentMessage::Error(AgentErrorCode::from_code(error.code))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_without_optional_counter_decode() {
        let stats: FeatureStatistics =
            serde_json::from_str(r#"{"netshield-level": 2, "DNSBL/1b": 3, "savedBytes": 4096}"#)
                .unwrap();

        assert_eq!(stats.ads_blocked, None);
        assert_eq!(stats.malware_blocked, Some(3));
        assert_eq!(stats.bytes_saved, 4096);
    }

    #[test]
    fn test_statistics_without_bytes_saved_fail() {
        let result =
            serde_json::from_str::<FeatureStatistics>(r#"{"DNSBL/2a": 12, "DNSBL/2b": 7}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_connection_details_require_every_field() {
        let complete = br#"{"type": "status", "state": "connected",
            "connection_details": {"device_ip": "10.2.0.2", "device_country": "CH", "server_ipv4": "185.1.1.1"}}"#;
        let partial = br#"{"type": "status", "state": "connected",
            "connection_details": {"device_ip": "10.2.0.2", "server_ipv4": "185.1.1.1"}}"#;

        let AgentMessage::Status(status) = decode_server_message(complete).unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.connection_details.unwrap().exit_ip, "185.1.1.1");
        assert!(matches!(decode_server_message(partial), Err(AgentError::Decode(_))));
    }

    #[test]
    fn test_error_message_maps_code() {
        let message =
            decode_server_message(br#"{"type": "error", "code": 86113, "description": "unpaid"}"#)
                .unwrap();
        assert_eq!(
            message,
            AgentMessage::Error(AgentErrorCode::PolicyViolationDelinquent)
        );
    }

    #[test]
    fn test_status_reason_and_unknown_state() {
        let message = decode_server_message(
            br#"{"type": "status", "state": "hard-jailed", "reason": {"code": 86115}}"#,
        )
        .unwrap();
        let AgentMessage::Status(status) = message else {
            panic!("expected status");
        };
        assert_eq!(status.state, Some(AgentState::HardJailed));
        assert_eq!(status.reason, Some(AgentErrorCode::UserBadBehavior));

        let unknown = decode_server_message(br#"{"type": "status", "state": "sleeping"}"#);
        assert!(matches!(unknown, Err(AgentError::Decode(_))));
    }

    #[test]
    fn test_hello_carries_public_credentials_only() {
        use crate::certauth::{Certificate, VpnKeys};
        use chrono::Utc;

        let auth = AuthenticationData {
            keys: VpnKeys::from_pem("PRIVATE".into(), "PUBLIC".into()),
            certificate: Certificate {
                raw: "CERT".into(),
                valid_until: Utc::now(),
                refresh_time: Utc::now(),
            },
        };
        let json = serde_json::to_string(&ClientMessage::hello(&auth, &VpnFeatures::default()))
            .unwrap();

        assert!(json.contains(r#""type":"hello""#));
        assert!(json.contains("CERT"));
        assert!(json.contains("PUBLIC"));
        assert!(!json.contains("PRIVATE"));
        assert!(json.contains(r#""randomized-nat":true"#));
    }
}
