//! Unified connection errors and their user-facing presentation.

use crate::agent::{AgentError, AgentErrorCode};
use crate::certauth::CertAuthError;
use crate::tunnel::TunnelError;
use thiserror::Error;

/// Why a connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The tunnel failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The control channel failed.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Credentials could not be loaded.
    #[error(transparent)]
    CertAuth(#[from] CertAuthError),

    /// The server is not in the directory.
    #[error("Server {0} not found in the server directory")]
    ServerMissing(String),

    /// The attempt did not complete in time.
    #[error("Connection attempt timed out")]
    Timeout,
}

/// Errors returned by orchestrator commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// The orchestrator task is gone.
    #[error("Connection orchestrator has stopped")]
    Stopped,

    /// The command was rejected.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// What kind of message to show for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Device limit reached; carries the plan tier.
    SessionLimit(&'static str),
    /// The plan does not include this.
    PlanUpgrade,
    /// The account has an unpaid balance.
    Billing,
    /// The server is restricted.
    RestrictedServer,
    /// Partially restricted by policy.
    SoftJailed,
    /// Fully restricted by policy.
    HardJailed,
    /// Abuse or terms violation.
    Abuse,
    /// Credentials problem.
    Certificate,
    /// Too many certificate requests.
    RateLimited,
    /// Server missing from the directory.
    ServerMissing,
    /// Connection attempt timed out.
    Timeout,
    /// The tunnel failed.
    Tunnel,
    /// Anything else.
    Generic,
}

/// A presentable message for an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
    /// Message kind.
    pub category: MessageCategory,
    /// Text for the user.
    pub message: String,
}

impl Presentation {
    fn new(category: MessageCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

const GENERIC_MESSAGE: &str = "Connection failed. Please try again.";

impl ConnectionError {
    /// The message category and text for this error.
    pub fn presentation(&self) -> Presentation {
        match self {
            ConnectionError::Tunnel(e) => Presentation::new(
                MessageCategory::Tunnel,
                format!("The VPN tunnel could not be established: {e}"),
            ),
            ConnectionError::Agent(e) => agent_presentation(e),
            ConnectionError::CertAuth(CertAuthError::RefreshWasRateLimited { retry_after }) => {
                let message = match retry_after {
                    Some(delay) => format!(
                        "Too many connection attempts. Please wait {} seconds and try again.",
                        delay.as_secs()
                    ),
                    None => "Too many connection attempts. Please wait and try again.".into(),
                };
                Presentation::new(MessageCategory::RateLimited, message)
            }
            ConnectionError::CertAuth(e) => Presentation::new(
                MessageCategory::Certificate,
                format!("Could not obtain VPN credentials: {e}"),
            ),
            ConnectionError::ServerMissing(server) => Presentation::new(
                MessageCategory::ServerMissing,
                format!("Server {server} is no longer available. Please pick another server."),
            ),
            ConnectionError::Timeout => Presentation::new(
                MessageCategory::Timeout,
                "The connection attempt timed out. Please try again.",
            ),
        }
    }
}

fn agent_presentation(error: &AgentError) -> Presentation {
    use MessageCategory as C;

    match error {
        AgentError::SoftJailed => Presentation::new(
            C::SoftJailed,
            "Your connection is restricted. Some traffic is blocked on this server.",
        ),
        AgentError::HardJailed => Presentation::new(
            C::HardJailed,
            "Your connection was blocked by the server's usage policy.",
        ),
        AgentError::ServerCertificateError | AgentError::ClientCertificateError => {
            Presentation::new(C::Certificate, "The server rejected the VPN credentials.")
        }
        AgentError::Server(code) => server_code_presentation(*code),
        AgentError::ConnectionError
        | AgentError::ServerUnreachable
        | AgentError::Handshake(_)
        | AgentError::Decode(_) => Presentation::new(C::Generic, GENERIC_MESSAGE),
    }
}

fn server_code_presentation(code: AgentErrorCode) -> Presentation {
    use AgentErrorCode as E;
    use MessageCategory as C;

    if let Some(tier) = code.session_limit_tier() {
        let message = match code {
            E::MaxSessionsVisionary | E::MaxSessionsPro => {
                "You have reached the maximum number of connected devices. \
                 Disconnect another device to continue."
                    .to_string()
            }
            _ => format!(
                "You have reached the device limit of your {tier} plan. \
                 Upgrade to connect more devices."
            ),
        };
        return Presentation::new(C::SessionLimit(tier), message);
    }

    match code {
        E::RestrictedServer => Presentation::new(
            C::RestrictedServer,
            "This server is not available on your plan.",
        ),
        E::PolicyViolationLowPlan | E::GuestSession => Presentation::new(
            C::PlanUpgrade,
            "Your plan does not allow this connection. Upgrade to continue.",
        ),
        E::PolicyViolationDelinquent => Presentation::new(
            C::Billing,
            "Your account has an unpaid balance. Please settle it to reconnect.",
        ),
        E::UserTorrentNotAllowed => Presentation::new(
            C::Abuse,
            "File sharing is not allowed on this server.",
        ),
        E::UserBadBehavior => Presentation::new(
            C::Abuse,
            "Your account was restricted for violating the terms of service.",
        ),
        E::CertificateExpired
        | E::CertificateRevoked
        | E::KeyUsedMultipleTimes
        | E::ServerSessionDoesNotMatch
        | E::BadCertificateSignature
        | E::CertificateNotProvided => Presentation::new(
            C::Certificate,
            "The server rejected the VPN credentials.",
        ),
        _ => Presentation::new(C::Generic, GENERIC_MESSAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CODE_TABLE;
    use std::time::Duration;

    #[test]
    fn test_session_limits_name_the_plan() {
        let error = ConnectionError::Agent(AgentError::Server(AgentErrorCode::MaxSessionsPlus));
        let presentation = error.presentation();

        assert_eq!(presentation.category, MessageCategory::SessionLimit("plus"));
        assert!(presentation.message.contains("plus plan"));
    }

    #[test]
    fn test_delinquent_renders_billing() {
        let error = ConnectionError::Agent(AgentError::Server(
            AgentErrorCode::PolicyViolationDelinquent,
        ));
        assert_eq!(error.presentation().category, MessageCategory::Billing);
    }

    #[test]
    fn test_unknown_codes_fall_back_to_generic() {
        let error = ConnectionError::Agent(AgentError::Server(AgentErrorCode::Unknown(1)));
        let presentation = error.presentation();

        assert_eq!(presentation.category, MessageCategory::Generic);
        assert_eq!(presentation.message, GENERIC_MESSAGE);
    }

    #[test]
    fn test_every_known_code_has_a_message() {
        for (_, code) in CODE_TABLE {
            let presentation = ConnectionError::Agent(AgentError::Server(*code)).presentation();
            assert!(!presentation.message.is_empty());
        }
        assert_eq!(
            ConnectionError::Agent(AgentError::Server(AgentErrorCode::ServerError))
                .presentation()
                .category,
            MessageCategory::Generic
        );
    }

    #[test]
    fn test_jail_states_are_distinct() {
        let soft = ConnectionError::Agent(AgentError::SoftJailed).presentation();
        let hard = ConnectionError::Agent(AgentError::HardJailed).presentation();

        assert_eq!(soft.category, MessageCategory::SoftJailed);
        assert_eq!(hard.category, MessageCategory::HardJailed);
        assert_ne!(soft.message, hard.message);
    }

    #[test]
    fn test_rate_limit_mentions_delay() {
        let error = ConnectionError::CertAuth(CertAuthError::RefreshWasRateLimited {
            retry_after: Some(Duration::from_secs(30)),
        });
        let presentation = error.presentation();

        assert_eq!(presentation.category, MessageCategory::RateLimited);
        assert!(presentation.message.contains("30 seconds"));
    }

    #[test]
    fn test_other_errors_map_to_their_category() {
        assert_eq!(
            ConnectionError::Timeout.presentation().category,
            MessageCategory::Timeout
        );
        assert_eq!(
            ConnectionError::ServerMissing("CH#1".into()).presentation().category,
            MessageCategory::ServerMissing
        );
        assert_eq!(
            ConnectionError::Tunnel(TunnelError::Terminated("gone".into()))
                .presentation()
                .category,
            MessageCategory::Tunnel
        );
        assert_eq!(
            ConnectionError::CertAuth(CertAuthError::NeedNewKeys)
                .presentation()
                .category,
            MessageCategory::Certificate
        );
    }
}
