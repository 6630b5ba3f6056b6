//! Control-channel error taxonomy.
//!
//! Servers report failures as numeric codes. Codes are mapped through
//! [`CODE_TABLE`]; anything not listed becomes [`AgentErrorCode::Unknown`].

use std::fmt;
use thiserror::Error;

/// Server-reported error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentErrorCode {
    /// The plan does not allow this server.
    RestrictedServer,
    /// The presented certificate expired.
    CertificateExpired,
    /// The presented certificate was revoked.
    CertificateRevoked,
    /// Session limit reached, plan unknown.
    MaxSessionsUnknown,
    /// Session limit reached on the free plan.
    MaxSessionsFree,
    /// Session limit reached on the basic plan.
    MaxSessionsBasic,
    /// Session limit reached on the plus plan.
    MaxSessionsPlus,
    /// Session limit reached on the visionary plan.
    MaxSessionsVisionary,
    /// Session limit reached on the pro plan.
    MaxSessionsPro,
    /// The keypair is in use by another session.
    KeyUsedMultipleTimes,
    /// Internal server failure.
    ServerError,
    /// Policy violation: plan too low.
    PolicyViolationLowPlan,
    /// Policy violation: delinquent account.
    PolicyViolationDelinquent,
    /// Torrenting not allowed on this server.
    UserTorrentNotAllowed,
    /// Abuse detected.
    UserBadBehavior,
    /// Guest sessions may not connect.
    GuestSession,
    /// Session does not match the server.
    ServerSessionDoesNotMatch,
    /// Certificate signature did not verify.
    BadCertificateSignature,
    /// No certificate was presented.
    CertificateNotProvided,
    /// A code this client does not know.
    Unknown(u32),
}

/// Every known code and its meaning.
pub const CODE_TABLE: &[(u32, AgentErrorCode)] = &[
    (86101, AgentErrorCode::RestrictedServer),
    (86102, AgentErrorCode::CertificateExpired),
    (86103, AgentErrorCode::CertificateRevoked),
    (86104, AgentErrorCode::MaxSessionsUnknown),
    (86105, AgentErrorCode::MaxSessionsFree),
    (86106, AgentErrorCode::MaxSessionsBasic),
    (86107, AgentErrorCode::MaxSessionsPlus),
    (86108, AgentErrorCode::MaxSessionsVisionary),
    (86109, AgentErrorCode::MaxSessionsPro),
    (86110, AgentErrorCode::KeyUsedMultipleTimes),
    (86111, AgentErrorCode::ServerError),
    (86112, AgentErrorCode::PolicyViolationLowPlan),
    (86113, AgentErrorCode::PolicyViolationDelinquent),
    (86114, AgentErrorCode::UserTorrentNotAllowed),
    (86115, AgentErrorCode::UserBadBehavior),
    (86116, AgentErrorCode::GuestSession),
    (86202, AgentErrorCode::ServerSessionDoesNotMatch),
    (86211, AgentErrorCode::BadCertificateSignature),
    (86212, AgentErrorCode::CertificateNotProvided),
];

impl AgentErrorCode {
    /// Map a numeric code.
    pub fn from_code(code: u32) -> Self {
        CODE_TABLE
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, kind)| *kind)
            .unwrap_or(AgentErrorCode::Unknown(code))
    }

    /// The numeric code.
    pub fn code(self) -> u32 {
        if let AgentErrorCode::Unknown(code) = self {
            return code;
        }
        CODE_TABLE
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(c, _)| *c)
            .unwrap_or_default()
    }

    /// Certificate problems fixed by fetching a new certificate.
    pub fn is_certificate_error(self) -> bool {
        matches!(
            self,
            AgentErrorCode::CertificateExpired
                | AgentErrorCode::CertificateRevoked
                | AgentErrorCode::BadCertificateSignature
                | AgentErrorCode::CertificateNotProvided
        )
    }

    /// Whether the session survives this error.
    pub fn is_recoverable(self) -> bool {
        self.is_certificate_error() || self == AgentErrorCode::KeyUsedMultipleTimes
    }

    /// The plan tier for session-limit errors.
    pub fn session_limit_tier(self) -> Option<&'static str> {
        match self {
            AgentErrorCode::MaxSessionsUnknown => Some("unknown"),
            AgentErrorCode::MaxSessionsFree => Some("free"),
            AgentErrorCode::MaxSessionsBasic => Some("basic"),
            AgentErrorCode::MaxSessionsPlus => Some("plus"),
            AgentErrorCode::MaxSessionsVisionary => Some("visionary"),
            AgentErrorCode::MaxSessionsPro => Some("pro"),
            _ => None,
        }
    }
}

impl fmt::Display for AgentErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentErrorCode::Unknown(code) => write!(f, "unknown error {code}"),
            other => write!(f, "{:?} ({})", other, other.code()),
        }
    }
}

/// Control-channel failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// The server reported an error code.
    #[error("Server reported {0}")]
    Server(AgentErrorCode),

    /// Connection restricted by server policy, partially.
    #[error("Connection soft-jailed by server policy")]
    SoftJailed,

    /// Connection restricted by server policy, fully.
    #[error("Connection hard-jailed by server policy")]
    HardJailed,

    /// The control session failed.
    #[error("Control channel connection error")]
    ConnectionError,

    /// The control endpoint could not be reached.
    #[error("Control channel server unreachable")]
    ServerUnreachable,

    /// The server's certificate was not trusted.
    #[error("Control channel server certificate rejected")]
    ServerCertificateError,

    /// The server rejected our certificate.
    #[error("Control channel client certificate rejected")]
    ClientCertificateError,

    /// Opening the session failed.
    #[error("Control channel handshake failed: {0}")]
    Handshake(String),

    /// A message could not be decoded.
    #[error("Failed to decode control channel message: {0}")]
    Decode(String),
}

impl AgentError {
    /// Whether the session survives this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AgentError::Server(code) => code.is_recoverable(),
            AgentError::ClientCertificateError => true,
            _ => false,
        }
    }

    /// Whether a new certificate fixes this error.
    pub fn needs_new_certificate(&self) -> bool {
        match self {
            AgentError::Server(code) => code.is_certificate_error(),
            AgentError::ClientCertificateError => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_code_table_is_unique_and_invertible() {
        let codes: HashSet<u32> = CODE_TABLE.iter().map(|(c, _)| *c).collect();
        let kinds: HashSet<AgentErrorCode> = CODE_TABLE.iter().map(|(_, k)| *k).collect();
        assert_eq!(codes.len(), CODE_TABLE.len());
        assert_eq!(kinds.len(), CODE_TABLE.len());

        for (code, kind) in CODE_TABLE {
            assert_eq!(AgentErrorCode::from_code(*code), *kind);
            assert_eq!(kind.code(), *code);
            assert!(!matches!(kind, AgentErrorCode::Unknown(_)));
        }
    }

    #[test]
    fn test_unknown_codes_are_preserved() {
        let kind = AgentErrorCode::from_code(99999);
        assert_eq!(kind, AgentErrorCode::Unknown(99999));
        assert_eq!(kind.code(), 99999);
        assert!(!kind.is_recoverable());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(AgentErrorCode::from_code(86102).is_recoverable());
        assert!(AgentErrorCode::from_code(86110).is_recoverable());
        assert!(AgentErrorCode::from_code(86212).is_certificate_error());
        assert!(!AgentErrorCode::from_code(86101).is_recoverable());
        assert!(!AgentError::HardJailed.is_recoverable());
        assert!(AgentError::ClientCertificateError.needs_new_certificate());
        assert!(!AgentError::Server(AgentErrorCode::KeyUsedMultipleTimes).needs_new_certificate());
    }

    #[test]
    fn test_session_limit_tiers() {
        assert_eq!(AgentErrorCode::from_code(86107).session_limit_tier(), Some("plus"));
        assert_eq!(AgentErrorCode::ServerError.session_limit_tier(), None);
    }
}
