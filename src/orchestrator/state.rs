//! Unified connection state.

use super::error::ConnectionError;
use crate::agent::ControlChannelState;
use crate::certauth::CertAuthState;
use crate::directory::{ServerDirectory, ServerHandle};
use crate::tunnel::TunnelState;

/// The single state callers observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; carries the error that ended the last attempt.
    Disconnected(Option<ConnectionError>),
    /// An attempt is in progress.
    Connecting,
    /// Tunnel and control channel are up.
    Connected(ServerHandle),
    /// Tearing down at the caller's request.
    Disconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected(None)
    }
}

impl ConnectionState {
    /// Combine the latest subsystem states.
    ///
    /// | Tunnel            | CertAuth | Agent                   | Result                 |
    /// |-------------------|----------|-------------------------|------------------------|
    /// | disconnected(e)   | -        | -                       | disconnected(tunnel e) |
    /// | connecting        | -        | -                       | connecting             |
    /// | disconnecting     | -        | -                       | disconnecting          |
    /// | connected         | -        | disconnected(e)         | disconnected(agent e)  |
    /// | connected         | failed(e)| -                       | disconnected(cert e)   |
    /// | connected         | loaded   | connected               | connected(server)      |
    /// | connected         | other    | connecting/disconnected | connecting             |
    ///
    /// A connected tunnel whose server the directory cannot resolve yields
    /// `disconnected(server missing)`.
    pub fn derive(
        tunnel: &TunnelState,
        cert: &CertAuthState,
        agent: &ControlChannelState,
        directory: &dyn ServerDirectory,
    ) -> Self {
        let reference = match tunnel {
            TunnelState::Disconnected(error) => {
                return ConnectionState::Disconnected(error.clone().map(ConnectionError::Tunnel));
            }
            TunnelState::Connecting(_) => return ConnectionState::Connecting,
            TunnelState::Disconnecting => return ConnectionState::Disconnecting,
            TunnelState::Connected(reference) => reference,
        };

        if let ControlChannelState::Disconnected(Some(error)) = agent {
            return ConnectionState::Disconnected(Some(ConnectionError::Agent(error.clone())));
        }
        if let CertAuthState::Failed(error) = cert {
            return ConnectionState::Disconnected(Some(ConnectionError::CertAuth(error.clone())));
        }

        match (cert, agent) {
            (CertAuthState::Loaded(_), ControlChannelState::Connected(_)) => {
                match directory.resolve(reference) {
                    Some(server) => ConnectionState::Connected(server),
                    None => ConnectionState::Disconnected(Some(ConnectionError::ServerMissing(
                        reference.to_string(),
                    ))),
                }
            }
            _ => ConnectionState::Connecting,
        }
    }

    /// The error carried by a `Disconnected` state.
    pub fn error(&self) -> Option<&ConnectionError> {
        match self {
            ConnectionState::Disconnected(error) => error.as_ref(),
            _ => None,
        }
    }

    /// Whether the state is `Disconnected`.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }

    /// Whether the state is `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, ConnectionDetails};
    use crate::certauth::{AuthenticationData, CertAuthError, Certificate, VpnKeys};
    use crate::directory::StaticServerDirectory;
    use crate::intent::LogicalServerRef;
    use crate::tunnel::TunnelError;
    use chrono::Utc;

    fn server() -> ServerHandle {
        ServerHandle {
            logical_id: "CH#1".into(),
            server_id: "s1".into(),
            name: "CH#1".into(),
            country: "CH".into(),
            entry_ip: "185.1.1.1".into(),
            exit_ip: "185.1.1.2".into(),
            domain: "ch-01.example.net".into(),
            label: None,
        }
    }

    fn directory() -> StaticServerDirectory {
        StaticServerDirectory::new(vec![server()])
    }

    fn loaded() -> CertAuthState {
        CertAuthState::Loaded(AuthenticationData {
            keys: VpnKeys::from_pem("PRIVATE".into(), "PUBLIC".into()),
            certificate: Certificate {
                raw: "CERT".into(),
                valid_until: Utc::now(),
                refresh_time: Utc::now(),
            },
        })
    }

    fn connected_tunnel() -> TunnelState {
        TunnelState::Connected(LogicalServerRef::new("CH#1", "s1"))
    }

    fn agent_connected() -> ControlChannelState {
        ControlChannelState::Connected(Some(ConnectionDetails {
            exit_ip: "185.1.1.2".into(),
            device_ip: "10.2.0.2".into(),
            device_country: "DE".into(),
        }))
    }

    #[test]
    fn test_connected_requires_all_three() {
        let dir = directory();

        assert_eq!(
            ConnectionState::derive(&connected_tunnel(), &loaded(), &agent_connected(), &dir),
            ConnectionState::Connected(server())
        );
        assert_eq!(
            ConnectionState::derive(
                &connected_tunnel(),
                &CertAuthState::Loading { should_refresh_if_missing: true },
                &agent_connected(),
                &dir
            ),
            ConnectionState::Connecting
        );
        assert_eq!(
            ConnectionState::derive(
                &connected_tunnel(),
                &loaded(),
                &ControlChannelState::Connecting,
                &dir
            ),
            ConnectionState::Connecting
        );
        assert_eq!(
            ConnectionState::derive(
                &connected_tunnel(),
                &loaded(),
                &ControlChannelState::Disconnected(None),
                &dir
            ),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn test_tunnel_state_dominates() {
        let dir = directory();
        let error = TunnelError::Terminated("gone".into());

        assert_eq!(
            ConnectionState::derive(
                &TunnelState::Disconnected(Some(error.clone())),
                &loaded(),
                &agent_connected(),
                &dir
            ),
            ConnectionState::Disconnected(Some(ConnectionError::Tunnel(error)))
        );
        assert_eq!(
            ConnectionState::derive(
                &TunnelState::Connecting(None),
                &CertAuthState::Failed(CertAuthError::NeedNewKeys),
                &ControlChannelState::Disconnected(Some(AgentError::HardJailed)),
                &dir
            ),
            ConnectionState::Connecting
        );
        assert_eq!(
            ConnectionState::derive(
                &TunnelState::Disconnecting,
                &loaded(),
                &agent_connected(),
                &dir
            ),
            ConnectionState::Disconnecting
        );
    }

    #[test]
    fn test_subsystem_errors_collapse() {
        let dir = directory();

        assert_eq!(
            ConnectionState::derive(
                &connected_tunnel(),
                &loaded(),
                &ControlChannelState::Disconnected(Some(AgentError::HardJailed)),
                &dir
            ),
            ConnectionState::Disconnected(Some(ConnectionError::Agent(AgentError::HardJailed)))
        );
        assert_eq!(
            ConnectionState::derive(
                &connected_tunnel(),
                &CertAuthState::Failed(CertAuthError::NeedNewKeys),
                &ControlChannelState::Connecting,
                &dir
            ),
            ConnectionState::Disconnected(Some(ConnectionError::CertAuth(
                CertAuthError::NeedNewKeys
            )))
        );
    }

    #[test]
    fn test_unresolved_server_is_missing() {
        let dir = StaticServerDirectory::new(Vec::new());
        let state = ConnectionState::derive(&connected_tunnel(), &loaded(), &agent_connected(), &dir);

        assert_eq!(
            state,
            ConnectionState::Disconnected(Some(ConnectionError::ServerMissing("CH#1/s1".into())))
        );
    }
}
