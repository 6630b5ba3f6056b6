//! Control-channel transport.
//!
//! [`AgentConnector`] opens a session to a server's control endpoint;
//! [`AgentSession`] yields decoded server messages until the stream ends.

use super::error::AgentError;
use super::protocol::{AgentMessage, ClientMessage, decode_server_message};
use crate::certauth::AuthenticationData;
use crate::framing::{self, FrameError};
use crate::intent::VpnFeatures;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

/// Default control-channel port.
pub const DEFAULT_AGENT_PORT: u16 = 65432;

/// Default limit for opening a session.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters for one control session.
#[derive(Debug, Clone)]
pub struct AgentConnectParams {
    /// Entry hostname of the server.
    pub host: String,
    /// Credentials presented to the server.
    pub auth: AuthenticationData,
    /// Requested features.
    pub features: VpnFeatures,
}

/// Opens control sessions.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(&self, params: AgentConnectParams)
    -> Result<Box<dyn AgentSession>, AgentError>;
}

/// An open control session.
#[async_trait]
pub trait AgentSession: Send {
    /// Next server message; `None` once the server closed the stream.
    async fn next_message(&mut self) -> Option<Result<AgentMessage, AgentError>>;

    /// Close the session gracefully.
    async fn close(&mut self);
}

/// Control sessions over TCP with framed JSON.
#[derive(Debug, Clone)]
pub struct TcpAgentConnector {
    port: u16,
    handshake_timeout: Duration,
}

impl TcpAgentConnector {
    /// Connector for the given port.
    pub fn new(port: u16, handshake_timeout: Duration) -> Self {
        Self {
            port,
            handshake_timeout,
        }
    }
}

impl Default for TcpAgentConnector {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_PORT, DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

#[async_trait]
impl AgentConnector for TcpAgentConnector {
    async fn connect(
        &self,
        params: AgentConnectParams,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        let address = (params.host.as_str(), self.port);
        debug!("Opening control channel to {}:{}", params.host, self.port);

        let handshake = async {
            let stream = TcpStream::connect(address).await.map_err(|e| match e.kind() {
                ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::TimedOut => {
                    AgentError::ServerUnreachable
                }
                _ => AgentError::Handshake(e.to_string()),
            })?;
            stream.set_nodelay(true).ok();

            let (reader, mut writer) = stream.into_split();
            framing::write_json(&mut writer, &ClientMessage::hello(&params.auth, &params.features))
                .await
                .map_err(|e| AgentError::Handshake(e.to_string()))?;

            Ok::<_, AgentError>(TcpAgentSession { reader, writer })
        };

        let session = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| AgentError::Handshake("timed out".into()))??;

        debug!("Control channel to {} open", params.host);
        Ok(Box::new(session))
    }
}

struct TcpAgentSession {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

#[async_trait]
impl AgentSession for TcpAgentSession {
    async fn next_message(&mut self) -> Option<Result<AgentMessage, AgentError>> {
        match framing::read_frame(&mut self.reader).await {
            Ok(payload) => Some(decode_server_message(&payload)),
            Err(FrameError::ConnectionClosed) => None,
            Err(e) => {
                debug!("Control channel read failed: {}", e);
                Some(Err(AgentError::ConnectionError))
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = framing::write_json(&mut self.writer, &ClientMessage::Close).await {
            debug!("Failed to send close: {}", e);
        }
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::AgentState;
    use crate::certauth::{Certificate, VpnKeys};
    use chrono::Utc;
    use tokio::net::TcpListener;

    fn params() -> AgentConnectParams {
        AgentConnectParams {
            host: "127.0.0.1".into(),
            auth: AuthenticationData {
                keys: VpnKeys::from_pem("PRIVATE".into(), "PUBLIC".into()),
                certificate: Certificate {
                    raw: "CERT".into(),
                    valid_until: Utc::now(),
                    refresh_time: Utc::now(),
                },
            },
            features: VpnFeatures::default(),
        }
    }

    #[tokio::test]
    async fn test_session_exchanges_framed_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello: serde_json::Value = framing::read_json(&mut stream).await.unwrap();
            framing::write_frame(&mut stream, br#"{"type": "status", "state": "connected"}"#)
                .await
                .unwrap();
            let close: serde_json::Value = framing::read_json(&mut stream).await.unwrap();
            (hello, close)
        });

        let connector = TcpAgentConnector::new(port, Duration::from_secs(5));
        let mut session = connector.connect(params()).await.unwrap();

        let message = session.next_message().await.unwrap().unwrap();
        let AgentMessage::Status(status) = message else {
            panic!("expected status");
        };
        assert_eq!(status.state, Some(AgentState::Connected));

        session.close().await;
        let (hello, close) = server.await.unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["certificate"], "CERT");
        assert_eq!(close["type"], "close");
    }

    #[tokio::test]
    async fn test_server_close_ends_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _: serde_json::Value = framing::read_json(&mut stream).await.unwrap();
        });

        let connector = TcpAgentConnector::new(port, Duration::from_secs(5));
        let mut session = connector.connect(params()).await.unwrap();

        assert!(session.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpAgentConnector::new(port, Duration::from_secs(5));
        let result = connector.connect(params()).await;

        assert!(matches!(result, Err(AgentError::ServerUnreachable)));
    }
}
