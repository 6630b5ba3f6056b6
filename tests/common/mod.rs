//! Scripted subsystems for orchestrator scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use vpnctl::agent::{
    AgentConnectParams, AgentConnector, AgentError, AgentMessage, AgentSession, AgentState,
    AgentStatus, ConnectionDetails,
};
use vpnctl::certauth::{
    CertificateAuthenticator, Certificate, ConfiguredSessionForker, MemoryCredentialStore,
};
use vpnctl::directory::{ServerHandle, StaticServerDirectory};
use vpnctl::intent::LogicalServerRef;
use vpnctl::orchestrator::{ConnectionState, OrchestratorHandle, Subsystems};
use vpnctl::retry::RetryPolicy;
use vpnctl::stream::{StatePublisher, Subscription};
use vpnctl::tunnel::{
    DeliveryError, ProcessError, ProcessStatus, ProviderRequest, ProviderResponse,
    TunnelConfiguration, TunnelController, TunnelProcess,
};

pub fn server() -> ServerHandle {
    ServerHandle {
        logical_id: "CH#1".into(),
        server_id: "ch-01".into(),
        name: "CH#1".into(),
        country: "CH".into(),
        entry_ip: "185.159.157.1".into(),
        exit_ip: "185.159.157.2".into(),
        domain: "node-ch-01.example.net".into(),
        label: None,
    }
}

/// Second server of the same logical, reached when the tunnel picks it.
pub fn other_server() -> ServerHandle {
    ServerHandle {
        server_id: "ch-02".into(),
        entry_ip: "185.159.157.11".into(),
        exit_ip: "185.159.157.12".into(),
        domain: "node-ch-02.example.net".into(),
        ..server()
    }
}

pub fn details() -> ConnectionDetails {
    ConnectionDetails {
        exit_ip: "185.159.157.2".into(),
        device_ip: "10.2.0.2".into(),
        device_country: "DE".into(),
    }
}

pub fn connected_status() -> Result<AgentMessage, AgentError> {
    Ok(AgentMessage::Status(AgentStatus {
        state: Some(AgentState::Connected),
        connection_details: Some(details()),
        ..AgentStatus::default()
    }))
}

pub fn state_message(state: AgentState) -> Result<AgentMessage, AgentError> {
    Ok(AgentMessage::Status(AgentStatus {
        state: Some(state),
        ..AgentStatus::default()
    }))
}

/// Certificate valid for an hour that asks to be refreshed after `delay`.
pub fn certificate_refreshing_in(delay: chrono::Duration) -> Certificate {
    let now = Utc::now();
    Certificate {
        raw: "-----BEGIN CERTIFICATE-----".into(),
        valid_until: now + chrono::Duration::hours(1),
        refresh_time: now + delay,
    }
}

/// Refresh reply carrying [`certificate_refreshing_in`].
pub fn issued_certificate_refreshing_in(delay: chrono::Duration) -> ProviderResponse {
    ProviderResponse::ok_json(&certificate_refreshing_in(delay)).unwrap()
}

fn issued_certificate() -> ProviderResponse {
    issued_certificate_refreshing_in(chrono::Duration::minutes(30))
}

/// Tunnel process that follows start/stop immediately and issues
/// certificates on request.
pub struct FakeTunnelProcess {
    status: StatePublisher<ProcessStatus>,
    pub calls: Mutex<Vec<&'static str>>,
    refresh_responses: Mutex<VecDeque<ProviderResponse>>,
    pub refreshes: AtomicU32,
    /// When set, `start` only reaches `connecting`.
    pub stall: bool,
    reported: Mutex<LogicalServerRef>,
}

impl FakeTunnelProcess {
    pub fn new() -> Self {
        Self {
            status: StatePublisher::new(ProcessStatus::Disconnected { reason: None }),
            calls: Mutex::default(),
            refresh_responses: Mutex::default(),
            refreshes: AtomicU32::new(0),
            stall: false,
            reported: Mutex::new(LogicalServerRef::new("CH#1", "ch-01")),
        }
    }

    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new()
        }
    }

    /// Answer the next refresh with `response` instead of a certificate.
    pub fn push_refresh_response(&self, response: ProviderResponse) {
        self.refresh_responses.lock().unwrap().push_back(response);
    }

    /// Report `reference` as the server the tunnel reached.
    pub fn report_server(&self, reference: LogicalServerRef) {
        *self.reported.lock().unwrap() = reference;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelProcess for FakeTunnelProcess {
    async fn save_configuration(&self, _config: &TunnelConfiguration) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), ProcessError> {
        self.calls.lock().unwrap().push("start");
        self.status.publish(ProcessStatus::Connecting);
        if !self.stall {
            self.status.publish(ProcessStatus::Connected);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessError> {
        self.calls.lock().unwrap().push("stop");
        self.status.publish(ProcessStatus::Disconnecting);
        self.status.publish(ProcessStatus::Disconnected { reason: None });
        Ok(())
    }

    fn subscribe_status(&self) -> Subscription<ProcessStatus> {
        self.status.subscribe()
    }

    async fn send_message(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, DeliveryError> {
        match request {
            ProviderRequest::GetCurrentLogicalAndServerId => {
                let reported = self.reported.lock().unwrap().clone();
                Ok(ProviderResponse::ok_json(&reported).unwrap())
            }
            ProviderRequest::RefreshCertificate { .. } => {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                let scripted = self.refresh_responses.lock().unwrap().pop_front();
                Ok(scripted.unwrap_or_else(issued_certificate))
            }
            _ => Ok(ProviderResponse::Ok(None)),
        }
    }
}

/// Handle on one scripted control session.
pub struct SessionScript {
    pub messages: mpsc::UnboundedSender<Result<AgentMessage, AgentError>>,
    pub closed: Arc<AtomicBool>,
}

struct ScriptedSession {
    messages: mpsc::UnboundedReceiver<Result<AgentMessage, AgentError>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn next_message(&mut self) -> Option<Result<AgentMessage, AgentError>> {
        self.messages.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out scripted sessions in order; unreachable once they
/// run out.
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<VecDeque<ScriptedSession>>,
    pub hosts: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    /// Queue a session that starts with `messages` already buffered.
    pub fn push_session(
        &self,
        messages: Vec<Result<AgentMessage, AgentError>>,
    ) -> SessionScript {
        let (tx, rx) = mpsc::unbounded_channel();
        for message in messages {
            tx.send(message).unwrap();
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.sessions.lock().unwrap().push_back(ScriptedSession {
            messages: rx,
            closed: Arc::clone(&closed),
        });
        SessionScript {
            messages: tx,
            closed,
        }
    }

    pub fn connects(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn connect(
        &self,
        params: AgentConnectParams,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        self.hosts.lock().unwrap().push(params.host);
        match self.sessions.lock().unwrap().pop_front() {
            Some(session) => Ok(Box::new(session)),
            None => Err(AgentError::ServerUnreachable),
        }
    }
}

/// An orchestrator over fake subsystems.
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub process: Arc<FakeTunnelProcess>,
    pub connector: Arc<ScriptedConnector>,
    pub tunnel: Arc<TunnelController>,
}

impl Harness {
    pub fn new(process: FakeTunnelProcess, connect_timeout: Duration) -> Self {
        Self::with_store(process, MemoryCredentialStore::new(), connect_timeout)
    }

    /// Harness whose authenticator starts from `store`.
    pub fn with_store(
        process: FakeTunnelProcess,
        store: MemoryCredentialStore,
        connect_timeout: Duration,
    ) -> Self {
        let process = Arc::new(process);
        let connector = Arc::new(ScriptedConnector::default());
        let tunnel = Arc::new(TunnelController::with_policy(
            process.clone(),
            RetryPolicy::new(1, Duration::ZERO),
        ));
        let authenticator = CertificateAuthenticator::new(
            Arc::new(store),
            tunnel.clone(),
            Arc::new(ConfiguredSessionForker::default()),
        );
        let agent = Arc::new(vpnctl::agent::ControlChannelAgent::new(connector.clone()));

        let handle = OrchestratorHandle::spawn(
            Subsystems {
                tunnel: tunnel.clone(),
                authenticator,
                agent,
                directory: Arc::new(StaticServerDirectory::new(vec![server(), other_server()])),
            },
            connect_timeout,
        );

        Self {
            handle,
            process,
            connector,
            tunnel,
        }
    }

    /// Wait until the tunnel controller reports disconnected.
    pub async fn tunnel_down(&self) {
        let mut states = self.tunnel.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(state) = states.next().await {
                if state.is_disconnected() {
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for the tunnel to stop")
    }
}

/// Next state matching `predicate`, within five seconds.
pub async fn wait_for(
    states: &mut Subscription<ConnectionState>,
    predicate: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = states.next().await.expect("state stream closed");
            if predicate(&state) {
                return state;
            }
        }
    })
    .await
    .expect("timed out waiting for connection state")
}
