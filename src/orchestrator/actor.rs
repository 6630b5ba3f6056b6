//! The orchestrator actor.
//!
//! All orchestration state lives in one task. It receives commands from
//! [`OrchestratorHandle`], the state streams of the three subsystems, the
//! control channel's events and the results of its own background work,
//! and republishes a single [`ConnectionState`] after each of them.
//!
//! ```text
//! connect ──► tunnel ──connected──► credentials ──loaded──► agent ──connected──► Connected
//!                                        ▲                     │                     │
//!                                        └──── recoverable ◄───┘       refresh time  │
//!                                              (once per connection)         ▼       │
//!                                                               rotating ◄── renew ◄─┘
//! ```
//!
//! While connected, the certificate is renewed in the background at its
//! refresh time and the control channel is reopened with it. The caller
//! keeps seeing `Connected` throughout; a failed renewal leaves the
//! connection as it is.
//!
//! Tunnel operations run on a separate worker in submission order, so a
//! teardown always reaches the process before the next attempt's start.

use super::error::{ConnectionError, OrchestratorError};
use super::state::ConnectionState;
use crate::agent::{AgentError, AgentEvent, ControlChannelAgent, ControlChannelState};
use crate::certauth::{
    AuthenticationData, CertAuthError, CertAuthState, Certificate, CertificateAuthenticator,
};
use crate::directory::{ServerDirectory, ServerHandle};
use crate::intent::{ServerConnectionIntent, ServerTarget};
use crate::stream::{StatePublisher, Subscription};
use crate::tunnel::{TunnelConfiguration, TunnelController, TunnelState};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default limit for reaching `Connected`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The subsystems an orchestrator drives.
pub struct Subsystems {
    /// Tunnel lifecycle.
    pub tunnel: Arc<TunnelController>,
    /// Credentials.
    pub authenticator: CertificateAuthenticator,
    /// Control channel.
    pub agent: Arc<ControlChannelAgent>,
    /// Server lookups.
    pub directory: Arc<dyn ServerDirectory>,
}

/// Client side of the orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: StatePublisher<ConnectionState>,
    agent: Arc<ControlChannelAgent>,
}

impl OrchestratorHandle {
    /// Start an orchestrator over `subsystems`.
    ///
    /// The actor runs until every handle is dropped. Must be called from
    /// within a tokio runtime.
    pub fn spawn(subsystems: Subsystems, connect_timeout: Duration) -> Self {
        let Subsystems {
            tunnel,
            authenticator,
            agent,
            directory,
        } = subsystems;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (tunnel_ops, tunnel_ops_rx) = mpsc::unbounded_channel();
        let state = StatePublisher::new(ConnectionState::default());

        let streams = Streams {
            commands,
            internal,
            tunnel: tunnel.subscribe(),
            cert: authenticator.subscribe(),
            agent: agent.subscribe(),
            events: agent.events(),
        };

        let actor = Actor {
            tunnel_state: tunnel.current_status(),
            cert_state: authenticator.state(),
            agent_state: agent.state(),
            authenticator,
            agent: Arc::clone(&agent),
            directory,
            connect_timeout,
            state: state.clone(),
            tunnel_ops,
            internal_tx,
            attempt: None,
            queued: None,
            disconnecting: false,
            latched: None,
            next_attempt: 0,
        };

        tokio::spawn(run_tunnel_ops(tunnel, tunnel_ops_rx));
        tokio::spawn(actor.run(streams));

        Self {
            commands: commands_tx,
            state,
            agent,
        }
    }

    /// Start connecting. Returns once the attempt is accepted; progress is
    /// reported on [`Self::subscribe`].
    pub async fn connect(&self, intent: ServerConnectionIntent) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { intent, reply })
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Tear down the current connection. Returns once teardown has begun.
    pub async fn disconnect(&self) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { reply })
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Current unified state.
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Unified state stream, current value first.
    pub fn subscribe(&self) -> Subscription<ConnectionState> {
        self.state.subscribe()
    }

    /// Control-channel events (details, statistics, errors).
    pub fn agent_events(&self) -> Subscription<AgentEvent> {
        self.agent.events()
    }
}

enum Command {
    Connect {
        intent: ServerConnectionIntent,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    Credentials {
        attempt: u64,
        load: CredentialLoad,
        result: Result<AuthenticationData, CertAuthError>,
    },
}

enum TunnelOp {
    Connect(TunnelConfiguration),
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
enum CredentialLoad {
    Cached,
    Refresh,
    RegenerateKeys,
    /// Background refresh of a connection that stays up.
    Renew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Tunnel,
    Credentials,
    Agent,
    Recovering,
    Connected,
    /// Reopening the control channel with a renewed certificate.
    Rotating,
}

struct Attempt {
    id: u64,
    intent: ServerConnectionIntent,
    server: ServerHandle,
    phase: Phase,
    recovered: bool,
    deadline: Instant,
    task: Option<JoinHandle<()>>,
    credentials: Option<AuthenticationData>,
    refresh_at: Option<Instant>,
}

struct Streams {
    commands: mpsc::UnboundedReceiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
    tunnel: Subscription<TunnelState>,
    cert: Subscription<CertAuthState>,
    agent: Subscription<ControlChannelState>,
    events: Subscription<AgentEvent>,
}

struct Actor {
    authenticator: CertificateAuthenticator,
    agent: Arc<ControlChannelAgent>,
    directory: Arc<dyn ServerDirectory>,
    connect_timeout: Duration,
    state: StatePublisher<ConnectionState>,
    tunnel_ops: mpsc::UnboundedSender<TunnelOp>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    tunnel_state: TunnelState,
    cert_state: CertAuthState,
    agent_state: ControlChannelState,
    attempt: Option<Attempt>,
    queued: Option<(ServerConnectionIntent, ServerHandle)>,
    disconnecting: bool,
    latched: Option<ConnectionError>,
    next_attempt: u64,
}

impl Actor {
    async fn run(mut self, mut streams: Streams) {
        loop {
            let deadline = self.deadline();
            let refresh_at = self.refresh_due();
            tokio::select! {
                biased;
                command = streams.commands.recv() => match command {
                    Some(command) => self.on_command(command, &mut streams).await,
                    None => break,
                },
                Some(state) = streams.tunnel.next() => self.on_tunnel(state, &mut streams).await,
                Some(state) = streams.cert.next() => self.on_cert(state).await,
                Some(state) = streams.agent.next() => self.on_agent(state).await,
                Some(event) = streams.events.next() => self.on_agent_event(event).await,
                Some(message) = streams.internal.recv() => self.on_internal(message).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timeout().await;
                }
                _ = tokio::time::sleep_until(refresh_at.unwrap_or_else(Instant::now)), if refresh_at.is_some() => {
                    self.renew_credentials();
                }
            }
            self.publish();
        }

        if let Some(attempt) = self.attempt.take()
            && let Some(task) = attempt.task
        {
            task.abort();
        }
        debug!("Connection orchestrator stopped");
    }

    async fn on_command(&mut self, command: Command, streams: &mut Streams) {
        match command {
            Command::Connect { intent, reply } => {
                let result = self.connect(intent, streams).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
        }
    }

    async fn connect(
        &mut self,
        intent: ServerConnectionIntent,
        streams: &mut Streams,
    ) -> Result<(), OrchestratorError> {
        let Some(server) = self.directory.resolve_target(&intent.target) else {
            let target = describe_target(&intent.target);
            warn!("Cannot connect, server {} is not in the directory", target);
            return Err(ConnectionError::ServerMissing(target).into());
        };

        info!("Connect requested to {} ({})", server.name, server.reference());
        self.latched = None;
        self.disconnecting = false;
        if self.attempt.is_some() || !self.tunnel_state.is_disconnected() {
            debug!("Tearing down the current connection first");
            self.teardown().await;
        }

        self.queued = Some((intent, server));
        self.start_queued(streams);
        Ok(())
    }

    async fn disconnect(&mut self) {
        info!("Disconnect requested");
        self.queued = None;
        self.latched = None;

        if self.attempt.is_some() || !self.tunnel_state.is_disconnected() {
            self.disconnecting = !self.tunnel_state.is_disconnected();
            self.teardown().await;
        }
    }

    /// Start the queued attempt once the tunnel is down.
    fn start_queued(&mut self, streams: &mut Streams) {
        if !self.tunnel_state.is_disconnected() {
            return;
        }
        let Some((intent, server)) = self.queued.take() else {
            return;
        };

        // Anything still buffered predates this attempt.
        streams.tunnel.drain();
        streams.events.drain();
        if let Some(state) = streams.cert.drain() {
            self.cert_state = state;
        }
        if let Some(state) = streams.agent.drain() {
            self.agent_state = state;
        }

        self.next_attempt += 1;
        let id = self.next_attempt;
        debug!("Starting connection attempt {} to {}", id, server.reference());

        // The controller publishes this as soon as it receives the request.
        self.tunnel_state = TunnelState::Connecting(Some(server.reference()));
        self.send_tunnel_op(TunnelOp::Connect(TunnelConfiguration::for_intent(
            server.clone(),
            &intent,
        )));

        self.attempt = Some(Attempt {
            id,
            intent,
            server,
            phase: Phase::Tunnel,
            recovered: false,
            deadline: Instant::now() + self.connect_timeout,
            task: None,
            credentials: None,
            refresh_at: None,
        });
    }

    async fn on_tunnel(&mut self, state: TunnelState, streams: &mut Streams) {
        debug!("Tunnel state: {:?}", state);
        self.tunnel_state = state;

        if self.tunnel_state.is_disconnected() {
            self.disconnecting = false;
            if self.attempt.is_none() {
                self.start_queued(streams);
                return;
            }
        }

        let tunnel_up = matches!(self.tunnel_state, TunnelState::Connected(_));
        if tunnel_up
            && let Some(attempt) = &mut self.attempt
            && attempt.phase == Phase::Tunnel
        {
            info!("Tunnel connected, loading credentials");
            attempt.phase = Phase::Credentials;
            self.spawn_credentials(CredentialLoad::Cached);
        }

        self.check_failure().await;
    }

    async fn on_cert(&mut self, state: CertAuthState) {
        self.cert_state = state;
        self.check_failure().await;
    }

    async fn on_agent(&mut self, state: ControlChannelState) {
        self.agent_state = state.clone();
        let Some(attempt) = &mut self.attempt else {
            return;
        };

        match (state, attempt.phase) {
            (ControlChannelState::Connected(_), Phase::Agent | Phase::Rotating) => {
                if attempt.phase == Phase::Rotating {
                    info!("Control channel reopened with the renewed certificate");
                } else {
                    info!("Control channel connected");
                }
                attempt.phase = Phase::Connected;
                // Each established connection may recover once more.
                attempt.recovered = false;
            }
            (
                ControlChannelState::Disconnected(Some(error)),
                Phase::Agent | Phase::Connected | Phase::Rotating,
            ) if error.is_recoverable() =>
            {
                self.recover(error).await;
                return;
            }
            _ => {}
        }

        self.check_failure().await;
    }

    async fn on_agent_event(&mut self, event: AgentEvent) {
        // Terminal errors arrive on the state stream as well.
        let AgentEvent::Error(error) = event else {
            return;
        };
        if !error.is_recoverable() {
            return;
        }
        if let Some(attempt) = &self.attempt
            && matches!(attempt.phase, Phase::Agent | Phase::Connected | Phase::Rotating)
        {
            self.recover(error).await;
        }
    }

    async fn on_internal(&mut self, message: Internal) {
        let Internal::Credentials {
            attempt: id,
            load,
            result,
        } = message;
        let Some(attempt) = &mut self.attempt else {
            return;
        };
        let current = match load {
            CredentialLoad::Renew => attempt.phase == Phase::Connected,
            _ => matches!(attempt.phase, Phase::Credentials | Phase::Recovering),
        };
        if attempt.id != id || !current {
            debug!("Ignoring {:?} credentials for attempt {}", load, id);
            return;
        }
        attempt.task = None;
        let renewing = matches!(load, CredentialLoad::Renew);

        match result {
            Ok(auth) => {
                attempt.refresh_at =
                    refresh_deadline(&auth.certificate, matches!(load, CredentialLoad::Cached));
                attempt.credentials = Some(auth.clone());

                // Prefer the server the tunnel actually reached.
                let server = match &self.tunnel_state {
                    TunnelState::Connected(reference) => self.directory.resolve(reference),
                    _ => None,
                }
                .unwrap_or_else(|| attempt.server.clone());
                let features = attempt.intent.features.clone();

                if renewing {
                    info!("Certificate renewed, reopening the control channel");
                    attempt.phase = Phase::Rotating;
                    attempt.deadline = Instant::now() + self.connect_timeout;
                    self.agent.disconnect().await;
                } else {
                    debug!("Credentials loaded, opening control channel");
                    attempt.phase = Phase::Agent;
                }
                self.agent.connect(&server, auth, features).await;
            }
            Err(CertAuthError::Cancelled) => debug!("Credential load cancelled"),
            Err(e) if renewing => {
                warn!("Background certificate renewal failed: {}", e);
                if let CertAuthError::RefreshWasRateLimited {
                    retry_after: Some(delay),
                } = e
                {
                    attempt.refresh_at = Some(Instant::now() + delay);
                }
            }
            Err(e) => self.fail(ConnectionError::CertAuth(e)).await,
        }
    }

    async fn on_timeout(&mut self) {
        if self.deadline().is_some() {
            warn!("Connection attempt timed out");
            self.fail(ConnectionError::Timeout).await;
        }
    }

    async fn recover(&mut self, error: AgentError) {
        let Some(attempt) = &mut self.attempt else {
            return;
        };
        if attempt.recovered {
            warn!("Control channel reported {} again, giving up", error);
            self.fail(ConnectionError::Agent(error)).await;
            return;
        }

        info!("Recovering from control channel error: {}", error);
        attempt.recovered = true;
        attempt.phase = Phase::Recovering;
        attempt.deadline = Instant::now() + self.connect_timeout;

        let load = if error.needs_new_certificate() {
            CredentialLoad::Refresh
        } else {
            CredentialLoad::RegenerateKeys
        };
        self.agent.disconnect().await;
        self.spawn_credentials(load);
    }

    fn renew_credentials(&mut self) {
        let Some(attempt) = &mut self.attempt else {
            return;
        };
        attempt.refresh_at = None;
        info!("Certificate refresh time reached, renewing");
        self.spawn_credentials(CredentialLoad::Renew);
    }

    fn spawn_credentials(&mut self, load: CredentialLoad) {
        let Some(attempt) = &mut self.attempt else {
            return;
        };
        if let Some(task) = attempt.task.take() {
            task.abort();
        }

        let authenticator = self.authenticator.clone();
        let internal = self.internal_tx.clone();
        let features = attempt.intent.features.clone();
        let id = attempt.id;

        attempt.task = Some(tokio::spawn(async move {
            let result = match load {
                CredentialLoad::Cached => {
                    authenticator.load_authentication_data(&features, true).await
                }
                CredentialLoad::Refresh | CredentialLoad::Renew => {
                    authenticator.refresh_certificate(&features).await
                }
                CredentialLoad::RegenerateKeys => authenticator.regenerate_keys(&features).await,
            };
            let _ = internal.send(Internal::Credentials {
                attempt: id,
                load,
                result,
            });
        }));
    }

    /// Fail the attempt if the latest subsystem states carry an error.
    async fn check_failure(&mut self) {
        if self.attempt.is_none() {
            return;
        }
        if let ConnectionState::Disconnected(Some(error)) = self.derive() {
            self.fail(error).await;
        }
    }

    async fn fail(&mut self, error: ConnectionError) {
        if self.attempt.is_none() {
            return;
        }
        warn!("Connection attempt failed: {}", error);
        self.latched = Some(error);
        self.teardown().await;
    }

    /// Cancel credentials and close the control channel, then stop the
    /// tunnel.
    async fn teardown(&mut self) {
        if let Some(attempt) = self.attempt.take()
            && let Some(task) = attempt.task
        {
            task.abort();
        }
        self.authenticator.cancel();
        self.agent.disconnect().await;
        self.send_tunnel_op(TunnelOp::Disconnect);
    }

    fn send_tunnel_op(&self, op: TunnelOp) {
        if self.tunnel_ops.send(op).is_err() {
            warn!("Tunnel worker is gone, dropping tunnel operation");
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.attempt
            .as_ref()
            .filter(|attempt| attempt.phase != Phase::Connected)
            .map(|attempt| attempt.deadline)
    }

    /// When the next background renewal is due, if one is armed.
    fn refresh_due(&self) -> Option<Instant> {
        self.attempt
            .as_ref()
            .filter(|attempt| attempt.phase == Phase::Connected && attempt.task.is_none())
            .and_then(|attempt| attempt.refresh_at)
    }

    fn derive(&self) -> ConnectionState {
        let phase = self.attempt.as_ref().map(|attempt| attempt.phase);
        let credentials = self
            .attempt
            .as_ref()
            .and_then(|attempt| attempt.credentials.as_ref());

        // A renewal in flight does not affect an established connection.
        let cert = match (phase, credentials) {
            (Some(Phase::Connected | Phase::Rotating), Some(credentials)) => {
                CertAuthState::Loaded(credentials.clone())
            }
            _ => self.cert_state.clone(),
        };
        // The agent is restarted on purpose while recovering or rotating.
        let agent = match (phase, &self.agent_state) {
            (Some(Phase::Recovering), _) => ControlChannelState::Connecting,
            (
                Some(Phase::Rotating),
                ControlChannelState::Disconnected(None) | ControlChannelState::Connecting,
            ) => ControlChannelState::Connected(None),
            (_, state) => state.clone(),
        };
        ConnectionState::derive(
            &self.tunnel_state,
            &cert,
            &agent,
            self.directory.as_ref(),
        )
    }

    fn compute(&self) -> ConnectionState {
        if let Some(error) = &self.latched {
            return ConnectionState::Disconnected(Some(error.clone()));
        }
        if self.disconnecting {
            return ConnectionState::Disconnecting;
        }
        if self.queued.is_some() {
            return ConnectionState::Connecting;
        }

        let derived = self.derive();
        match &self.attempt {
            None => match derived {
                ConnectionState::Disconnected(_) => ConnectionState::Disconnected(None),
                other => other,
            },
            Some(attempt) => match derived {
                ConnectionState::Connected(server)
                    if matches!(attempt.phase, Phase::Connected | Phase::Rotating) =>
                {
                    ConnectionState::Connected(server)
                }
                ConnectionState::Disconnecting => ConnectionState::Disconnecting,
                _ => ConnectionState::Connecting,
            },
        }
    }

    fn publish(&self) {
        let state = self.compute();
        if self.state.publish_if_changed(state.clone()) {
            match &state {
                ConnectionState::Disconnected(Some(error)) => {
                    info!("Connection state: disconnected ({})", error)
                }
                ConnectionState::Connected(server) => {
                    info!("Connection state: connected to {}", server.name)
                }
                other => debug!("Connection state: {:?}", other),
            }
        }
    }
}

async fn run_tunnel_ops(tunnel: Arc<TunnelController>, mut ops: mpsc::UnboundedReceiver<TunnelOp>) {
    while let Some(op) = ops.recv().await {
        let result = match op {
            TunnelOp::Connect(configuration) => tunnel.connect(configuration).await,
            TunnelOp::Disconnect => tunnel.disconnect().await,
        };
        // Failures are also published on the tunnel's state stream.
        if let Err(e) = result {
            warn!("Tunnel operation failed: {}", e);
        }
    }
}

fn describe_target(target: &ServerTarget) -> String {
    match &target.server_id {
        Some(server_id) => format!("{}/{}", target.logical_id, server_id),
        None => target.logical_id.clone(),
    }
}

/// When to renew `certificate` in the background. One already past its
/// refresh time is renewed at once only when `renew_overdue` is set.
fn refresh_deadline(certificate: &Certificate, renew_overdue: bool) -> Option<Instant> {
    let now = Utc::now();
    if certificate.should_refresh(now) {
        return renew_overdue.then(Instant::now);
    }
    let delay = (certificate.refresh_time - now).to_std().unwrap_or_default();
    Some(Instant::now() + delay)
}
