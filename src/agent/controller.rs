//! Control-channel session management.
//!
//! [`ControlChannelAgent`] runs at most one session at a time. Each session
//! is a background task that reads server messages, republishes them as
//! [`AgentEvent`]s and folds them into a [`ControlChannelState`].
//!
//! Errors the session survives (certificate problems, key reuse) are only
//! emitted as events. Everything else collapses the state to
//! `Disconnected(Some(error))` and ends the session.

use super::error::AgentError;
use super::protocol::{
    AgentMessage, AgentState, AgentStatus, ConnectionDetails, FeatureStatistics,
    NegotiatedFeatures,
};
use super::session::{AgentConnectParams, AgentConnector, AgentSession};
use crate::certauth::AuthenticationData;
use crate::directory::ServerHandle;
use crate::intent::VpnFeatures;
use crate::stream::{EventPublisher, StatePublisher, Subscription};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// State of the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlChannelState {
    /// No session; carries the error that ended the last one.
    Disconnected(Option<AgentError>),
    /// Session opening.
    Connecting,
    /// Session established.
    Connected(Option<ConnectionDetails>),
}

impl Default for ControlChannelState {
    fn default() -> Self {
        ControlChannelState::Disconnected(None)
    }
}

/// Everything a session reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// An error, recoverable or not.
    Error(AgentError),
    /// A raw server state.
    State(AgentState),
    /// Features the server enabled.
    Features(NegotiatedFeatures),
    /// Addresses seen by the server.
    ConnectionDetails(ConnectionDetails),
    /// Blocking statistics.
    Stats(FeatureStatistics),
}

struct Shared {
    state: StatePublisher<ControlChannelState>,
    events: EventPublisher<AgentEvent>,
    next_id: AtomicU64,
    active: AtomicU64,
}

struct SessionTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drives control-channel sessions.
pub struct ControlChannelAgent {
    connector: Arc<dyn AgentConnector>,
    shared: Arc<Shared>,
    session: Mutex<Option<SessionTask>>,
}

impl ControlChannelAgent {
    /// Agent using `connector` for its sessions.
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                state: StatePublisher::new(ControlChannelState::default()),
                events: EventPublisher::new(),
                next_id: AtomicU64::new(0),
                active: AtomicU64::new(0),
            }),
            session: Mutex::new(None),
        }
    }

    /// Open a session to `server`, replacing any current one.
    ///
    /// Returns once the session task is running; progress is reported
    /// through [`Self::subscribe`].
    pub async fn connect(
        &self,
        server: &ServerHandle,
        auth: AuthenticationData,
        features: VpnFeatures,
    ) {
        self.stop_session().await;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.active.store(id, Ordering::SeqCst);
        self.shared.state.publish(ControlChannelState::Connecting);
        info!("Connecting control channel to {}", server.domain);

        let params = AgentConnectParams {
            host: server.domain.clone(),
            auth,
            features,
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = SessionRunner {
            shared: Arc::clone(&self.shared),
            id,
            details: None,
        };
        let handle = tokio::spawn(runner.run(Arc::clone(&self.connector), params, shutdown_rx));

        *self.lock_session() = Some(SessionTask { shutdown, handle });
    }

    /// Close the current session. Always ends in `Disconnected(None)`.
    pub async fn disconnect(&self) {
        self.stop_session().await;
        self.shared
            .state
            .publish(ControlChannelState::Disconnected(None));
    }

    /// Current state.
    pub fn state(&self) -> ControlChannelState {
        self.shared.state.current()
    }

    /// State stream, current value first.
    pub fn subscribe(&self) -> Subscription<ControlChannelState> {
        self.shared.state.subscribe()
    }

    /// Event stream.
    pub fn events(&self) -> Subscription<AgentEvent> {
        self.shared.events.subscribe()
    }

    async fn stop_session(&self) {
        let Some(mut task) = self.lock_session().take() else {
            return;
        };
        self.shared.active.store(0, Ordering::SeqCst);
        let _ = task.shutdown.send(true);

        if tokio::time::timeout(CLOSE_TIMEOUT * 2, &mut task.handle)
            .await
            .is_err()
        {
            warn!("Control channel session did not stop in time, aborting");
            task.handle.abort();
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<SessionTask>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ControlChannelAgent {
    fn drop(&mut self) {
        if let Some(task) = self.lock_session().take() {
            task.handle.abort();
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct SessionRunner {
    shared: Arc<Shared>,
    id: u64,
    details: Option<ConnectionDetails>,
}

impl SessionRunner {
    async fn run(
        mut self,
        connector: Arc<dyn AgentConnector>,
        params: AgentConnectParams,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let host = params.host.clone();
        let mut session = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            result = connector.connect(params) => match result {
                Ok(session) => session,
                Err(e) => {
                    warn!("Control channel to {} failed: {}", host, e);
                    self.fail(e);
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    close(session.as_mut()).await;
                    return;
                }
                message = session.next_message() => {
                    let flow = match message {
                        Some(Ok(message)) => self.handle(message),
                        Some(Err(AgentError::Decode(reason))) => {
                            warn!("Ignoring malformed control message: {}", reason);
                            Flow::Continue
                        }
                        Some(Err(e)) => self.fail(e),
                        None => {
                            warn!("Control channel to {} closed by server", host);
                            self.fail(AgentError::ConnectionError)
                        }
                    };
                    if let Flow::Stop = flow {
                        close(session.as_mut()).await;
                        return;
                    }
                }
            }
        }
    }

    fn handle(&mut self, message: AgentMessage) -> Flow {
        match message {
            AgentMessage::Status(status) => self.handle_status(status),
            AgentMessage::Error(code) => self.report(AgentError::Server(code)),
        }
    }

    fn handle_status(&mut self, status: AgentStatus) -> Flow {
        if let Some(features) = status.features {
            self.emit(AgentEvent::Features(features));
        }
        if let Some(details) = status.connection_details {
            self.details = Some(details.clone());
            self.emit(AgentEvent::ConnectionDetails(details));
            if matches!(self.shared.state.current(), ControlChannelState::Connected(_)) {
                self.set_state(ControlChannelState::Connected(self.details.clone()));
            }
        }
        if let Some(statistics) = status.statistics {
            self.emit(AgentEvent::Stats(statistics));
        }

        let reason = status.reason.map(AgentError::Server);
        let Some(state) = status.state else {
            return match reason {
                Some(error) => self.report(error),
                None => Flow::Continue,
            };
        };
        self.emit(AgentEvent::State(state));

        if state == AgentState::Disconnected {
            return self.fail(reason.unwrap_or(AgentError::ConnectionError));
        }
        if let Some(error) = reason
            && let Flow::Stop = self.report(error)
        {
            return Flow::Stop;
        }

        match state {
            AgentState::Connecting => self.set_state(ControlChannelState::Connecting),
            AgentState::Connected => {
                info!("Control channel connected");
                self.set_state(ControlChannelState::Connected(self.details.clone()));
            }
            other => {
                if let Some(error) = other.error() {
                    return self.report(error);
                }
            }
        }
        Flow::Continue
    }

    fn report(&self, error: AgentError) -> Flow {
        if error.is_recoverable() {
            info!("Control channel reported recoverable error: {}", error);
            self.emit(AgentEvent::Error(error));
            Flow::Continue
        } else {
            self.fail(error)
        }
    }

    fn fail(&self, error: AgentError) -> Flow {
        warn!("Control channel failed: {}", error);
        self.emit(AgentEvent::Error(error.clone()));
        self.set_state(ControlChannelState::Disconnected(Some(error)));
        Flow::Stop
    }

    fn is_current(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst) == self.id
    }

    fn emit(&self, event: AgentEvent) {
        if self.is_current() {
            self.shared.events.publish(event);
        }
    }

    fn set_state(&self, state: ControlChannelState) {
        if self.is_current() {
            self.shared.state.publish(state);
        }
    }
}

async fn close(session: &mut dyn AgentSession) {
    if tokio::time::timeout(CLOSE_TIMEOUT, session.close())
        .await
        .is_err()
    {
        debug!("Control channel close timed out");
    }
}
