//! Tunnel lifecycle controller.
//!
//! Wraps a [`TunnelProcess`] and turns its raw status notifications into
//! [`TunnelState`] transitions:
//!
//! ```text
//!  connect()                        process status
//!     │                                  │
//!     ▼                                  ▼
//! ┌─────────────────────┐   map    ┌────────────┐
//! │ save config, start  │◄────────►│  watcher   │──► StatePublisher<TunnelState>
//! └─────────────────────┘ session  └────────────┘
//! ```
//!
//! Transitions the process should never make on its own are normalised
//! here: a tunnel that drops or turns invalid without being asked to
//! becomes `disconnected(Terminated)`, and a `disconnecting` report that
//! nobody requested while still connecting is ignored.

use super::error::{DeliveryError, TunnelError};
use super::process::{TunnelConfiguration, TunnelProcess};
use super::provider::{ProviderMessenger, ProviderRequest, ProviderResponse};
use super::state::{ProcessStatus, TunnelState};
use crate::intent::LogicalServerRef;
use crate::retry::{Attempt, RetryPolicy, retry};
use crate::stream::{StatePublisher, Subscription};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const UNEXPECTED_STOP: &str = "tunnel process stopped unexpectedly";
const INVALID_PROCESS: &str = "tunnel process lost its configuration";

/// Drives the tunnel process and publishes its state.
pub struct TunnelController {
    shared: Arc<Shared>,
    watcher: JoinHandle<()>,
}

struct Shared {
    process: Arc<dyn TunnelProcess>,
    policy: RetryPolicy,
    state: StatePublisher<TunnelState>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    configuration: Option<TunnelConfiguration>,
    disconnect_requested: bool,
}

impl TunnelController {
    /// Controller using the default IPC retry policy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(process: Arc<dyn TunnelProcess>) -> Self {
        Self::with_policy(process, RetryPolicy::ipc())
    }

    /// Controller with a custom IPC retry policy.
    pub fn with_policy(process: Arc<dyn TunnelProcess>, policy: RetryPolicy) -> Self {
        let mut statuses = process.subscribe_status();

        // Consume the replayed status now so a connect issued before the
        // watcher first runs is not overwritten by it.
        let initial = statuses.try_next().unwrap_or(ProcessStatus::Invalid);
        let replay = initial.is_active().then(|| initial.clone());

        let shared = Arc::new(Shared {
            process,
            policy,
            state: StatePublisher::new(TunnelState::Disconnected(None)),
            session: Mutex::new(Session::default()),
        });

        let watcher = tokio::spawn(watch_status(Arc::clone(&shared), replay, statuses));

        Self { shared, watcher }
    }

    /// Configure the process for `configuration` and start it.
    ///
    /// Returns once the start signal is delivered; the tunnel coming up is
    /// reported on the state stream.
    pub async fn connect(&self, configuration: TunnelConfiguration) -> Result<(), TunnelError> {
        let pending = configuration.server.reference();
        {
            let mut session = self.shared.session();
            session.disconnect_requested = false;
            session.configuration = Some(configuration.clone());
        }

        info!("Connecting tunnel to {}", pending);
        self.shared
            .state
            .publish_if_changed(TunnelState::Connecting(Some(pending)));

        if let Err(e) = self.shared.process.save_configuration(&configuration).await {
            return Err(self.shared.fail(TunnelError::ConfigurationSave(e.to_string())));
        }
        if let Err(e) = self.shared.process.start().await {
            return Err(self.shared.fail(TunnelError::ProcessLaunch(e.to_string())));
        }

        debug!("Tunnel start signal delivered");
        Ok(())
    }

    /// Disable on-demand reconnection and stop the process.
    ///
    /// Completion is reported as `disconnected` on the state stream.
    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        let configuration = {
            let mut session = self.shared.session();
            session.disconnect_requested = true;
            session.configuration.clone()
        };
        let already_down = self.shared.state.current().is_disconnected();

        if let Some(mut configuration) = configuration {
            configuration.on_demand = false;
            if let Err(e) = self.shared.process.save_configuration(&configuration).await {
                warn!("Failed to disable on-demand before stopping: {}", e);
            }
        }

        if already_down {
            if let Err(e) = self.shared.process.stop().await {
                debug!("Stop on an already stopped tunnel failed: {}", e);
            }
            let mut session = self.shared.session();
            session.configuration = None;
            session.disconnect_requested = false;
            return Ok(());
        }

        info!("Disconnecting tunnel");
        self.shared.state.publish_if_changed(TunnelState::Disconnecting);

        if let Err(e) = self.shared.process.stop().await {
            return Err(self.shared.fail(TunnelError::ProcessStop(e.to_string())));
        }
        Ok(())
    }

    /// Latest tunnel state.
    pub fn current_status(&self) -> TunnelState {
        self.shared.state.current()
    }

    /// Stream of tunnel states, starting with the current one.
    pub fn subscribe(&self) -> Subscription<TunnelState> {
        self.shared.state.subscribe()
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl ProviderMessenger for TunnelController {
    async fn send_provider_message(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, TunnelError> {
        self.shared.send(request).await
    }
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a provider message, retrying transient delivery failures under
    /// the controller's policy.
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, TunnelError> {
        debug!("Sending provider message: {:?}", request);
        let process = &self.process;

        retry(self.policy, move |attempt| {
            let request = request.clone();
            async move {
                match process.send_message(request).await {
                    Ok(response) => Ok(response),
                    Err(e) if e.is_transient() => {
                        warn!("Provider message delivery failed (attempt {}): {}", attempt, e);
                        Err(Attempt::Retry((attempt, e)))
                    }
                    Err(e) => Err(Attempt::Fail((attempt, e))),
                }
            }
        })
        .await
        .map_err(|(attempts, e): (u32, DeliveryError)| {
            error!("Giving up on provider message after {} attempts: {}", attempts, e);
            TunnelError::Ipc {
                attempts,
                message: e.to_string(),
            }
        })
    }

    fn pending_server(&self) -> Option<LogicalServerRef> {
        self.session()
            .configuration
            .as_ref()
            .map(|c| c.server.reference())
    }

    fn fail(&self, error: TunnelError) -> TunnelError {
        error!("Tunnel failed: {}", error);
        {
            let mut session = self.session();
            session.configuration = None;
            session.disconnect_requested = false;
        }
        self.state
            .publish(TunnelState::Disconnected(Some(error.clone())));
        error
    }

    async fn query_current_server(&self) -> Option<LogicalServerRef> {
        match self.send(ProviderRequest::GetCurrentLogicalAndServerId).await {
            Ok(ProviderResponse::Ok(Some(payload))) => {
                match serde_json::from_slice::<LogicalServerRef>(&payload) {
                    Ok(server) => Some(server),
                    Err(e) => {
                        warn!("Unreadable current server reply: {}", e);
                        None
                    }
                }
            }
            Ok(other) => {
                debug!("Tunnel process did not report its server: {:?}", other);
                None
            }
            Err(e) => {
                debug!("Could not query current server: {}", e);
                None
            }
        }
    }

    /// Map a process status to the next tunnel state; `None` keeps the
    /// current one.
    async fn map_status(&self, status: &ProcessStatus) -> Option<TunnelState> {
        let current = self.state.current();

        match status {
            ProcessStatus::Invalid => self.stopped(&current, Some(INVALID_PROCESS)),
            ProcessStatus::Connecting => Some(TunnelState::Connecting(self.pending_server())),
            ProcessStatus::Reasserting => {
                let server = match current {
                    TunnelState::Connected(server) => Some(server),
                    _ => self.pending_server(),
                };
                Some(TunnelState::Connecting(server))
            }
            ProcessStatus::Connected => {
                let reported = self.query_current_server().await;
                match reported.or_else(|| self.pending_server()) {
                    Some(server) => Some(TunnelState::Connected(server)),
                    None => {
                        warn!("Tunnel connected but its server is unknown");
                        Some(TunnelState::Connecting(None))
                    }
                }
            }
            ProcessStatus::Disconnecting => {
                let requested = self.session().disconnect_requested;
                match current {
                    _ if requested => Some(TunnelState::Disconnecting),
                    TunnelState::Connected(_) => Some(TunnelState::Disconnecting),
                    other => {
                        debug!("Ignoring unrequested disconnecting while {:?}", other);
                        None
                    }
                }
            }
            ProcessStatus::Disconnected { reason } => self.stopped(&current, reason.as_deref()),
        }
    }

    /// The process is down. Only a requested stop ends without an error.
    fn stopped(&self, current: &TunnelState, reason: Option<&str>) -> Option<TunnelState> {
        let mut session = self.session();
        if session.disconnect_requested {
            session.disconnect_requested = false;
            session.configuration = None;
            return Some(TunnelState::Disconnected(None));
        }
        if current.is_disconnected() {
            return None;
        }
        session.configuration = None;
        let reason = reason.unwrap_or(UNEXPECTED_STOP).to_string();
        Some(TunnelState::Disconnected(Some(TunnelError::Terminated(reason))))
    }
}

async fn watch_status(
    shared: Arc<Shared>,
    replay: Option<ProcessStatus>,
    mut statuses: Subscription<ProcessStatus>,
) {
    if let Some(status) = replay {
        apply_status(&shared, &status).await;
    }
    while let Some(status) = statuses.next().await {
        apply_status(&shared, &status).await;
    }
    debug!("Tunnel status stream ended");
}

async fn apply_status(shared: &Shared, status: &ProcessStatus) {
    debug!("Tunnel process status: {:?}", status);
    if let Some(state) = shared.map_status(status).await
        && shared.state.publish_if_changed(state.clone())
    {
        info!("Tunnel state: {:?}", state);
    }
}
