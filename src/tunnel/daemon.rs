//! Unix socket transport to the tunnel daemon.
//!
//! The privileged tunnel runs under a daemon that listens on a Unix socket.
//! One connection carries both request/response traffic and unsolicited
//! status pushes:
//!
//! ```text
//! ┌──────────────────────┐   Unix Socket   ┌──────────────────────┐
//! │  DaemonTunnelProcess │ ──Request{id}──►│    tunnel daemon     │
//! │                      │◄─Response{id}── │                      │
//! │  StatePublisher      │◄─Status──────── │                      │
//! └──────────────────────┘     bincode     └──────────────────────┘
//! ```
//!
//! The daemon pushes its current status as soon as a client connects.
//! Requests are correlated with responses by id; a request whose response
//! does not arrive within the response timeout fails with
//! [`DeliveryError::Timeout`]. If the connection drops, the status becomes
//! `disconnected` and the next request reconnects.

use super::error::{DeliveryError, ProcessError};
use super::process::{TunnelConfiguration, TunnelProcess};
use super::provider::{ProviderRequest, ProviderResponse};
use super::state::ProcessStatus;
use crate::framing::{FrameError, read_bincode, write_bincode};
use crate::stream::{StatePublisher, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default time to wait for a daemon response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Disconnect reason reported when the daemon connection is lost.
pub const DAEMON_CONNECTION_LOST: &str = "tunnel daemon connection lost";

/// Message from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientToDaemon {
    /// A request awaiting a response with the same id.
    Request {
        /// Correlation id.
        id: Uuid,
        /// The request.
        request: DaemonRequest,
    },
}

/// Operations the daemon performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    /// Persist tunnel configuration.
    SaveConfiguration(TunnelConfiguration),
    /// Start the tunnel.
    Start,
    /// Stop the tunnel.
    Stop,
    /// Forward a provider message to the running tunnel.
    Provider(ProviderRequest),
}

/// Message from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonToClient {
    /// Response to the request with the same id.
    Response {
        /// Correlation id.
        id: Uuid,
        /// The response.
        response: DaemonResponse,
    },
    /// Status push.
    Status(ProcessStatus),
}

/// Daemon replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Lifecycle request accepted.
    Ack,
    /// Request refused.
    Rejected(String),
    /// Reply from the running tunnel.
    Provider(ProviderResponse),
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<DaemonResponse>>>>;

struct DaemonLink {
    tx: mpsc::Sender<ClientToDaemon>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for DaemonLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// [`TunnelProcess`] backed by the tunnel daemon.
pub struct DaemonTunnelProcess {
    socket_path: PathBuf,
    response_timeout: Duration,
    status: StatePublisher<ProcessStatus>,
    pending: PendingMap,
    link: tokio::sync::Mutex<Option<DaemonLink>>,
}

impl DaemonTunnelProcess {
    /// Connect to the daemon at `socket_path`.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        response_timeout: Duration,
    ) -> Result<Self, ProcessError> {
        let process = Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            response_timeout,
            status: StatePublisher::new(ProcessStatus::Invalid),
            pending: Arc::new(Mutex::new(HashMap::new())),
            link: tokio::sync::Mutex::new(None),
        };
        process
            .ensure_link()
            .await
            .map_err(|e| ProcessError::Unavailable(e.to_string()))?;
        Ok(process)
    }

    /// Path of the daemon socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn ensure_link(&self) -> Result<mpsc::Sender<ClientToDaemon>, DeliveryError> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref()
            && existing.alive.load(Ordering::SeqCst)
        {
            return Ok(existing.tx.clone());
        }

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                    DeliveryError::NotRunning
                }
                _ => DeliveryError::Transport(e.to_string()),
            })?;
        info!("Connected to tunnel daemon at {:?}", self.socket_path);

        let (tx, rx) = mpsc::channel::<ClientToDaemon>(64);
        let alive = Arc::new(AtomicBool::new(true));
        let (read_half, write_half) = stream.into_split();

        let reader = {
            let alive = Arc::clone(&alive);
            let pending = Arc::clone(&self.pending);
            let status = self.status.clone();
            tokio::spawn(async move {
                if let Err(e) = daemon_reader(read_half, &pending, &status).await
                    && !matches!(e, FrameError::ConnectionClosed)
                {
                    error!("Daemon reader error: {}", e);
                }
                alive.store(false, Ordering::SeqCst);
                // Dropping the senders fails every waiting request.
                lock(&pending).clear();
                // Whatever the daemon last pushed no longer holds.
                warn!("Lost connection to tunnel daemon");
                status.publish_if_changed(ProcessStatus::Disconnected {
                    reason: Some(DAEMON_CONNECTION_LOST.to_string()),
                });
                debug!("Daemon reader task finished");
            })
        };

        let writer = {
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                if let Err(e) = daemon_writer(write_half, rx).await
                    && !matches!(e, FrameError::ConnectionClosed)
                {
                    error!("Daemon writer error: {}", e);
                }
                alive.store(false, Ordering::SeqCst);
                debug!("Daemon writer task finished");
            })
        };

        *link = Some(DaemonLink {
            tx: tx.clone(),
            alive,
            reader,
            writer,
        });
        Ok(tx)
    }

    async fn request(&self, request: DaemonRequest) -> Result<DaemonResponse, DeliveryError> {
        let tx = self.ensure_link().await?;
        let id = Uuid::new_v4();
        let (response_tx, response_rx) = oneshot::channel();
        lock(&self.pending).insert(id, response_tx);

        if tx.send(ClientToDaemon::Request { id, request }).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(DeliveryError::Transport("daemon connection closed".into()));
        }

        match tokio::time::timeout(self.response_timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DeliveryError::Transport(
                "daemon connection closed before responding".into(),
            )),
            Err(_) => {
                lock(&self.pending).remove(&id);
                warn!("Daemon request {} timed out", id);
                Err(DeliveryError::Timeout)
            }
        }
    }

    async fn lifecycle(&self, request: DaemonRequest) -> Result<(), ProcessError> {
        match self.request(request).await {
            Ok(DaemonResponse::Ack) => Ok(()),
            Ok(DaemonResponse::Rejected(reason)) => Err(ProcessError::Rejected(reason)),
            Ok(DaemonResponse::Provider(other)) => Err(ProcessError::Unavailable(format!(
                "unexpected provider reply {other:?}"
            ))),
            Err(e) => Err(ProcessError::Unavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl TunnelProcess for DaemonTunnelProcess {
    async fn save_configuration(&self, config: &TunnelConfiguration) -> Result<(), ProcessError> {
        self.lifecycle(DaemonRequest::SaveConfiguration(config.clone()))
            .await
    }

    async fn start(&self) -> Result<(), ProcessError> {
        self.lifecycle(DaemonRequest::Start).await
    }

    async fn stop(&self) -> Result<(), ProcessError> {
        self.lifecycle(DaemonRequest::Stop).await
    }

    fn subscribe_status(&self) -> Subscription<ProcessStatus> {
        self.status.subscribe()
    }

    async fn send_message(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, DeliveryError> {
        match self.request(DaemonRequest::Provider(request)).await? {
            DaemonResponse::Provider(response) => Ok(response),
            DaemonResponse::Rejected(reason) => Ok(ProviderResponse::Error(reason)),
            DaemonResponse::Ack => Err(DeliveryError::Malformed("ack for provider message".into())),
        }
    }
}

fn lock(
    pending: &PendingMap,
) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<DaemonResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn daemon_reader(
    mut reader: OwnedReadHalf,
    pending: &PendingMap,
    status: &StatePublisher<ProcessStatus>,
) -> Result<(), FrameError> {
    loop {
        match read_bincode::<_, DaemonToClient>(&mut reader).await? {
            DaemonToClient::Response { id, response } => match lock(pending).remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(response);
                }
                None => debug!("Dropping response for unknown request {}", id),
            },
            DaemonToClient::Status(update) => {
                debug!("Daemon status push: {:?}", update);
                status.publish_if_changed(update);
            }
        }
    }
}

async fn daemon_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ClientToDaemon>,
) -> Result<(), FrameError> {
    while let Some(msg) = rx.recv().await {
        write_bincode(&mut writer, &msg).await?;
    }
    Ok(())
}
