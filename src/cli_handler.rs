//! Command handling for vpnctl.
//!
//! Each subcommand builds its own tokio runtime and the subsystems it needs.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::{AgentEvent, ControlChannelAgent, TcpAgentConnector};
use crate::certauth::{
    CertificateAuthenticator, ConfiguredSessionForker, CredentialStore, FileCredentialStore,
};
use crate::cli::Commands;
use crate::config::Config;
use crate::directory::StaticServerDirectory;
use crate::intent::ServerConnectionIntent;
use crate::orchestrator::{ConnectionState, OrchestratorHandle, Subsystems};
use crate::tunnel::{DaemonTunnelProcess, TunnelController};

/// Run a subcommand to completion.
pub fn handle_command(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Servers => list_servers(&config),
        Commands::Logout => run_logout(config),
        connect @ Commands::Connect { .. } => {
            let intent = connect
                .intent()
                .context("connect command without a target")?;
            run_connect(intent, config)
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

fn credential_store(config: &Config) -> FileCredentialStore {
    FileCredentialStore::new(
        config
            .credentials
            .store_dir
            .clone()
            .unwrap_or_else(FileCredentialStore::default_dir),
    )
}

fn load_directory(config: &Config) -> Result<StaticServerDirectory> {
    StaticServerDirectory::load_all(&config.directory.servers_files)
        .context("Failed to load server directory")
}

/// Print every known server.
fn list_servers(config: &Config) -> Result<()> {
    let directory = load_directory(config)?;
    if directory.servers().is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    for server in directory.servers() {
        println!(
            "{:<12} {:<12} {:<4} {:<16} {}",
            server.logical_id, server.server_id, server.country, server.exit_ip, server.domain
        );
    }
    Ok(())
}

/// Delete stored credentials, cancelling tunnel-side refreshes when the
/// daemon is reachable.
fn run_logout(config: Config) -> Result<()> {
    let rt = build_runtime()?;

    rt.block_on(async {
        let store = Arc::new(credential_store(&config));

        match DaemonTunnelProcess::connect(
            config.tunnel.socket_path(),
            config.tunnel.response_timeout(),
        )
        .await
        {
            Ok(process) => {
                let tunnel = Arc::new(TunnelController::with_policy(
                    Arc::new(process),
                    config.tunnel.retry_policy(),
                ));
                let authenticator = CertificateAuthenticator::new(
                    store,
                    tunnel,
                    Arc::new(ConfiguredSessionForker::default()),
                );
                authenticator
                    .clear_credentials()
                    .await
                    .context("Failed to clear credentials")?;
            }
            Err(e) => {
                warn!("Tunnel daemon unavailable, clearing local credentials only: {}", e);
                store.clear().context("Failed to clear credentials")?;
            }
        }

        println!("Credentials removed.");
        Ok(())
    })
}

/// Connect and report progress until Ctrl-C or a terminal error.
fn run_connect(intent: ServerConnectionIntent, config: Config) -> Result<()> {
    let rt = build_runtime()?;

    rt.block_on(async {
        let directory = Arc::new(load_directory(&config)?);
        let process = DaemonTunnelProcess::connect(
            config.tunnel.socket_path(),
            config.tunnel.response_timeout(),
        )
        .await
        .with_context(|| {
            format!(
                "Failed to reach tunnel daemon at {:?}",
                config.tunnel.socket_path()
            )
        })?;

        let tunnel = Arc::new(TunnelController::with_policy(
            Arc::new(process),
            config.tunnel.retry_policy(),
        ));
        let authenticator = CertificateAuthenticator::new(
            Arc::new(credential_store(&config)),
            tunnel.clone(),
            Arc::new(ConfiguredSessionForker::new(
                config.session.selector.clone(),
                config.session.session_cookie.clone(),
            )),
        );
        let agent = Arc::new(ControlChannelAgent::new(Arc::new(TcpAgentConnector::new(
            config.agent.port(),
            config.agent.handshake_timeout(),
        ))));

        let handle = OrchestratorHandle::spawn(
            Subsystems {
                tunnel,
                authenticator,
                agent,
                directory,
            },
            config.connection.connect_timeout(),
        );

        let mut states = handle.subscribe();
        let mut events = handle.agent_events();

        handle
            .connect(intent)
            .await
            .context("Failed to start connection")?;

        let mut started = false;
        let mut interrupted = false;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                result = &mut ctrl_c, if !interrupted => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                    }
                    interrupted = true;
                    info!("Interrupted, disconnecting");
                    handle.disconnect().await.context("Failed to disconnect")?;
                }
                state = states.next() => {
                    let Some(state) = state else {
                        anyhow::bail!("Connection orchestrator stopped");
                    };
                    match state {
                        ConnectionState::Connecting => {
                            started = true;
                            println!("Connecting...");
                        }
                        ConnectionState::Connected(server) => {
                            println!("Connected to {} ({}, {})", server.name, server.country, server.exit_ip);
                        }
                        ConnectionState::Disconnecting => println!("Disconnecting..."),
                        ConnectionState::Disconnected(Some(error)) => {
                            let presentation = error.presentation();
                            println!("{}", presentation.message);
                            return Err(anyhow::Error::new(error)
                                .context(format!("Connection failed ({:?})", presentation.category)));
                        }
                        ConnectionState::Disconnected(None) => {
                            if interrupted || started {
                                println!("Disconnected.");
                                return Ok(());
                            }
                        }
                    }
                }
                Some(event) = events.next() => report_event(event),
            }
        }
    })
}

fn report_event(event: AgentEvent) {
    match event {
        AgentEvent::ConnectionDetails(details) => {
            println!(
                "Exit IP {} (device {} in {})",
                details.exit_ip, details.device_ip, details.device_country
            );
        }
        AgentEvent::Stats(stats) => {
            info!(
                "Blocked ads {:?}, trackers {:?}, malware {:?}, saved {} bytes",
                stats.ads_blocked, stats.trackers_blocked, stats.malware_blocked, stats.bytes_saved
            );
        }
        AgentEvent::Features(features) => debug!("Server features: {:?}", features),
        AgentEvent::Error(error) => warn!("Control channel reported: {}", error),
        AgentEvent::State(state) => debug!("Control channel state: {:?}", state),
    }
}
