//! Configuration schema definitions.
//!
//! Every field is optional in the file. Zero or empty values mean "use the
//! built-in default", which the accessor methods resolve.

use super::error::ConfigError;
use crate::agent::{DEFAULT_AGENT_PORT, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::orchestrator::DEFAULT_CONNECT_TIMEOUT;
use crate::retry::RetryPolicy;
use crate::tunnel::daemon::DEFAULT_RESPONSE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default tunnel daemon socket.
pub const DEFAULT_DAEMON_SOCKET: &str = "/run/vpnctl/tunnel.sock";

/// Log levels accepted in `general.log_level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Tunnel daemon settings.
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Credential storage.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Server directory sources.
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Control channel settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Connection attempt settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Pre-provisioned API session.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists are appended, scalars are overridden when set.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.tunnel.merge(other.tunnel);
        self.credentials.merge(other.credentials);
        self.directory.merge(other.directory);
        self.agent.merge(other.agent);
        self.connection.merge(other.connection);
        self.session.merge(other.session);
    }

    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.general.log_level.as_str();
        if !level.is_empty() && !LOG_LEVELS.contains(&level) {
            return Err(ConfigError::InvalidValue {
                section: "general",
                key: "log_level",
                reason: format!("'{level}' is not one of {}", LOG_LEVELS.join(", ")),
            });
        }
        if self.session.session_cookie.is_some() && self.session.selector.is_none() {
            return Err(ConfigError::InvalidValue {
                section: "session",
                key: "selector",
                reason: "a session_cookie needs the selector it belongs to".to_string(),
            });
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Tunnel daemon connection.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TunnelConfig {
    /// Unix socket of the tunnel daemon.
    #[serde(default)]
    pub daemon_socket: Option<PathBuf>,

    /// Delivery attempts for provider messages. 0 = default (5).
    #[serde(default)]
    pub ipc_max_attempts: u32,

    /// Delay between delivery attempts in milliseconds. 0 = default (1000).
    #[serde(default)]
    pub ipc_retry_delay_ms: u64,

    /// Time to wait for a daemon response in milliseconds. 0 = default.
    #[serde(default)]
    pub ipc_response_timeout_ms: u64,
}

impl TunnelConfig {
    fn merge(&mut self, other: TunnelConfig) {
        if other.daemon_socket.is_some() {
            self.daemon_socket = other.daemon_socket;
        }
        if other.ipc_max_attempts != 0 {
            self.ipc_max_attempts = other.ipc_max_attempts;
        }
        if other.ipc_retry_delay_ms != 0 {
            self.ipc_retry_delay_ms = other.ipc_retry_delay_ms;
        }
        if other.ipc_response_timeout_ms != 0 {
            self.ipc_response_timeout_ms = other.ipc_response_timeout_ms;
        }
    }

    /// Daemon socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon_socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DAEMON_SOCKET))
    }

    /// Retry policy for provider messages.
    pub fn retry_policy(&self) -> RetryPolicy {
        let default = RetryPolicy::ipc();
        RetryPolicy::new(
            if self.ipc_max_attempts == 0 {
                default.max_attempts
            } else {
                self.ipc_max_attempts
            },
            if self.ipc_retry_delay_ms == 0 {
                default.delay
            } else {
                Duration::from_millis(self.ipc_retry_delay_ms)
            },
        )
    }

    /// Response timeout for daemon requests.
    pub fn response_timeout(&self) -> Duration {
        match self.ipc_response_timeout_ms {
            0 => DEFAULT_RESPONSE_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }
}

/// Credential storage location.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CredentialsConfig {
    /// Directory holding keys and certificate.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl CredentialsConfig {
    fn merge(&mut self, other: CredentialsConfig) {
        if other.store_dir.is_some() {
            self.store_dir = other.store_dir;
        }
    }
}

/// Server directory sources.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DirectoryConfig {
    /// Server list files, read in order.
    #[serde(default)]
    pub servers_files: Vec<PathBuf>,
}

impl DirectoryConfig {
    fn merge(&mut self, other: DirectoryConfig) {
        self.servers_files.extend(other.servers_files);
    }
}

/// Control channel settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AgentConfig {
    /// Control channel port. 0 = default (65432).
    #[serde(default)]
    pub port: u16,

    /// Session open timeout in milliseconds. 0 = default.
    #[serde(default)]
    pub handshake_timeout_ms: u64,
}

impl AgentConfig {
    fn merge(&mut self, other: AgentConfig) {
        if other.port != 0 {
            self.port = other.port;
        }
        if other.handshake_timeout_ms != 0 {
            self.handshake_timeout_ms = other.handshake_timeout_ms;
        }
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_AGENT_PORT
        } else {
            self.port
        }
    }

    /// Effective handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        match self.handshake_timeout_ms {
            0 => DEFAULT_HANDSHAKE_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }
}

/// Connection attempt settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConnectionConfig {
    /// Seconds to reach `connected`. 0 = default (30).
    #[serde(default)]
    pub connect_timeout_secs: u64,
}

impl ConnectionConfig {
    fn merge(&mut self, other: ConnectionConfig) {
        if other.connect_timeout_secs != 0 {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
    }

    /// Effective connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        match self.connect_timeout_secs {
            0 => DEFAULT_CONNECT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }
}

/// API session handed to the tunnel process when its own expires.
#[derive(Clone, Deserialize, Serialize, Default)]
pub struct SessionConfig {
    /// Session selector.
    #[serde(default)]
    pub selector: Option<String>,

    /// Session cookie.
    #[serde(default)]
    pub session_cookie: Option<String>,
}

impl SessionConfig {
    fn merge(&mut self, other: SessionConfig) {
        if other.selector.is_some() {
            self.selector = other.selector;
        }
        if other.session_cookie.is_some() {
            self.session_cookie = other.session_cookie;
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("selector", &self.selector)
            .field("session_cookie", &self.session_cookie.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
