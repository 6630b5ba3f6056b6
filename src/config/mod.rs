//! Configuration system for vpnctl.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/vpnctl/config.toml`
//! 2. User config: `~/.config/vpnctl/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! Missing system and user files are skipped; every value has a built-in
//! default.
//!
//! # Merge Behavior
//!
//! - **Lists** (`directory.servers_files`) are **merged** (appended)
//! - **Scalars** (ports, timeouts, log_level) are **overridden** when set
//!
//! ```toml
//! [tunnel]
//! daemon_socket = "/run/vpnctl/tunnel.sock"
//!
//! [directory]
//! servers_files = ["/etc/vpnctl/servers.toml"]
//!
//! [connection]
//! connect_timeout_secs = 30
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    AgentConfig, Config, ConnectionConfig, CredentialsConfig, DEFAULT_DAEMON_SOCKET,
    DirectoryConfig, GeneralConfig, LOG_LEVELS, SessionConfig, TunnelConfig,
};
