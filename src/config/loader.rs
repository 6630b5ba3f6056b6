//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/vpnctl/config.toml`
//! 3. User config: `~/.config/vpnctl/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Lists (server files) are **merged** (appended).
//! Scalars (socket, timeouts, log_level) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{Config, TunnelConfig};
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/vpnctl/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "vpnctl";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Server list read when no `directory.servers_files` are configured.
pub const USER_SERVERS_FILE: &str = "servers.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config` file,
    /// invalid TOML and invalid values are errors.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    return Err(ConfigError::MissingFile {
                        path: cli_config_path.clone(),
                    });
                }
            }
        }

        if let Some(ref socket) = cli.socket {
            config.merge(Config {
                tunnel: TunnelConfig {
                    daemon_socket: Some(socket.clone()),
                    ..Default::default()
                },
                ..Default::default()
            });
            debug!("Using daemon socket {:?} from CLI", socket);
        }

        if config.directory.servers_files.is_empty() {
            config.directory.servers_files.push(self.default_servers_path());
        }

        config.validate()?;
        Ok(config)
    }

    /// Server list next to the user config.
    fn default_servers_path(&self) -> PathBuf {
        self.user_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(USER_SERVERS_FILE)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &PathBuf) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.clone(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
