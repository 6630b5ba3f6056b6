//! Server directory lookups.
//!
//! The directory maps the opaque ids reported by the tunnel to server
//! metadata. Lookups are synchronous and side-effect free.
//!
//! [`StaticServerDirectory`] is loaded from a TOML file:
//!
//! ```toml
//! [[servers]]
//! logical_id = "CH#1"
//! server_id = "ch-01"
//! name = "CH#1"
//! country = "CH"
//! entry_ip = "185.159.157.1"
//! exit_ip = "185.159.157.2"
//! domain = "node-ch-01.example.net"
//! ```

use crate::intent::{LogicalServerRef, ServerTarget};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Server metadata used to configure the tunnel and render connected state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHandle {
    /// Logical server id.
    pub logical_id: String,
    /// Physical server id.
    pub server_id: String,
    /// Display name.
    pub name: String,
    /// Exit country code.
    pub country: String,
    /// Tunnel entry address.
    pub entry_ip: String,
    /// Address traffic leaves from.
    pub exit_ip: String,
    /// Server hostname; also the control-channel host.
    pub domain: String,
    /// Optional server label.
    #[serde(default)]
    pub label: Option<String>,
}

impl ServerHandle {
    /// The id pair for this server.
    pub fn reference(&self) -> LogicalServerRef {
        LogicalServerRef::new(self.logical_id.clone(), self.server_id.clone())
    }
}

/// Lookup from tunnel-reported ids to server metadata.
pub trait ServerDirectory: Send + Sync {
    /// Resolve one physical server.
    fn resolve(&self, reference: &LogicalServerRef) -> Option<ServerHandle>;

    /// All servers of a logical, in preference order.
    fn servers_for_logical(&self, logical_id: &str) -> Vec<ServerHandle>;

    /// Pick the server for a connect target.
    fn resolve_target(&self, target: &ServerTarget) -> Option<ServerHandle> {
        match &target.server_id {
            Some(server_id) => self.resolve(&LogicalServerRef::new(
                target.logical_id.clone(),
                server_id.clone(),
            )),
            None => self.servers_for_logical(&target.logical_id).into_iter().next(),
        }
    }
}

/// Errors from loading a directory file.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Failed to read the directory file.
    #[error("Failed to read server directory {path}: {source}")]
    Read {
        /// Path that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse the directory file.
    #[error("Failed to parse server directory {path}: {source}")]
    Parse {
        /// Path that couldn't be parsed.
        path: PathBuf,
        /// The underlying TOML error.
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    servers: Vec<ServerHandle>,
}

/// In-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticServerDirectory {
    servers: Vec<ServerHandle>,
}

impl StaticServerDirectory {
    /// Directory over a fixed list.
    pub fn new(servers: Vec<ServerHandle>) -> Self {
        Self { servers }
    }

    /// Load `[[servers]]` entries from a TOML file.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let contents = fs::read_to_string(path).map_err(|e| DirectoryError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: DirectoryFile = toml::from_str(&contents).map_err(|e| DirectoryError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!("Loaded {} servers from {:?}", file.servers.len(), path);
        Ok(Self::new(file.servers))
    }

    /// Load and concatenate several files in order. Missing files are skipped.
    pub fn load_all(paths: &[PathBuf]) -> Result<Self, DirectoryError> {
        let mut servers = Vec::new();
        for path in paths {
            if !path.exists() {
                debug!("No server directory at {:?}", path);
                continue;
            }
            servers.extend(Self::load(path)?.servers);
        }
        Ok(Self::new(servers))
    }

    /// Every known server.
    pub fn servers(&self) -> &[ServerHandle] {
        &self.servers
    }
}

impl ServerDirectory for StaticServerDirectory {
    fn resolve(&self, reference: &LogicalServerRef) -> Option<ServerHandle> {
        self.servers
            .iter()
            .find(|s| s.logical_id == reference.logical_id && s.server_id == reference.server_id)
            .cloned()
    }

    fn servers_for_logical(&self, logical_id: &str) -> Vec<ServerHandle> {
        self.servers
            .iter()
            .filter(|s| s.logical_id == logical_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn server(logical: &str, id: &str) -> ServerHandle {
        ServerHandle {
            logical_id: logical.to_string(),
            server_id: id.to_string(),
            name: logical.to_string(),
            country: "CH".to_string(),
            entry_ip: "10.0.0.1".to_string(),
            exit_ip: "10.0.0.2".to_string(),
            domain: format!("{id}.example.net"),
            label: None,
        }
    }

    #[test]
    fn test_resolve_exact_server() {
        let dir = StaticServerDirectory::new(vec![server("CH#1", "a"), server("CH#1", "b")]);

        let found = dir.resolve(&LogicalServerRef::new("CH#1", "b")).unwrap();
        assert_eq!(found.server_id, "b");
        assert!(dir.resolve(&LogicalServerRef::new("CH#1", "z")).is_none());
    }

    #[test]
    fn test_logical_target_picks_first_server() {
        let dir = StaticServerDirectory::new(vec![server("SE#3", "x"), server("SE#3", "y")]);

        let picked = dir.resolve_target(&ServerTarget::logical("SE#3")).unwrap();
        assert_eq!(picked.server_id, "x");
        assert!(dir.resolve_target(&ServerTarget::logical("NL#9")).is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("servers.toml");
        fs::write(
            &path,
            r#"
            [[servers]]
            logical_id = "IS#2"
            server_id = "is-02"
            name = "IS#2"
            country = "IS"
            entry_ip = "192.0.2.10"
            exit_ip = "192.0.2.11"
            domain = "node-is-02.example.net"
            label = "2"
            "#,
        )
        .unwrap();

        let dir = StaticServerDirectory::load(&path).unwrap();
        assert_eq!(dir.servers().len(), 1);
        assert_eq!(dir.servers()[0].label.as_deref(), Some("2"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("servers.toml");
        fs::write(&path, "[[servers]\n").unwrap();

        let err = StaticServerDirectory::load(&path).unwrap_err();
        assert!(matches!(err, DirectoryError::Parse { .. }));
    }

    #[test]
    fn test_load_all_skips_missing_files() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("servers.toml");
        fs::write(
            &path,
            r#"
            [[servers]]
            logical_id = "DE#4"
            server_id = "de-04"
            name = "DE#4"
            country = "DE"
            entry_ip = "192.0.2.20"
            exit_ip = "192.0.2.21"
            domain = "node-de-04.example.net"
            "#,
        )
        .unwrap();

        let dir =
            StaticServerDirectory::load_all(&[tmp.path().join("missing.toml"), path]).unwrap();
        assert_eq!(dir.servers().len(), 1);
        assert!(dir.resolve(&LogicalServerRef::new("DE#4", "de-04")).is_some());
    }
}
