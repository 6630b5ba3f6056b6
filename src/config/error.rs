//! Errors raised while loading vpnctl configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Why the configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file passed with `--config` does not exist.
    #[error("Config file {path} passed with --config does not exist")]
    MissingFile {
        /// The requested path.
        path: PathBuf,
    },

    /// A config file exists but could not be read.
    #[error("Cannot read {path}: {source}")]
    ReadError {
        /// The unreadable file.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// A config file is not valid TOML for the schema.
    #[error("Malformed config {path}: {source}")]
    ParseError {
        /// The malformed file.
        path: PathBuf,
        /// TOML failure, with line and column.
        source: toml::de::Error,
    },

    /// A key parsed but its value is not usable.
    #[error("[{section}] {key}: {reason}")]
    InvalidValue {
        /// Table the key lives in, such as `general`.
        section: &'static str,
        /// The offending key.
        key: &'static str,
        /// What is accepted instead.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_names_table_and_key() {
        let err = ConfigError::InvalidValue {
            section: "session",
            key: "selector",
            reason: "missing".into(),
        };

        assert_eq!(err.to_string(), "[session] selector: missing");
    }
}
