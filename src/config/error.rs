//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling the proxy configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("Cannot read {path}: {source}")]
    Read {
        /// Offending file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file given with `--config` does not exist.
    #[error("Config file {0} does not exist")]
    MissingFile(PathBuf),

    /// A config file is not valid TOML for the schema.
    #[error("Cannot parse {path}: {source}")]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// The underlying TOML error, with line and column.
        #[source]
        source: toml::de::Error,
    },

    /// Settings that parse but cannot be used together.
    #[error("[{field}] {message}")]
    Invalid {
        /// Dotted key, e.g. `ssl.ca_key`.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}
