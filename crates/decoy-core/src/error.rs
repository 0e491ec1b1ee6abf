//! Configuration error types.

use thiserror::Error;

/// Errors that can occur while loading or editing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("accounts file is empty")]
    EmptyAccountsFile,

    #[error("malformed account on line {line}: expected `username:password`")]
    MalformedAccountLine { line: usize },

    #[error("server not found in config: {0}")]
    ServerNotFound(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
