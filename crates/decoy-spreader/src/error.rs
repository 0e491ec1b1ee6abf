//! Spreader error types.

use thiserror::Error;

/// Errors that can occur during spread operations.
#[derive(Debug, Error)]
pub enum SpreaderError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("player not assigned to any server: {0}")]
    PlayerNotAssigned(String),
}

pub type SpreaderResult<T> = Result<T, SpreaderError>;
