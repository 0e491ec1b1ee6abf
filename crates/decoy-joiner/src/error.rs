//! Joiner error types.

use thiserror::Error;

/// Errors that can occur while supervising a joiner invocation.
#[derive(Debug, Error)]
pub enum JoinerError {
    #[error("failed to spawn joiner process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("probe timed out after {0} seconds")]
    ProbeTimeout(u64),
}

pub type JoinerResult<T> = Result<T, JoinerError>;
