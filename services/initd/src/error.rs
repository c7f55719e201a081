//! Error types for the init supervisor.

use gantry_api::{ForkError, ForkFailure};
use thiserror::Error;

/// Reasons a fork cannot produce a child process. Each maps onto one wire
/// reason code; the carried string is the human-readable detail.
#[derive(Debug, Error)]
pub enum InitdError {
    /// The requested identity cannot be resolved or assumed.
    #[error("identity_error: {0}")]
    Identity(String),

    /// The command cannot be executed.
    #[error("exec_error: {0}")]
    Exec(String),

    /// The requested working directory does not exist.
    #[error("no_such_directory: {0}")]
    NoSuchDirectory(String),

    /// The request shape is invalid (empty args, unknown pid, bad signal).
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
}

impl InitdError {
    pub fn reason(&self) -> ForkFailure {
        match self {
            InitdError::Identity(_) => ForkFailure::IdentityError,
            InitdError::Exec(_) => ForkFailure::ExecError,
            InitdError::NoSuchDirectory(_) => ForkFailure::NoSuchDirectory,
            InitdError::InvalidRequest(_) => ForkFailure::InvalidRequest,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            InitdError::Identity(m)
            | InitdError::Exec(m)
            | InitdError::NoSuchDirectory(m)
            | InitdError::InvalidRequest(m) => m,
        }
    }

    pub fn to_wire(&self) -> ForkError {
        ForkError {
            reason: self.reason(),
            message: self.message().to_string(),
        }
    }
}
