use crate::process::ExitInfo;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the supervisor and the request gateway.
///
/// Cloneable: a single start attempt is shared by every caller that attached
/// to it, and each of them receives the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Backend was not ready after {waited:?}")]
    StartupTimeout { waited: Duration },

    #[error("Failed to launch backend: {0}")]
    ProcessCreation(String),

    #[error("Backend exited during startup ({0})")]
    ExitedDuringStartup(ExitInfo),

    #[error("Backend is not running")]
    NotRunning,

    #[error("Backend is shutting down")]
    ShuttingDown,

    #[error("Backend responded with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Backend request failed: {0}")]
    Transport(String),

    #[error("Invalid response from backend: {0}")]
    InvalidResponse(String),

    #[error("Supervisor task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for SupervisorError {
    fn from(err: tokio::task::JoinError) -> Self {
        SupervisorError::TaskFailed(err.to_string())
    }
}

impl From<reqwest::Error> for SupervisorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SupervisorError::InvalidResponse(err.to_string())
        } else {
            SupervisorError::Transport(err.to_string())
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
