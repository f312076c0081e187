use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
}

impl SupervisorState {
    /// `Running` and `Degraded` both mean a live, ready process exists.
    pub fn is_up(&self) -> bool {
        matches!(self, SupervisorState::Running | SupervisorState::Degraded)
    }
}

/// Point-in-time view of the supervisor. Built from memory only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub running: bool,
    pub state: SupervisorState,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub pid: Option<u32>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartOutcome {
    /// A new process was launched and became ready.
    Started,
    /// The backend was already up, nothing was done.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopOutcome {
    /// There was no process to stop.
    NotRunning,
    /// The process exited within the grace period.
    Graceful,
    /// The grace period ran out and the process was killed.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Exited { generation: u64, info: ExitInfo },
    Health { generation: u64, healthy: bool },
}
