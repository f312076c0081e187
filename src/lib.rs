//! Supervisor for the companion app's local backend service.
//!
//! [`Supervisor`] launches the backend, waits until its health path answers,
//! keeps checking it and shuts it down (SIGTERM, then SIGKILL). Requests to the
//! backend go through [`RequestGateway`], which refuses to send anything unless
//! the supervisor reports the backend as running.

pub mod configs;
pub mod error;
pub mod gateway;
pub mod health;
pub mod probe;
pub mod process;
pub mod socket;

pub use error::{Result, SupervisorError};
pub use gateway::RequestGateway;
pub use process::{StartOutcome, Status, StopOutcome, Supervisor, SupervisorState};
