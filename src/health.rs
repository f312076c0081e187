//! Periodic health checks while the backend is up.
//!
//! The monitor only reports. It never restarts or kills the backend and keeps
//! running after a failed check; crash handling belongs to the exit observer.

use crate::probe::ReadinessProbe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info_span, Instrument};

/// Handle to a running health check loop. Dropping it cancels the loop,
/// including a probe that is still in flight.
#[derive(Debug)]
pub struct HealthMonitor {
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Starts checking every `interval`, the first check one interval from
    /// now. `report` receives every outcome.
    pub fn spawn<F>(probe: ReadinessProbe, interval: Duration, report: F) -> Self
    where
        F: Fn(bool) + Send + 'static,
    {
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let healthy = probe.check().await;
                    debug!(healthy, "Health check");
                    report(healthy);
                }
            }
            .instrument(info_span!("health_monitor")),
        );
        Self { task }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
