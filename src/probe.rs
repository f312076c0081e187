//! Liveness checks against the backend's health endpoint.

use crate::configs::ProcessConfig;
use crate::error::{Result, SupervisorError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ReadinessProbe {
    pub fn new(client: reqwest::Client, config: &ProcessConfig) -> Self {
        Self {
            client,
            url: config.url(&config.health_path),
            timeout: config.probe_timeout,
        }
    }

    /// One bounded GET against the health path. Transport errors and
    /// non-success statuses both count as "not ready".
    pub async fn check(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(status = %response.status(), "Health check failed");
                false
            }
            Err(err) => {
                trace!(%err, "Health check unreachable");
                false
            }
        }
    }

    /// Polls [`check`](Self::check) every `poll_interval` until it succeeds or
    /// `max_wait` has elapsed.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn wait_until_ready(&self, max_wait: Duration, poll_interval: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // A hanging check must not push us past the deadline.
            if let Ok(true) = tokio::time::timeout_at(deadline, self.check()).await {
                debug!(attempt, elapsed = ?started.elapsed(), "Backend ready");
                return Ok(());
            }
            let next = Instant::now() + poll_interval;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(SupervisorError::StartupTimeout { waited: max_wait });
            }
            tokio::time::sleep_until(next).await;
        }
    }
}
