//! Post-deploy liveness verification with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{Result, ShipyardError};

/// Liveness path appended to every health endpoint.
pub const LIVENESS_PATH: &str = "/health";

/// Delay schedule between probe attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `step * n` before retry `n`.
    Linear { step: Duration },
    /// `initial * 2^(n-1)` before retry `n`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match *self {
            Backoff::Linear { step } => step.saturating_mul(retry),
            Backoff::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("health endpoint unreachable: {0}")]
    Transport(String),

    #[error("health endpoint answered {status}")]
    Unhealthy { status: u16 },
}

/// A single liveness probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, endpoint: &str) -> std::result::Result<(), HealthError>;
}

/// Polls a health endpoint until it answers or attempts run out.
#[derive(Clone)]
pub struct HealthVerifier {
    probe: Arc<dyn HealthProbe>,
}

impl HealthVerifier {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// `true` once a probe succeeds; `false` after `attempts` failures.
    pub async fn verify(&self, endpoint: &str, attempts: u32, backoff: Backoff) -> bool {
        for attempt in 1..=attempts {
            match self.probe.check(endpoint).await {
                Ok(()) => {
                    info!(endpoint = %endpoint, attempt, "service healthy");
                    return true;
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, attempt, error = %e, "health probe failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff.delay(attempt)).await;
            }
        }
        warn!(endpoint = %endpoint, attempts, "health verification exhausted");
        false
    }

    /// [`Self::verify`] bounded by an overall deadline.
    pub async fn verify_within(
        &self,
        endpoint: &str,
        attempts: u32,
        backoff: Backoff,
        limit: Duration,
    ) -> Result<bool> {
        tokio::time::timeout(limit, self.verify(endpoint, attempts, backoff))
            .await
            .map_err(|_| ShipyardError::Timeout {
                operation: "health verification".to_string(),
                secs: limit.as_secs(),
            })
    }
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

/// `GET <endpoint>/health`; any 2xx is healthy.
pub struct HttpHealthProbe {
    http_client: reqwest::Client,
    request_timeout: Duration,
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            request_timeout,
        }
    }

    pub fn liveness_url(endpoint: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), LIVENESS_PATH)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, endpoint: &str) -> std::result::Result<(), HealthError> {
        let response = self
            .http_client
            .get(Self::liveness_url(endpoint))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HealthError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HealthError::Unhealthy {
                status: status.as_u16(),
            })
        }
    }
}
