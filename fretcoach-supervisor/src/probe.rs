//! HTTP liveness probing of the backend.
//!
//! One GET per attempt with its own timeout, a fixed pause between attempts and a
//! bounded attempt budget. Every await is raced against a cancellation token, so a
//! stop request abandons in-flight and pending attempts.

use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProbePolicy, ServiceEndpoint};

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthProbeResult {
    pub attempt: u32,
    pub success: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready { attempt: u32 },
    Exhausted { attempts: u32 },
    Cancelled,
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Loopback only: never route through a proxy from the environment.
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }

    /// Issue one GET. Only a 200 counts as healthy.
    pub async fn check(&self, url: &str, attempt: u32, timeout: Duration) -> HealthProbeResult {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) if response.status() == StatusCode::OK => HealthProbeResult {
                attempt,
                success: true,
                timed_out: false,
            },
            Ok(response) => {
                debug!("Health check {} returned {}", attempt, response.status());
                HealthProbeResult {
                    attempt,
                    success: false,
                    timed_out: false,
                }
            }
            Err(e) => {
                if !e.is_connect() && !e.is_timeout() {
                    warn!("Health check {} unexpected error: {}", attempt, e);
                }
                HealthProbeResult {
                    attempt,
                    success: false,
                    timed_out: e.is_timeout(),
                }
            }
        }
    }

    /// Poll `endpoint` until it answers 200, attempts run out, or `cancel` fires.
    pub async fn probe(
        &self,
        endpoint: &ServiceEndpoint,
        policy: &ProbePolicy,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        let url = endpoint.url();
        debug!(
            "Probing {} ({} attempts every {:?})",
            url,
            policy.max_attempts,
            policy.interval()
        );

        for attempt in 1..=policy.max_attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                result = self.check(&url, attempt, policy.attempt_timeout()) => result,
            };
            debug!(?result, "health probe attempt");

            if result.success {
                info!("Backend healthy at {} after {} attempt(s)", url, attempt);
                return ProbeOutcome::Ready { attempt };
            }
            if attempt == policy.max_attempts {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                _ = tokio::time::sleep(policy.interval()) => {}
            }
        }

        warn!(
            "Backend at {} not healthy after {} attempts",
            url, policy.max_attempts
        );
        ProbeOutcome::Exhausted {
            attempts: policy.max_attempts,
        }
    }
}
