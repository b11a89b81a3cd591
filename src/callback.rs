use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{DeliveryError, FailureReason};
use crate::types::Decision;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Retry/backoff settings for callback delivery.
///
/// Attempt count is only one bound: no attempt starts at or after the
/// event's response deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,

    /// Upper bound for a single attempt; clamped to the time left.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 200,
            max_ms: 10_000,
            jitter_ms: 100,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64, jitter_ms: u64) -> Self {
        self.base_ms = base_ms;
        self.max_ms = max_ms;
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }

    /// Exponential delay after failed attempt number `attempt` (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_ms.max(1);
        let max = self.max_ms.max(base);
        let pow = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(pow).min(max))
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=self.jitter_ms))
    }
}

/// Body posted to the dispatcher's callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackBody {
    pub secret: String,
    pub output: Decision,
}

/// Successful delivery details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub attempts: u32,
    pub status: u16,
}

/// Delivers deferred decisions to the dispatcher.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl CallbackClient {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_client(reqwest::Client::new(), policy)
    }

    pub fn with_client(http: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { http, policy }
    }

    /// Post `{secret, output}` to `callback_url`, retrying transient failures
    /// until the policy or `deadline` runs out.
    ///
    /// Terminal failures are logged here; callers only record the result.
    pub async fn deliver(
        &self,
        callback_url: &str,
        secret: &str,
        decision: &Decision,
        deadline: Instant,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let body = CallbackBody {
            secret: secret.to_string(),
            output: decision.clone(),
        };

        let result = self.deliver_body(callback_url, &body, deadline).await;
        match &result {
            Ok(receipt) => {
                metric_inc("trigger.callback.delivered");
                debug!(
                    callback_url,
                    attempts = receipt.attempts,
                    status = receipt.status,
                    "callback delivered"
                );
            }
            Err(err) => {
                metric_inc("trigger.callback.abandoned");
                warn!(callback_url, attempts = err.attempts(), error = %err, "callback abandoned");
            }
        }
        result
    }

    async fn deliver_body(
        &self,
        callback_url: &str,
        body: &CallbackBody,
        deadline: Instant,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut last = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(DeliveryError::DeadlineExceeded { attempts, last });
            }

            attempts += 1;
            let timeout = self.policy.attempt_timeout().min(deadline - now);

            let reason = match self.attempt(callback_url, body, timeout).await {
                Ok(status) => return Ok(DeliveryReceipt { attempts, status }),
                Err(reason) => reason,
            };

            if !reason.is_retryable() {
                return Err(DeliveryError::Rejected { attempts, reason });
            }
            if attempts >= max_attempts {
                return Err(DeliveryError::Exhausted { attempts, last: reason });
            }

            let delay = self.policy.delay_for_attempt(attempts) + self.policy.jitter();
            if Instant::now() + delay >= deadline {
                return Err(DeliveryError::DeadlineExceeded {
                    attempts,
                    last: Some(reason),
                });
            }

            metric_inc("trigger.callback.retry");
            debug!(callback_url, attempts, error = %reason, delay_ms = delay.as_millis() as u64, "callback retry scheduled");
            last = Some(reason);
            sleep(delay).await;
        }
    }

    /// One HTTP attempt.
    async fn attempt(
        &self,
        callback_url: &str,
        body: &CallbackBody,
        timeout: Duration,
    ) -> Result<u16, FailureReason> {
        let response = self
            .http
            .post(callback_url)
            .timeout(timeout)
            .json(body)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(status.as_u16())
                } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    Err(FailureReason::RemoteError(status.as_u16()))
                } else {
                    Err(FailureReason::ClientError(status.as_u16()))
                }
            }
            Err(err) => {
                if err.is_timeout() {
                    Err(FailureReason::Timeout)
                } else {
                    Err(FailureReason::Network)
                }
            }
        }
    }
}
