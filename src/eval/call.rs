use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::{error::EvalError, LLMError};

/// Budgets for the two blocking external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub agent_timeout_ms: u64,
    pub judge_timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 30_000,
            judge_timeout_ms: 30_000,
            retry_backoff_ms: 500,
        }
    }
}

impl TimeoutConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.agent_timeout_ms == 0 || self.judge_timeout_ms == 0 {
            return Err(EvalError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Delay before retry number `attempt` (1-based), doubling each time.
pub fn retry_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Run `make()` under `timeout`. A timeout or transient transport error gets
/// exactly one retry after the backoff; anything else is returned as is.
pub async fn bounded_call<T, F, Fut>(
    label: &'static str,
    timeout: Duration,
    backoff: Duration,
    mut make: F,
) -> Result<T, LLMError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LLMError>>,
{
    const MAX_ATTEMPTS: u32 = 2;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let started = Instant::now();
        let result = match time::timeout(timeout, make()).await {
            Ok(result) => result,
            Err(_) => Err(LLMError::Timeout(timeout.as_millis() as u64)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                debug!(call = label, attempt, elapsed_ms, "external call succeeded");
                return Ok(value);
            }
            Err(err) if attempt < MAX_ATTEMPTS && err.is_transient() => {
                let delay = retry_delay(backoff, attempt);
                warn!(
                    call = label,
                    attempt,
                    elapsed_ms,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                time::sleep(delay).await;
            }
            Err(err) => {
                warn!(call = label, attempt, elapsed_ms, error = %err, "external call failed");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn retry_delay_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(base, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_once_then_reported() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), LLMError> = bounded_call(
            "agent",
            Duration::from_millis(50),
            Duration::from_millis(10),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            },
        )
        .await;

        assert!(matches!(result, Err(LLMError::Timeout(50))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let attempts = AtomicU32::new(0);
        let result = bounded_call(
            "judge",
            Duration::from_secs(1),
            Duration::from_millis(10),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(LLMError::Timeout(1))
                    } else {
                        Ok("verdict")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.expect("second attempt succeeds"), "verdict");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn content_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), LLMError> = bounded_call(
            "agent",
            Duration::from_secs(1),
            Duration::from_millis(10),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(LLMError::InvalidResponse("no choices")) }
            },
        )
        .await;

        assert!(matches!(result, Err(LLMError::InvalidResponse(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = TimeoutConfig {
            agent_timeout_ms: 0,
            ..TimeoutConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
