use std::future::Future;
use std::time::Duration;

use ai_client::AiError;
use curator_common::OracleConfig;
use tracing::warn;

use super::contract::ContractViolation;

/// Longest single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded retry budget for oracle calls: `max_retries` extra attempts after
/// the first, exponential backoff between attempts, and a per-call timeout
/// that counts as a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OracleConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Delay before attempt `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Call the oracle until `validate` accepts a response or the budget runs
    /// out. `retries` on the outcome is the number of failed attempts.
    pub async fn run<T, F, Fut, V>(&self, label: &str, mut call: F, validate: V) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
        V: Fn(&str) -> Result<T, ContractViolation>,
    {
        let mut last_error: String;
        let mut last_raw = None;
        let mut attempt = 0u32;

        loop {
            match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(raw)) => match validate(&raw) {
                    Ok(value) => {
                        return RetryOutcome::Accepted {
                            value,
                            raw,
                            retries: attempt,
                        }
                    }
                    Err(violation) => {
                        warn!(label, attempt, error = %violation, "Oracle response violates contract");
                        last_error = violation.to_string();
                        last_raw = Some(raw);
                    }
                },
                Ok(Err(e)) => {
                    warn!(label, attempt, error = %e, "Oracle call failed");
                    last_error = e.to_string();
                    let permanent = e
                        .downcast_ref::<AiError>()
                        .is_some_and(|ai| !ai.is_transient());
                    if permanent {
                        return RetryOutcome::Exhausted {
                            retries: attempt,
                            last_error,
                            last_raw,
                        };
                    }
                }
                Err(_) => {
                    warn!(label, attempt, timeout_secs = self.timeout.as_secs(), "Oracle call timed out");
                    last_error = format!("timed out after {:?}", self.timeout);
                }
            }

            if attempt >= self.max_retries {
                return RetryOutcome::Exhausted {
                    retries: attempt,
                    last_error,
                    last_raw,
                };
            }
            tokio::time::sleep(self.delay_for(attempt)).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Accepted {
        value: T,
        raw: String,
        retries: u32,
    },
    Exhausted {
        retries: u32,
        last_error: String,
        last_raw: Option<String>,
    },
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        match self {
            Self::Accepted { retries, .. } | Self::Exhausted { retries, .. } => *retries,
        }
    }
}
