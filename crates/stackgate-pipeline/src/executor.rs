//! Stage execution with bounded retries.
//!
//! An [`ExecutionError`] (timeout, spawn failure, transient infra fault) is
//! retried with exponential backoff up to the configured cap. A tool-
//! reported failure (nonzero exit) is an *outcome*, never retried here —
//! that is a gate decision for the engine.
//!
//! Every attempt is returned to the caller so it can be persisted as its
//! own append-only stage attempt record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::{AdapterContext, ExecutionOutcome, ToolAdapter};
use stackgate_core::domain::ExecutionError;

/// Retry policy for transient execution errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Base backoff delay; doubles per retry.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): base * 2^(retry-1).
    pub fn delay_ms(&self, retry: u32) -> u64 {
        self.base_delay_ms.saturating_mul(1u64 << (retry - 1).min(16))
    }
}

/// One attempt's timing and result.
#[derive(Debug)]
pub struct AttemptOutcome {
    /// 1-based attempt counter
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: Result<ExecutionOutcome, ExecutionError>,
}

/// All attempts made for one stage invocation, in order.
#[derive(Debug)]
pub struct ExecutionReport {
    pub attempts: Vec<AttemptOutcome>,
}

impl ExecutionReport {
    /// The deciding attempt (always present — at least one attempt is made).
    pub fn final_attempt(&self) -> &AttemptOutcome {
        self.attempts.last().expect("at least one attempt")
    }
}

/// Run the adapter, retrying execution errors per policy.
pub async fn execute_with_retries(
    adapter: &dyn ToolAdapter,
    ctx: &AdapterContext,
    policy: &RetryPolicy,
) -> ExecutionReport {
    let mut attempts = Vec::new();

    for attempt in 1..=(policy.max_retries + 1) {
        let mut attempt_ctx = ctx.clone();
        attempt_ctx.attempt = attempt;

        let started_at = Utc::now();
        let result = adapter.run(&attempt_ctx).await;
        let finished_at = Utc::now();

        let retryable = result.is_err();
        attempts.push(AttemptOutcome {
            attempt,
            started_at,
            finished_at,
            result,
        });

        if !retryable {
            break;
        }

        if attempt <= policy.max_retries {
            let delay = policy.delay_ms(attempt);
            warn!(
                run_id = %ctx.run_id,
                stage = %ctx.stage,
                attempt = attempt,
                delay_ms = delay,
                "execution error, retrying"
            );
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }

    ExecutionReport { attempts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stackgate_core::domain::Stage;
    use stackgate_state::{RunId, StackId};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: RunId::new(),
            stack_id: StackId("s".into()),
            stage: Stage::Validate,
            attempt: 1,
            revision: "rev".into(),
            inputs: Vec::new(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
        }
    }

    /// Adapter that errors for the first `failures` calls, then succeeds.
    struct FlakyAdapter {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ToolAdapter for FlakyAdapter {
        async fn run(&self, _ctx: &AdapterContext) -> Result<ExecutionOutcome, ExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ExecutionError::Io {
                    message: "transient".into(),
                })
            } else {
                Ok(ExecutionOutcome {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: 1,
                })
            }
        }
    }

    /// Adapter that always reports a tool failure (nonzero exit).
    struct FailingToolAdapter;

    #[async_trait]
    impl ToolAdapter for FailingToolAdapter {
        async fn run(&self, _ctx: &AdapterContext) -> Result<ExecutionOutcome, ExecutionError> {
            Ok(ExecutionOutcome {
                exit_code: 1,
                stdout: String::new(),
                stderr: "violation".into(),
                duration_ms: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_success_first_try_single_attempt() {
        let adapter = FlakyAdapter {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        let report = execute_with_retries(&adapter, &ctx(), &fast_policy(3)).await;
        assert_eq!(report.attempts.len(), 1);
        assert!(report.final_attempt().result.is_ok());
    }

    #[tokio::test]
    async fn test_execution_error_retried_until_success() {
        let adapter = FlakyAdapter {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let report = execute_with_retries(&adapter, &ctx(), &fast_policy(3)).await;
        assert_eq!(report.attempts.len(), 3);
        assert!(report.attempts[0].result.is_err());
        assert!(report.attempts[1].result.is_err());
        assert!(report.attempts[2].result.is_ok());
        assert_eq!(report.final_attempt().attempt, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let adapter = FlakyAdapter {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let report = execute_with_retries(&adapter, &ctx(), &fast_policy(2)).await;
        assert_eq!(report.attempts.len(), 3);
        assert!(report.final_attempt().result.is_err());
    }

    #[tokio::test]
    async fn test_tool_failure_never_retried() {
        let report = execute_with_retries(&FailingToolAdapter, &ctx(), &fast_policy(3)).await;
        assert_eq!(report.attempts.len(), 1);
        let outcome = report.final_attempt().result.as_ref().unwrap();
        assert_eq!(outcome.exit_code, 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 4,
            base_delay_ms: 100,
        };
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert_eq!(policy.delay_ms(3), 400);
    }
}
