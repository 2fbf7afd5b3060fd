use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::{RetryConfig, WorkflowNode};

/// Wraps one node invocation with bounded retries and a per-attempt timeout.
#[derive(Debug, Clone, Default)]
pub struct RetryGuard {
    retry: RetryConfig,
    timeout: Option<Duration>,
}

/// Final result of a guarded call plus how many attempts it took.
#[derive(Debug)]
pub struct GuardOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryGuard {
    pub fn new(retry: RetryConfig, timeout: Option<Duration>) -> Self {
        Self { retry, timeout }
    }

    pub fn from_node(node: &WorkflowNode) -> Self {
        Self::new(
            node.retry_config.clone().unwrap_or_default(),
            node.timeout_ms.map(Duration::from_millis),
        )
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or runs
    /// out of retries. `op` receives the 0-based attempt number.
    ///
    /// A timed-out attempt is dropped, not aborted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> GuardOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.retry.max_retries;
        let mut attempt = 0;
        loop {
            let result = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(WeftError::Timeout {
                        node: label.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => op(attempt).await,
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(node_id = %label, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return GuardOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                    };
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let backoff = self.retry.delay_for(attempt);
                    warn!(
                        node_id = %label,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying node"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return GuardOutcome {
                        result: Err(e),
                        attempts: attempt + 1,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn guard(max_retries: u32, delay_ms: u64, timeout_ms: Option<u64>) -> RetryGuard {
        RetryGuard::new(
            RetryConfig::new(max_retries, delay_ms, 2.0),
            timeout_ms.map(Duration::from_millis),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_runs_n_plus_one_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let outcome: GuardOutcome<()> = guard(3, 100, None)
            .run("n1", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(WeftError::execution("Persistent failure"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.result.unwrap_err().to_string(), "Persistent failure");
        // 100 + 200 + 400
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_kth_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = guard(3, 10, None)
            .run("n1", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(WeftError::execution("flaky"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.result.unwrap(), "done");
    }

    #[tokio::test]
    async fn zero_retries_is_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: GuardOutcome<()> = guard(0, 10, None)
            .run("n1", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(WeftError::execution("nope"))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: GuardOutcome<()> = guard(5, 10, None)
            .run("gate", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(WeftError::GateFailure {
                        condition: "output.ok".into(),
                    })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.result, Err(WeftError::GateFailure { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let outcome: GuardOutcome<()> = guard(0, 10, Some(1000))
            .run("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, WeftError::Timeout { timeout_ms: 1000, .. }));
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = guard(1, 10, Some(100))
            .run("slow-then-fast", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.result.unwrap(), 1);
    }
}
