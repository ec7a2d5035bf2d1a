use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skein_core::definition::RetryPolicy;
use skein_core::error::{Result, SkeinError};

/// Outcome of a successful (possibly retried) invocation.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    /// Total invocations, the successful one included.
    pub attempts: u32,
}

/// Failure after the policy was exhausted.
#[derive(Debug)]
pub struct Exhausted {
    pub error: SkeinError,
    pub attempts: u32,
}

/// Applies a node's backoff policy across repeated handler invocations.
pub struct RetryCoordinator;

impl RetryCoordinator {
    /// Run `operation` until it succeeds or the policy is exhausted.
    ///
    /// Each attempt gets a fresh future from `operation`, so every attempt
    /// sees the same input. Without a policy the first failure is final.
    /// The final error is wrapped as [`SkeinError::NodeExecution`].
    /// Cancellation during a backoff wait ends the loop with
    /// [`SkeinError::Cancelled`].
    pub async fn run<F, Fut, T>(
        node_id: &str,
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> std::result::Result<Attempted<T>, Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = policy.map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 1;

        loop {
            debug!(node_id, attempt, max_attempts, "Invoking handler");
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(node_id, attempt, "Handler succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(SkeinError::Cancelled) => {
                    return Err(Exhausted {
                        error: SkeinError::Cancelled,
                        attempts: attempt,
                    });
                }
                // A timed-out human wait is final: re-prompting would let
                // late input through.
                Err(e @ SkeinError::HumanInputTimeout { .. }) => {
                    return Err(Exhausted {
                        error: SkeinError::node(node_id, e),
                        attempts: attempt,
                    });
                }
                Err(e) if attempt < max_attempts => {
                    // max_attempts > 1 implies a policy
                    let delay = policy.map(|p| p.delay_for(attempt)).unwrap_or_default();
                    warn!(
                        node_id,
                        attempt,
                        max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying node"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(Exhausted {
                                error: SkeinError::Cancelled,
                                attempts: attempt,
                            });
                        }
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Exhausted {
                        error: SkeinError::node(node_id, e),
                        attempts: attempt,
                    });
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
    use std::time::{Duration, Instant};

    fn flaky(fail_times: u32, calls: Arc<AtomicU32>) -> impl FnMut(u32) -> futures::future::Ready<Result<u32>> {
        move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= fail_times {
                futures::future::ready(Err(SkeinError::Handler(format!("attempt {n} failed"))))
            } else {
                futures::future::ready(Ok(n))
            }
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let result = RetryCoordinator::run("n", Some(&policy), &CancellationToken::new(), flaky(2, calls.clone()))
            .await
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_and_wraps() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        let err = RetryCoordinator::run("n", Some(&policy), &CancellationToken::new(), flaky(99, calls.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err.error, SkeinError::NodeExecution { ref node_id, .. } if node_id == "n"));
    }

    #[tokio::test]
    async fn human_timeout_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let err = RetryCoordinator::run("approve", Some(&policy), &CancellationToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err::<u32, _>(SkeinError::HumanInputTimeout {
                node_id: "approve".into(),
                timeout_ms: 30,
            }))
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err.error, SkeinError::NodeExecution { ref node_id, .. } if node_id == "approve"));
    }

    #[tokio::test]
    async fn no_policy_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = RetryCoordinator::run("n", None, &CancellationToken::new(), flaky(1, calls.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waits_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(3, Duration::from_millis(20));
        let start = Instant::now();
        RetryCoordinator::run("n", Some(&policy), &CancellationToken::new(), flaky(2, calls))
            .await
            .unwrap();
        // 20ms + 40ms of linear backoff
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(3, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = RetryCoordinator::run("n", Some(&policy), &cancel, flaky(99, calls))
            .await
            .unwrap_err();
        assert!(matches!(err.error, SkeinError::Cancelled));
    }
}
