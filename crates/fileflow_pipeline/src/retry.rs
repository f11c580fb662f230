//! Per-step retry with exponential backoff over transient errors.

use crate::failure::CancellationToken;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Errors that may be worth another attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for fileflow_db::DbError {
    fn is_transient(&self) -> bool {
        self.is_transient()
    }
}

impl Transient for fileflow_store::StoreError {
    fn is_transient(&self) -> bool {
        self.is_transient()
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Cancellation observed before an attempt or a backoff sleep.
    Cancelled,
    /// Every attempt exceeded the per-operation timeout.
    TimedOut,
    /// Non-transient error, or the attempt budget ran out.
    Failed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Cancelled => f.write_str("cancelled"),
            RetryError::TimedOut => f.write_str("operation timed out"),
            RetryError::Failed(e) => e.fmt(f),
        }
    }
}

/// Attempt budget R with exponential backoff (base, 2x per attempt) and
/// a per-attempt timeout. Timeouts count as transient.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub op_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: fileflow_protocol::config::DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            op_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// Fast backoff for tests.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Run `operation`, retrying transient failures and timeouts up to
    /// the budget. Non-transient failures return immediately.
    pub async fn run<T, E, F, Fut>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.base_delay;
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            match tokio::time::timeout(self.op_timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) if error.is_transient() && attempt < attempts => {
                    warn!(
                        op = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient failure, backing off"
                    );
                }
                Ok(Err(error)) => return Err(RetryError::Failed(error)),
                Err(_elapsed) if attempt < attempts => {
                    warn!(
                        op = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        timeout_ms = self.op_timeout.as_millis() as u64,
                        "attempt timed out, backing off"
                    );
                }
                Err(_elapsed) => return Err(RetryError::TimedOut),
            }
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        unreachable!("retry loop always returns");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky {
        transient: bool,
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.transient)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let policy = RetryPolicy::new(3).with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = policy
            .run("op", &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky { transient: true })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_fast() {
        let policy = RetryPolicy::new(3).with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("op", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky { transient: false })
            })
            .await;
        assert!(matches!(result, Err(RetryError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(2).with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("op", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky { transient: true })
            })
            .await;
        assert!(matches!(result, Err(RetryError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_attempts_hit_the_operation_timeout() {
        let policy = RetryPolicy::new(2)
            .with_base_delay(Duration::from_millis(1))
            .with_op_timeout(Duration::from_millis(5));
        let result: Result<(), RetryError<Flaky>> = policy
            .run("op", &CancellationToken::new(), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RetryError::TimedOut)));
    }

    #[tokio::test]
    async fn cancellation_preempts_attempts() {
        let policy = RetryPolicy::new(3).with_base_delay(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<Flaky>> =
            policy.run("op", &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
