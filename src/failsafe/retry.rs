//! Retry logic with exponential backoff
//!
//! The schedule is data ([`RetryPolicy`]) and sleeping goes through an
//! injectable [`Sleeper`], so tests can assert the exact delays without
//! waiting for them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Error;
use crate::config::RetryConfig;
use crate::transport::TransportResponse;

/// Retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff_factor: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Statuses that trigger a retry
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_factor: config.backoff_factor,
            max_backoff: config.max_backoff,
            retryable_status_codes: config.retryable_status_codes.clone(),
        }
    }

    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delays between attempts: `backoff_factor * 2^(n-1)` for retry n
    #[must_use]
    pub fn schedule(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.backoff_factor)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
            .build()
    }

    /// Whether a response status should be retried
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }
}

/// Something that can wait
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of a retried call
#[derive(Debug)]
pub struct RetryOutcome {
    /// Final response, or the error that ended the chain
    pub result: Result<TransportResponse, Error>,
    /// Attempts made (first call included)
    pub attempts: u32,
}

impl RetryOutcome {
    /// Retries made after the first attempt
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Executes one outbound call under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(Arc::new(TokioSleeper))
    }
}

impl RetryExecutor {
    /// Create an executor that waits through `sleeper`
    #[must_use]
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    /// Run `f` until it succeeds, fails permanently, or retries run out.
    ///
    /// Retryable: responses whose status is in the policy's set, and
    /// transient transport errors (timeouts, connection failures). A
    /// response with any other status is returned as-is for the caller to
    /// interpret. Exhaustion yields [`Error::Transport`] carrying the last
    /// status and detail.
    pub async fn execute<F, Fut>(
        &self,
        policy: &RetryPolicy,
        name: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<TransportResponse, Error>>,
    {
        let mut delays = policy.schedule();
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(Error::Cancelled),
                    attempts,
                };
            }

            attempts += 1;
            let mut hint = None;
            let failure = match f(attempts).await {
                Ok(response) if policy.is_retryable_status(response.status) => {
                    hint = response.retry_after;
                    Error::transport(Some(response.status), response.summary())
                }
                Ok(response) => {
                    return RetryOutcome {
                        result: Ok(response),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() => e,
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts,
                    };
                }
            };

            let Some(scheduled) = delays.next() else {
                warn!(
                    operation = name,
                    attempts,
                    error = %failure,
                    "Retries exhausted"
                );
                return RetryOutcome {
                    result: Err(into_transport(failure)),
                    attempts,
                };
            };

            // A server-sent Retry-After may stretch the wait, never past max_backoff
            let delay = hint.map_or(scheduled, |h| scheduled.max(h.min(policy.max_backoff)));

            debug!(
                operation = name,
                attempt = attempts,
                delay_ms = delay.as_millis(),
                error = %failure,
                "Retrying after backoff"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return RetryOutcome { result: Err(Error::Cancelled), attempts };
                }
                () = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

fn into_transport(error: Error) -> Error {
    match error {
        Error::Transport { .. } => error,
        other => Error::transport(None, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().push(duration);
        }
    }

    fn response(status: u16) -> TransportResponse {
        TransportResponse {
            status,
            body: Value::Null,
            retry_after: None,
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_factor: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }

    #[tokio::test]
    async fn always_503_attempts_max_retries_plus_one() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = RetryExecutor::new(sleeper.clone());
        let calls = AtomicU32::new(0);

        let outcome = executor
            .execute(&policy(3), "test", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(response(503)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.retries(), 3);
        assert!(matches!(
            outcome.result,
            Err(Error::Transport { status: Some(503), .. })
        ));
        assert_eq!(
            *sleeper.delays.lock(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn success_after_transient_failures() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = RetryExecutor::new(sleeper.clone());

        let outcome = executor
            .execute(&policy(3), "test", &CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(Error::Timeout("30s".into()))
                } else {
                    Ok(response(200))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap().status, 200);
        assert_eq!(sleeper.delays.lock().len(), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_returns_immediately() {
        let executor = RetryExecutor::new(Arc::new(RecordingSleeper::default()));
        let outcome = executor
            .execute(&policy(3), "test", &CancellationToken::new(), |_| async {
                Ok(response(404))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap().status, 404);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let executor = RetryExecutor::new(Arc::new(RecordingSleeper::default()));
        let outcome = executor
            .execute(&policy(3), "test", &CancellationToken::new(), |_| async {
                Err(Error::Authentication("bad token".into()))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(Error::Authentication(_))));
    }

    #[tokio::test]
    async fn exhausted_timeouts_surface_as_transport_error() {
        let executor = RetryExecutor::new(Arc::new(RecordingSleeper::default()));
        let outcome = executor
            .execute(&policy(1), "test", &CancellationToken::new(), |_| async {
                Err(Error::Timeout("deadline elapsed".into()))
            })
            .await;
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.result, Err(Error::Transport { status: None, .. })));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = executor
            .execute(&policy(3), "test", &cancel, |_| async { Ok(response(200)) })
            .await;
        assert_eq!(outcome.attempts, 0);
        assert!(matches!(outcome.result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let outcome = executor
            .execute(&policy(5), "test", &cancel, |_| async { Ok(response(503)) })
            .await;
        // attempt 1, wait 1s, attempt 2, cancelled during the 2s wait
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn retry_after_hint_stretches_delay() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = RetryExecutor::new(sleeper.clone());
        let outcome = executor
            .execute(&policy(1), "test", &CancellationToken::new(), |attempt| async move {
                if attempt == 1 {
                    Ok(TransportResponse {
                        retry_after: Some(Duration::from_secs(7)),
                        ..response(429)
                    })
                } else {
                    Ok(response(200))
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap().status, 200);
        assert_eq!(*sleeper.delays.lock(), vec![Duration::from_secs(7)]);
    }

    #[test]
    fn zero_retries_has_empty_schedule() {
        assert_eq!(RetryPolicy::none().schedule().count(), 0);
    }

    #[test]
    fn schedule_is_capped_by_max_backoff() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_secs(3),
            ..policy(4)
        };
        let delays: Vec<_> = policy.schedule().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(3)));
    }
}
