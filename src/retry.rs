//! Retry logic with exponential backoff
//!
//! Fetch tasks and non-publish depositor requests go through [`with_retry`]. The
//! caller gets back either the value or an [`Exhausted`] carrying the final error and
//! how many attempts were made, which is what failure records in the run summary need.
//!
//! # Example
//!
//! ```no_run
//! use dataset_archiver::retry::{IsRetryable, with_retry};
//! use dataset_archiver::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let value = with_retry(&config, || async { Ok::<_, MyError>(7) })
//!     .await
//!     .map_err(|exhausted| exhausted.error)?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DepositorError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, 5xx, throttling, truncated payloads) return `true`.
/// Permanent failures (bad credentials, 404, invalid config) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// Whether an HTTP status is worth retrying
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_body()
                    || e.status().is_some_and(|s| is_retryable_status(s.as_u16()))
            }
            Error::Http { status, .. } => is_retryable_status(*status),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Truncated downloads and error pages served with 200 usually go away on retry
            Error::InvalidArchive { .. } | Error::UnexpectedHtml { .. } => true,
            Error::Depositor(DepositorError::Api { status, .. }) => is_retryable_status(*status),
            Error::Depositor(_) => false,
            // Publication is never retried automatically
            Error::Publish(_) => false,
            Error::Fetch(_) | Error::Resume(_) => false,
            Error::Config { .. } | Error::Serialization(_) => false,
            Error::InsufficientSpace { .. } => false,
            Error::Cancelled => false,
            Error::Other(_) => false,
        }
    }
}

/// Final error of an operation whose retry budget ran out (or that failed permanently)
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error returned by the last attempt
    pub error: E,
    /// Number of attempts made, including the first
    pub attempts: u32,
}

impl<E: std::fmt::Display> std::fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.error, self.attempts)
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// The operation is attempted once, then retried up to `config.max_attempts` more
/// times while it fails with a retryable error. Delays start at
/// `config.initial_delay`, grow by `config.backoff_multiplier` and are capped at
/// `config.max_delay`.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> std::result::Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };
                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "operation failed with non-retryable error");
                }
                return Err(Exhausted {
                    error: e,
                    attempts: attempt + 1,
                });
            }
        }
    }
}

/// Add random jitter to a delay
///
/// The result is uniformly distributed between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PublishError, ResumeError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn success_does_not_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast(3), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast(3), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_reports_attempt_count() {
        let result = with_retry(&fast(2), || async { Err::<i32, _>(TestError::Transient) }).await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3, "initial attempt + 2 retries");
        assert!(exhausted.to_string().contains("3 attempt"));
    }

    #[tokio::test]
    async fn permanent_error_stops_after_one_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast(5), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Permanent)
            }
        })
        .await;

        let exhausted = result.unwrap_err();
        assert!(matches!(exhausted.error, TestError::Permanent));
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_max_attempts_fails_on_first_transient_error() {
        let result = with_retry(&fast(0), || async { Err::<i32, _>(TestError::Transient) }).await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[tokio::test]
    async fn backoff_grows_and_is_capped() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(60),
            backoff_multiplier: 10.0,
            jitter: false,
        };
        let timestamps = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let ts = timestamps.clone();

        let _ = with_retry(&config, || {
            let ts = ts.clone();
            async move {
                ts.lock().await.push(std::time::Instant::now());
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        let ts = timestamps.lock().await;
        assert_eq!(ts.len(), 4);
        let first = ts[1].duration_since(ts[0]);
        let last = ts[3].duration_since(ts[2]);
        assert!(first >= Duration::from_millis(35), "first gap {first:?}");
        assert!(last >= Duration::from_millis(55), "capped gap {last:?}");
        // Generous upper bound for slow CI machines
        assert!(last < Duration::from_millis(400), "capped gap {last:?}");
    }

    #[test]
    fn add_jitter_stays_within_bounds() {
        let delay = Duration::from_millis(50);
        for _ in 0..200 {
            let jittered = add_jitter(delay);
            assert!(jittered >= delay && jittered <= delay * 2);
        }
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn http_status_classification() {
        for status in [408, 429, 500, 502, 503, 504] {
            let err = Error::Http {
                status,
                url: "https://example.com".into(),
            };
            assert!(err.is_retryable(), "{status} should be retried");
        }
        for status in [400, 401, 403, 404, 410] {
            let err = Error::Http {
                status,
                url: "https://example.com".into(),
            };
            assert!(!err.is_retryable(), "{status} should not be retried");
        }
    }

    #[test]
    fn transient_io_kinds_are_retryable() {
        let reset = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(reset.is_retryable());
        let denied = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!denied.is_retryable());
    }

    #[test]
    fn payload_integrity_failures_are_retryable() {
        assert!(
            Error::InvalidArchive {
                path: "a.zip".into(),
                reason: "truncated".into()
            }
            .is_retryable()
        );
        assert!(
            Error::UnexpectedHtml {
                url: "https://example.com".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn publish_and_resume_errors_are_never_retried() {
        assert!(
            !Error::Publish(PublishError::Rejected {
                draft: "1".into(),
                message: "server error".into()
            })
            .is_retryable()
        );
        assert!(
            !Error::Resume(ResumeError::DraftMismatch {
                expected: "1".into(),
                found: "2".into()
            })
            .is_retryable()
        );
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn depositor_api_errors_follow_status() {
        let busy = Error::Depositor(DepositorError::Api {
            status: 503,
            message: "busy".into(),
        });
        let forbidden = Error::Depositor(DepositorError::Api {
            status: 403,
            message: "bad token".into(),
        });
        assert!(busy.is_retryable());
        assert!(!forbidden.is_retryable());
    }
}
