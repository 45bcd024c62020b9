//! Resilient call wrapper
//!
//! Retries a single outbound call with exponential backoff, jitter, a
//! per-attempt timeout and cooperative cancellation. The backoff math is a
//! pure function ([`backoff_delay`]) so it can be tested without I/O.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::errors::ResilienceError;
use crate::common::shutdown::Shutdown;
use crate::config::types::{RetryConfig, MAX_JITTER};

/// Jitter applied to server-provided retry hints never exceeds this fraction
const HINT_JITTER_CAP: f64 = 0.1;

/// Why a single attempt failed
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// The remote answered with a non-success status
    Status {
        status: u16,
        /// Server-provided delay before retrying
        retry_after: Option<Duration>,
        body: Option<String>,
    },
    /// Connection-level failure (DNS, refused, reset)
    Network(String),
    /// The attempt exceeded its timeout and was abandoned
    Timeout(Duration),
    /// Any other failure; not retried by default
    Other(String),
}

impl CallFailure {
    pub fn status(status: u16) -> Self {
        CallFailure::Status {
            status,
            retry_after: None,
            body: None,
        }
    }

    pub fn with_retry_after(self, delay: Duration) -> Self {
        match self {
            CallFailure::Status { status, body, .. } => CallFailure::Status {
                status,
                retry_after: Some(delay),
                body,
            },
            other => other,
        }
    }

    pub fn with_body(self, text: impl Into<String>) -> Self {
        match self {
            CallFailure::Status {
                status,
                retry_after,
                ..
            } => CallFailure::Status {
                status,
                retry_after,
                body: Some(text.into()),
            },
            other => other,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            CallFailure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallFailure::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            CallFailure::Status { body, .. } => body.as_deref(),
            _ => None,
        }
    }

    /// Default classification: listed statuses, network errors and timeouts
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            CallFailure::Status { status, .. } => retryable_statuses.contains(status),
            CallFailure::Network(_) | CallFailure::Timeout(_) => true,
            CallFailure::Other(_) => false,
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Status { status, body, .. } => match body {
                Some(body) if !body.is_empty() => write!(f, "status {}: {}", status, body),
                _ => write!(f, "status {}", status),
            },
            CallFailure::Network(msg) => write!(f, "network error: {}", msg),
            CallFailure::Timeout(after) => write!(f, "timed out after {:?}", after),
            CallFailure::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Source of uniform random samples in [0, 1)
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Thread-local RNG jitter
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Constant jitter sample, for deterministic tests
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Delay before the retry that follows failed attempt number `attempt`
/// (zero-based)
///
/// A server hint is honored with at most 10% jitter; otherwise the delay is
/// `min(base * 2^attempt, max) * (1 + sample * jitter)`. Both paths are capped
/// at the configured maximum before jitter for the exponential path and after
/// jitter for the hint path.
pub fn backoff_delay(
    attempt: u32,
    config: &RetryConfig,
    hint: Option<Duration>,
    sample: f64,
) -> Duration {
    let sample = sample.clamp(0.0, 1.0);
    let max_delay = config.max_delay();

    if let Some(hint) = hint {
        let jitter = config.jitter.clamp(0.0, HINT_JITTER_CAP);
        return scale(hint.min(max_delay), 1.0 + sample * jitter).min(max_delay);
    }

    let factor = 2f64.powi(attempt.min(31) as i32);
    let exponential = config
        .base_delay()
        .checked_mul(factor as u32)
        .unwrap_or(max_delay)
        .min(max_delay);
    let spread = sample * config.jitter.clamp(0.0, MAX_JITTER);
    if spread == 0.0 {
        return exponential;
    }
    scale(exponential, 1.0 + spread)
}

/// `delay * factor`, saturating instead of overflowing
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Custom retry classification
pub type RetryPredicate = Arc<dyn Fn(&CallFailure) -> bool + Send + Sync>;

/// Wraps outbound calls with a uniform retry policy
#[derive(Clone)]
pub struct ResilientCaller {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
    jitter: Arc<dyn JitterSource>,
    shutdown: Option<Shutdown>,
}

impl fmt::Debug for ResilientCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientCaller")
            .field("config", &self.config)
            .field("custom_predicate", &self.predicate.is_some())
            .field("cancellable", &self.shutdown.is_some())
            .finish()
    }
}

impl ResilientCaller {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
            jitter: Arc::new(ThreadRngJitter),
            shutdown: None,
        }
    }

    /// Replace the default retryable classification
    pub fn with_retry_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&CallFailure) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Abort in-flight attempts and backoff sleeps once shutdown is triggered
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn is_retryable(&self, failure: &CallFailure) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(failure),
            None => failure.is_retryable(&self.config.retryable_statuses),
        }
    }

    /// Run `attempt_fn` until it succeeds, fails non-retryably, or retries
    /// run out
    ///
    /// `attempt_fn` receives the one-based attempt number and must build a
    /// fresh future each time.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallFailure>>,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let failure = match self.run_attempt(attempt_fn(attempt)).await {
                Some(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Some(Err(failure)) => failure,
                None => {
                    return Err(ResilienceError::Cancelled {
                        operation: operation.to_string(),
                        attempts: attempt,
                    })
                }
            };

            let retryable = self.is_retryable(&failure);
            if !retryable || attempt >= max_attempts {
                warn!(
                    operation,
                    attempts = attempt,
                    retryable,
                    error = %failure,
                    "Call failed"
                );
                return Err(ResilienceError::CallFailed {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_status: failure.status_code(),
                    last_body: failure.body().map(str::to_string),
                    last_error: failure,
                    retryable,
                });
            }

            let delay = backoff_delay(
                attempt - 1,
                &self.config,
                failure.retry_after(),
                self.jitter.sample(),
            );
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Retrying after failure"
            );

            if !self.sleep(delay).await {
                return Err(ResilienceError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
        }
    }

    /// `None` means the attempt was cancelled by shutdown
    async fn run_attempt<T, Fut>(&self, fut: Fut) -> Option<Result<T, CallFailure>>
    where
        Fut: Future<Output = Result<T, CallFailure>>,
    {
        let timeout = self.config.attempt_timeout();
        let timed = async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(CallFailure::Timeout(timeout)),
            }
        };

        match &self.shutdown {
            Some(shutdown) => tokio::select! {
                result = timed => Some(result),
                _ = shutdown.wait() => None,
            },
            None => Some(timed.await),
        }
    }

    /// Returns false when shutdown interrupted the sleep
    async fn sleep(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(shutdown) => tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = shutdown.wait() => false,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
            attempt_timeout_ms: 200,
            ..RetryConfig::default()
        }
    }

    fn caller(max_retries: u32) -> ResilientCaller {
        ResilientCaller::new(fast_config(max_retries)).with_jitter_source(Arc::new(FixedJitter(0.0)))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.5,
            ..RetryConfig::default()
        };
        assert_eq!(backoff_delay(0, &config, None, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, &config, None, 0.0), Duration::from_millis(400));
        assert_eq!(backoff_delay(10, &config, None, 0.0), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_scales_delay() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.5,
            ..RetryConfig::default()
        };
        // Full jitter sample adds half again
        assert_eq!(backoff_delay(1, &config, None, 1.0), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_honors_hint_with_small_jitter() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: 0.5,
            ..RetryConfig::default()
        };
        let hint = Some(Duration::from_secs(2));
        assert_eq!(backoff_delay(5, &config, hint, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(5, &config, hint, 1.0), Duration::from_millis(2200));

        let capped = Some(Duration::from_secs(60));
        assert_eq!(backoff_delay(0, &config, capped, 0.0), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_never_overflows() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: 0.5,
            ..RetryConfig::default()
        };
        let huge = Some(Duration::from_secs(u64::MAX));
        assert_eq!(backoff_delay(0, &config, huge, 1.0), Duration::from_secs(10));
        assert_eq!(backoff_delay(0, &config, huge, 0.0), Duration::from_secs(10));

        let unbounded = RetryConfig {
            base_delay_ms: u64::MAX,
            max_delay_ms: u64::MAX,
            jitter: 1e9,
            ..RetryConfig::default()
        };
        assert!(backoff_delay(31, &unbounded, None, 1.0) >= unbounded.max_delay());
        assert_eq!(
            backoff_delay(0, &unbounded, Some(Duration::MAX), 1.0),
            Duration::from_millis(u64::MAX)
        );
    }

    #[test]
    fn test_default_classification() {
        let statuses = RetryConfig::default().retryable_statuses;
        assert!(CallFailure::status(429).is_retryable(&statuses));
        assert!(CallFailure::status(503).is_retryable(&statuses));
        assert!(!CallFailure::status(400).is_retryable(&statuses));
        assert!(CallFailure::Network("reset".into()).is_retryable(&statuses));
        assert!(CallFailure::Timeout(Duration::from_secs(1)).is_retryable(&statuses));
        assert!(!CallFailure::Other("bad input".into()).is_retryable(&statuses));
    }

    #[tokio::test]
    async fn test_succeeds_after_retryable_failures() {
        let attempts = AtomicU32::new(0);
        let result = caller(3)
            .call("flaky", |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 2 {
                        Err(CallFailure::status(503))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_raises_after_exhausting_retries() {
        let attempts = AtomicU32::new(0);
        let err = caller(2)
            .call("down", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallFailure::status(500).with_body("boom")) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match err {
            ResilienceError::CallFailed {
                attempts,
                retryable,
                last_status,
                last_body,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(retryable);
                assert_eq!(last_status, Some(500));
                assert_eq!(last_body.as_deref(), Some("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_fails_on_first_attempt() {
        let attempts = AtomicU32::new(0);
        let err = caller(5)
            .call("bad-request", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallFailure::status(400)) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_custom_predicate_overrides_classification() {
        let attempts = AtomicU32::new(0);
        let caller = caller(3).with_retry_predicate(|f| matches!(f, CallFailure::Other(_)));
        let _ = caller
            .call("custom", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallFailure::Other("try again".into())) }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let attempts = AtomicU32::new(0);
        let caller = ResilientCaller::new(RetryConfig {
            attempt_timeout_ms: 20,
            ..fast_config(1)
        });
        let err = caller
            .call("slow", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, CallFailure>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(matches!(
            err,
            ResilienceError::CallFailed {
                last_error: CallFailure::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_attempt() {
        let shutdown = Shutdown::new();
        let caller = ResilientCaller::new(RetryConfig {
            attempt_timeout_ms: 10_000,
            ..fast_config(3)
        })
        .with_shutdown(shutdown.clone());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let err = caller
            .call("hanging", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, CallFailure>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Cancelled { attempts: 1, .. }));
    }
}
