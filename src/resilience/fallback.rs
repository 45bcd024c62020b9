//! Ordered fallback across interchangeable resources

use parking_lot::RwLock;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::rate_limit::{RateLimitState, RateLimitTracker};
use super::retry::CallFailure;
use crate::common::clock::{system_clock, SharedClock};
use crate::common::errors::ResilienceError;
use crate::config::types::{FallbackConfig, RateLimitConfig};

/// A successful fallback result tagged with the resource that served it
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub resource: String,
    /// Resources that failed retryably before this one succeeded
    pub failed: Vec<(String, String)>,
    /// Resources skipped because they were cooling down
    pub skipped: Vec<String>,
}

/// Tries resources in preference order, skipping those in cooldown
///
/// A retryable failure puts the resource into a flat cooldown and moves on;
/// a non-retryable failure aborts the whole chain, since it would fail the
/// same way on every resource.
pub struct FallbackExecutor {
    operation: String,
    resources: Vec<String>,
    config: FallbackConfig,
    cooldowns: RateLimitTracker,
    last_success: RwLock<Option<String>>,
}

impl FallbackExecutor {
    pub fn new(operation: impl Into<String>, resources: Vec<String>, config: FallbackConfig) -> Self {
        Self::with_clock(operation, resources, config, system_clock())
    }

    pub fn with_clock(
        operation: impl Into<String>,
        resources: Vec<String>,
        config: FallbackConfig,
        clock: SharedClock,
    ) -> Self {
        let cooldowns = RateLimitTracker::with_clock(RateLimitConfig::flat(config.cooldown()), clock);
        Self {
            operation: operation.into(),
            resources,
            config,
            cooldowns,
            last_success: RwLock::new(None),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Resource that served the most recent successful call
    pub fn last_success(&self) -> Option<String> {
        self.last_success.read().clone()
    }

    pub fn is_available(&self, resource: &str) -> bool {
        self.cooldowns.is_allowed(resource)
    }

    pub fn cooldown_remaining(&self, resource: &str) -> Option<Duration> {
        self.cooldowns.remaining_cooldown(resource)
    }

    pub fn resource_state(&self, resource: &str) -> Option<RateLimitState> {
        self.cooldowns.snapshot(resource)
    }

    fn is_retryable(&self, failure: &CallFailure) -> bool {
        failure.is_retryable(&self.config.retryable_statuses)
    }

    /// Run `attempt` against each available resource until one succeeds
    pub async fn execute<T, F, Fut>(&self, mut attempt: F) -> Result<FallbackOutcome<T>, ResilienceError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, CallFailure>>,
    {
        let mut skipped = Vec::new();
        let mut failed = Vec::new();

        for resource in &self.resources {
            if !self.cooldowns.is_allowed(resource) {
                debug!(operation = %self.operation, resource = %resource, "Skipping resource in cooldown");
                skipped.push(resource.clone());
                continue;
            }

            match attempt(resource.clone()).await {
                Ok(value) => {
                    self.cooldowns.record_success(resource);
                    *self.last_success.write() = Some(resource.clone());
                    if !failed.is_empty() || !skipped.is_empty() {
                        info!(
                            operation = %self.operation,
                            resource = %resource,
                            failed = failed.len(),
                            skipped = skipped.len(),
                            "Served by fallback resource"
                        );
                    }
                    return Ok(FallbackOutcome {
                        value,
                        resource: resource.clone(),
                        failed,
                        skipped,
                    });
                }
                Err(failure) if self.is_retryable(&failure) => {
                    let cooldown = self.cooldowns.record_failure(resource, None);
                    warn!(
                        operation = %self.operation,
                        resource = %resource,
                        cooldown_ms = cooldown.as_millis() as u64,
                        error = %failure,
                        "Resource failed, trying next"
                    );
                    failed.push((resource.clone(), failure.to_string()));
                }
                Err(failure) => {
                    warn!(
                        operation = %self.operation,
                        resource = %resource,
                        error = %failure,
                        "Non-retryable failure, aborting fallback chain"
                    );
                    return Err(ResilienceError::NonRetryable {
                        operation: self.operation.clone(),
                        resource: resource.clone(),
                        error: failure,
                    });
                }
            }
        }

        Err(ResilienceError::NoResourceAvailable {
            operation: self.operation.clone(),
            skipped,
            failed,
        })
    }
}

impl std::fmt::Debug for FallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackExecutor")
            .field("operation", &self.operation)
            .field("resources", &self.resources)
            .field("last_success", &*self.last_success.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn executor(clock: Arc<ManualClock>) -> FallbackExecutor {
        FallbackExecutor::with_clock(
            "decide",
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            FallbackConfig {
                cooldown_ms: 60_000,
                ..FallbackConfig::default()
            },
            clock,
        )
    }

    #[tokio::test]
    async fn test_falls_through_to_next_resource() {
        let exec = executor(ManualClock::starting_now());
        let calls = Mutex::new(Vec::new());

        let outcome = exec
            .execute(|resource| {
                calls.lock().push(resource.clone());
                async move {
                    match resource.as_str() {
                        "A" => Err(CallFailure::status(503)),
                        _ => Ok(format!("served by {resource}")),
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.resource, "B");
        assert_eq!(outcome.value, "served by B");
        assert_eq!(*calls.lock(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(exec.last_success().as_deref(), Some("B"));
        assert!(!exec.is_available("A"));
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_chain() {
        let exec = executor(ManualClock::starting_now());
        let calls = Mutex::new(Vec::new());

        let err = exec
            .execute(|resource| {
                calls.lock().push(resource);
                async { Err::<(), _>(CallFailure::status(400)) }
            })
            .await
            .unwrap_err();

        assert_eq!(*calls.lock(), vec!["A".to_string()]);
        assert!(matches!(err, ResilienceError::NonRetryable { ref resource, .. } if resource == "A"));
        assert!(!err.is_retryable());
        // A bad request is not the resource's fault
        assert!(exec.is_available("A"));
    }

    #[tokio::test]
    async fn test_cooling_resources_are_skipped_until_expiry() {
        let clock = ManualClock::starting_now();
        let exec = executor(clock.clone());

        let _ = exec
            .execute(|_| async { Err::<(), _>(CallFailure::Network("down".into())) })
            .await;

        let calls = Mutex::new(0u32);
        let err = exec
            .execute(|_| {
                *calls.lock() += 1;
                async { Ok::<_, CallFailure>(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(*calls.lock(), 0);
        match err {
            ResilienceError::NoResourceAvailable { skipped, failed, .. } => {
                assert_eq!(skipped.len(), 3);
                assert!(failed.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }

        clock.advance(Duration::from_secs(60));
        let outcome = exec.execute(|_| async { Ok::<_, CallFailure>(7) }).await.unwrap();
        assert_eq!(outcome.resource, "A");
        assert!(exec.resource_state("A").unwrap().cooldown_until.is_none());
    }
}
