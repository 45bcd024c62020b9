//! Per-resource cooldown tracking
//!
//! Each resource moves through `Healthy -> Cooldown -> Recovering -> Healthy`.
//! A failure starts (or extends) a cooldown; once the cooldown expires the
//! resource is `Recovering` until enough consecutive successes clear the
//! failure history. A failure while recovering goes straight back to
//! cooldown with a longer delay.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::common::clock::{system_clock, to_chrono, SharedClock};
use crate::config::types::RateLimitConfig;

/// Health of a tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceHealth {
    Healthy,
    Cooldown,
    Recovering,
}

/// Bookkeeping for one resource
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitState {
    /// When the current cooldown ends
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Successes since the last failure; reset on failure
    pub consecutive_successes: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_failures: u64,
    pub total_successes: u64,
}

impl RateLimitState {
    fn health_at(&self, now: DateTime<Utc>) -> ResourceHealth {
        match self.cooldown_until {
            Some(until) if until > now => ResourceHealth::Cooldown,
            _ if self.consecutive_failures > 0 => ResourceHealth::Recovering,
            _ => ResourceHealth::Healthy,
        }
    }
}

/// Cooldown after `consecutive_failures` failures with no server hint:
/// `min(initial * multiplier^(failures - 1), max)`
pub fn cooldown_for(consecutive_failures: u32, config: &RateLimitConfig) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(63) as i32;
    let max = config.max_cooldown();
    let factor = config.multiplier.max(1.0).powi(exponent);
    let secs = config.initial_cooldown().as_secs_f64() * factor;
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    if factor == 1.0 {
        return config.initial_cooldown().min(max);
    }
    Duration::from_secs_f64(secs)
}

/// Cooldown state machine keyed by resource name
pub struct RateLimitTracker {
    config: RateLimitConfig,
    states: RwLock<HashMap<String, RateLimitState>>,
    clock: SharedClock,
}

impl RateLimitTracker {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// True when no cooldown is set or it has already expired
    pub fn is_allowed(&self, resource: &str) -> bool {
        let now = self.clock.now();
        self.states
            .read()
            .get(resource)
            .and_then(|s| s.cooldown_until)
            .map_or(true, |until| until <= now)
    }

    pub fn health(&self, resource: &str) -> ResourceHealth {
        let now = self.clock.now();
        self.states
            .read()
            .get(resource)
            .map_or(ResourceHealth::Healthy, |s| s.health_at(now))
    }

    /// Time left in the current cooldown, if any
    pub fn remaining_cooldown(&self, resource: &str) -> Option<Duration> {
        let now = self.clock.now();
        let until = self.states.read().get(resource)?.cooldown_until?;
        (until - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Record a failure and return the cooldown applied
    ///
    /// A server-provided `hint` is used as-is; otherwise the cooldown grows
    /// exponentially with consecutive failures.
    pub fn record_failure(&self, resource: &str, hint: Option<Duration>) -> Duration {
        let now = self.clock.now();
        let mut states = self.states.write();
        let state = states.entry(resource.to_string()).or_default();

        let was = state.health_at(now);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.consecutive_successes = 0;
        state.total_failures += 1;
        state.last_failure_at = Some(now);

        let cooldown = hint.unwrap_or_else(|| cooldown_for(state.consecutive_failures, &self.config));
        state.cooldown_until = Some(now + to_chrono(cooldown));

        if was == ResourceHealth::Recovering {
            warn!(
                resource,
                consecutive_failures = state.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "Resource failed while recovering, back in cooldown"
            );
        } else {
            debug!(
                resource,
                consecutive_failures = state.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                hinted = hint.is_some(),
                "Resource entered cooldown"
            );
        }

        cooldown
    }

    /// Record a success; failure state clears only after
    /// `success_threshold` consecutive successes
    pub fn record_success(&self, resource: &str) {
        let now = self.clock.now();
        let mut states = self.states.write();
        let state = states.entry(resource.to_string()).or_default();

        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.total_successes += 1;
        state.last_success_at = Some(now);

        if state.consecutive_successes >= self.config.success_threshold.max(1) {
            if state.consecutive_failures > 0 || state.cooldown_until.is_some() {
                info!(
                    resource,
                    after_failures = state.consecutive_failures,
                    "Resource recovered"
                );
            }
            state.cooldown_until = None;
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
        }
    }

    /// Copy of the current state for one resource
    pub fn snapshot(&self, resource: &str) -> Option<RateLimitState> {
        self.states.read().get(resource).cloned()
    }

    /// Forget everything about a resource
    pub fn reset(&self, resource: &str) {
        self.states.write().remove(resource);
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("config", &self.config)
            .field("resources", &self.states.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use std::sync::Arc;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            initial_cooldown_ms: 1_000,
            max_cooldown_ms: 10_000,
            multiplier: 2.0,
            success_threshold: 3,
        }
    }

    fn tracker() -> (RateLimitTracker, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        (RateLimitTracker::with_clock(config(), clock.clone()), clock)
    }

    #[test]
    fn test_cooldown_formula() {
        let config = config();
        assert_eq!(cooldown_for(1, &config), Duration::from_secs(1));
        assert_eq!(cooldown_for(2, &config), Duration::from_secs(2));
        assert_eq!(cooldown_for(3, &config), Duration::from_secs(4));
        assert_eq!(cooldown_for(4, &config), Duration::from_secs(8));
        assert_eq!(cooldown_for(5, &config), Duration::from_secs(10));
        assert_eq!(cooldown_for(500, &config), Duration::from_secs(10));
    }

    #[test]
    fn test_allowed_strictly_after_cooldown_elapses() {
        let (tracker, clock) = tracker();
        tracker.record_failure("api", None);
        let applied = tracker.record_failure("api", None);
        assert_eq!(applied, Duration::from_secs(2));

        assert!(!tracker.is_allowed("api"));
        clock.advance(Duration::from_millis(1_999));
        assert!(!tracker.is_allowed("api"));
        assert_eq!(tracker.health("api"), ResourceHealth::Cooldown);

        clock.advance(Duration::from_millis(1));
        assert!(tracker.is_allowed("api"));
        assert_eq!(tracker.health("api"), ResourceHealth::Recovering);
    }

    #[test]
    fn test_hint_overrides_exponential() {
        let (tracker, _clock) = tracker();
        let applied = tracker.record_failure("api", Some(Duration::from_secs(42)));
        assert_eq!(applied, Duration::from_secs(42));
        assert!(tracker.remaining_cooldown("api").unwrap() > Duration::from_secs(41));
    }

    #[test]
    fn test_single_success_does_not_clear_failures() {
        let (tracker, clock) = tracker();
        tracker.record_failure("api", None);
        tracker.record_failure("api", None);
        clock.advance(Duration::from_secs(5));

        tracker.record_success("api");
        let state = tracker.snapshot("api").unwrap();
        assert_eq!(state.consecutive_failures, 2);
        assert!(state.cooldown_until.is_some());
        assert_eq!(tracker.health("api"), ResourceHealth::Recovering);

        tracker.record_success("api");
        tracker.record_success("api");
        let state = tracker.snapshot("api").unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.cooldown_until.is_none());
        assert_eq!(tracker.health("api"), ResourceHealth::Healthy);
    }

    #[test]
    fn test_failure_while_recovering_resets_success_count() {
        let (tracker, clock) = tracker();
        tracker.record_failure("api", None);
        clock.advance(Duration::from_secs(2));
        tracker.record_success("api");
        tracker.record_success("api");

        let applied = tracker.record_failure("api", None);
        assert_eq!(applied, Duration::from_secs(2));
        let state = tracker.snapshot("api").unwrap();
        assert_eq!(state.consecutive_successes, 0);
        assert_eq!(tracker.health("api"), ResourceHealth::Cooldown);
    }

    #[test]
    fn test_unknown_resource_is_healthy() {
        let (tracker, _clock) = tracker();
        assert!(tracker.is_allowed("never-seen"));
        assert_eq!(tracker.health("never-seen"), ResourceHealth::Healthy);
        assert!(tracker.remaining_cooldown("never-seen").is_none());
    }
}
