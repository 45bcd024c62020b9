//! Resilience layer for unreliable external services
//!
//! - [`retry`]: retries one outbound call with backoff, jitter and timeouts
//! - [`rate_limit`]: per-resource cooldown state machine
//! - [`fallback`]: ordered fallback across substitute resources
//! - [`http`]: classification of HTTP responses into retryable failures

pub mod fallback;
pub mod http;
pub mod rate_limit;
pub mod retry;

pub use fallback::{FallbackExecutor, FallbackOutcome};
pub use rate_limit::{cooldown_for, RateLimitState, RateLimitTracker, ResourceHealth};
pub use retry::{
    backoff_delay, CallFailure, FixedJitter, JitterSource, ResilientCaller, RetryPredicate,
    ThreadRngJitter,
};
