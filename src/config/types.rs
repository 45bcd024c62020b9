//! Configuration types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::common::types::ExecutionMode;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cycle scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Resilient call wrapper settings
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-resource cooldown settings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Fallback chain settings
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// Idempotency guard settings
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// Hook registry settings
    #[serde(default)]
    pub hooks: HookRegistryConfig,
    /// Policy values read by the built-in hooks
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Remote decision backend (optional)
    #[serde(default)]
    pub backend: Option<BackendConfig>,
    /// General application settings
    #[serde(default)]
    pub settings: AppSettings,
}

/// Cycle scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between the end of one cycle and the start of the next
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Active domains
    #[serde(default)]
    pub domains: Vec<String>,
    /// Paper or live execution
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Consecutive no-op decisions before a domain is flagged for attention
    #[serde(default = "default_max_consecutive_noops")]
    pub max_consecutive_noops: u32,
    /// Decisions below this confidence are skipped
    #[serde(default)]
    pub min_confidence: f64,
    /// Process domains concurrently (default) or one after another
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Upper bound on one worker invocation in seconds
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
    /// Upper bound on one maintenance task in seconds
    #[serde(default = "default_maintenance_timeout")]
    pub maintenance_timeout_secs: u64,
    /// Number of recent decisions included in each domain context
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            domains: Vec::new(),
            execution_mode: ExecutionMode::Paper,
            max_consecutive_noops: default_max_consecutive_noops(),
            min_confidence: 0.0,
            parallel: true,
            worker_timeout_secs: default_worker_timeout(),
            maintenance_timeout_secs: default_maintenance_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

impl SchedulerConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn maintenance_timeout(&self) -> Duration {
        Duration::from_secs(self.maintenance_timeout_secs)
    }
}

fn default_cycle_interval() -> u64 {
    300
}

fn default_max_consecutive_noops() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_worker_timeout() -> u64 {
    120
}

fn default_maintenance_timeout() -> u64 {
    30
}

fn default_history_limit() -> usize {
    20
}

/// Largest accepted retry jitter fraction
pub const MAX_JITTER: f64 = 10.0;

/// Retry policy for one outbound call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the computed delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Timeout for each individual attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
    /// HTTP statuses worth retrying
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
            attempt_timeout_ms: default_attempt_timeout(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_attempt_timeout() -> u64 {
    30_000
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![408, 425, 429, 500, 502, 503, 504]
}

/// Cooldown policy for the rate limit tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_initial_cooldown")]
    pub initial_cooldown_ms: u64,
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_ms: u64,
    /// Growth factor per consecutive failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Consecutive successes needed to fully clear failure state
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_cooldown_ms: default_initial_cooldown(),
            max_cooldown_ms: default_max_cooldown(),
            multiplier: default_multiplier(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl RateLimitConfig {
    /// Flat cooldown that clears on the first success
    pub fn flat(cooldown: Duration) -> Self {
        let ms = cooldown.as_millis() as u64;
        Self {
            initial_cooldown_ms: ms,
            max_cooldown_ms: ms,
            multiplier: 1.0,
            success_threshold: 1,
        }
    }

    pub fn initial_cooldown(&self) -> Duration {
        Duration::from_millis(self.initial_cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

fn default_initial_cooldown() -> u64 {
    5_000
}

fn default_max_cooldown() -> u64 {
    300_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_success_threshold() -> u32 {
    3
}

/// Fallback chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Cooldown applied to a resource after a retryable failure
    #[serde(default = "default_fallback_cooldown")]
    pub cooldown_ms: u64,
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_fallback_cooldown(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl FallbackConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

fn default_fallback_cooldown() -> u64 {
    60_000
}

/// Idempotency guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a fingerprint blocks duplicates
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Optional time bucket folded into the fingerprint
    #[serde(default)]
    pub bucket_secs: Option<u64>,
    /// Minimum seconds between background sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// JSON file used to persist records across restarts
    #[serde(default)]
    pub store_path: Option<String>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            bucket_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            store_path: None,
        }
    }
}

impl IdempotencyConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn bucket(&self) -> Option<Duration> {
        self.bucket_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_retention() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60 * 60
}

/// Hook registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRegistryConfig {
    /// Capacity of the execution log ring buffer
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for HookRegistryConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
        }
    }
}

fn default_log_capacity() -> usize {
    500
}

/// Policy limits enforced by the built-in hooks
///
/// The scheduler never reads these directly; each value switches on the
/// matching hook when set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Hard ceiling on any single action amount
    #[serde(default)]
    pub max_action_amount: Option<Decimal>,
    /// Amounts above this need `approved=true` in the decision metadata
    #[serde(default)]
    pub approval_threshold: Option<Decimal>,
    /// Maximum open positions per domain before new opens are blocked
    #[serde(default)]
    pub max_positions_per_domain: Option<usize>,
    /// Largest fraction of the domain balance one action may use
    #[serde(default)]
    pub max_balance_fraction: Option<Decimal>,
    /// Global drawdown limit in percent across all domains
    #[serde(default)]
    pub max_drawdown_pct: Option<Decimal>,
    /// Per-domain drawdown limits in percent
    #[serde(default)]
    pub domain_drawdown_pct: HashMap<String, Decimal>,
}

/// Remote decision backend reached by the HTTP worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the decision service
    pub url: String,
    /// Interchangeable model identifiers, in preference order
    #[serde(default)]
    pub models: Vec<String>,
    /// Path of the decision endpoint
    #[serde(default = "default_decide_path")]
    pub decide_path: String,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            url: url.into(),
            models,
            decide_path: default_decide_path(),
        }
    }
}

fn default_decide_path() -> String {
    "/v1/decide".to_string()
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
