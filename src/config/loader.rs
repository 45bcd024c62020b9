//! Configuration loader

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use super::types::{AppConfig, BackendConfig, MAX_JITTER};
use crate::common::errors::{OrchestratorError, Result};
use crate::common::types::ExecutionMode;

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. Plain operator variables (`CYCLE_INTERVAL_SECS`, `ACTIVE_DOMAINS`, ...)
/// 2. Environment variables prefixed with `APP__` (`APP__SCHEDULER__PARALLEL`)
/// 3. Configuration file (TOML format)
/// 4. Default values
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("APP")
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("scheduler.domains")
            .with_list_parse_key("backend.models")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;

    let mut app: AppConfig = config
        .try_deserialize()
        .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;

    apply_overrides(&mut app, |name| std::env::var(name).ok())?;
    validate(&app)?;
    Ok(app)
}

/// Load configuration from environment variables only
pub fn load_from_env() -> Result<AppConfig> {
    // Try to load from .env file
    dotenvy::dotenv().ok();

    let mut app = AppConfig::default();
    apply_overrides(&mut app, |name| std::env::var(name).ok())?;
    validate(&app)?;
    Ok(app)
}

/// Apply the plain operator variables, reading each through `lookup`
pub fn apply_overrides<F>(app: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(secs) = parse_var::<u64>("CYCLE_INTERVAL_SECS", get("CYCLE_INTERVAL_SECS"))? {
        app.scheduler.cycle_interval_secs = secs;
    }
    if let Some(domains) = get("ACTIVE_DOMAINS") {
        app.scheduler.domains = split_list(&domains);
    }
    if let Some(mode) = get("EXECUTION_MODE") {
        app.scheduler.execution_mode = parse_mode(&mode)?;
    }
    if let Some(confidence) = parse_var::<f64>("MIN_CONFIDENCE", get("MIN_CONFIDENCE"))? {
        app.scheduler.min_confidence = confidence;
    }

    if let Some(max) = parse_var::<usize>("MAX_POSITIONS_PER_DOMAIN", get("MAX_POSITIONS_PER_DOMAIN"))? {
        app.policy.max_positions_per_domain = Some(max);
    }
    if let Some(threshold) = parse_var::<Decimal>("APPROVAL_THRESHOLD", get("APPROVAL_THRESHOLD"))? {
        app.policy.approval_threshold = Some(threshold);
    }
    if let Some(ceiling) = parse_var::<Decimal>("MAX_ACTION_AMOUNT", get("MAX_ACTION_AMOUNT"))? {
        app.policy.max_action_amount = Some(ceiling);
    }
    if let Some(pct) = parse_var::<Decimal>("MAX_DRAWDOWN_PCT", get("MAX_DRAWDOWN_PCT"))? {
        app.policy.max_drawdown_pct = Some(pct);
    }
    if let Some(limits) = get("DOMAIN_DRAWDOWN_PCT") {
        app.policy.domain_drawdown_pct = parse_domain_limits(&limits)?;
    }

    if let Some(url) = get("DECISION_BACKEND_URL") {
        let models = get("DECISION_BACKEND_MODELS")
            .map(|m| split_list(&m))
            .unwrap_or_default();
        match app.backend.as_mut() {
            Some(backend) => {
                backend.url = url;
                if !models.is_empty() {
                    backend.models = models;
                }
            }
            None => app.backend = Some(BackendConfig::new(url, models)),
        }
    } else if let (Some(models), Some(backend)) = (get("DECISION_BACKEND_MODELS"), app.backend.as_mut()) {
        backend.models = split_list(&models);
    }

    Ok(())
}

/// Reject settings the components cannot work with
pub fn validate(app: &AppConfig) -> Result<()> {
    let invalid = |msg: String| Err(OrchestratorError::Configuration(msg));

    if !(0.0..=1.0).contains(&app.scheduler.min_confidence) {
        return invalid(format!(
            "min_confidence must be within [0, 1], got {}",
            app.scheduler.min_confidence
        ));
    }
    let mut seen = HashSet::new();
    for domain in &app.scheduler.domains {
        if domain.is_empty() || !seen.insert(domain.as_str()) {
            return invalid(format!("invalid or duplicate domain '{}'", domain));
        }
    }
    if !(0.0..=MAX_JITTER).contains(&app.retry.jitter) {
        return invalid(format!(
            "retry jitter must be between 0 and {}, got {}",
            MAX_JITTER, app.retry.jitter
        ));
    }
    if app.retry.base_delay_ms > app.retry.max_delay_ms {
        return invalid("retry base delay exceeds max delay".to_string());
    }
    if !app.rate_limit.multiplier.is_finite() || app.rate_limit.multiplier < 1.0 {
        return invalid(format!(
            "rate limit multiplier must be >= 1, got {}",
            app.rate_limit.multiplier
        ));
    }
    if let Some(fraction) = app.policy.max_balance_fraction {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return invalid(format!("max_balance_fraction must be within (0, 1], got {}", fraction));
        }
    }
    if let Some(backend) = &app.backend {
        if backend.models.is_empty() {
            return invalid("decision backend needs at least one model".to_string());
        }
    }
    Ok(())
}

fn parse_var<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                OrchestratorError::Configuration(format!("{}={}: {}", name, raw, e))
            })
        })
        .transpose()
}

fn parse_mode(raw: &str) -> Result<ExecutionMode> {
    match raw.to_lowercase().as_str() {
        "paper" => Ok(ExecutionMode::Paper),
        "live" | "real" => Ok(ExecutionMode::Live),
        other => Err(OrchestratorError::Configuration(format!(
            "EXECUTION_MODE must be paper or live, got {}",
            other
        ))),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `domain:pct,domain:pct`
pub fn parse_domain_limits(raw: &str) -> Result<HashMap<String, Decimal>> {
    split_list(raw)
        .into_iter()
        .map(|pair| {
            let (domain, pct) = pair.split_once(':').ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "DOMAIN_DRAWDOWN_PCT entry '{}' is not domain:pct",
                    pair
                ))
            })?;
            let pct = Decimal::from_str(pct.trim()).map_err(|e| {
                OrchestratorError::Configuration(format!("DOMAIN_DRAWDOWN_PCT {}: {}", pair, e))
            })?;
            Ok((domain.trim().to_string(), pct))
        })
        .collect()
}
