//! Data model shared by the scheduler, hooks and collaborators

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Free-form metadata attached to decisions and hook results
pub type Metadata = BTreeMap<String, Value>;

/// Kind of action a decision proposes
///
/// The set is open: workers may emit any action name, and unknown names are
/// carried through as [`ActionKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    Open,
    Close,
    Adjust,
    NoOp,
    Other(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Open => "open",
            ActionKind::Close => "close",
            ActionKind::Adjust => "adjust",
            ActionKind::NoOp => "no-op",
            ActionKind::Other(name) => name,
        }
    }
}

impl From<String> for ActionKind {
    fn from(value: String) -> Self {
        let lowered = value.trim().to_lowercase();
        match lowered.as_str() {
            "open" | "buy" => ActionKind::Open,
            "close" | "sell" => ActionKind::Close,
            "adjust" => ActionKind::Adjust,
            "no-op" | "noop" | "hold" | "none" => ActionKind::NoOp,
            _ => ActionKind::Other(lowered),
        }
    }
}

impl From<&str> for ActionKind {
    fn from(value: &str) -> Self {
        ActionKind::from(value.to_string())
    }
}

impl From<ActionKind> for String {
    fn from(value: ActionKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed action from one domain worker for one cycle
///
/// Decisions are read-only once handed to the pipeline, except for the
/// `amount` field which pre-decision hooks may adjust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Domain that produced this decision
    pub domain: String,
    /// What to do
    pub action: ActionKind,
    /// Market, instrument or position the action applies to
    #[serde(default)]
    pub target: Option<String>,
    /// Monetary amount of the action
    #[serde(default)]
    pub amount: Option<Decimal>,
    /// Human-readable explanation
    #[serde(default)]
    pub rationale: String,
    /// Confidence in [0, 1]
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Metadata,
    /// Percentage for partial actions (e.g. close 50%)
    #[serde(default)]
    pub percentage: Option<Decimal>,
}

impl Decision {
    pub fn new(domain: impl Into<String>, action: ActionKind, rationale: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            action,
            target: None,
            amount: None,
            rationale: rationale.into(),
            confidence: 0.0,
            metadata: Metadata::new(),
            percentage: None,
        }
    }

    /// A decision to do nothing this cycle
    pub fn no_op(domain: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self::new(domain, ActionKind::NoOp, rationale)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Set confidence, clamped to [0, 1]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_percentage(mut self, percentage: Decimal) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_no_op(&self) -> bool {
        self.action == ActionKind::NoOp
    }
}

/// Whether execution has real effects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Paper,
    Live,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Paper => write!(f, "paper"),
            ExecutionMode::Live => write!(f, "live"),
        }
    }
}

/// An open position held in a domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub domain: String,
    pub target: String,
    /// Monetary size of the position
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn new(domain: impl Into<String>, target: impl Into<String>, size: Decimal) -> Self {
        Self {
            domain: domain.into(),
            target: target.into(),
            size,
            entry_price: None,
            opened_at: Utc::now(),
        }
    }
}

/// Result reported by the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Venue-specific details (order ids, fills, simulated prices)
    #[serde(default)]
    pub details: Value,
}

impl ExecutionReport {
    pub fn success(details: Value) -> Self {
        Self {
            success: true,
            error: None,
            details,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            details: Value::Null,
        }
    }
}

/// Per-domain outcome tag logged every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
    Skipped,
    Blocked,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Skipped => write!(f, "skipped"),
            Outcome::Blocked => write!(f, "blocked"),
        }
    }
}

/// A decision as persisted after a successful execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: Decision,
    pub outcome: Outcome,
    pub fingerprint: Option<String>,
    pub report: Option<ExecutionReport>,
    pub cycle: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Read-only snapshot handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainContext {
    pub domain: String,
    pub cycle: u64,
    pub balance: Decimal,
    pub peak_balance: Decimal,
    pub open_positions: Vec<Position>,
    pub recent_decisions: Vec<DecisionRecord>,
    pub consecutive_no_ops: u32,
    pub built_at: DateTime<Utc>,
}

impl DomainContext {
    /// Drawdown from the peak balance as a percentage (0 when no peak)
    pub fn drawdown_percent(&self) -> Decimal {
        drawdown_percent(self.balance, self.peak_balance)
    }

    pub fn has_position(&self, target: &str) -> bool {
        self.open_positions.iter().any(|p| p.target == target)
    }
}

/// Percentage drop of `balance` below `peak`
pub fn drawdown_percent(balance: Decimal, peak: Decimal) -> Decimal {
    if peak <= Decimal::ZERO || balance >= peak {
        return Decimal::ZERO;
    }
    (peak - balance) / peak * Decimal::ONE_HUNDRED
}

/// Outcome of one domain within one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub domain: String,
    pub decision: Option<Decision>,
    pub executed: bool,
    pub outcome: Outcome,
    /// Block reason, skip reason or error text
    pub reason: Option<String>,
    pub fingerprint: Option<String>,
}

impl CycleResult {
    pub fn success(decision: Decision, fingerprint: String) -> Self {
        Self {
            domain: decision.domain.clone(),
            decision: Some(decision),
            executed: true,
            outcome: Outcome::Success,
            reason: None,
            fingerprint: Some(fingerprint),
        }
    }

    pub fn failed(decision: Decision, fingerprint: Option<String>, error: impl Into<String>) -> Self {
        Self {
            domain: decision.domain.clone(),
            decision: Some(decision),
            executed: false,
            outcome: Outcome::Failed,
            reason: Some(error.into()),
            fingerprint,
        }
    }

    pub fn blocked(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            domain: decision.domain.clone(),
            decision: Some(decision),
            executed: false,
            outcome: Outcome::Blocked,
            reason: Some(reason.into()),
            fingerprint: None,
        }
    }

    pub fn skipped(
        domain: impl Into<String>,
        decision: Option<Decision>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            decision,
            executed: false,
            outcome: Outcome::Skipped,
            reason: Some(reason.into()),
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Everything that happened in one cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub results: Vec<CycleResult>,
}

impl CycleReport {
    /// Number of domains that ended with the given outcome
    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn result_for(&self, domain: &str) -> Option<&CycleResult> {
        self.results.iter().find(|r| r.domain == domain)
    }
}
