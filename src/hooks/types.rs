use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::common::errors::Result;
use crate::common::types::{Decision, DomainContext, ExecutionReport, Metadata};

/// Lifecycle events hooks can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Before a decision is reserved and executed; hooks may block or
    /// adjust the amount
    PreDecision,
    /// After a successful execution; informational only
    PostDecision,
    /// After a failed execution; informational only
    ExecutionFailed,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookEvent::PreDecision => write!(f, "pre_decision"),
            HookEvent::PostDecision => write!(f, "post_decision"),
            HookEvent::ExecutionFailed => write!(f, "execution_failed"),
        }
    }
}

/// Event-specific input threaded through a hook chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookPayload {
    Empty,
    Decision(Decision),
    Executed {
        decision: Decision,
        report: ExecutionReport,
    },
}

impl HookPayload {
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            HookPayload::Decision(decision) => Some(decision),
            HookPayload::Executed { decision, .. } => Some(decision),
            HookPayload::Empty => None,
        }
    }

    pub fn into_decision(self) -> Option<Decision> {
        match self {
            HookPayload::Decision(decision) => Some(decision),
            HookPayload::Executed { decision, .. } => Some(decision),
            HookPayload::Empty => None,
        }
    }
}

/// What a hook gets to look at
///
/// Treated as immutable by hooks; the registry swaps in each hook's
/// modified payload before calling the next one.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: HookEvent,
    pub domain: String,
    pub payload: HookPayload,
    /// Domain state the decision was produced from, when available
    pub snapshot: Option<Arc<DomainContext>>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl HookContext {
    pub fn new(event: HookEvent, domain: impl Into<String>, payload: HookPayload) -> Self {
        Self {
            event,
            domain: domain.into(),
            payload,
            snapshot: None,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Arc<DomainContext>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.payload.decision()
    }
}

/// A hook's verdict
#[derive(Debug, Clone, PartialEq)]
pub struct HookResult {
    pub proceed: bool,
    pub reason: Option<String>,
    /// Replacement input for the rest of the chain
    pub modified_input: Option<HookPayload>,
    pub metadata: Metadata,
}

impl HookResult {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            reason: None,
            modified_input: None,
            metadata: Metadata::new(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: Some(reason.into()),
            modified_input: None,
            metadata: Metadata::new(),
        }
    }

    /// Proceed with a replacement payload
    pub fn modify(payload: HookPayload) -> Self {
        Self {
            modified_input: Some(payload),
            ..Self::proceed()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A validator or mutator attached to a lifecycle event
///
/// Returning `Err` (or panicking) blocks the chain.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult>;
}

/// Adapter for synchronous closures
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&HookContext) -> Result<HookResult> + Send + Sync,
{
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        (self.0)(ctx)
    }
}

/// A registered hook
#[derive(Clone)]
pub struct HookEntry {
    /// Unique within a registry
    pub name: String,
    pub event: HookEvent,
    /// Lower runs first
    pub priority: i32,
    /// Restrict to these domains; `None` means every domain
    pub domains: Option<Vec<String>>,
    pub enabled: bool,
    pub hook: Arc<dyn Hook>,
}

impl HookEntry {
    pub fn new(
        name: impl Into<String>,
        event: HookEvent,
        priority: i32,
        hook: impl Hook + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            event,
            priority,
            domains: None,
            enabled: true,
            hook: Arc::new(hook),
        }
    }

    pub fn from_fn<F>(name: impl Into<String>, event: HookEvent, priority: i32, f: F) -> Self
    where
        F: Fn(&HookContext) -> Result<HookResult> + Send + Sync + 'static,
    {
        Self::new(name, event, priority, FnHook(f))
    }

    pub fn for_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = Some(domains.into_iter().map(Into::into).collect());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matches(&self, event: HookEvent, domain: &str) -> bool {
        self.enabled
            && self.event == event
            && self
                .domains
                .as_ref()
                .map_or(true, |domains| domains.iter().any(|d| d == domain))
    }
}

impl fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("name", &self.name)
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("domains", &self.domains)
            .field("enabled", &self.enabled)
            .finish()
    }
}
