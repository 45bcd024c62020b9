//! Hook registry and chain runner

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

use super::types::{Hook, HookContext, HookEntry, HookEvent, HookResult};
use crate::common::types::Metadata;
use crate::config::types::HookRegistryConfig;

/// One hook invocation, kept for observability
#[derive(Debug, Clone, Serialize)]
pub struct HookExecution {
    pub hook: String,
    pub event: HookEvent,
    pub domain: String,
    pub proceed: bool,
    pub reason: Option<String>,
    /// The hook returned an error or panicked
    pub errored: bool,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Running counters for one hook
///
/// Errors are counted on their own and also as blocks, since an erroring
/// hook blocks its chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HookStats {
    pub runs: u64,
    pub blocks: u64,
    pub errors: u64,
    pub total_duration: Duration,
}

/// Ordered, event-scoped admission pipeline
pub struct HookRegistry {
    entries: RwLock<Vec<HookEntry>>,
    log: Mutex<VecDeque<HookExecution>>,
    log_capacity: usize,
    stats: Mutex<HashMap<String, HookStats>>,
}

impl HookRegistry {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            log: Mutex::new(VecDeque::with_capacity(log_capacity.min(1024))),
            log_capacity,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &HookRegistryConfig) -> Self {
        Self::new(config.log_capacity)
    }

    /// Add a hook; a duplicate name is logged and ignored
    pub fn register(&self, entry: HookEntry) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name == entry.name) {
            warn!(hook = %entry.name, "Hook already registered, ignoring");
            return false;
        }
        debug!(
            hook = %entry.name,
            event = %entry.event,
            priority = entry.priority,
            "Hook registered"
        );
        entries.push(entry);
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        before != entries.len()
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.write().iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| e.name == name)
    }

    /// Registered hook names in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run every enabled hook matching the event and domain, in ascending
    /// priority order
    ///
    /// The first `proceed = false` is returned verbatim. A hook error or
    /// panic stops the chain with a synthetic block naming the hook. When
    /// all hooks proceed, the result carries the last modified input (if any
    /// hook modified it) and the merged metadata.
    #[instrument(skip(self, context), fields(domain = %context.domain))]
    pub async fn run(&self, event: HookEvent, mut context: HookContext) -> HookResult {
        let mut chain: Vec<(String, i32, Arc<dyn Hook>)> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.matches(event, &context.domain))
            .map(|e| (e.name.clone(), e.priority, e.hook.clone()))
            .collect();
        // Stable sort keeps registration order among equal priorities
        chain.sort_by_key(|(_, priority, _)| *priority);

        context.event = event;
        let mut modified = false;
        let mut metadata = Metadata::new();

        for (name, _, hook) in chain {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(hook.run(&context)).catch_unwind().await;
            let duration = started.elapsed();

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    let reason = format!("hook '{}' failed: {}", name, e);
                    error!(hook = %name, event = %event, error = %e, "Hook failed, blocking");
                    self.record(&name, event, &context.domain, false, Some(&reason), true, duration);
                    return HookResult::block(reason);
                }
                Err(_) => {
                    let reason = format!("hook '{}' panicked", name);
                    error!(hook = %name, event = %event, "Hook panicked, blocking");
                    self.record(&name, event, &context.domain, false, Some(&reason), true, duration);
                    return HookResult::block(reason);
                }
            };

            self.record(
                &name,
                event,
                &context.domain,
                result.proceed,
                result.reason.as_deref(),
                false,
                duration,
            );

            if !result.proceed {
                debug!(hook = %name, event = %event, reason = ?result.reason, "Hook blocked chain");
                return result;
            }

            if let Some(input) = result.modified_input {
                context.payload = input;
                modified = true;
            }
            metadata.extend(result.metadata);
        }

        HookResult {
            proceed: true,
            reason: None,
            modified_input: modified.then_some(context.payload),
            metadata,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        hook: &str,
        event: HookEvent,
        domain: &str,
        proceed: bool,
        reason: Option<&str>,
        errored: bool,
        duration: Duration,
    ) {
        {
            let mut stats = self.stats.lock();
            let entry = stats.entry(hook.to_string()).or_default();
            entry.runs += 1;
            entry.total_duration += duration;
            if !proceed {
                entry.blocks += 1;
            }
            if errored {
                entry.errors += 1;
            }
        }

        if self.log_capacity == 0 {
            return;
        }
        let mut log = self.log.lock();
        while log.len() >= self.log_capacity {
            log.pop_front();
        }
        log.push_back(HookExecution {
            hook: hook.to_string(),
            event,
            domain: domain.to_string(),
            proceed,
            reason: reason.map(str::to_string),
            errored,
            duration,
            timestamp: Utc::now(),
        });
    }

    /// Most recent executions, oldest first
    pub fn recent_executions(&self, limit: usize) -> Vec<HookExecution> {
        let log = self.log.lock();
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    pub fn execution_log_len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn stats(&self, name: &str) -> Option<HookStats> {
        self.stats.lock().get(name).cloned()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::from_config(&HookRegistryConfig::default())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("entries", &*self.entries.read())
            .field("log_capacity", &self.log_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::errors::OrchestratorError;
    use crate::common::types::{ActionKind, Decision};
    use crate::hooks::types::HookPayload;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;

    type CallLog = Arc<Mutex<Vec<String>>>;

    fn spy(name: &str, priority: i32, calls: &CallLog, result: HookResult) -> HookEntry {
        let calls = calls.clone();
        let label = name.to_string();
        HookEntry::from_fn(name, HookEvent::PreDecision, priority, move |_| {
            calls.lock().push(label.clone());
            Ok(result.clone())
        })
    }

    fn context(domain: &str) -> HookContext {
        let decision = Decision::new(domain, ActionKind::Open, "test")
            .with_target("BTC")
            .with_amount(dec!(100));
        HookContext::new(HookEvent::PreDecision, domain, HookPayload::Decision(decision))
    }

    #[tokio::test]
    async fn test_runs_in_priority_order() {
        let registry = HookRegistry::new(10);
        let calls: CallLog = Arc::default();
        registry.register(spy("late", 50, &calls, HookResult::proceed()));
        registry.register(spy("early", 1, &calls, HookResult::proceed()));
        registry.register(spy("middle", 10, &calls, HookResult::proceed()));

        let result = registry.run(HookEvent::PreDecision, context("spot")).await;

        assert!(result.proceed);
        assert_eq!(*calls.lock(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_block_stops_chain_and_is_returned_verbatim() {
        let registry = HookRegistry::new(10);
        let calls: CallLog = Arc::default();
        let blocking = HookResult::block("limit hit").with_metadata("limit", json!(5));
        registry.register(spy("first", 1, &calls, HookResult::proceed()));
        registry.register(spy("blocker", 2, &calls, blocking.clone()));
        registry.register(spy("never", 3, &calls, HookResult::proceed()));

        let result = registry.run(HookEvent::PreDecision, context("spot")).await;

        assert_eq!(result, blocking);
        assert_eq!(*calls.lock(), vec!["first", "blocker"]);
    }

    #[tokio::test]
    async fn test_error_fails_closed() {
        let registry = HookRegistry::new(10);
        let calls: CallLog = Arc::default();
        registry.register(HookEntry::from_fn("broken", HookEvent::PreDecision, 1, |_| {
            Err(OrchestratorError::Internal("bug".into()))
        }));
        registry.register(spy("after", 2, &calls, HookResult::proceed()));

        let result = registry.run(HookEvent::PreDecision, context("spot")).await;

        assert!(!result.proceed);
        assert!(result.reason.unwrap().contains("broken"));
        assert!(calls.lock().is_empty());
        let stats = registry.stats("broken").unwrap();
        assert_eq!((stats.runs, stats.blocks, stats.errors), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_panic_fails_closed() {
        let registry = HookRegistry::new(10);
        registry.register(HookEntry::from_fn("panics", HookEvent::PreDecision, 1, |_| {
            panic!("hook bug")
        }));

        let result = registry.run(HookEvent::PreDecision, context("spot")).await;

        assert!(!result.proceed);
        assert!(result.reason.unwrap().contains("panics"));
    }

    #[tokio::test]
    async fn test_modified_input_threads_through_chain() {
        let registry = HookRegistry::new(10);
        registry.register(HookEntry::from_fn("halve", HookEvent::PreDecision, 1, |ctx| {
            let mut decision = ctx.decision().cloned().unwrap();
            decision.amount = decision.amount.map(|a| a / dec!(2));
            Ok(HookResult::modify(HookPayload::Decision(decision)).with_metadata("step", json!(1)))
        }));
        registry.register(HookEntry::from_fn("check", HookEvent::PreDecision, 2, |ctx| {
            let amount = ctx.decision().and_then(|d| d.amount).unwrap();
            Ok(HookResult::proceed()
                .with_metadata("seen_amount", json!(amount.to_string()))
                .with_metadata("step", json!(2)))
        }));

        let result = registry.run(HookEvent::PreDecision, context("spot")).await;

        assert!(result.proceed);
        let decision = result.modified_input.unwrap().into_decision().unwrap();
        assert_eq!(decision.amount, Some(dec!(50)));
        assert_eq!(result.metadata["seen_amount"], json!("50"));
        // Later hooks win on key conflicts
        assert_eq!(result.metadata["step"], json!(2));
    }

    #[tokio::test]
    async fn test_unmodified_chain_returns_no_input() {
        let registry = HookRegistry::new(10);
        let result = registry.run(HookEvent::PreDecision, context("spot")).await;
        assert!(result.proceed);
        assert!(result.modified_input.is_none());
    }

    #[tokio::test]
    async fn test_domain_and_event_filtering() {
        let registry = HookRegistry::new(10);
        let calls: CallLog = Arc::default();
        registry.register(spy("perps-only", 1, &calls, HookResult::block("perps")).for_domains(["perps"]));
        let post_calls = calls.clone();
        registry.register(HookEntry::from_fn("post", HookEvent::PostDecision, 1, move |_| {
            post_calls.lock().push("post".into());
            Ok(HookResult::block("ignored"))
        }));

        let result = registry.run(HookEvent::PreDecision, context("spot")).await;
        assert!(result.proceed);
        assert!(calls.lock().is_empty());

        let result = registry.run(HookEvent::PreDecision, context("perps")).await;
        assert!(!result.proceed);
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let registry = HookRegistry::new(10);
        let calls: CallLog = Arc::default();
        assert!(registry.register(spy("a", 1, &calls, HookResult::proceed())));
        assert!(!registry.register(spy("a", 2, &calls, HookResult::proceed())));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_enable_disable_and_unregister() {
        let registry = HookRegistry::new(10);
        let calls: CallLog = Arc::default();
        registry.register(spy("blocker", 1, &calls, HookResult::block("no")));

        assert!(registry.set_enabled("blocker", false));
        assert!(registry.run(HookEvent::PreDecision, context("spot")).await.proceed);

        assert!(registry.set_enabled("blocker", true));
        assert!(!registry.run(HookEvent::PreDecision, context("spot")).await.proceed);

        assert!(registry.unregister("blocker"));
        assert!(!registry.unregister("blocker"));
        assert!(!registry.set_enabled("blocker", true));
        assert!(registry.run(HookEvent::PreDecision, context("spot")).await.proceed);
    }

    #[tokio::test]
    async fn test_execution_log_is_bounded() {
        let registry = HookRegistry::new(3);
        let calls: CallLog = Arc::default();
        registry.register(spy("a", 1, &calls, HookResult::proceed()));
        registry.register(spy("b", 2, &calls, HookResult::proceed()));

        registry.run(HookEvent::PreDecision, context("spot")).await;
        registry.run(HookEvent::PreDecision, context("spot")).await;

        assert_eq!(registry.execution_log_len(), 3);
        let recent: Vec<String> = registry
            .recent_executions(10)
            .into_iter()
            .map(|e| e.hook)
            .collect();
        assert_eq!(recent, vec!["b", "a", "b"]);
    }
}
