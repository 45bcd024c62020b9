//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use decision_orchestrator::config::types::SchedulerConfig;
use decision_orchestrator::{
    ActionKind, CycleScheduler, Decision, DecisionExecutor, DecisionRecord, DecisionWorker,
    DomainContext, ExecutionMode, ExecutionReport, HookRegistry, IdempotencyGuard,
    InMemoryPersistence, OrchestratorError, Persistence, Position, Result,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted worker reply
#[derive(Debug, Clone)]
pub enum Reply {
    Decide(Decision),
    Nothing,
    Fail(String),
    /// Sleep before answering with a no-op
    Stall(Duration),
    Panic(String),
}

/// Worker that replays a script, repeating the last reply once exhausted
pub struct ScriptedWorker {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Reply>,
    calls: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Reply::Nothing),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always answer with the same decision
    pub fn always(decision: Decision) -> Arc<Self> {
        Self::new(vec![Reply::Decide(decision)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionWorker for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn produce_decision(&self, context: &DomainContext) -> Result<Option<Decision>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = match self.script.lock().pop_front() {
            Some(reply) => {
                *self.last.lock() = reply.clone();
                reply
            }
            None => self.last.lock().clone(),
        };

        match reply {
            Reply::Decide(decision) => Ok(Some(decision)),
            Reply::Nothing => Ok(None),
            Reply::Fail(message) => Err(OrchestratorError::worker(&context.domain, message)),
            Reply::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Some(Decision::no_op(&context.domain, "stalled")))
            }
            Reply::Panic(message) => panic!("{}", message),
        }
    }
}

/// Executor that records every call and can be told to fail
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, Decision)>>,
    failing_domains: Mutex<HashSet<String>>,
    erroring_domains: Mutex<HashSet<String>>,
    panicking_domains: Mutex<HashSet<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report `success = false` for this domain
    pub fn fail_domain(&self, domain: &str) {
        self.failing_domains.lock().insert(domain.to_string());
    }

    /// Return an `Err` for this domain
    pub fn error_domain(&self, domain: &str) {
        self.erroring_domains.lock().insert(domain.to_string());
    }

    /// Panic mid-call for this domain
    pub fn panic_domain(&self, domain: &str) {
        self.panicking_domains.lock().insert(domain.to_string());
    }

    pub fn heal(&self) {
        self.failing_domains.lock().clear();
        self.erroring_domains.lock().clear();
        self.panicking_domains.lock().clear();
    }

    pub fn calls(&self) -> Vec<(String, Decision)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl DecisionExecutor for RecordingExecutor {
    async fn execute(
        &self,
        domain: &str,
        decision: &Decision,
        mode: ExecutionMode,
    ) -> Result<ExecutionReport> {
        self.calls
            .lock()
            .push((domain.to_string(), decision.clone()));

        if self.panicking_domains.lock().contains(domain) {
            panic!("venue connection dropped mid-order for {}", domain);
        }
        if self.erroring_domains.lock().contains(domain) {
            return Err(OrchestratorError::Execution(format!("venue down for {}", domain)));
        }
        if self.failing_domains.lock().contains(domain) {
            return Ok(ExecutionReport::failure("order rejected"));
        }
        Ok(ExecutionReport::success(json!({
            "mode": mode.to_string(),
            "order_id": format!("{}-{}", domain, self.call_count()),
        })))
    }
}

/// Persistence whose reads fail for selected domains
pub struct FlakyPersistence {
    inner: InMemoryPersistence,
    broken: Mutex<HashSet<String>>,
}

impl FlakyPersistence {
    pub fn new(inner: InMemoryPersistence) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken: Mutex::new(HashSet::new()),
        })
    }

    pub fn break_domain(&self, domain: &str) {
        self.broken.lock().insert(domain.to_string());
    }

    fn check(&self, domain: &str) -> Result<()> {
        if self.broken.lock().contains(domain) {
            return Err(OrchestratorError::Persistence(format!("{} unavailable", domain)));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn balance(&self, domain: &str) -> Result<Decimal> {
        self.check(domain)?;
        self.inner.balance(domain).await
    }

    async fn peak_balance(&self, domain: &str) -> Result<Decimal> {
        self.check(domain)?;
        self.inner.peak_balance(domain).await
    }

    async fn set_balance(&self, domain: &str, balance: Decimal) -> Result<()> {
        self.inner.set_balance(domain, balance).await
    }

    async fn open_positions(&self, domain: &str) -> Result<Vec<Position>> {
        self.check(domain)?;
        self.inner.open_positions(domain).await
    }

    async fn set_positions(&self, domain: &str, positions: Vec<Position>) -> Result<()> {
        self.inner.set_positions(domain, positions).await
    }

    async fn recent_decisions(&self, domain: &str, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.check(domain)?;
        self.inner.recent_decisions(domain, limit).await
    }

    async fn record_decision(&self, record: DecisionRecord) -> Result<()> {
        self.inner.record_decision(record).await
    }
}

/// Scheduler config with no inter-cycle sleep
pub fn scheduler_config(domains: &[&str]) -> SchedulerConfig {
    SchedulerConfig {
        domains: domains.iter().map(|d| d.to_string()).collect(),
        cycle_interval_secs: 0,
        worker_timeout_secs: 5,
        ..SchedulerConfig::default()
    }
}

/// A buy decision as a worker would emit it
pub fn buy(domain: &str, target: &str, amount: Decimal) -> Decision {
    Decision::new(domain, ActionKind::Open, "signal fired")
        .with_target(target)
        .with_amount(amount)
        .with_confidence(0.9)
}

/// Everything a scheduler test needs to inspect afterwards
pub struct Harness {
    pub scheduler: CycleScheduler,
    pub executor: Arc<RecordingExecutor>,
    pub persistence: Arc<dyn Persistence>,
    pub hooks: Arc<HookRegistry>,
    pub guard: Arc<IdempotencyGuard>,
}

/// Build a scheduler with one worker per domain
pub fn harness(
    config: SchedulerConfig,
    workers: Vec<(&str, Arc<ScriptedWorker>)>,
    persistence: Arc<dyn Persistence>,
) -> Harness {
    let executor = RecordingExecutor::new();
    let hooks = Arc::new(HookRegistry::new(100));
    let guard = Arc::new(IdempotencyGuard::new(Duration::from_secs(3600)));

    let mut builder = CycleScheduler::builder(config)
        .executor(executor.clone())
        .persistence(persistence.clone())
        .hooks(hooks.clone())
        .idempotency(guard.clone());
    for (domain, worker) in workers {
        builder = builder.worker(domain, worker as Arc<dyn DecisionWorker>);
    }

    Harness {
        scheduler: builder.build().expect("scheduler should build"),
        executor,
        persistence,
        hooks,
        guard,
    }
}

/// Sample decision backend responses
pub mod backend_responses {
    /// Backend proposes buying BTC
    pub const BUY_BTC: &str = r#"{
        "decision": {
            "action": "buy",
            "target": "BTC",
            "amount": "100",
            "rationale": "momentum",
            "confidence": 0.82
        }
    }"#;

    /// Backend has nothing to propose
    pub const NOTHING: &str = r#"{"decision": null}"#;
}
