use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::maintenance::{MaintenanceRunner, MaintenanceTask};
use crate::common::errors::{OrchestratorError, Result};
use crate::common::shutdown::Shutdown;
use crate::common::traits::{DecisionExecutor, DecisionWorker, Persistence};
use crate::common::types::{
    CycleReport, CycleResult, Decision, DecisionRecord, DomainContext, ExecutionReport, Outcome,
};
use crate::config::types::{IdempotencyConfig, SchedulerConfig};
use crate::hooks::{HookContext, HookEvent, HookPayload, HookRegistry};
use crate::idempotency::IdempotencyGuard;

/// Drives decision cycles across domains
///
/// Each cycle runs pre-cycle maintenance, builds every domain's context and
/// asks its worker for a decision (all domains concurrently, joined), then
/// pushes each decision through admission hooks, idempotency reservation
/// and execution. Cycles never overlap.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CycleScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    workers: HashMap<String, Arc<dyn DecisionWorker>>,
    executor: Arc<dyn DecisionExecutor>,
    persistence: Arc<dyn Persistence>,
    hooks: Arc<HookRegistry>,
    guard: Arc<IdempotencyGuard>,
    maintenance: MaintenanceRunner,
    shutdown: Shutdown,
    noop_streaks: Mutex<HashMap<String, u32>>,
    cycle: AtomicU64,
}

/// A domain after context building and decision production
enum Prepared {
    Ready {
        context: Arc<DomainContext>,
        decision: Decision,
    },
    Done(CycleResult),
}

/// Builder for [`CycleScheduler`]
pub struct CycleSchedulerBuilder {
    config: SchedulerConfig,
    workers: HashMap<String, Arc<dyn DecisionWorker>>,
    default_worker: Option<Arc<dyn DecisionWorker>>,
    executor: Option<Arc<dyn DecisionExecutor>>,
    persistence: Option<Arc<dyn Persistence>>,
    hooks: Option<Arc<HookRegistry>>,
    guard: Option<Arc<IdempotencyGuard>>,
    maintenance: Vec<Arc<dyn MaintenanceTask>>,
    shutdown: Option<Shutdown>,
}

impl CycleSchedulerBuilder {
    /// Worker for one domain
    pub fn worker(mut self, domain: impl Into<String>, worker: Arc<dyn DecisionWorker>) -> Self {
        self.workers.insert(domain.into(), worker);
        self
    }

    /// Worker for every domain without its own
    pub fn default_worker(mut self, worker: Arc<dyn DecisionWorker>) -> Self {
        self.default_worker = Some(worker);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn DecisionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn idempotency(mut self, guard: Arc<IdempotencyGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn maintenance_task(mut self, task: Arc<dyn MaintenanceTask>) -> Self {
        self.maintenance.push(task);
        self
    }

    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> Result<CycleScheduler> {
        let executor = self
            .executor
            .ok_or_else(|| OrchestratorError::Configuration("scheduler needs an executor".into()))?;
        let persistence = self.persistence.ok_or_else(|| {
            OrchestratorError::Configuration("scheduler needs a persistence backend".into())
        })?;
        if self.config.domains.is_empty() {
            return Err(OrchestratorError::Configuration(
                "no active domains configured".into(),
            ));
        }

        let mut workers = HashMap::new();
        for domain in &self.config.domains {
            let worker = self
                .workers
                .get(domain)
                .cloned()
                .or_else(|| self.default_worker.clone())
                .ok_or_else(|| {
                    OrchestratorError::Configuration(format!("no worker for domain {}", domain))
                })?;
            workers.insert(domain.clone(), worker);
        }

        let mut maintenance = MaintenanceRunner::new(self.config.maintenance_timeout());
        for task in self.maintenance {
            maintenance.add(task);
        }

        Ok(CycleScheduler {
            inner: Arc::new(SchedulerInner {
                workers,
                executor,
                persistence,
                hooks: self.hooks.unwrap_or_default(),
                guard: self.guard.unwrap_or_else(|| {
                    Arc::new(IdempotencyGuard::new(IdempotencyConfig::default().retention()))
                }),
                maintenance,
                shutdown: self.shutdown.unwrap_or_default(),
                noop_streaks: Mutex::new(HashMap::new()),
                cycle: AtomicU64::new(0),
                config: self.config,
            }),
        })
    }
}

impl CycleScheduler {
    pub fn builder(config: SchedulerConfig) -> CycleSchedulerBuilder {
        CycleSchedulerBuilder {
            config,
            workers: HashMap::new(),
            default_worker: None,
            executor: None,
            persistence: None,
            hooks: None,
            guard: None,
            maintenance: Vec::new(),
            shutdown: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyGuard> {
        &self.inner.guard
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.inner.shutdown.clone()
    }

    /// Number of cycles started so far
    pub fn cycles_run(&self) -> u64 {
        self.inner.cycle.load(Ordering::SeqCst)
    }

    pub fn consecutive_no_ops(&self, domain: &str) -> u32 {
        self.inner
            .noop_streaks
            .lock()
            .get(domain)
            .copied()
            .unwrap_or(0)
    }

    /// Run cycles until shutdown
    pub async fn run(&self) -> Result<()> {
        self.run_loop(None).await.map(|_| ())
    }

    /// Run at most `max_cycles` cycles, stopping early on shutdown
    pub async fn run_cycles(&self, max_cycles: u64) -> Result<Vec<CycleReport>> {
        self.run_loop(Some(max_cycles)).await
    }

    async fn run_loop(&self, max_cycles: Option<u64>) -> Result<Vec<CycleReport>> {
        let shutdown = &self.inner.shutdown;
        let interval = self.inner.config.cycle_interval();
        let mut reports = Vec::new();
        let mut completed = 0u64;

        info!(
            domains = ?self.inner.config.domains,
            mode = %self.inner.config.execution_mode,
            interval_secs = interval.as_secs(),
            parallel = self.inner.config.parallel,
            "Starting cycle scheduler"
        );

        while !shutdown.is_triggered() {
            let report = self.run_cycle().await;
            completed += 1;
            if max_cycles.is_some() {
                reports.push(report);
            }
            if max_cycles.is_some_and(|max| completed >= max) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.wait() => {
                    debug!("Shutdown requested during inter-cycle sleep");
                    break;
                }
            }
        }

        info!(cycles = completed, "Cycle scheduler stopped");
        Ok(reports)
    }

    /// Run one full cycle across every active domain
    #[instrument(skip(self), fields(cycle = tracing::field::Empty))]
    pub async fn run_cycle(&self) -> CycleReport {
        let inner = &self.inner;
        let cycle = inner.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("cycle", cycle);
        let started_at = Utc::now();
        let started = Instant::now();

        let maintenance = inner.maintenance.run_pre_cycle(cycle).await;
        if maintenance.failed > 0 || maintenance.timed_out > 0 {
            warn!(
                failed = maintenance.failed,
                timed_out = maintenance.timed_out,
                "Maintenance had problems; continuing cycle"
            );
        }

        let domains = inner.config.domains.clone();
        let results = if inner.config.parallel {
            self.run_parallel(&domains, cycle).await
        } else {
            let mut results = Vec::with_capacity(domains.len());
            for domain in &domains {
                let pipeline = async {
                    let prepared = inner.prepare(domain, cycle).await;
                    inner.process(prepared, cycle).await
                };
                let result = match AssertUnwindSafe(pipeline).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(&*panic);
                        error!(domain = %domain, error = %message, "Domain pipeline panicked");
                        CycleResult::skipped(
                            domain.as_str(),
                            None,
                            format!("pipeline aborted: {}", message),
                        )
                    }
                };
                results.push(result);
            }
            results
        };

        for result in &results {
            log_outcome(result);
        }

        inner.maintenance.spawn_post_cycle(cycle);

        let report = CycleReport {
            cycle,
            started_at,
            duration: started.elapsed(),
            results,
        };
        info!(
            success = report.count(Outcome::Success),
            failed = report.count(Outcome::Failed),
            skipped = report.count(Outcome::Skipped),
            blocked = report.count(Outcome::Blocked),
            duration_ms = report.duration.as_millis() as u64,
            "Cycle complete"
        );
        report
    }

    /// Two joined fan-outs: context and decisions first, then admission
    /// and execution
    async fn run_parallel(&self, domains: &[String], cycle: u64) -> Vec<CycleResult> {
        let prepare = domains.iter().map(|domain| {
            let inner = self.inner.clone();
            let domain = domain.clone();
            tokio::spawn(async move { inner.prepare(&domain, cycle).await })
        });
        let prepared: Vec<Prepared> = join_all(prepare)
            .await
            .into_iter()
            .zip(domains)
            .map(|(joined, domain)| {
                joined.unwrap_or_else(|e| {
                    Prepared::Done(CycleResult::skipped(
                        domain.as_str(),
                        None,
                        format!("context task aborted: {}", e),
                    ))
                })
            })
            .collect();

        let process = prepared.into_iter().map(|prepared| {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.process(prepared, cycle).await })
        });
        join_all(process)
            .await
            .into_iter()
            .zip(domains)
            .map(|(joined, domain)| {
                joined.unwrap_or_else(|e| {
                    error!(domain = %domain, error = %e, "Domain pipeline panicked");
                    CycleResult::skipped(domain.as_str(), None, format!("pipeline aborted: {}", e))
                })
            })
            .collect()
    }
}

impl SchedulerInner {
    async fn build_context(&self, domain: &str, cycle: u64) -> Result<DomainContext> {
        let context_error = |e: OrchestratorError| OrchestratorError::context(domain, e.to_string());
        let persistence = &self.persistence;

        let balance = persistence.balance(domain).await.map_err(context_error)?;
        let peak_balance = persistence.peak_balance(domain).await.map_err(context_error)?;
        let open_positions = persistence.open_positions(domain).await.map_err(context_error)?;
        let recent_decisions = persistence
            .recent_decisions(domain, self.config.history_limit)
            .await
            .map_err(context_error)?;
        let consecutive_no_ops = self.noop_streaks.lock().get(domain).copied().unwrap_or(0);

        Ok(DomainContext {
            domain: domain.to_string(),
            cycle,
            balance,
            peak_balance,
            open_positions,
            recent_decisions,
            consecutive_no_ops,
            built_at: Utc::now(),
        })
    }

    async fn produce(&self, domain: &str, context: &DomainContext) -> Result<Option<Decision>> {
        let worker = self
            .workers
            .get(domain)
            .ok_or_else(|| OrchestratorError::worker(domain, "no worker registered"))?;
        let timeout = self.config.worker_timeout();

        let call = AssertUnwindSafe(worker.produce_decision(context)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(OrchestratorError::worker(
                domain,
                format!("worker {} panicked: {}", worker.name(), panic_message(&*panic)),
            )),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "worker {} for {} after {:?}",
                worker.name(),
                domain,
                timeout
            ))),
        }
    }

    /// Context build and decision production for one domain
    async fn prepare(&self, domain: &str, cycle: u64) -> Prepared {
        let context = match self.build_context(domain, cycle).await {
            Ok(context) => Arc::new(context),
            Err(e) => {
                warn!(domain, error = %e, "Context build failed");
                return Prepared::Done(CycleResult::skipped(
                    domain,
                    None,
                    format!("context build failed: {}", e),
                ));
            }
        };

        match self.produce(domain, &context).await {
            Ok(Some(mut decision)) => {
                if decision.domain.is_empty() {
                    decision.domain = domain.to_string();
                }
                Prepared::Ready { context, decision }
            }
            Ok(None) => Prepared::Done(CycleResult::skipped(domain, None, "no decision")),
            Err(e) => {
                warn!(domain, error = %e, "Worker failed");
                Prepared::Done(CycleResult::skipped(
                    domain,
                    None,
                    format!("worker failed: {}", e),
                ))
            }
        }
    }

    /// Track no-op streaks; returns the streak after this decision
    fn update_noop_streak(&self, domain: &str, is_no_op: bool) -> u32 {
        let mut streaks = self.noop_streaks.lock();
        let streak = streaks.entry(domain.to_string()).or_insert(0);
        *streak = if is_no_op { streak.saturating_add(1) } else { 0 };
        *streak
    }

    /// Admission, reservation and execution for one decision
    ///
    /// The result is always reported under the pipeline's domain, even
    /// when the decision names another one.
    async fn process(&self, prepared: Prepared, cycle: u64) -> CycleResult {
        let (context, decision) = match prepared {
            Prepared::Ready { context, decision } => (context, decision),
            Prepared::Done(result) => return result,
        };
        let domain = context.domain.clone();
        let result = self.admit_and_execute(context, decision, cycle).await;
        CycleResult { domain, ..result }
    }

    async fn admit_and_execute(
        &self,
        context: Arc<DomainContext>,
        mut decision: Decision,
        cycle: u64,
    ) -> CycleResult {
        let domain = context.domain.clone();

        let streak = self.update_noop_streak(&domain, decision.is_no_op());
        if decision.is_no_op() {
            let max = self.config.max_consecutive_noops;
            if max > 0 && streak >= max {
                warn!(domain = %domain, streak, max, "Domain keeps returning no-ops; needs attention");
            }
            return CycleResult::skipped(domain, Some(decision), "no-op");
        }

        if decision.confidence < self.config.min_confidence {
            let reason = format!(
                "confidence {:.2} below minimum {:.2}",
                decision.confidence, self.config.min_confidence
            );
            return CycleResult::skipped(domain, Some(decision), reason);
        }

        // Admission
        let pre = HookContext::new(
            HookEvent::PreDecision,
            domain.as_str(),
            HookPayload::Decision(decision.clone()),
        )
        .with_snapshot(context.clone());
        let admission = self.hooks.run(HookEvent::PreDecision, pre).await;
        if !admission.proceed {
            let reason = admission
                .reason
                .unwrap_or_else(|| "blocked by hook".to_string());
            return CycleResult::blocked(decision, reason);
        }
        // Hooks may only adjust the amount
        if let Some(adjusted) = admission.modified_input.as_ref().and_then(HookPayload::decision) {
            if adjusted.amount != decision.amount {
                info!(
                    domain = %domain,
                    from = ?decision.amount,
                    to = ?adjusted.amount,
                    "Hook adjusted decision amount"
                );
                decision.amount = adjusted.amount;
            }
        }

        // Reservation is keyed on the decision itself, so two domains
        // proposing the same logical action collide
        let reservation = match self.guard.check_and_reserve(
            &decision.domain,
            &decision.action,
            decision.target.as_deref(),
            decision.amount,
        ) {
            Ok(reservation) => reservation,
            Err(e) => {
                error!(domain = %domain, error = %e, "Idempotency reservation failed");
                return CycleResult::failed(decision, None, format!("reservation failed: {}", e));
            }
        };
        if reservation.is_duplicate {
            return CycleResult::skipped(domain, Some(decision), "duplicate action")
                .with_fingerprint(reservation.key);
        }
        let key = reservation.key;

        // Execution
        let mode = self.config.execution_mode;
        let executed = AssertUnwindSafe(self.executor.execute(&domain, &decision, mode))
            .catch_unwind()
            .await;
        let report = match executed {
            Ok(Ok(report)) if report.success => report,
            Ok(Ok(report)) => {
                let error = report
                    .error
                    .clone()
                    .unwrap_or_else(|| "execution reported failure".to_string());
                return self.fail_execution(decision, key, report, error, &context).await;
            }
            Ok(Err(e)) => {
                let error = e.to_string();
                let report = ExecutionReport::failure(error.clone());
                return self.fail_execution(decision, key, report, error, &context).await;
            }
            Err(panic) => {
                let error = format!("executor panicked: {}", panic_message(&*panic));
                error!(domain = %domain, key = %key, error = %error, "Executor panicked");
                let report = ExecutionReport::failure(error.clone());
                return self.fail_execution(decision, key, report, error, &context).await;
            }
        };

        // Post-decision hooks are informational
        let post = HookContext::new(
            HookEvent::PostDecision,
            domain.as_str(),
            HookPayload::Executed {
                decision: decision.clone(),
                report: report.clone(),
            },
        )
        .with_snapshot(context.clone());
        let observed = self.hooks.run(HookEvent::PostDecision, post).await;
        if !observed.proceed {
            warn!(domain = %domain, reason = ?observed.reason, "Post-decision hook objected; ignored");
        }

        let record = DecisionRecord {
            decision: decision.clone(),
            outcome: Outcome::Success,
            fingerprint: Some(key.clone()),
            report: Some(report.clone()),
            cycle,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.persistence.record_decision(record).await {
            error!(domain = %domain, error = %e, "Failed to persist executed decision");
        }

        let result = json!({ "cycle": cycle, "details": report.details });
        if let Err(e) = self.guard.update_result(&key, result) {
            error!(domain = %domain, key = %key, error = %e, "Failed to finalize idempotency record");
        }

        CycleResult::success(decision, key)
    }

    /// Release the reservation so a later cycle can retry, and tell the
    /// failure hooks
    async fn fail_execution(
        &self,
        decision: Decision,
        key: String,
        report: ExecutionReport,
        error: String,
        context: &Arc<DomainContext>,
    ) -> CycleResult {
        if let Err(e) = self.guard.remove(&key) {
            error!(domain = %context.domain, key = %key, error = %e, "Failed to release idempotency reservation");
        }

        let failed = HookContext::new(
            HookEvent::ExecutionFailed,
            context.domain.as_str(),
            HookPayload::Executed {
                decision: decision.clone(),
                report,
            },
        )
        .with_snapshot(context.clone())
        .with_error(error.as_str());
        self.hooks.run(HookEvent::ExecutionFailed, failed).await;

        CycleResult::failed(decision, Some(key), error)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn log_outcome(result: &CycleResult) {
    let action = result.decision.as_ref().map(|d| d.action.to_string());
    let amount = result.decision.as_ref().and_then(|d| d.amount);
    match result.outcome {
        Outcome::Success => info!(
            domain = %result.domain,
            outcome = %result.outcome,
            action = ?action,
            amount = ?amount,
            "Domain outcome"
        ),
        Outcome::Failed => error!(
            domain = %result.domain,
            outcome = %result.outcome,
            action = ?action,
            reason = ?result.reason,
            "Domain outcome"
        ),
        Outcome::Skipped | Outcome::Blocked => info!(
            domain = %result.domain,
            outcome = %result.outcome,
            action = ?action,
            reason = ?result.reason,
            "Domain outcome"
        ),
    }
}

impl std::fmt::Debug for CycleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleScheduler")
            .field("domains", &self.inner.config.domains)
            .field("mode", &self.inner.config.execution_mode)
            .field("cycles_run", &self.cycles_run())
            .finish()
    }
}
