//! Best-effort maintenance around each cycle
//!
//! Every task runs in its own spawned task with a timeout, so an error, a
//! panic or a hang in one task never reaches the scheduler. Pre-cycle
//! tasks are joined before the domains run; post-cycle tasks are detached.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::errors::Result;
use crate::idempotency::IdempotencyGuard;

/// When a task runs relative to the domain pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenancePhase {
    /// Joined before context building starts
    PreCycle,
    /// Detached after all domains finished
    PostCycle,
}

#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    fn phase(&self) -> MaintenancePhase {
        MaintenancePhase::PreCycle
    }

    async fn run(&self, cycle: u64) -> Result<()>;
}

/// How a joined maintenance pass went
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Runs maintenance tasks inside their own error boundaries
pub struct MaintenanceRunner {
    tasks: Vec<Arc<dyn MaintenanceTask>>,
    timeout: Duration,
}

impl MaintenanceRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            timeout,
        }
    }

    pub fn add(&mut self, task: Arc<dyn MaintenanceTask>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn tasks_for(&self, phase: MaintenancePhase) -> impl Iterator<Item = &Arc<dyn MaintenanceTask>> {
        self.tasks.iter().filter(move |t| t.phase() == phase)
    }

    /// Run every pre-cycle task and wait for all of them
    pub async fn run_pre_cycle(&self, cycle: u64) -> MaintenanceSummary {
        let pending: Vec<_> = self
            .tasks_for(MaintenancePhase::PreCycle)
            .map(|task| run_isolated(task.clone(), cycle, self.timeout))
            .collect();

        let mut summary = MaintenanceSummary::default();
        for status in futures_util::future::join_all(pending).await {
            match status {
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::TimedOut => summary.timed_out += 1,
            }
        }
        summary
    }

    /// Start every post-cycle task without waiting for it
    pub fn spawn_post_cycle(&self, cycle: u64) -> Vec<JoinHandle<()>> {
        self.tasks_for(MaintenancePhase::PostCycle)
            .map(|task| {
                let task = task.clone();
                let timeout = self.timeout;
                tokio::spawn(async move {
                    run_isolated(task, cycle, timeout).await;
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Succeeded,
    Failed,
    TimedOut,
}

async fn run_isolated(task: Arc<dyn MaintenanceTask>, cycle: u64, timeout: Duration) -> TaskStatus {
    let name = task.name().to_string();
    let started = Instant::now();
    let mut handle = tokio::spawn(async move { task.run(cycle).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => {
            debug!(task = %name, cycle, elapsed_ms = started.elapsed().as_millis() as u64, "Maintenance task finished");
            TaskStatus::Succeeded
        }
        Ok(Ok(Err(e))) => {
            warn!(task = %name, cycle, error = %e, "Maintenance task failed");
            TaskStatus::Failed
        }
        Ok(Err(join_error)) => {
            error!(task = %name, cycle, error = %join_error, "Maintenance task panicked");
            TaskStatus::Failed
        }
        Err(_) => {
            handle.abort();
            warn!(task = %name, cycle, timeout_ms = timeout.as_millis() as u64, "Maintenance task timed out");
            TaskStatus::TimedOut
        }
    }
}

/// Periodically deletes expired idempotency records
pub struct IdempotencySweepTask {
    guard: Arc<IdempotencyGuard>,
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl IdempotencySweepTask {
    pub fn new(guard: Arc<IdempotencyGuard>, interval: Duration) -> Self {
        Self {
            guard,
            interval,
            last_run: Mutex::new(None),
        }
    }

    fn due(&self) -> bool {
        let mut last_run = self.last_run.lock();
        match *last_run {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last_run = Some(Instant::now());
                true
            }
        }
    }
}

#[async_trait]
impl MaintenanceTask for IdempotencySweepTask {
    fn name(&self) -> &str {
        "idempotency-sweep"
    }

    async fn run(&self, cycle: u64) -> Result<()> {
        if !self.due() {
            return Ok(());
        }
        let removed = self.guard.sweep()?;
        if removed > 0 {
            info!(cycle, removed, remaining = self.guard.len(), "Swept expired idempotency records");
        }
        Ok(())
    }
}
