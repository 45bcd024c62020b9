//! Decision Orchestrator Library
//!
//! Runs periodic decision cycles across independent domains: workers
//! propose decisions, hooks admit or adjust them, an idempotency guard
//! stops duplicates and an executor carries them out. Outbound calls go
//! through a resilience layer with retries, cooldowns and fallbacks.

pub mod common;
pub mod config;
pub mod execution;
pub mod hooks;
pub mod idempotency;
pub mod resilience;
pub mod scheduler;
pub mod workers;

// Re-export commonly used types
pub use common::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use common::errors::{OrchestratorError, ResilienceError, Result};
pub use common::shutdown::Shutdown;
pub use common::traits::{DecisionExecutor, DecisionWorker, Persistence};
pub use common::types::{
    ActionKind, CycleReport, CycleResult, Decision, DecisionRecord, DomainContext, ExecutionMode,
    ExecutionReport, Metadata, Outcome, Position,
};
pub use config::types::AppConfig;

pub use execution::{InMemoryPersistence, PaperExecutor};
pub use hooks::{Hook, HookContext, HookEntry, HookEvent, HookPayload, HookRegistry, HookResult};
pub use idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryStore, JsonFileStore};
pub use resilience::{CallFailure, FallbackExecutor, RateLimitTracker, ResilientCaller};
pub use scheduler::{CycleScheduler, IdempotencySweepTask, MaintenanceTask};
pub use workers::{HttpDecisionWorker, IdleWorker};
