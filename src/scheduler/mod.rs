//! Cycle scheduler and the maintenance tasks run around each cycle

pub mod cycle;
pub mod maintenance;

pub use cycle::{CycleScheduler, CycleSchedulerBuilder};
pub use maintenance::{
    IdempotencySweepTask, MaintenancePhase, MaintenanceRunner, MaintenanceSummary, MaintenanceTask,
};
