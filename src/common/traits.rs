//! Boundary traits for the scheduler's external collaborators

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::errors::Result;
use super::types::{Decision, DecisionRecord, DomainContext, ExecutionMode, ExecutionReport, Position};

/// A decision-producing worker for one domain
///
/// Workers may reach remote backends through the resilience layer and must
/// tolerate being dropped mid-call when the scheduler times them out.
#[async_trait]
pub trait DecisionWorker: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Produce at most one decision for this cycle
    ///
    /// # Returns
    /// * `Ok(None)` - Nothing to propose
    /// * `Ok(Some(decision))` - A proposed action (possibly a no-op)
    async fn produce_decision(&self, context: &DomainContext) -> Result<Option<Decision>>;
}

/// Carries out approved decisions
#[async_trait]
pub trait DecisionExecutor: Send + Sync {
    /// Execute a decision in the given mode
    ///
    /// An `Err` and an `ExecutionReport` with `success == false` are both
    /// treated as a failed execution.
    async fn execute(
        &self,
        domain: &str,
        decision: &Decision,
        mode: ExecutionMode,
    ) -> Result<ExecutionReport>;
}

/// Balance, position and decision-history storage
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Current balance for a domain
    async fn balance(&self, domain: &str) -> Result<Decimal>;

    /// Highest balance observed for a domain
    async fn peak_balance(&self, domain: &str) -> Result<Decimal>;

    async fn set_balance(&self, domain: &str, balance: Decimal) -> Result<()>;

    async fn open_positions(&self, domain: &str) -> Result<Vec<Position>>;

    async fn set_positions(&self, domain: &str, positions: Vec<Position>) -> Result<()>;

    /// Most recent decisions, newest first
    async fn recent_decisions(&self, domain: &str, limit: usize) -> Result<Vec<DecisionRecord>>;

    async fn record_decision(&self, record: DecisionRecord) -> Result<()>;
}
