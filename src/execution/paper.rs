use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::common::errors::{OrchestratorError, Result};
use crate::common::traits::{DecisionExecutor, Persistence};
use crate::common::types::{ActionKind, Decision, ExecutionMode, ExecutionReport, Position};

/// Simulates decisions against persisted balances and positions
///
/// Opening debits the balance and adds to the target's position, closing
/// credits the position back (all of it, or `percentage` of it), adjusting
/// resizes the position by `amount`. Live mode is refused.
pub struct PaperExecutor {
    persistence: Arc<dyn Persistence>,
}

impl PaperExecutor {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    async fn open(&self, domain: &str, decision: &Decision) -> Result<ExecutionReport> {
        let (target, amount) = require_target_and_amount(decision)?;
        let balance = self.persistence.balance(domain).await?;
        if amount > balance {
            return Ok(ExecutionReport::failure(format!(
                "insufficient balance: {} requested, {} available",
                amount, balance
            )));
        }

        let mut positions = self.persistence.open_positions(domain).await?;
        match positions.iter_mut().find(|p| p.target == target) {
            Some(position) => position.size += amount,
            None => positions.push(Position::new(domain, target, amount)),
        }
        self.persistence.set_positions(domain, positions).await?;
        self.persistence.set_balance(domain, balance - amount).await?;

        Ok(ExecutionReport::success(json!({
            "simulated": true,
            "action": "open",
            "target": target,
            "amount": amount.to_string(),
            "balance_after": (balance - amount).to_string(),
        })))
    }

    async fn close(&self, domain: &str, decision: &Decision) -> Result<ExecutionReport> {
        let target = decision
            .target
            .as_deref()
            .ok_or_else(|| OrchestratorError::Execution("close requires a target".into()))?;
        let mut positions = self.persistence.open_positions(domain).await?;
        let Some(index) = positions.iter().position(|p| p.target == target) else {
            return Ok(ExecutionReport::failure(format!("no open position in {}", target)));
        };

        let fraction = decision
            .percentage
            .map(|pct| (pct / Decimal::ONE_HUNDRED).clamp(Decimal::ZERO, Decimal::ONE))
            .unwrap_or(Decimal::ONE);
        let released = positions[index].size * fraction;
        positions[index].size -= released;
        if positions[index].size <= Decimal::ZERO {
            positions.remove(index);
        }

        let balance = self.persistence.balance(domain).await? + released;
        self.persistence.set_positions(domain, positions).await?;
        self.persistence.set_balance(domain, balance).await?;

        Ok(ExecutionReport::success(json!({
            "simulated": true,
            "action": "close",
            "target": target,
            "released": released.to_string(),
            "balance_after": balance.to_string(),
        })))
    }

    async fn adjust(&self, domain: &str, decision: &Decision) -> Result<ExecutionReport> {
        let (target, delta) = require_target_and_amount(decision)?;
        let mut positions = self.persistence.open_positions(domain).await?;
        let Some(position) = positions.iter_mut().find(|p| p.target == target) else {
            return Ok(ExecutionReport::failure(format!("no open position in {}", target)));
        };

        // Negative deltas shrink the position, never below zero
        let delta = delta.max(-position.size);
        let balance = self.persistence.balance(domain).await?;
        if delta > balance {
            return Ok(ExecutionReport::failure(format!(
                "insufficient balance: {} requested, {} available",
                delta, balance
            )));
        }
        position.size += delta;
        positions.retain(|p| p.size > Decimal::ZERO);

        self.persistence.set_positions(domain, positions).await?;
        self.persistence.set_balance(domain, balance - delta).await?;

        Ok(ExecutionReport::success(json!({
            "simulated": true,
            "action": "adjust",
            "target": target,
            "delta": delta.to_string(),
        })))
    }
}

fn require_target_and_amount(decision: &Decision) -> Result<(&str, Decimal)> {
    let target = decision.target.as_deref().ok_or_else(|| {
        OrchestratorError::Execution(format!("{} requires a target", decision.action))
    })?;
    let amount = decision.amount.ok_or_else(|| {
        OrchestratorError::Execution(format!("{} requires an amount", decision.action))
    })?;
    Ok((target, amount))
}

#[async_trait]
impl DecisionExecutor for PaperExecutor {
    #[instrument(skip(self, decision), fields(action = %decision.action))]
    async fn execute(
        &self,
        domain: &str,
        decision: &Decision,
        mode: ExecutionMode,
    ) -> Result<ExecutionReport> {
        if mode == ExecutionMode::Live {
            return Err(OrchestratorError::Execution(
                "paper executor cannot execute in live mode".to_string(),
            ));
        }

        let report = match &decision.action {
            ActionKind::Open => self.open(domain, decision).await?,
            ActionKind::Close => self.close(domain, decision).await?,
            ActionKind::Adjust => self.adjust(domain, decision).await?,
            ActionKind::NoOp | ActionKind::Other(_) => ExecutionReport::success(json!({
                "simulated": true,
                "action": decision.action.as_str(),
                "executed_at": Utc::now(),
            })),
        };
        debug!(success = report.success, "Paper execution finished");
        Ok(report)
    }
}
