//! Built-in policy hooks
//!
//! Each hook enforces one value from [`PolicyConfig`]. Safety checks that
//! look at shared state run first (low priority numbers), cheaper
//! per-decision checks after, and the amount clamp last so it only sees
//! decisions that would otherwise be admitted.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::registry::HookRegistry;
use super::types::{Hook, HookContext, HookEntry, HookEvent, HookPayload, HookResult};
use crate::common::errors::Result;
use crate::common::traits::Persistence;
use crate::common::types::{drawdown_percent, ActionKind};
use crate::config::types::PolicyConfig;

pub const DRAWDOWN_PRIORITY: i32 = 5;
pub const AMOUNT_CEILING_PRIORITY: i32 = 10;
pub const APPROVAL_PRIORITY: i32 = 20;
pub const MAX_POSITIONS_PRIORITY: i32 = 30;
pub const BALANCE_FRACTION_PRIORITY: i32 = 40;
pub const AUDIT_PRIORITY: i32 = 100;

/// Whether an action adds exposure (closing never does)
fn increases_exposure(action: &ActionKind) -> bool {
    matches!(action, ActionKind::Open | ActionKind::Adjust)
}

/// Blocks any action whose amount is above a hard ceiling
#[derive(Debug, Clone)]
pub struct AmountCeilingHook {
    pub ceiling: Decimal,
}

#[async_trait]
impl Hook for AmountCeilingHook {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        match ctx.decision().and_then(|d| d.amount) {
            Some(amount) if amount > self.ceiling => Ok(HookResult::block(format!(
                "amount {} exceeds ceiling {}",
                amount, self.ceiling
            ))),
            _ => Ok(HookResult::proceed()),
        }
    }
}

/// Requires explicit approval for high-value actions
///
/// A decision above the threshold passes only when its metadata carries
/// `"approved": true`.
#[derive(Debug, Clone)]
pub struct ApprovalThresholdHook {
    pub threshold: Decimal,
}

#[async_trait]
impl Hook for ApprovalThresholdHook {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        let Some(decision) = ctx.decision() else {
            return Ok(HookResult::proceed());
        };
        match decision.amount {
            Some(amount) if amount > self.threshold => {
                let approved = decision
                    .metadata
                    .get("approved")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if approved {
                    Ok(HookResult::proceed().with_metadata("approval", json!("granted")))
                } else {
                    Ok(HookResult::block(format!(
                        "amount {} exceeds approval threshold {}, approval required",
                        amount, self.threshold
                    )))
                }
            }
            _ => Ok(HookResult::proceed()),
        }
    }
}

/// Caps the number of open positions per domain
#[derive(Debug, Clone)]
pub struct MaxPositionsHook {
    pub max_positions: usize,
}

#[async_trait]
impl Hook for MaxPositionsHook {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        let (Some(decision), Some(snapshot)) = (ctx.decision(), ctx.snapshot.as_ref()) else {
            return Ok(HookResult::proceed());
        };
        if decision.action != ActionKind::Open {
            return Ok(HookResult::proceed());
        }
        // Adding to an existing position does not open a new one
        if let Some(target) = &decision.target {
            if snapshot.has_position(target) {
                return Ok(HookResult::proceed());
            }
        }
        let open = snapshot.open_positions.len();
        if open >= self.max_positions {
            return Ok(HookResult::block(format!(
                "{} open positions reaches limit {} for {}",
                open, self.max_positions, ctx.domain
            )));
        }
        Ok(HookResult::proceed())
    }
}

/// Shrinks an action to at most a fraction of the domain balance
#[derive(Debug, Clone)]
pub struct BalanceFractionHook {
    pub max_fraction: Decimal,
}

#[async_trait]
impl Hook for BalanceFractionHook {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        let (Some(decision), Some(snapshot)) = (ctx.decision(), ctx.snapshot.as_ref()) else {
            return Ok(HookResult::proceed());
        };
        let Some(amount) = decision.amount else {
            return Ok(HookResult::proceed());
        };
        if !increases_exposure(&decision.action) {
            return Ok(HookResult::proceed());
        }

        let cap = (snapshot.balance * self.max_fraction).max(Decimal::ZERO);
        if cap.is_zero() {
            return Ok(HookResult::block(format!(
                "no balance available in {} for amount {}",
                ctx.domain, amount
            )));
        }
        if amount <= cap {
            return Ok(HookResult::proceed());
        }

        let mut clamped = decision.clone();
        clamped.amount = Some(cap);
        Ok(HookResult::modify(HookPayload::Decision(clamped))
            .with_reason(format!("amount {} clamped to {}", amount, cap))
            .with_metadata("clamped_from", json!(amount.to_string())))
    }
}

/// Blocks new exposure once drawdown from peak exceeds a limit
///
/// Reads balances from persistence at run time, so it may observe a
/// sibling domain's half-applied update within the same cycle.
pub struct DrawdownHook {
    persistence: Arc<dyn Persistence>,
    domains: Vec<String>,
    global_limit: Option<Decimal>,
    domain_limits: HashMap<String, Decimal>,
}

impl DrawdownHook {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        domains: Vec<String>,
        global_limit: Option<Decimal>,
        domain_limits: HashMap<String, Decimal>,
    ) -> Self {
        Self {
            persistence,
            domains,
            global_limit,
            domain_limits,
        }
    }

    async fn global_drawdown(&self) -> Result<Decimal> {
        let mut balance = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        for domain in &self.domains {
            balance += self.persistence.balance(domain).await?;
            peak += self.persistence.peak_balance(domain).await?;
        }
        Ok(drawdown_percent(balance, peak))
    }
}

#[async_trait]
impl Hook for DrawdownHook {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        let Some(decision) = ctx.decision() else {
            return Ok(HookResult::proceed());
        };
        if !increases_exposure(&decision.action) {
            return Ok(HookResult::proceed());
        }

        if let Some(limit) = self.domain_limits.get(&ctx.domain) {
            let balance = self.persistence.balance(&ctx.domain).await?;
            let peak = self.persistence.peak_balance(&ctx.domain).await?;
            let drawdown = drawdown_percent(balance, peak);
            if drawdown > *limit {
                return Ok(HookResult::block(format!(
                    "{} drawdown {}% exceeds limit {}%",
                    ctx.domain,
                    drawdown.round_dp(2),
                    limit
                )));
            }
        }

        if let Some(limit) = self.global_limit {
            let drawdown = self.global_drawdown().await?;
            if drawdown > limit {
                return Ok(HookResult::block(format!(
                    "global drawdown {}% exceeds limit {}%",
                    drawdown.round_dp(2),
                    limit
                )));
            }
        }

        Ok(HookResult::proceed())
    }
}

/// Logs executed and failed decisions
#[derive(Debug, Clone, Default)]
pub struct AuditLogHook;

#[async_trait]
impl Hook for AuditLogHook {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        match &ctx.payload {
            HookPayload::Executed { decision, report } if report.success => {
                info!(
                    domain = %ctx.domain,
                    action = %decision.action,
                    target = ?decision.target,
                    amount = ?decision.amount,
                    confidence = decision.confidence,
                    "Decision executed"
                );
            }
            payload => {
                warn!(
                    domain = %ctx.domain,
                    action = ?payload.decision().map(|d| d.action.to_string()),
                    error = ?ctx.error,
                    "Decision execution failed"
                );
            }
        }
        Ok(HookResult::proceed())
    }
}

/// Register the hooks enabled by `policy`; returns how many were added
pub fn register_policy_hooks(
    registry: &HookRegistry,
    policy: &PolicyConfig,
    persistence: Arc<dyn Persistence>,
    domains: &[String],
) -> usize {
    let mut entries = Vec::new();

    if policy.max_drawdown_pct.is_some() || !policy.domain_drawdown_pct.is_empty() {
        entries.push(HookEntry::new(
            "drawdown-limit",
            HookEvent::PreDecision,
            DRAWDOWN_PRIORITY,
            DrawdownHook::new(
                persistence,
                domains.to_vec(),
                policy.max_drawdown_pct,
                policy.domain_drawdown_pct.clone(),
            ),
        ));
    }
    if let Some(ceiling) = policy.max_action_amount {
        entries.push(HookEntry::new(
            "amount-ceiling",
            HookEvent::PreDecision,
            AMOUNT_CEILING_PRIORITY,
            AmountCeilingHook { ceiling },
        ));
    }
    if let Some(threshold) = policy.approval_threshold {
        entries.push(HookEntry::new(
            "approval-threshold",
            HookEvent::PreDecision,
            APPROVAL_PRIORITY,
            ApprovalThresholdHook { threshold },
        ));
    }
    if let Some(max_positions) = policy.max_positions_per_domain {
        entries.push(HookEntry::new(
            "max-positions",
            HookEvent::PreDecision,
            MAX_POSITIONS_PRIORITY,
            MaxPositionsHook { max_positions },
        ));
    }
    if let Some(max_fraction) = policy.max_balance_fraction {
        entries.push(HookEntry::new(
            "balance-fraction",
            HookEvent::PreDecision,
            BALANCE_FRACTION_PRIORITY,
            BalanceFractionHook { max_fraction },
        ));
    }
    entries.push(HookEntry::new(
        "audit-executed",
        HookEvent::PostDecision,
        AUDIT_PRIORITY,
        AuditLogHook,
    ));
    entries.push(HookEntry::new(
        "audit-failed",
        HookEvent::ExecutionFailed,
        AUDIT_PRIORITY,
        AuditLogHook,
    ));

    entries
        .into_iter()
        .filter(|entry| registry.register(entry.clone()))
        .count()
}
