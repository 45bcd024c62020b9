use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

use crate::common::errors::Result;
use crate::common::traits::Persistence;
use crate::common::types::{DecisionRecord, Position};

/// Default number of decision records kept per domain
pub const DEFAULT_HISTORY_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, Default)]
struct Balance {
    current: Decimal,
    peak: Decimal,
}

/// Process-local persistence
///
/// Tracks the peak balance on every write so drawdown checks have
/// something to compare against.
#[derive(Debug)]
pub struct InMemoryPersistence {
    balances: RwLock<HashMap<String, Balance>>,
    positions: RwLock<HashMap<String, Vec<Position>>>,
    history: RwLock<HashMap<String, VecDeque<DecisionRecord>>>,
    history_capacity: usize,
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Seed a starting balance, builder style
    pub fn with_balance(self, domain: impl Into<String>, balance: Decimal) -> Self {
        self.balances.write().insert(
            domain.into(),
            Balance {
                current: balance,
                peak: balance,
            },
        );
        self
    }

    /// Total number of decision records across domains
    pub fn decision_count(&self) -> usize {
        self.history.read().values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn balance(&self, domain: &str) -> Result<Decimal> {
        Ok(self
            .balances
            .read()
            .get(domain)
            .map(|b| b.current)
            .unwrap_or_default())
    }

    async fn peak_balance(&self, domain: &str) -> Result<Decimal> {
        Ok(self
            .balances
            .read()
            .get(domain)
            .map(|b| b.peak)
            .unwrap_or_default())
    }

    async fn set_balance(&self, domain: &str, balance: Decimal) -> Result<()> {
        let mut balances = self.balances.write();
        let entry = balances.entry(domain.to_string()).or_default();
        entry.current = balance;
        entry.peak = entry.peak.max(balance);
        Ok(())
    }

    async fn open_positions(&self, domain: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_positions(&self, domain: &str, positions: Vec<Position>) -> Result<()> {
        self.positions.write().insert(domain.to_string(), positions);
        Ok(())
    }

    async fn recent_decisions(&self, domain: &str, limit: usize) -> Result<Vec<DecisionRecord>> {
        Ok(self
            .history
            .read()
            .get(domain)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn record_decision(&self, record: DecisionRecord) -> Result<()> {
        let mut history = self.history.write();
        let records = history.entry(record.decision.domain.clone()).or_default();
        if records.len() >= self.history_capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Decision, Outcome};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(domain: &str, rationale: &str) -> DecisionRecord {
        DecisionRecord {
            decision: Decision::no_op(domain, rationale),
            outcome: Outcome::Success,
            fingerprint: None,
            report: None,
            cycle: 1,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_peak_balance_tracks_highest() {
        let store = InMemoryPersistence::new().with_balance("spot", dec!(100));
        store.set_balance("spot", dec!(150)).await.unwrap();
        store.set_balance("spot", dec!(90)).await.unwrap();

        assert_eq!(store.balance("spot").await.unwrap(), dec!(90));
        assert_eq!(store.peak_balance("spot").await.unwrap(), dec!(150));
        assert_eq!(store.balance("unknown").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_recent_decisions_newest_first_and_bounded() {
        let store = InMemoryPersistence::with_history_capacity(3);
        for i in 0..5 {
            store.record_decision(record("spot", &format!("r{i}"))).await.unwrap();
        }
        store.record_decision(record("perps", "other")).await.unwrap();

        let recent = store.recent_decisions("spot", 2).await.unwrap();
        let rationales: Vec<_> = recent.iter().map(|r| r.decision.rationale.as_str()).collect();
        assert_eq!(rationales, vec!["r4", "r3"]);
        assert_eq!(store.decision_count(), 4);
    }
}
