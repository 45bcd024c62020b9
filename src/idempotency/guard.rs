use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::fingerprint::Fingerprinter;
use super::store::{IdempotencyRecord, IdempotencyStore, InMemoryStore, ReservationState};
use crate::common::clock::{system_clock, to_chrono, SharedClock};
use crate::common::errors::Result;
use crate::common::types::ActionKind;
use crate::config::types::IdempotencyConfig;

/// Answer to a reservation attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationOutcome {
    pub is_duplicate: bool,
    pub key: String,
    /// Stored result of the earlier action, when it completed
    pub previous_result: Option<Value>,
}

#[derive(Debug, Default)]
struct GuardState {
    records: HashMap<String, IdempotencyRecord>,
    /// Keys reserved by this process and not yet completed or removed
    in_flight: HashSet<String>,
}

/// Prevents the same logical action from executing twice
///
/// Check-then-create happens under one lock, so concurrent callers with
/// identical inputs see exactly one successful reservation.
pub struct IdempotencyGuard {
    state: Mutex<GuardState>,
    store: Arc<dyn IdempotencyStore>,
    fingerprinter: Fingerprinter,
    retention: Duration,
    clock: SharedClock,
}

impl IdempotencyGuard {
    pub fn new(retention: Duration) -> Self {
        Self::with_store(retention, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(retention: Duration, store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            state: Mutex::new(GuardState::default()),
            store,
            fingerprinter: Fingerprinter::default(),
            retention,
            clock: system_clock(),
        }
    }

    pub fn from_config(config: &IdempotencyConfig, store: Arc<dyn IdempotencyStore>) -> Self {
        Self::with_store(config.retention(), store).with_bucket(config.bucket())
    }

    pub fn with_bucket(mut self, bucket: Option<Duration>) -> Self {
        self.fingerprinter = Fingerprinter::new(bucket);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Compute the key these inputs would reserve under, without reserving
    pub fn key_for(
        &self,
        domain: &str,
        action: &ActionKind,
        target: Option<&str>,
        amount: Option<Decimal>,
    ) -> String {
        self.fingerprinter
            .key(domain, action, target, amount, self.clock.now())
    }

    fn is_expired(&self, record: &IdempotencyRecord) -> bool {
        self.clock.now() - record.created_at >= to_chrono(self.retention)
    }

    /// Atomically detect a duplicate or reserve a fresh fingerprint
    ///
    /// # Returns
    /// * `is_duplicate == true` - An unexpired record exists; nothing was
    ///   created and `previous_result` carries its result, if any
    /// * `is_duplicate == false` - A `reserved` record now exists under `key`
    pub fn check_and_reserve(
        &self,
        domain: &str,
        action: &ActionKind,
        target: Option<&str>,
        amount: Option<Decimal>,
    ) -> Result<ReservationOutcome> {
        let now = self.clock.now();
        let key = self.fingerprinter.key(domain, action, target, amount, now);
        let mut state = self.state.lock();

        if let Some(existing) = state.records.get(&key) {
            if !self.is_expired(existing) {
                debug!(%domain, key = %key, state = ?existing.state, "Duplicate action detected");
                return Ok(ReservationOutcome {
                    is_duplicate: true,
                    previous_result: existing.result.clone(),
                    key,
                });
            }
        }

        let record = IdempotencyRecord {
            key: key.clone(),
            domain: domain.to_string(),
            action: action.clone(),
            target: target.map(str::to_string),
            amount,
            state: ReservationState::Reserved,
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert(&record)?;
        state.records.insert(key.clone(), record);
        state.in_flight.insert(key.clone());

        Ok(ReservationOutcome {
            is_duplicate: false,
            key,
            previous_result: None,
        })
    }

    /// Mark a reservation completed and attach its result
    ///
    /// Returns `false` when no record exists for `key`.
    pub fn update_result(&self, key: &str, result: Value) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(existing) = state.records.get(key) else {
            warn!(key = %key, "No idempotency record to complete");
            return Ok(false);
        };

        let mut updated = existing.clone();
        updated.state = ReservationState::Completed;
        updated.result = Some(result);
        updated.updated_at = self.clock.now();
        self.store.upsert(&updated)?;

        state.records.insert(key.to_string(), updated);
        state.in_flight.remove(key);
        Ok(true)
    }

    /// Delete a reservation so the action may be retried
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.records.contains_key(key) {
            return Ok(false);
        }
        self.store.delete(&[key.to_string()])?;
        state.records.remove(key);
        state.in_flight.remove(key);
        Ok(true)
    }

    /// Delete every expired record that is not mid-reservation
    ///
    /// Returns how many records were removed.
    pub fn sweep(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .records
            .values()
            .filter(|r| self.is_expired(r) && !state.in_flight.contains(&r.key))
            .map(|r| r.key.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        self.store.delete(&expired)?;
        for key in &expired {
            state.records.remove(key);
        }
        debug!(removed = expired.len(), remaining = state.records.len(), "Idempotency sweep");
        Ok(expired.len())
    }

    /// Reload unexpired records from the store
    ///
    /// Reservations left by a crashed process come back as `reserved` and
    /// keep blocking their action until retention expires. Expired records
    /// are purged from the store. Returns how many records were restored.
    pub fn restore(&self) -> Result<usize> {
        let loaded = self.store.load()?;
        let (live, expired): (Vec<_>, Vec<_>) =
            loaded.into_iter().partition(|r| !self.is_expired(r));

        if !expired.is_empty() {
            let keys: Vec<String> = expired.into_iter().map(|r| r.key).collect();
            self.store.delete(&keys)?;
        }

        let mut state = self.state.lock();
        let mut restored = 0;
        for record in live {
            if record.state == ReservationState::Reserved {
                warn!(
                    key = %record.key,
                    domain = %record.domain,
                    "Restored unfinished reservation; treating as possibly executed"
                );
            }
            if state.records.insert(record.key.clone(), record).is_none() {
                restored += 1;
            }
        }
        info!(restored, "Restored idempotency records");
        Ok(restored)
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.state.lock().records.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Number of reservations awaiting completion or removal
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("retention", &self.retention)
            .field("bucket", &self.fingerprinter.bucket())
            .field("records", &self.len())
            .finish()
    }
}
