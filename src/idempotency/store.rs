//! Durable backing for idempotency records

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::common::errors::{OrchestratorError, Result};
use crate::common::types::ActionKind;

/// Lifecycle of a reservation
///
/// Released reservations are deleted outright, so only these two states
/// are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Reserved,
    Completed,
}

/// One fingerprinted action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub domain: String,
    pub action: ActionKind,
    pub target: Option<String>,
    pub amount: Option<Decimal>,
    pub state: ReservationState,
    /// Result attached on completion, returned to later duplicates
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where the guard writes its records
///
/// Calls happen while the guard holds its lock, so implementations should
/// be quick and must not call back into the guard.
pub trait IdempotencyStore: Send + Sync {
    fn load(&self) -> Result<Vec<IdempotencyRecord>>;

    fn upsert(&self, record: &IdempotencyRecord) -> Result<()>;

    fn delete(&self, keys: &[String]) -> Result<()>;
}

/// Non-durable store; records vanish with the process
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl IdempotencyStore for InMemoryStore {
    fn load(&self) -> Result<Vec<IdempotencyRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn upsert(&self, record: &IdempotencyRecord) -> Result<()> {
        self.records
            .lock()
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        let mut records = self.records.lock();
        for key in keys {
            records.remove(key);
        }
        Ok(())
    }
}

/// Keeps every record in one JSON file, rewritten on each change
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl JsonFileStore {
    /// Open the store, reading any existing file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                let list: Vec<IdempotencyRecord> = serde_json::from_str(&raw)?;
                list.into_iter().map(|r| (r.key.clone(), r)).collect()
            }
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), records = records.len(), "Opened idempotency store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, records: &HashMap<String, IdempotencyRecord>) -> Result<()> {
        let mut list: Vec<&IdempotencyRecord> = records.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&list)?)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            OrchestratorError::Persistence(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl IdempotencyStore for JsonFileStore {
    fn load(&self) -> Result<Vec<IdempotencyRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn upsert(&self, record: &IdempotencyRecord) -> Result<()> {
        let mut records = self.records.lock();
        let previous = records.insert(record.key.clone(), record.clone());
        if let Err(e) = self.flush(&records) {
            match previous {
                Some(previous) => records.insert(record.key.clone(), previous),
                None => records.remove(&record.key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        let mut records = self.records.lock();
        let before = records.len();
        for key in keys {
            records.remove(key);
        }
        if records.len() == before {
            return Ok(());
        }
        self.flush(&records)
    }
}
