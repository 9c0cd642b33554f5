//! Persisted state store
//!
//! State is a mapping from `(scope, resource id)` to a [`StateRecord`]. The
//! store is passed explicitly to the orchestrator; every write covers exactly
//! one record so a failure mid-run leaves already applied resources recorded.

use crate::error::{Error, Result};
use crate::types::ResourceType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Recorded state of one resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource id, unique within its scope
    pub id: String,
    /// Type tag routing later operations
    pub resource_type: ResourceType,
    /// Props the last successful call ran with, references resolved
    pub props: Value,
    /// Output of the last successful call
    pub output: Value,
    /// Ids this instance referenced when it was last applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Registration order within the scope
    pub sequence: u64,
    /// Per-declaration timeout in milliseconds, honoured by later deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Last time the record was written
    pub last_updated: DateTime<Utc>,
}

/// Storage backend for state records
///
/// Implementations must make `put` and `remove` atomic per record and support
/// enumerating every record of a scope.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read one record
    async fn get(&self, scope: &str, id: &str) -> Result<Option<StateRecord>>;

    /// Insert or replace one record
    async fn put(&self, scope: &str, record: &StateRecord) -> Result<()>;

    /// Remove one record; removing a missing record is not an error
    async fn remove(&self, scope: &str, id: &str) -> Result<()>;

    /// All records of a scope, ordered by sequence
    async fn list(&self, scope: &str) -> Result<Vec<StateRecord>>;
}

/// In-memory store, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    scopes: Mutex<HashMap<String, BTreeMap<String, StateRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of scopes holding at least one record
    pub fn scopes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<String, StateRecord>>> {
        match self.scopes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, scope: &str, id: &str) -> Result<Option<StateRecord>> {
        Ok(self.lock().get(scope).and_then(|s| s.get(id)).cloned())
    }

    async fn put(&self, scope: &str, record: &StateRecord) -> Result<()> {
        if record.id.is_empty() {
            return Err(Error::Store("record id must not be empty".to_string()));
        }
        self.lock()
            .entry(scope.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, scope: &str, id: &str) -> Result<()> {
        let mut scopes = self.lock();
        if let Some(records) = scopes.get_mut(scope) {
            records.remove(id);
            if records.is_empty() {
                scopes.remove(scope);
            }
        }
        Ok(())
    }

    async fn list(&self, scope: &str) -> Result<Vec<StateRecord>> {
        let mut records: Vec<StateRecord> = self
            .lock()
            .get(scope)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }
}
