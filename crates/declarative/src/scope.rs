//! Scopes: ordered registries of resource instances
//!
//! A scope collects every instance created during one logical run (a test
//! case, a deployment). Registration order is kept so teardown can walk it
//! backwards.

use crate::error::{Error, Result};
use crate::store::{StateRecord, StateStore};
use crate::types::ResourceType;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// A live resource instance recorded in a scope
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInstance {
    pub id: String,
    pub resource_type: ResourceType,
    /// Props of the last successful call, references resolved
    pub props: Value,
    /// Last observed output
    pub output: Value,
    /// Ids this instance references
    pub dependencies: Vec<String>,
    /// Registration order within the scope
    pub sequence: u64,
    /// Timeout the declaration asked for, reused when the instance is deleted
    pub timeout: Option<Duration>,
}

impl ResourceInstance {
    /// Turn the instance into a persistable record
    pub fn to_record(&self, last_updated: DateTime<Utc>) -> StateRecord {
        StateRecord {
            id: self.id.clone(),
            resource_type: self.resource_type.clone(),
            props: self.props.clone(),
            output: self.output.clone(),
            dependencies: self.dependencies.clone(),
            sequence: self.sequence,
            timeout_ms: self
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            last_updated,
        }
    }

    /// Look up an output attribute
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.output.get(name)
    }
}

impl From<StateRecord> for ResourceInstance {
    fn from(record: StateRecord) -> Self {
        Self {
            id: record.id,
            resource_type: record.resource_type,
            props: record.props,
            output: record.output,
            dependencies: record.dependencies,
            sequence: record.sequence,
            timeout: record.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Ordered set of instances belonging to one run
#[derive(Debug, Clone)]
pub struct Scope {
    id: String,
    instances: Vec<ResourceInstance>,
    next_sequence: u64,
}

impl Scope {
    /// Create an empty scope
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instances: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Rebuild a scope from its persisted records
    pub async fn open(id: impl Into<String>, store: &dyn StateStore) -> Result<Self> {
        let mut scope = Self::new(id);
        for record in store.list(&scope.id).await? {
            scope.register(record.into())?;
        }
        log::debug!(
            "Opened scope '{}' with {} instances",
            scope.id,
            scope.instances.len()
        );
        Ok(scope)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add an instance
    ///
    /// Fails with [`Error::DuplicateId`] if the id is already registered.
    /// Instances stay ordered by their sequence number.
    pub fn register(&mut self, instance: ResourceInstance) -> Result<()> {
        if self.contains(&instance.id) {
            return Err(Error::DuplicateId {
                id: instance.id,
                within: format!("scope '{}'", self.id),
            });
        }
        self.next_sequence = self.next_sequence.max(instance.sequence + 1);
        let pos = self
            .instances
            .partition_point(|i| i.sequence <= instance.sequence);
        self.instances.insert(pos, instance);
        Ok(())
    }

    /// Reserve the sequence number for the next registration
    pub fn reserve_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Replace the recorded state of an existing instance
    pub(crate) fn replace(&mut self, instance: ResourceInstance) -> Result<()> {
        match self.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(slot) => {
                *slot = instance;
                Ok(())
            }
            None => self.register(instance),
        }
    }

    /// Drop an instance after it was deleted
    pub(crate) fn forget(&mut self, id: &str) -> Option<ResourceInstance> {
        let pos = self.instances.iter().position(|i| i.id == id)?;
        Some(self.instances.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<&ResourceInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.iter().any(|i| i.id == id)
    }

    /// Instances in registration order
    pub fn instances(&self) -> &[ResourceInstance] {
        &self.instances
    }

    /// Ids in registration order
    pub fn ids(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.id.as_str()).collect()
    }

    /// Ids in teardown order (last registered first)
    pub fn teardown_order(&self) -> Vec<&str> {
        self.instances.iter().rev().map(|i| i.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
