//! Change classification between desired and recorded state

use crate::scope::ResourceInstance;
use crate::types::ResourceType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// What a run will do with one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// No recorded state
    Create,
    /// Recorded props differ from the desired ones
    Update,
    /// Recorded props equal the desired ones; lifecycle skipped
    Noop,
    /// Recorded but no longer declared
    Delete,
}

/// Classify a resource by deep comparison of its resolved props
pub fn classify(prior: Option<&ResourceInstance>, resolved_props: &Value) -> Action {
    match prior {
        None => Action::Create,
        Some(instance) if instance.props == *resolved_props => Action::Noop,
        Some(_) => Action::Update,
    }
}

/// Top-level prop keys whose values differ
pub fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    match (before.as_object(), after.as_object()) {
        (Some(b), Some(a)) => {
            let keys: BTreeSet<&String> = b.keys().chain(a.keys()).collect();
            keys.into_iter()
                .filter(|k| b.get(*k) != a.get(*k))
                .cloned()
                .collect()
        }
        _ if before == after => Vec::new(),
        _ => vec![String::new()],
    }
}

/// A planned change for one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDiff {
    /// Resource id
    pub resource_id: String,
    /// Type of the resource
    pub resource_type: ResourceType,
    /// Planned action
    pub action: Action,
    /// Recorded props, if any
    pub current: Option<Value>,
    /// Desired props; references are resolved where the target already exists
    pub desired: Option<Value>,
    /// Whether the desired props still reference resources that change in
    /// this run, so the final comparison happens at apply time
    pub pending_references: bool,
}

impl ResourceDiff {
    /// Check if this diff represents an addition
    pub fn is_addition(&self) -> bool {
        self.action == Action::Create
    }

    /// Check if this diff represents a removal
    pub fn is_removal(&self) -> bool {
        self.action == Action::Delete
    }

    /// Check if this diff represents a modification
    pub fn is_modification(&self) -> bool {
        self.action == Action::Update
    }

    /// Check if nothing changes
    pub fn is_noop(&self) -> bool {
        self.action == Action::Noop
    }

    /// Top-level fields that change, for updates
    pub fn changed_fields(&self) -> Vec<String> {
        match (&self.current, &self.desired) {
            (Some(before), Some(after)) if self.is_modification() => {
                changed_fields(before, after)
            }
            _ => Vec::new(),
        }
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Number of resources to create
    pub additions: usize,
    /// Number of resources to delete
    pub removals: usize,
    /// Number of resources to update
    pub modifications: usize,
    /// Number of resources left untouched
    pub unchanged: usize,
}

impl DiffSummary {
    /// Create a summary from a list of diffs
    pub fn from_diffs(diffs: &[ResourceDiff]) -> Self {
        let mut summary = Self::default();
        for diff in diffs {
            match diff.action {
                Action::Create => summary.additions += 1,
                Action::Delete => summary.removals += 1,
                Action::Update => summary.modifications += 1,
                Action::Noop => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.removals + self.modifications
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Group diffs by resource type
pub fn group_by_type(
    diffs: &[ResourceDiff],
) -> std::collections::BTreeMap<String, Vec<&ResourceDiff>> {
    let mut groups: std::collections::BTreeMap<String, Vec<&ResourceDiff>> =
        std::collections::BTreeMap::new();
    for diff in diffs {
        groups
            .entry(diff.resource_type.to_string())
            .or_default()
            .push(diff);
    }
    groups
}
