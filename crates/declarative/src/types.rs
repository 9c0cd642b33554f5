//! Core types for resource lifecycle management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Type tag of the form `provider::resource`, e.g. `aws::Bucket`
///
/// Routes later operations on an instance to the lifecycle that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceType(String);

impl ResourceType {
    /// Parse and validate a type tag
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        let valid = match tag.split_once("::") {
            Some((provider, resource)) => is_segment(provider) && is_segment(resource),
            None => false,
        };
        if !valid {
            return Err(Error::InvalidType(tag));
        }
        Ok(Self(tag))
    }

    /// The full tag
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The provider half (`aws` in `aws::Bucket`)
    pub fn provider(&self) -> &str {
        self.0.split_once("::").map_or("", |(p, _)| p)
    }

    /// The resource half (`Bucket` in `aws::Bucket`)
    pub fn resource(&self) -> &str {
        self.0.split_once("::").map_or("", |(_, r)| r)
    }
}

fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ResourceType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.0
    }
}

/// Lifecycle phase passed to a lifecycle function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Why a resource was not processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A resource it depends on (apply) or that depends on it (destroy) did not succeed
    Blocked { by: String },
    /// The run was cancelled before it started
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { by } => write!(f, "blocked by '{by}'"),
            Self::Cancelled => f.write_str("run cancelled"),
        }
    }
}

/// Per-resource outcome of a run
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Resource was created
    Created,
    /// Resource was updated
    Updated,
    /// Resource was deleted
    Deleted,
    /// Props matched recorded state, lifecycle not invoked
    Noop,
    /// Lifecycle invocation failed
    Failed(Arc<Error>),
    /// Resource was not processed
    Skipped(SkipReason),
}

impl Outcome {
    /// Check if the outcome represents success (no failure, not skipped)
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Deleted | Self::Noop
        )
    }

    /// Check if the outcome represents a change
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }

    /// The failure, if any
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
            Self::Deleted => f.write_str("deleted"),
            Self::Noop => f.write_str("unchanged"),
            Self::Failed(err) => write!(f, "failed: {err}"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

/// Outcome for a single resource id
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    pub id: String,
    pub resource_type: ResourceType,
    pub outcome: Outcome,
}

/// Aggregated result of `apply` or `destroy`
///
/// Outcomes are kept in completion order.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub outcomes: Vec<ResourceOutcome>,
}

impl RunResult {
    pub(crate) fn push(&mut self, id: &str, resource_type: &ResourceType, outcome: Outcome) {
        self.outcomes.push(ResourceOutcome {
            id: id.to_string(),
            resource_type: resource_type.clone(),
            outcome,
        });
    }

    /// Outcome recorded for an id
    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.id == id)
            .map(|o| &o.outcome)
    }

    /// Ids that completed without error
    pub fn succeeded(&self) -> Vec<&str> {
        self.ids_where(Outcome::is_success)
    }

    /// Ids whose lifecycle call failed
    pub fn failed(&self) -> Vec<&str> {
        self.ids_where(|o| matches!(o, Outcome::Failed(_)))
    }

    /// Ids that were never processed
    pub fn skipped(&self) -> Vec<&str> {
        self.ids_where(|o| matches!(o, Outcome::Skipped(_)))
    }

    /// Failed ids paired with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.outcome.error().map(|e| (o.id.as_str(), e)))
    }

    /// Check if the run was fully successful (nothing failed or skipped)
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.is_success())
    }

    /// Count outcomes by kind
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for o in &self.outcomes {
            summary.add(&o.outcome);
        }
        summary
    }

    fn ids_where(&self, pred: impl Fn(&Outcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| pred(&o.outcome))
            .map(|o| o.id.as_str())
            .collect()
    }
}

/// Summary counts of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub noop: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.noop + self.failed + self.skipped
    }

    /// Check if execution was fully successful
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Add a result to the summary
    pub fn add(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::Noop => self.noop += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::Skipped(_) => self.skipped += 1,
        }
    }
}

/// Options for a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of lifecycle invocations in flight
    pub concurrency: usize,
    /// Fallback invocation timeout when neither declaration nor definition sets one
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout: None,
        }
    }
}
