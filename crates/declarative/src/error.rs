//! Error types for resource lifecycle orchestration.
//!
//! Setup errors (registration conflicts, unknown types, cycles) are returned
//! before anything is invoked. Per-resource errors end up inside a
//! [`RunResult`](crate::RunResult) as [`Outcome::Failed`](crate::Outcome).

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the lifecycle core.
#[derive(Debug, Error)]
pub enum Error {
    /// A lifecycle function is already registered for this type
    #[error("resource type already defined: {0}")]
    DuplicateType(String),

    /// An id is declared or registered twice
    #[error("duplicate resource id '{id}' in {within}")]
    DuplicateId {
        /// The duplicated id
        id: String,
        /// Where it collided ("scope 'dev'", "desired graph")
        within: String,
    },

    /// Type tag is not of the form `provider::resource`
    #[error("invalid resource type '{0}': expected 'provider::resource'")]
    InvalidType(String),

    /// No lifecycle function registered for a declared or recorded type
    #[error("no lifecycle defined for resource type '{resource_type}' (resource '{id}')")]
    UnknownType {
        /// Resource carrying the unknown type
        id: String,
        /// The type tag
        resource_type: String,
    },

    /// A reference points at an id that is not part of the desired graph
    #[error("resource '{id}' references unknown resource '{target}'")]
    UnknownReference {
        /// Referencing resource
        id: String,
        /// Missing referenced id
        target: String,
    },

    /// The declared type differs from the type recorded for the same id
    #[error("resource '{id}' was created as '{recorded}' and cannot become '{declared}'")]
    TypeChanged {
        /// Resource id
        id: String,
        /// Type stored in state
        recorded: String,
        /// Type in the desired graph
        declared: String,
    },

    /// The dependency graph contains a cycle
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Participating ids, first id repeated at the end
        cycle: Vec<String>,
    },

    /// An immutable property changed on update
    #[error("immutable property '{field}' cannot change from {old} to {new}")]
    ImmutableProperty {
        /// Property name
        field: String,
        /// Recorded value
        old: Value,
        /// Attempted value
        new: Value,
    },

    /// A lifecycle invocation exceeded its allotted duration
    #[error("resource '{id}' timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Resource id
        id: String,
        /// Configured limit
        after: Duration,
    },

    /// The run was cancelled before the invocation could start
    #[error("run cancelled")]
    Cancelled,

    /// A reference could not be resolved against the referenced output
    #[error("resource '{id}' cannot resolve '{attr}' from '{target}'")]
    UnresolvedReference {
        /// Referencing resource
        id: String,
        /// Referenced resource
        target: String,
        /// Missing output attribute
        attr: String,
    },

    /// State store read/write failure
    #[error("state store error: {0}")]
    Store(String),

    /// Failure raised by a provider lifecycle function
    #[error("resource '{id}' failed: {source:#}")]
    Provider {
        /// Resource id
        id: String,
        /// Provider error, passed through unmodified
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    /// Build the error for a failed lifecycle call.
    ///
    /// Lifecycle functions return `anyhow::Error`; when it wraps one of our own
    /// variants (for example from [`Context::ensure_unchanged`](crate::Context::ensure_unchanged))
    /// that variant is surfaced as-is.
    pub fn from_lifecycle(id: &str, err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(source) => Error::Provider {
                id: id.to_string(),
                source,
            },
        }
    }
}

/// Result type for lifecycle core operations.
pub type Result<T> = std::result::Result<T, Error>;
