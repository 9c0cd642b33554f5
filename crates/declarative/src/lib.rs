//! # Declarative
//!
//! Resource lifecycle orchestration: declare the resources you want, record
//! what exists, and converge one into the other in dependency order.
//!
//! ## Core Concepts
//!
//! - **Lifecycle**: one async function per resource type handling create,
//!   update and delete
//! - **DesiredGraph**: resources declared by the current run; props may
//!   reference other resources with `{"$ref": "<id>", "attr": "<field>"}`
//! - **Scope**: registration-ordered record of live instances, persisted
//!   through a [`StateStore`]
//! - **Orchestrator**: diffs desired against recorded state and invokes
//!   lifecycles concurrently, dependencies first
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{Context, Declaration, DesiredGraph, MemoryStore, Orchestrator, Phase, Registry, lifecycle_fn};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! let mut registry = Registry::new();
//! registry.define("aws::Bucket", lifecycle_fn(|ctx: Context, id: String, props: Value| async move {
//!     match ctx.phase() {
//!         Phase::Create | Phase::Update => Ok(json!({ "id": id, "name": props["name"] })),
//!         Phase::Delete => Ok(Value::Null),
//!     }
//! }))?;
//!
//! let desired = DesiredGraph::new()
//!     .with(Declaration::new("logs", "aws::Bucket", json!({ "name": "logs" }))?)?
//!     .with(Declaration::new("policy", "aws::BucketPolicy", json!({ "bucket": { "$ref": "logs" } }))?)?;
//!
//! let orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(MemoryStore::new()));
//! let mut scope = orchestrator.open_scope("dev").await?;
//! let result = orchestrator.apply(&mut scope, &desired).await?;
//! ```
//!
//! ## Observers
//!
//! [`RunObserver`] receives progress events from the scheduling loop so the
//! crate carries no UI dependency. [`LogProgress`], the default for `apply`
//! and `destroy`, forwards them to `log`.

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod lock;
pub mod planner;
pub mod reference;
pub mod resource;
pub mod retry;
pub mod scope;
pub mod store;
pub mod types;

// Re-export main types at crate root
pub use context::{Context, LogProgress, RunObserver};
pub use diff::{Action, DiffSummary, ResourceDiff, group_by_type};
pub use error::{Error, Result};
pub use executor::Orchestrator;
pub use graph::{Declaration, DependencyGraph, DesiredGraph};
pub use lock::IdLocks;
pub use planner::ExecutionPlan;
pub use reference::Reference;
pub use resource::{FnLifecycle, Lifecycle, Registry, ResourceDefinition, lifecycle_fn};
pub use scope::{ResourceInstance, Scope};
pub use store::{MemoryStore, StateRecord, StateStore};
pub use types::{
    Outcome, Phase, ResourceOutcome, ResourceType, RunOptions, RunResult, RunSummary, SkipReason,
};
