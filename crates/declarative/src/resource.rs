//! Resource definitions and the lifecycle registry
//!
//! A resource type is bound to exactly one lifecycle function which handles
//! create, update and delete by matching on [`Context::phase`].
//!
//! # Example
//!
//! ```ignore
//! use declarative::{Context, Lifecycle, Phase, Registry};
//! use serde_json::{json, Value};
//!
//! struct Bucket;
//!
//! #[async_trait::async_trait]
//! impl Lifecycle for Bucket {
//!     async fn run(&self, ctx: &Context, id: &str, props: &Value) -> anyhow::Result<Value> {
//!         match ctx.phase() {
//!             Phase::Create => Ok(json!({ "id": id, "name": props["name"] })),
//!             Phase::Update => {
//!                 ctx.ensure_unchanged(props, "name")?;
//!                 Ok(ctx.prior_output().cloned().unwrap_or_default())
//!             }
//!             Phase::Delete => Ok(Value::Null),
//!         }
//!     }
//! }
//!
//! let mut registry = Registry::new();
//! registry.define("aws::Bucket", Bucket)?;
//! ```

use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::ResourceType;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Asynchronous lifecycle function of one resource type
///
/// Implementations must be idempotent under retry: re-running `Create` with
/// the same props must not duplicate the external entity (check before
/// creating, or rely on a provider-native upsert). All external I/O happens
/// here; errors are passed to the orchestrator unmodified.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Run the phase given by `ctx` and return the observed output
    ///
    /// The output of a `Delete` call is discarded.
    async fn run(&self, ctx: &Context, id: &str, props: &Value) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`Lifecycle`]
pub struct FnLifecycle<F>(F);

/// Wrap an async closure `(context, id, props) -> output` as a lifecycle
pub fn lifecycle_fn<F, Fut>(f: F) -> FnLifecycle<F>
where
    F: Fn(Context, String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnLifecycle(f)
}

#[async_trait]
impl<F, Fut> Lifecycle for FnLifecycle<F>
where
    F: Fn(Context, String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(&self, ctx: &Context, id: &str, props: &Value) -> anyhow::Result<Value> {
        (self.0)(ctx.clone(), id.to_string(), props.clone()).await
    }
}

/// A resource type bound to its lifecycle function
#[derive(Clone)]
pub struct ResourceDefinition {
    resource_type: ResourceType,
    lifecycle: Arc<dyn Lifecycle>,
    immutable: Vec<String>,
    timeout: Option<Duration>,
}

impl ResourceDefinition {
    /// Create a definition for a `provider::resource` tag
    pub fn new<L: Lifecycle + 'static>(resource_type: &str, lifecycle: L) -> Result<Self> {
        Ok(Self {
            resource_type: ResourceType::new(resource_type)?,
            lifecycle: Arc::new(lifecycle),
            immutable: Vec::new(),
            timeout: None,
        })
    }

    /// Declare props that may not change after creation
    ///
    /// The orchestrator checks these before invoking `Update`.
    pub fn with_immutable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Default timeout for invocations of this type
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    pub fn lifecycle(&self) -> Arc<dyn Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    pub fn immutable_fields(&self) -> &[String] {
        &self.immutable
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run the immutable-field checks for an update
    pub fn check_immutable(&self, ctx: &Context, props: &Value) -> Result<()> {
        for field in &self.immutable {
            ctx.ensure_unchanged(props, field)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("resource_type", &self.resource_type)
            .field("immutable", &self.immutable)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Mapping from type tag to definition
#[derive(Debug, Clone, Default)]
pub struct Registry {
    definitions: HashMap<ResourceType, ResourceDefinition>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `resource_type` to `lifecycle`
    ///
    /// Fails with [`Error::DuplicateType`] if the type is already defined.
    pub fn define<L: Lifecycle + 'static>(&mut self, resource_type: &str, lifecycle: L) -> Result<()> {
        self.register(ResourceDefinition::new(resource_type, lifecycle)?)
    }

    /// Add a fully configured definition
    pub fn register(&mut self, definition: ResourceDefinition) -> Result<()> {
        if self.definitions.contains_key(definition.resource_type()) {
            return Err(Error::DuplicateType(definition.resource_type().to_string()));
        }
        log::debug!("Defined resource type {}", definition.resource_type());
        self.definitions
            .insert(definition.resource_type().clone(), definition);
        Ok(())
    }

    /// Look up a definition
    pub fn get(&self, resource_type: &ResourceType) -> Option<&ResourceDefinition> {
        self.definitions.get(resource_type)
    }

    /// Whether a type is defined
    pub fn contains(&self, resource_type: &ResourceType) -> bool {
        self.definitions.contains_key(resource_type)
    }

    /// Registered type tags, sorted
    pub fn types(&self) -> Vec<&ResourceType> {
        let mut types: Vec<_> = self.definitions.keys().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
