//! Invocation context and observer traits
//!
//! A [`Context`] is handed to every lifecycle call. Observers let a frontend
//! follow a run without the core depending on any UI crate.

use crate::error::Error;
use crate::types::{Outcome, Phase, ResourceType};
use serde_json::Value;

/// Read-only view handed to a single lifecycle invocation
#[derive(Debug, Clone)]
pub struct Context {
    scope: String,
    resource_type: ResourceType,
    phase: Phase,
    prior_props: Option<Value>,
    prior_output: Option<Value>,
}

impl Context {
    /// Context for a resource with no recorded state
    pub fn create(scope: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            scope: scope.into(),
            resource_type,
            phase: Phase::Create,
            prior_props: None,
            prior_output: None,
        }
    }

    /// Context for a resource with recorded state
    pub fn with_prior(
        scope: impl Into<String>,
        resource_type: ResourceType,
        phase: Phase,
        prior_props: Value,
        prior_output: Value,
    ) -> Self {
        Self {
            scope: scope.into(),
            resource_type,
            phase,
            prior_props: Some(prior_props),
            prior_output: Some(prior_output),
        }
    }

    /// Lifecycle phase being executed
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Scope the instance belongs to
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Type of the instance
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Last successfully recorded output, absent on create
    pub fn prior_output(&self) -> Option<&Value> {
        self.prior_output.as_ref()
    }

    /// Last successfully recorded props, absent on create
    pub fn prior_props(&self) -> Option<&Value> {
        self.prior_props.as_ref()
    }

    /// Recorded value of `field`, preferring output over props
    pub fn prior_value(&self, field: &str) -> Option<&Value> {
        self.prior_output
            .as_ref()
            .and_then(|o| o.get(field))
            .or_else(|| self.prior_props.as_ref().and_then(|p| p.get(field)))
    }

    /// Fail with [`Error::ImmutableProperty`] if `field` changed on update
    ///
    /// A no-op outside [`Phase::Update`] or when nothing was recorded for the
    /// field.
    pub fn ensure_unchanged(&self, props: &Value, field: &str) -> Result<(), Error> {
        if self.phase != Phase::Update {
            return Ok(());
        }
        let Some(old) = self.prior_value(field) else {
            return Ok(());
        };
        let new = props.get(field).cloned().unwrap_or(Value::Null);
        if *old != new {
            return Err(Error::ImmutableProperty {
                field: field.to_string(),
                old: old.clone(),
                new,
            });
        }
        Ok(())
    }
}

/// Progress callback for runs
///
/// Called from the scheduling loop only, never from inside an invocation.
pub trait RunObserver: Send {
    /// Called when a run starts with the number of resources it covers
    fn on_run_start(&mut self, total: usize);

    /// Called right before a lifecycle function is invoked
    fn on_resource_start(&mut self, id: &str, phase: Phase);

    /// Called once per resource with its final outcome
    fn on_resource_complete(&mut self, id: &str, outcome: &Outcome);

    /// Called when the run finishes
    fn on_run_complete(&mut self);
}

/// Observer that forwards events to the `log` facade
///
/// Used by [`Orchestrator::apply`](crate::Orchestrator::apply) and
/// [`Orchestrator::destroy`](crate::Orchestrator::destroy).
pub struct LogProgress;

impl RunObserver for LogProgress {
    fn on_run_start(&mut self, total: usize) {
        log::info!("Run started with {total} resources");
    }

    fn on_resource_start(&mut self, id: &str, phase: Phase) {
        log::info!("{phase} {id}");
    }

    fn on_resource_complete(&mut self, id: &str, outcome: &Outcome) {
        if outcome.is_success() {
            log::info!("{id}: {outcome}");
        } else {
            log::warn!("{id}: {outcome}");
        }
    }

    fn on_run_complete(&mut self) {
        log::info!("Run complete");
    }
}
