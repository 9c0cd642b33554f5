//! Execution planner - validates a desired graph against a scope and builds
//! the ordered change set

use crate::diff::{Action, ResourceDiff, classify};
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, DesiredGraph};
use crate::reference::resolve_props;
use crate::resource::Registry;
use crate::scope::Scope;
use std::collections::HashMap;

/// Validated change set for one apply
///
/// Building a plan performs every setup check (unknown types and references,
/// type changes, cycles), so a plan that builds can be executed without
/// setup errors.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Scope the plan targets
    pub scope: String,
    /// Dependency graph of the desired resources
    pub graph: DependencyGraph,
    /// Desired ids, dependencies first
    pub apply_order: Vec<String>,
    /// Dependency graph of recorded resources no longer declared
    pub removal_graph: DependencyGraph,
    /// Removed ids, dependents first
    pub removals: Vec<String>,
    /// Per-resource diffs, apply order followed by removals
    pub diffs: Vec<ResourceDiff>,
}

impl ExecutionPlan {
    /// Validate `desired` against `scope` and classify every resource
    pub fn build(registry: &Registry, scope: &Scope, desired: &DesiredGraph) -> Result<Self> {
        for decl in desired.resources() {
            if !registry.contains(&decl.resource_type) {
                return Err(Error::UnknownType {
                    id: decl.id.clone(),
                    resource_type: decl.resource_type.to_string(),
                });
            }
            if let Some(prior) = scope.get(&decl.id)
                && prior.resource_type != decl.resource_type
            {
                return Err(Error::TypeChanged {
                    id: decl.id.clone(),
                    recorded: prior.resource_type.to_string(),
                    declared: decl.resource_type.to_string(),
                });
            }
        }

        let graph = desired.dependency_graph()?;
        let apply_order = graph.topological_order()?;

        let removal_graph = removal_graph(registry, scope, |id| desired.contains(id))?;
        let removals = removal_graph.reverse_topological_order()?;

        let mut planned: HashMap<&str, Action> = HashMap::new();
        let mut diffs = Vec::with_capacity(apply_order.len() + removals.len());

        for id in &apply_order {
            let Some(decl) = desired.get(id) else {
                continue;
            };
            let prior = scope.get(id);

            // Only outputs of untouched resources are known before running
            let lookup = |target: &str, attr: &str| {
                if planned.get(target) != Some(&Action::Noop) {
                    return None;
                }
                scope.get(target).and_then(|i| i.attr(attr)).cloned()
            };

            let (action, desired_props, pending) = match resolve_props(&decl.props, &lookup) {
                Ok(resolved) => (classify(prior, &resolved), resolved, false),
                Err(_) => {
                    let action = if prior.is_some() {
                        Action::Update
                    } else {
                        Action::Create
                    };
                    (action, decl.props.clone(), true)
                }
            };

            planned.insert(id.as_str(), action);
            diffs.push(ResourceDiff {
                resource_id: id.clone(),
                resource_type: decl.resource_type.clone(),
                action,
                current: prior.map(|p| p.props.clone()),
                desired: Some(desired_props),
                pending_references: pending,
            });
        }

        for id in &removals {
            if let Some(instance) = scope.get(id) {
                diffs.push(ResourceDiff {
                    resource_id: id.clone(),
                    resource_type: instance.resource_type.clone(),
                    action: Action::Delete,
                    current: Some(instance.props.clone()),
                    desired: None,
                    pending_references: false,
                });
            }
        }

        Ok(Self {
            scope: scope.id().to_string(),
            graph,
            apply_order,
            removal_graph,
            removals,
            diffs,
        })
    }

    /// Diffs that change something
    pub fn changes(&self) -> Vec<&ResourceDiff> {
        self.diffs.iter().filter(|d| !d.is_noop()).collect()
    }

    /// Summary counts
    pub fn summary(&self) -> crate::diff::DiffSummary {
        crate::diff::DiffSummary::from_diffs(&self.diffs)
    }

    /// Check if applying would change anything
    pub fn has_changes(&self) -> bool {
        self.summary().has_changes()
    }

    /// Total number of resources the plan covers
    pub fn total_resources(&self) -> usize {
        self.apply_order.len() + self.removals.len()
    }
}

/// Dependency graph over recorded instances selected by `keep == false`
///
/// Nodes are added in registration order; only edges between selected
/// instances are kept. Every selected type must still be defined.
pub(crate) fn removal_graph<F>(registry: &Registry, scope: &Scope, keep: F) -> Result<DependencyGraph>
where
    F: Fn(&str) -> bool,
{
    let mut graph = DependencyGraph::new();
    let removed: Vec<_> = scope
        .instances()
        .iter()
        .filter(|i| !keep(&i.id))
        .collect();

    for instance in &removed {
        if !registry.contains(&instance.resource_type) {
            return Err(Error::UnknownType {
                id: instance.id.clone(),
                resource_type: instance.resource_type.to_string(),
            });
        }
        graph.add_node(&instance.id);
    }
    for instance in &removed {
        for dep in &instance.dependencies {
            if graph.contains(dep) {
                graph.add_edge(&instance.id, dep);
            }
        }
    }
    Ok(graph)
}
