//! Execution engine - converges a scope with bounded parallelism
//!
//! The orchestrator owns a scheduling loop that starts lifecycle invocations
//! as soon as their dependencies are done, up to `RunOptions::concurrency` at
//! a time. Every invocation runs as its own task; results flow back to the
//! loop, which updates the scope, unblocks dependents and reports progress.

use crate::context::{Context, LogProgress, RunObserver};
use crate::diff::{Action, classify};
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, DesiredGraph};
use crate::lock::IdLocks;
use crate::planner::{ExecutionPlan, removal_graph};
use crate::reference::resolve_props;
use crate::resource::{Lifecycle, Registry};
use crate::scope::{ResourceInstance, Scope};
use crate::store::StateStore;
use crate::types::{Outcome, Phase, ResourceType, RunOptions, RunResult, SkipReason};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Drives lifecycle functions against a state store
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(MemoryStore::new()));
/// let mut scope = orchestrator.open_scope("dev").await?;
/// let result = orchestrator.apply(&mut scope, &desired).await?;
/// assert!(result.is_success());
/// orchestrator.destroy(&mut scope).await?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<Registry>,
    store: Arc<dyn StateStore>,
    options: RunOptions,
    locks: IdLocks,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            options: RunOptions::default(),
            locks: IdLocks::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Share per-instance locks with other orchestrators
    pub fn with_locks(mut self, locks: IdLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops new invocations when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Load a scope from the store
    pub async fn open_scope(&self, id: &str) -> Result<Scope> {
        Scope::open(id, self.store.as_ref()).await
    }

    /// Compute the change set without invoking anything
    pub fn plan(&self, scope: &Scope, desired: &DesiredGraph) -> Result<ExecutionPlan> {
        ExecutionPlan::build(&self.registry, scope, desired)
    }

    /// Converge `scope` to `desired`
    pub async fn apply(&self, scope: &mut Scope, desired: &DesiredGraph) -> Result<RunResult> {
        self.apply_with(scope, desired, &mut LogProgress).await
    }

    /// [`apply`](Self::apply) reporting progress to `observer`
    ///
    /// `scope` is reloaded from the store first, so the run always diffs
    /// against persisted state. Setup errors are returned before any
    /// invocation. Everything else ends up in the returned [`RunResult`].
    ///
    /// Removed resources are deleted after the creates and updates. One that
    /// a kept instance still records as a dependency (because that instance
    /// failed or was skipped) is left in place as
    /// `Skipped(Blocked { by: <kept id> })`.
    pub async fn apply_with(
        &self,
        scope: &mut Scope,
        desired: &DesiredGraph,
        observer: &mut dyn RunObserver,
    ) -> Result<RunResult> {
        self.reload(scope).await?;
        let plan = self.plan(scope, desired)?;
        log::info!(
            "Applying {} resources to scope '{}' ({} to remove)",
            plan.apply_order.len(),
            scope.id(),
            plan.removals.len()
        );

        let mut result = RunResult::default();
        observer.on_run_start(plan.total_resources());

        let schedule = Schedule::forward(&plan.graph, &plan.apply_order, |id| {
            desired.get(id).map(|d| d.resource_type.clone())
        });
        self.run_schedule(scope, schedule, observer, &mut result, |id, scope| {
            self.prepare_apply(id, scope, desired)
        })
        .await;

        if !plan.removals.is_empty() {
            let held = held_removals(scope, desired, &plan.removals, &result);
            let schedule = Schedule::backward(&plan.removal_graph, &plan.removals, |id| {
                scope.get(id).map(|i| i.resource_type.clone())
            })
            .hold(held);
            self.run_schedule(scope, schedule, observer, &mut result, |id, scope| {
                self.prepare_delete(id, scope)
            })
            .await;
        }

        observer.on_run_complete();
        log_summary(&result);
        Ok(result)
    }

    /// Delete every instance of `scope`, dependents first
    pub async fn destroy(&self, scope: &mut Scope) -> Result<RunResult> {
        self.destroy_with(scope, &mut LogProgress).await
    }

    /// [`destroy`](Self::destroy) reporting progress to `observer`
    ///
    /// A failed deletion blocks the deletion of everything it still
    /// references; independent deletions continue.
    pub async fn destroy_with(
        &self,
        scope: &mut Scope,
        observer: &mut dyn RunObserver,
    ) -> Result<RunResult> {
        self.reload(scope).await?;
        let graph = removal_graph(&self.registry, scope, |_| false)?;
        let order = graph.reverse_topological_order()?;
        log::info!("Destroying {} resources in scope '{}'", order.len(), scope.id());

        let mut result = RunResult::default();
        observer.on_run_start(order.len());

        let schedule = Schedule::backward(&graph, &order, |id| {
            scope.get(id).map(|i| i.resource_type.clone())
        });
        self.run_schedule(scope, schedule, observer, &mut result, |id, scope| {
            self.prepare_delete(id, scope)
        })
        .await;

        observer.on_run_complete();
        log_summary(&result);
        Ok(result)
    }

    /// Replace `scope` with what the store currently records for it
    async fn reload(&self, scope: &mut Scope) -> Result<()> {
        let id = scope.id().to_string();
        *scope = Scope::open(id, self.store.as_ref()).await?;
        Ok(())
    }

    // =========================================================================
    // Preparation
    // =========================================================================

    /// Resolve, classify and build the invocation for a desired resource
    fn prepare_apply(&self, id: &str, scope: &mut Scope, desired: &DesiredGraph) -> Prepared {
        let Some(decl) = desired.get(id) else {
            return Prepared::Finished(Outcome::Skipped(SkipReason::Cancelled));
        };
        let Some(definition) = self.registry.get(&decl.resource_type) else {
            return failed(Error::UnknownType {
                id: id.to_string(),
                resource_type: decl.resource_type.to_string(),
            });
        };

        let lookup = |target: &str, attr: &str| scope.get(target).and_then(|i| i.attr(attr)).cloned();
        let props = match resolve_props(&decl.props, &lookup) {
            Ok(props) => props,
            Err(unresolved) => {
                return failed(Error::UnresolvedReference {
                    id: id.to_string(),
                    target: unresolved.target,
                    attr: unresolved.attr,
                });
            }
        };

        let (ctx, sequence) = match scope.get(id) {
            None => (
                Context::create(scope.id(), decl.resource_type.clone()),
                scope.reserve_sequence(),
            ),
            Some(prior) if classify(Some(prior), &props) == Action::Noop => {
                return Prepared::Finished(Outcome::Noop);
            }
            Some(prior) => {
                let ctx = Context::with_prior(
                    scope.id(),
                    decl.resource_type.clone(),
                    Phase::Update,
                    prior.props.clone(),
                    prior.output.clone(),
                );
                if let Err(err) = definition.check_immutable(&ctx, &props) {
                    return failed(err);
                }
                (ctx, prior.sequence)
            }
        };

        Prepared::Invoke(Invocation {
            id: id.to_string(),
            resource_type: decl.resource_type.clone(),
            lifecycle: definition.lifecycle(),
            ctx,
            props,
            dependencies: decl.dependencies(),
            sequence,
            declared_timeout: decl.timeout,
            timeout: decl
                .timeout
                .or_else(|| definition.timeout())
                .or(self.options.timeout),
        })
    }

    /// Build the delete invocation for a recorded instance
    fn prepare_delete(&self, id: &str, scope: &mut Scope) -> Prepared {
        let Some(instance) = scope.get(id) else {
            // Already gone
            return Prepared::Finished(Outcome::Deleted);
        };
        let Some(definition) = self.registry.get(&instance.resource_type) else {
            return failed(Error::UnknownType {
                id: id.to_string(),
                resource_type: instance.resource_type.to_string(),
            });
        };

        Prepared::Invoke(Invocation {
            id: id.to_string(),
            resource_type: instance.resource_type.clone(),
            lifecycle: definition.lifecycle(),
            ctx: Context::with_prior(
                scope.id(),
                instance.resource_type.clone(),
                Phase::Delete,
                instance.props.clone(),
                instance.output.clone(),
            ),
            props: instance.props.clone(),
            dependencies: instance.dependencies.clone(),
            sequence: instance.sequence,
            declared_timeout: instance.timeout,
            timeout: instance
                .timeout
                .or_else(|| definition.timeout())
                .or(self.options.timeout),
        })
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn run_schedule<F>(
        &self,
        scope: &mut Scope,
        schedule: Schedule,
        observer: &mut dyn RunObserver,
        result: &mut RunResult,
        mut prepare: F,
    ) where
        F: FnMut(&str, &mut Scope) -> Prepared,
    {
        let mut state = Scheduler::new(schedule);
        for (id, by) in std::mem::take(&mut state.schedule.held) {
            state.hold(&id, &by, observer, result);
        }
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks: JoinSet<Completion> = JoinSet::new();

        loop {
            while !self.cancel.is_cancelled() {
                let Some(index) = state.next_ready() else {
                    break;
                };
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                state.take(index);
                let id = state.schedule.order[index].clone();

                match prepare(&id, scope) {
                    Prepared::Invoke(invocation) => {
                        observer.on_resource_start(&id, invocation.ctx.phase());
                        log::debug!("Starting {} {id}", invocation.ctx.phase());
                        tasks.spawn(invocation.run(
                            Arc::clone(&self.store),
                            self.locks.clone(),
                            scope.id().to_string(),
                            permit,
                        ));
                    }
                    Prepared::Finished(outcome) => {
                        drop(permit);
                        state.settle(&id, outcome, observer, result);
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(completion) => {
                    let (id, outcome) = completion.apply_to(scope);
                    state.settle(&id, outcome, observer, result);
                }
                Err(err) => {
                    // Invocations catch their own panics, so only runtime
                    // shutdown lands here
                    log::error!("Lifecycle task aborted: {err}");
                }
            }
        }

        if self.cancel.is_cancelled() {
            log::warn!("Run cancelled, skipping remaining resources");
        }
        state.skip_remaining(observer, result);
    }
}

/// Removed ids that a kept instance still records as a dependency
///
/// A kept instance whose create or update succeeded was rewritten with its
/// new dependencies, which cannot name a removed id. Any other kept instance
/// keeps holding what it recorded before the run.
fn held_removals(
    scope: &Scope,
    desired: &DesiredGraph,
    removals: &[String],
    result: &RunResult,
) -> Vec<(String, String)> {
    let holders: Vec<&ResourceInstance> = scope
        .instances()
        .iter()
        .filter(|i| desired.contains(&i.id))
        .filter(|i| !result.outcome(&i.id).is_some_and(Outcome::is_success))
        .collect();

    removals
        .iter()
        .filter_map(|removed| {
            holders
                .iter()
                .find(|k| k.dependencies.iter().any(|d| d == removed))
                .map(|k| (removed.clone(), k.id.clone()))
        })
        .collect()
}

fn failed(err: Error) -> Prepared {
    Prepared::Finished(Outcome::Failed(Arc::new(err)))
}

fn log_summary(result: &RunResult) {
    let summary = result.summary();
    log::info!(
        "Run finished: {} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
        summary.created,
        summary.updated,
        summary.deleted,
        summary.noop,
        summary.failed,
        summary.skipped
    );
}

// =============================================================================
// Invocation
// =============================================================================

enum Prepared {
    Invoke(Invocation),
    /// Decided without calling the lifecycle
    Finished(Outcome),
}

struct Invocation {
    id: String,
    resource_type: ResourceType,
    lifecycle: Arc<dyn Lifecycle>,
    ctx: Context,
    props: Value,
    dependencies: Vec<String>,
    sequence: u64,
    /// Declaration timeout, recorded with the instance
    declared_timeout: Option<Duration>,
    /// Effective limit for this call
    timeout: Option<Duration>,
}

impl Invocation {
    /// Call the lifecycle and persist its result under the instance lock
    async fn run(
        self,
        store: Arc<dyn StateStore>,
        locks: IdLocks,
        scope: String,
        _permit: OwnedSemaphorePermit,
    ) -> Completion {
        let _guard = locks.acquire(&scope, &self.id).await;
        let phase = self.ctx.phase();

        let call = AssertUnwindSafe(self.lifecycle.run(&self.ctx, &self.id, &self.props)).catch_unwind();
        let returned = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(returned) => returned,
                Err(_) => {
                    return self.complete(Err(Error::Timeout {
                        id: self.id.clone(),
                        after: limit,
                    }));
                }
            },
            None => call.await,
        };

        let output = match returned {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return self.complete(Err(Error::from_lifecycle(&self.id, err))),
            Err(panic) => {
                let err = Error::Provider {
                    id: self.id.clone(),
                    source: anyhow::anyhow!("lifecycle panicked: {}", panic_message(panic.as_ref())),
                };
                return self.complete(Err(err));
            }
        };

        let persisted = if phase == Phase::Delete {
            store.remove(&scope, &self.id).await.map(|()| None)
        } else {
            let instance = ResourceInstance {
                id: self.id.clone(),
                resource_type: self.resource_type.clone(),
                props: self.props.clone(),
                output,
                dependencies: self.dependencies.clone(),
                sequence: self.sequence,
                timeout: self.declared_timeout,
            };
            store
                .put(&scope, &instance.to_record(Utc::now()))
                .await
                .map(|()| Some(instance))
        };
        self.complete(persisted)
    }

    fn complete(&self, result: Result<Option<ResourceInstance>>) -> Completion {
        Completion {
            id: self.id.clone(),
            phase: self.ctx.phase(),
            result,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Completion {
    id: String,
    phase: Phase,
    /// Recorded instance after create/update, `None` after delete
    result: Result<Option<ResourceInstance>>,
}

impl Completion {
    /// Mirror a persisted result into the in-memory scope
    fn apply_to(self, scope: &mut Scope) -> (String, Outcome) {
        let outcome = match self.result {
            Ok(Some(instance)) => match scope.replace(instance) {
                Ok(()) if self.phase == Phase::Create => Outcome::Created,
                Ok(()) => Outcome::Updated,
                Err(err) => Outcome::Failed(Arc::new(err)),
            },
            Ok(None) => {
                scope.forget(&self.id);
                Outcome::Deleted
            }
            Err(err) => Outcome::Failed(Arc::new(err)),
        };
        (self.id, outcome)
    }
}

// =============================================================================
// Scheduler state
// =============================================================================

/// Static description of one scheduling pass
struct Schedule {
    /// Ids in start priority
    order: Vec<String>,
    types: HashMap<String, ResourceType>,
    /// How many ids each id waits on
    waiting: HashMap<String, usize>,
    /// Ids that wait on each id
    unblocks: HashMap<String, Vec<String>>,
    /// Ids decided up front as blocked, with the id blocking them
    held: Vec<(String, String)>,
}

impl Schedule {
    /// Dependencies before dependents
    fn forward<T>(graph: &DependencyGraph, order: &[String], type_of: T) -> Self
    where
        T: Fn(&str) -> Option<ResourceType>,
    {
        Self::build(order, type_of, |id| graph.dependencies(id), |id| graph.dependents(id))
    }

    /// Dependents before dependencies
    fn backward<T>(graph: &DependencyGraph, order: &[String], type_of: T) -> Self
    where
        T: Fn(&str) -> Option<ResourceType>,
    {
        Self::build(order, type_of, |id| graph.dependents(id), |id| graph.dependencies(id))
    }

    fn build<T, W, U>(order: &[String], type_of: T, waits_on: W, unblocks: U) -> Self
    where
        T: Fn(&str) -> Option<ResourceType>,
        W: Fn(&str) -> Vec<String>,
        U: Fn(&str) -> Vec<String>,
    {
        let mut schedule = Self {
            order: Vec::with_capacity(order.len()),
            types: HashMap::new(),
            waiting: HashMap::new(),
            unblocks: HashMap::new(),
            held: Vec::new(),
        };
        for id in order {
            let Some(resource_type) = type_of(id) else {
                continue;
            };
            schedule.order.push(id.clone());
            schedule.types.insert(id.clone(), resource_type);
            schedule.waiting.insert(id.clone(), waits_on(id).len());
            schedule.unblocks.insert(id.clone(), unblocks(id));
        }
        schedule
    }

    /// Keep each `(id, by)` from running, reported as blocked by `by`
    fn hold(mut self, held: Vec<(String, String)>) -> Self {
        self.held = held;
        self
    }
}

struct Scheduler {
    schedule: Schedule,
    index: HashMap<String, usize>,
    ready: BTreeSet<usize>,
    decided: HashSet<String>,
}

impl Scheduler {
    fn new(schedule: Schedule) -> Self {
        let index: HashMap<String, usize> = schedule
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let ready = schedule
            .order
            .iter()
            .enumerate()
            .filter(|(_, id)| schedule.waiting.get(*id).copied().unwrap_or(0) == 0)
            .map(|(i, _)| i)
            .collect();
        Self {
            schedule,
            index,
            ready,
            decided: HashSet::new(),
        }
    }

    fn next_ready(&self) -> Option<usize> {
        self.ready.iter().next().copied()
    }

    fn take(&mut self, index: usize) {
        self.ready.remove(&index);
    }

    /// Record a final outcome and release or block the ids waiting on it
    fn settle(
        &mut self,
        id: &str,
        outcome: Outcome,
        observer: &mut dyn RunObserver,
        result: &mut RunResult,
    ) {
        let success = outcome.is_success();
        self.record(id, outcome, observer, result);

        if success {
            let unblocked = self.schedule.unblocks.get(id).cloned().unwrap_or_default();
            for next in unblocked {
                if let Some(count) = self.schedule.waiting.get_mut(&next) {
                    *count = count.saturating_sub(1);
                    if *count == 0
                        && !self.decided.contains(&next)
                        && let Some(&i) = self.index.get(&next)
                    {
                        self.ready.insert(i);
                    }
                }
            }
            return;
        }

        // Block everything reachable from the failed id
        let mut queue: VecDeque<String> = self
            .schedule
            .unblocks
            .get(id)
            .cloned()
            .unwrap_or_default()
            .into();
        while let Some(next) = queue.pop_front() {
            if self.decided.contains(&next) {
                continue;
            }
            if let Some(more) = self.schedule.unblocks.get(&next) {
                queue.extend(more.iter().cloned());
            }
            if let Some(&i) = self.index.get(&next) {
                self.ready.remove(&i);
            }
            let reason = SkipReason::Blocked { by: id.to_string() };
            self.record(&next, Outcome::Skipped(reason), observer, result);
        }
    }

    /// Decide `id` as blocked by `by` before it starts
    ///
    /// Whatever waits on `id` is blocked in turn, as after a failure.
    fn hold(
        &mut self,
        id: &str,
        by: &str,
        observer: &mut dyn RunObserver,
        result: &mut RunResult,
    ) {
        if let Some(&i) = self.index.get(id) {
            self.ready.remove(&i);
        }
        log::warn!("Keeping {id}: still referenced by {by}");
        let reason = SkipReason::Blocked { by: by.to_string() };
        self.settle(id, Outcome::Skipped(reason), observer, result);
    }

    /// Mark every undecided id as cancelled
    fn skip_remaining(&mut self, observer: &mut dyn RunObserver, result: &mut RunResult) {
        let remaining: Vec<String> = self
            .schedule
            .order
            .iter()
            .filter(|id| !self.decided.contains(*id))
            .cloned()
            .collect();
        for id in remaining {
            self.record(&id, Outcome::Skipped(SkipReason::Cancelled), observer, result);
        }
    }

    fn record(
        &mut self,
        id: &str,
        outcome: Outcome,
        observer: &mut dyn RunObserver,
        result: &mut RunResult,
    ) {
        if !self.decided.insert(id.to_string()) {
            return;
        }
        observer.on_resource_complete(id, &outcome);
        if let Some(resource_type) = self.schedule.types.get(id) {
            result.push(id, resource_type, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Declaration;
    use crate::resource::{ResourceDefinition, lifecycle_fn};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lifecycle that records every call as `phase:id`
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail: Arc<Mutex<HashSet<String>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn fail_on(&self, key: &str) {
            self.fail.lock().unwrap().insert(key.to_string());
        }

        fn pass_on(&self, key: &str) {
            self.fail.lock().unwrap().remove(key);
        }
    }

    #[async_trait]
    impl Lifecycle for Recorder {
        async fn run(&self, ctx: &Context, id: &str, props: &Value) -> anyhow::Result<Value> {
            let key = format!("{}:{id}", ctx.phase());
            self.calls.lock().unwrap().push(key.clone());
            if self.fail.lock().unwrap().contains(&key) {
                anyhow::bail!("{key} refused");
            }
            Ok(json!({ "id": format!("{id}-ext"), "props": props }))
        }
    }

    fn setup(recorder: &Recorder) -> (Orchestrator, Arc<MemoryStore>) {
        let mut registry = Registry::new();
        registry.define("test::Thing", recorder.clone()).unwrap();
        with_registry(registry)
    }

    fn with_registry(registry: Registry) -> (Orchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(Arc::new(registry), Arc::clone(&store) as Arc<dyn StateStore>);
        (orchestrator, store)
    }

    fn decl(id: &str, props: Value) -> Declaration {
        Declaration::new(id, "test::Thing", props).unwrap()
    }

    /// c -> b -> a, declared dependents first
    fn chain() -> DesiredGraph {
        DesiredGraph::new()
            .with(decl("c", json!({"b": {"$ref": "b"}})))
            .unwrap()
            .with(decl("b", json!({"a": {"$ref": "a"}})))
            .unwrap()
            .with(decl("a", json!({"name": "a"})))
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_in_dependency_order() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let mut scope = orchestrator.open_scope("dev").await.unwrap();

        let result = orchestrator.apply(&mut scope, &chain()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.summary().created, 3);
        assert_eq!(recorder.calls(), vec!["create:a", "create:b", "create:c"]);

        let records = store.list("dev").await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        // references are persisted resolved
        assert_eq!(records[1].props, json!({"a": "a-ext"}));
        assert_eq!(records[1].dependencies, vec!["a"]);
    }

    #[tokio::test]
    async fn test_reapply_makes_no_calls() {
        let recorder = Recorder::default();
        let (orchestrator, _store) = setup(&recorder);
        let mut scope = orchestrator.open_scope("dev").await.unwrap();
        orchestrator.apply(&mut scope, &chain()).await.unwrap();

        // fresh scope from the store, as a new process would see it
        let mut reopened = orchestrator.open_scope("dev").await.unwrap();
        let result = orchestrator.apply(&mut reopened, &chain()).await.unwrap();

        assert_eq!(result.summary().noop, 3);
        assert_eq!(result.summary().total_changes(), 0);
        assert_eq!(recorder.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_update_receives_prior_output() {
        let seen = Arc::new(Mutex::new(None));
        let lifecycle = {
            let seen = Arc::clone(&seen);
            lifecycle_fn(move |ctx: Context, id: String, props: Value| {
                let seen = Arc::clone(&seen);
                async move {
                    if ctx.phase() == Phase::Update {
                        *seen.lock().unwrap() = ctx.prior_output().cloned();
                    }
                    Ok::<_, anyhow::Error>(json!({ "id": id, "size": props["size"] }))
                }
            })
        };
        let mut registry = Registry::new();
        registry.define("test::Thing", lifecycle).unwrap();
        let (orchestrator, store) = with_registry(registry);
        let mut scope = Scope::new("dev");

        let v1 = DesiredGraph::new().with(decl("a", json!({"size": 1}))).unwrap();
        let v2 = DesiredGraph::new().with(decl("a", json!({"size": 2}))).unwrap();
        orchestrator.apply(&mut scope, &v1).await.unwrap();
        let result = orchestrator.apply(&mut scope, &v2).await.unwrap();

        assert!(matches!(result.outcome("a"), Some(Outcome::Updated)));
        assert_eq!(*seen.lock().unwrap(), Some(json!({"id": "a", "size": 1})));
        let record = store.get("dev", "a").await.unwrap().unwrap();
        assert_eq!(record.output, json!({"id": "a", "size": 2}));
        assert_eq!(record.sequence, 0);
    }

    #[tokio::test]
    async fn test_destroy_reverse_order() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let mut scope = Scope::new("dev");
        orchestrator.apply(&mut scope, &chain()).await.unwrap();

        let result = orchestrator.destroy(&mut scope).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.summary().deleted, 3);
        assert_eq!(
            recorder.calls()[3..],
            ["delete:c", "delete:b", "delete:a"]
        );
        assert!(scope.is_empty());
        assert!(store.list("dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_call() {
        let recorder = Recorder::default();
        let (orchestrator, _store) = setup(&recorder);
        let desired = DesiredGraph::new()
            .with(decl("a", json!({"b": {"$ref": "b"}})))
            .unwrap()
            .with(decl("b", json!({"a": {"$ref": "a"}})))
            .unwrap();

        let err = orchestrator
            .apply(&mut Scope::new("dev"), &desired)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CyclicDependency { ref cycle } if cycle.len() == 3));
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let recorder = Recorder::default();
        recorder.fail_on("create:a");
        let (orchestrator, store) = setup(&recorder);
        let desired = DesiredGraph::new()
            .with(decl("a", json!({})))
            .unwrap()
            .with(decl("b", json!({"a": {"$ref": "a"}})))
            .unwrap()
            .with(decl("c", json!({})))
            .unwrap();

        let result = orchestrator
            .apply(&mut Scope::new("dev"), &desired)
            .await
            .unwrap();

        assert!(!result.is_success());
        match result.outcome("a") {
            Some(Outcome::Failed(err)) => assert!(err.to_string().contains("create:a refused")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            result.outcome("b"),
            Some(Outcome::Skipped(SkipReason::Blocked { by })) if by == "a"
        ));
        assert!(matches!(result.outcome("c"), Some(Outcome::Created)));
        assert!(!recorder.calls().contains(&"create:b".to_string()));

        let ids: Vec<_> = store
            .list("dev")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[tokio::test]
    async fn test_immutable_change_rejected() {
        let recorder = Recorder::default();
        let mut registry = Registry::new();
        registry
            .register(
                ResourceDefinition::new("test::Thing", recorder.clone())
                    .unwrap()
                    .with_immutable(["name"]),
            )
            .unwrap();
        let (orchestrator, store) = with_registry(registry);
        let mut scope = Scope::new("dev");

        let v1 = DesiredGraph::new().with(decl("bucket", json!({"name": "logs"}))).unwrap();
        let v2 = DesiredGraph::new().with(decl("bucket", json!({"name": "audit"}))).unwrap();
        orchestrator.apply(&mut scope, &v1).await.unwrap();
        let result = orchestrator.apply(&mut scope, &v2).await.unwrap();

        match result.outcome("bucket").and_then(Outcome::error) {
            Some(Error::ImmutableProperty { field, old, new }) => {
                assert_eq!(field, "name");
                assert_eq!(*old, json!("logs"));
                assert_eq!(*new, json!("audit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(recorder.calls(), vec!["create:bucket"]);
        let record = store.get("dev", "bucket").await.unwrap().unwrap();
        assert_eq!(record.props, json!({"name": "logs"}));
    }

    #[tokio::test]
    async fn test_unresolved_attribute_fails_resource() {
        let recorder = Recorder::default();
        let (orchestrator, _store) = setup(&recorder);
        let desired = DesiredGraph::new()
            .with(decl("a", json!({})))
            .unwrap()
            .with(decl("b", json!({"x": {"$ref": "a", "attr": "missing"}})))
            .unwrap();

        let result = orchestrator
            .apply(&mut Scope::new("dev"), &desired)
            .await
            .unwrap();

        assert!(matches!(
            result.outcome("b").and_then(Outcome::error),
            Some(Error::UnresolvedReference { attr, .. }) if attr == "missing"
        ));
        assert_eq!(recorder.calls(), vec!["create:a"]);
    }

    #[tokio::test]
    async fn test_removed_resources_are_deleted() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let mut scope = Scope::new("dev");
        let v1 = DesiredGraph::new()
            .with(decl("a", json!({})))
            .unwrap()
            .with(decl("b", json!({"a": {"$ref": "a"}})))
            .unwrap();
        orchestrator.apply(&mut scope, &v1).await.unwrap();

        let v2 = DesiredGraph::new().with(decl("x", json!({}))).unwrap();
        let result = orchestrator.apply(&mut scope, &v2).await.unwrap();

        assert!(result.is_success());
        assert_eq!(
            recorder.calls()[2..],
            ["create:x", "delete:b", "delete:a"]
        );
        assert_eq!(scope.ids(), vec!["x"]);
        assert_eq!(store.list("dev").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_failure_blocks_dependencies() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let mut scope = Scope::new("dev");
        let desired = DesiredGraph::new()
            .with(decl("a", json!({})))
            .unwrap()
            .with(decl("b", json!({"a": {"$ref": "a"}})))
            .unwrap()
            .with(decl("c", json!({})))
            .unwrap();
        orchestrator.apply(&mut scope, &desired).await.unwrap();
        recorder.fail_on("delete:b");

        let result = orchestrator.destroy(&mut scope).await.unwrap();

        assert!(matches!(result.outcome("b"), Some(Outcome::Failed(_))));
        assert!(matches!(
            result.outcome("a"),
            Some(Outcome::Skipped(SkipReason::Blocked { by })) if by == "b"
        ));
        assert!(matches!(result.outcome("c"), Some(Outcome::Deleted)));
        assert_eq!(scope.ids(), vec!["a", "b"]);
        assert_eq!(store.list("dev").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_recorded_type_fails_before_any_call() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let orphan = ResourceInstance {
            id: "orphan".into(),
            resource_type: ResourceType::new("gone::Thing").unwrap(),
            props: json!({}),
            output: json!({}),
            dependencies: Vec::new(),
            sequence: 0,
            timeout: None,
        };
        store.put("dev", &orphan.to_record(Utc::now())).await.unwrap();

        let err = orchestrator
            .destroy(&mut Scope::new("dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownType { ref id, .. } if id == "orphan"));
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stale_scope_is_reloaded_from_store() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let v1 = DesiredGraph::new()
            .with(decl("a", json!({})))
            .unwrap()
            .with(decl("b", json!({})))
            .unwrap();
        let mut scope = orchestrator.open_scope("dev").await.unwrap();
        orchestrator.apply(&mut scope, &v1).await.unwrap();

        // a caller holding an empty copy of the scope
        let mut stale = Scope::new("dev");
        let v2 = DesiredGraph::new().with(decl("b", json!({}))).unwrap();
        let result = orchestrator.apply(&mut stale, &v2).await.unwrap();

        assert!(matches!(result.outcome("b"), Some(Outcome::Noop)));
        assert!(matches!(result.outcome("a"), Some(Outcome::Deleted)));
        assert_eq!(recorder.calls(), vec!["create:a", "create:b", "delete:a"]);
        let records = store.list("dev").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].id.as_str(), records[0].sequence), ("b", 1));
        assert_eq!(stale.ids(), vec!["b"]);

        // new registrations continue after the persisted sequence numbers
        let v3 = v2.with(decl("c", json!({}))).unwrap();
        orchestrator.apply(&mut Scope::new("dev"), &v3).await.unwrap();
        assert_eq!(store.get("dev", "c").await.unwrap().unwrap().sequence, 2);

        let destroyed = orchestrator.destroy(&mut Scope::new("dev")).await.unwrap();
        assert_eq!(destroyed.summary().deleted, 2);
        assert!(store.list("dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removal_waits_for_failed_dependent() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let mut scope = orchestrator.open_scope("dev").await.unwrap();
        let v1 = DesiredGraph::new()
            .with(decl("r", json!({})))
            .unwrap()
            .with(decl("k", json!({"r": {"$ref": "r"}})))
            .unwrap();
        orchestrator.apply(&mut scope, &v1).await.unwrap();

        // k stops referencing r, but its update fails
        recorder.fail_on("update:k");
        let v2 = DesiredGraph::new()
            .with(decl("k", json!({"r": "external"})))
            .unwrap();
        let result = orchestrator.apply(&mut scope, &v2).await.unwrap();

        assert!(matches!(result.outcome("k"), Some(Outcome::Failed(_))));
        assert!(matches!(
            result.outcome("r"),
            Some(Outcome::Skipped(SkipReason::Blocked { by })) if by == "k"
        ));
        assert!(!recorder.calls().contains(&"delete:r".to_string()));
        assert!(store.get("dev", "r").await.unwrap().is_some());
        assert_eq!(
            store.get("dev", "k").await.unwrap().unwrap().dependencies,
            vec!["r"]
        );

        // once k is updated the removal goes through
        recorder.pass_on("update:k");
        let result = orchestrator.apply(&mut scope, &v2).await.unwrap();
        assert!(result.is_success());
        assert!(matches!(result.outcome("k"), Some(Outcome::Updated)));
        assert!(matches!(result.outcome("r"), Some(Outcome::Deleted)));
        assert_eq!(scope.ids(), vec!["k"]);
    }

    #[tokio::test]
    async fn test_held_removal_blocks_its_dependencies() {
        let recorder = Recorder::default();
        let (orchestrator, store) = setup(&recorder);
        let mut scope = orchestrator.open_scope("dev").await.unwrap();
        let v1 = DesiredGraph::new()
            .with(decl("base", json!({})))
            .unwrap()
            .with(decl("r", json!({"base": {"$ref": "base"}})))
            .unwrap()
            .with(decl("k", json!({"r": {"$ref": "r"}})))
            .unwrap()
            .with(decl("loose", json!({})))
            .unwrap();
        orchestrator.apply(&mut scope, &v1).await.unwrap();

        recorder.fail_on("update:k");
        let v2 = DesiredGraph::new()
            .with(decl("k", json!({})))
            .unwrap();
        let result = orchestrator.apply(&mut scope, &v2).await.unwrap();

        assert!(matches!(
            result.outcome("r"),
            Some(Outcome::Skipped(SkipReason::Blocked { by })) if by == "k"
        ));
        assert!(matches!(
            result.outcome("base"),
            Some(Outcome::Skipped(SkipReason::Blocked { by })) if by == "r"
        ));
        assert!(matches!(result.outcome("loose"), Some(Outcome::Deleted)));
        let ids: Vec<_> = store
            .list("dev")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["base", "r", "k"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_invocation() {
        let slow = lifecycle_fn(|_ctx: Context, id: String, _props: Value| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(json!({ "id": id }))
        });
        let mut registry = Registry::new();
        registry
            .register(
                ResourceDefinition::new("test::Slow", slow)
                    .unwrap()
                    .with_timeout(Duration::from_millis(50)),
            )
            .unwrap();
        let (orchestrator, store) = with_registry(registry);

        let desired = DesiredGraph::new()
            .with(Declaration::new("fast-limit", "test::Slow", json!({})).unwrap())
            .unwrap()
            .with(
                Declaration::new("patient", "test::Slow", json!({}))
                    .unwrap()
                    .with_timeout(Duration::from_secs(120)),
            )
            .unwrap();
        let result = orchestrator
            .apply(&mut Scope::new("dev"), &desired)
            .await
            .unwrap();

        assert!(matches!(
            result.outcome("fast-limit").and_then(Outcome::error),
            Some(Error::Timeout { after, .. }) if *after == Duration::from_millis(50)
        ));
        assert!(matches!(result.outcome("patient"), Some(Outcome::Created)));
        assert!(store.get("dev", "fast-limit").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_invocations() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let lifecycle = {
            let token = token.clone();
            let calls = Arc::clone(&calls);
            lifecycle_fn(move |_ctx: Context, id: String, _props: Value| {
                let token = token.clone();
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                    Ok::<_, anyhow::Error>(json!({ "id": id }))
                }
            })
        };
        let mut registry = Registry::new();
        registry.define("test::Thing", lifecycle).unwrap();
        let (orchestrator, _store) = with_registry(registry);
        let orchestrator = orchestrator
            .with_cancellation(token)
            .with_options(RunOptions {
                concurrency: 1,
                timeout: None,
            });

        let desired = DesiredGraph::new()
            .with(decl("a", json!({})))
            .unwrap()
            .with(decl("b", json!({})))
            .unwrap()
            .with(decl("c", json!({})))
            .unwrap();
        let result = orchestrator
            .apply(&mut Scope::new("dev"), &desired)
            .await
            .unwrap();

        // the started invocation finishes normally
        assert!(matches!(result.outcome("a"), Some(Outcome::Created)));
        assert!(matches!(
            result.outcome("b"),
            Some(Outcome::Skipped(SkipReason::Cancelled))
        ));
        assert!(matches!(
            result.outcome("c"),
            Some(Outcome::Skipped(SkipReason::Cancelled))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let lifecycle = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            lifecycle_fn(move |_ctx: Context, id: String, _props: Value| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(json!({ "id": id }))
                }
            })
        };
        let mut registry = Registry::new();
        registry.define("test::Thing", lifecycle).unwrap();
        let (orchestrator, _store) = with_registry(registry);
        let orchestrator = orchestrator.with_options(RunOptions {
            concurrency: 2,
            timeout: None,
        });

        let mut desired = DesiredGraph::new();
        for i in 0..6 {
            desired.add(decl(&format!("r{i}"), json!({}))).unwrap();
        }
        let result = orchestrator
            .apply(&mut Scope::new("dev"), &desired)
            .await
            .unwrap();

        assert_eq!(result.summary().created, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panic_becomes_provider_error() {
        let lifecycle = lifecycle_fn(|_ctx: Context, id: String, _props: Value| async move {
            if id == "bad" {
                panic!("boom");
            }
            Ok::<_, anyhow::Error>(json!({ "id": id }))
        });
        let mut registry = Registry::new();
        registry.define("test::Thing", lifecycle).unwrap();
        let (orchestrator, _store) = with_registry(registry);

        let desired = DesiredGraph::new()
            .with(decl("bad", json!({})))
            .unwrap()
            .with(decl("good", json!({})))
            .unwrap();
        let result = orchestrator
            .apply(&mut Scope::new("dev"), &desired)
            .await
            .unwrap();

        match result.outcome("bad").and_then(Outcome::error) {
            Some(Error::Provider { source, .. }) => {
                assert_eq!(source.to_string(), "lifecycle panicked: boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(result.outcome("good"), Some(Outcome::Created)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_declared_timeout_applies_to_later_delete() {
        let lifecycle = lifecycle_fn(|ctx: Context, id: String, _props: Value| async move {
            if ctx.phase() == Phase::Delete {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok::<_, anyhow::Error>(json!({ "id": id }))
        });
        let mut registry = Registry::new();
        registry.define("test::Thing", lifecycle).unwrap();
        let (orchestrator, store) = with_registry(registry);

        let v1 = DesiredGraph::new()
            .with(decl("slow", json!({})).with_timeout(Duration::from_millis(50)))
            .unwrap();
        orchestrator.apply(&mut Scope::new("dev"), &v1).await.unwrap();
        let record = store.get("dev", "slow").await.unwrap().unwrap();
        assert_eq!(record.timeout_ms, Some(50));

        // no longer declared, only the record carries the limit
        let result = orchestrator
            .apply(&mut Scope::new("dev"), &DesiredGraph::new())
            .await
            .unwrap();
        assert!(matches!(
            result.outcome("slow").and_then(Outcome::error),
            Some(Error::Timeout { after, .. }) if *after == Duration::from_millis(50)
        ));
        assert!(store.get("dev", "slow").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_locks_serialize_same_instance() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let lifecycle = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let calls = Arc::clone(&calls);
            lifecycle_fn(move |_ctx: Context, id: String, _props: Value| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(json!({ "id": id }))
                }
            })
        };
        let mut registry = Registry::new();
        registry.define("test::Thing", lifecycle).unwrap();
        let registry = Arc::new(registry);

        // two runs with their own stores, sharing one lock table
        let locks = IdLocks::new();
        let first = Orchestrator::new(Arc::clone(&registry), Arc::new(MemoryStore::new()))
            .with_locks(locks.clone());
        let second = Orchestrator::new(Arc::clone(&registry), Arc::new(MemoryStore::new()))
            .with_locks(locks.clone());

        let desired = DesiredGraph::new().with(decl("a", json!({}))).unwrap();
        let mut left = Scope::new("dev");
        let mut right = Scope::new("dev");
        let (a, b) = tokio::join!(
            first.apply(&mut left, &desired),
            second.apply(&mut right, &desired)
        );

        assert!(matches!(a.unwrap().outcome("a"), Some(Outcome::Created)));
        assert!(matches!(b.unwrap().outcome("a"), Some(Outcome::Created)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plan_does_not_invoke() {
        let recorder = Recorder::default();
        let (orchestrator, _store) = setup(&recorder);
        let plan = orchestrator.plan(&Scope::new("dev"), &chain()).unwrap();

        assert_eq!(plan.summary().additions, 3);
        assert!(recorder.calls().is_empty());
    }
}
