//! Plan executor for applying change plans.
//!
//! Actions run as soon as everything they wait for has succeeded, up to a
//! parallelism bound. A failed action skips its transitive dependents while
//! independent actions keep going. Every completed action is recorded in the
//! snapshot and persisted right away, so an interrupted run leaves a valid
//! snapshot to resume from. A failed write does not undo the provider call:
//! the action stays succeeded, the error is reported separately and no new
//! action is started.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ReplaceStrategy};
use crate::error::{ApplyError, PartialApplyReport, PlanError, ProviderError, Result, StackError};
use crate::graph::{Graph, Reference, ResourceNode};
use crate::provider::Provider;
use crate::state::{HistoryEntry, HistoryOperation, ResourceState, StateSnapshot, StateStore};

use super::plan::{ActionType, ChangePlan, PlannedAction};

/// Default number of concurrent provider operations.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Executor for change plans.
pub struct PlanExecutor {
    /// Provider that materializes resources.
    provider: Arc<dyn Provider>,
    /// Where the snapshot is persisted after every operation.
    store: Option<Arc<dyn StateStore>>,
    /// State lock refreshed before every write.
    lock_id: Option<String>,
    /// Maximum concurrent operations.
    parallelism: usize,
    /// Stops scheduling new operations when cancelled.
    cancel: CancellationToken,
    /// Property hasher.
    hasher: ConfigHasher,
}

/// Outcome of a single action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    /// The provider call succeeded and was recorded.
    Succeeded,
    /// The action failed.
    Failed {
        /// Error message.
        error: String,
    },
    /// The action was skipped because an action it waits for failed.
    Skipped {
        /// Description of the failed action.
        cause: String,
    },
    /// The run was cancelled before the action started.
    NotStarted,
}

/// Result of executing a single action.
#[derive(Debug, Clone)]
pub struct ActionResult {
    /// Action index.
    pub index: usize,
    /// Action that was executed.
    pub action: PlannedAction,
    /// Outcome.
    pub status: ActionStatus,
    /// Provider identity touched by the action.
    pub provider_id: Option<String>,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Individual action results, in plan order.
    pub results: Vec<ActionResult>,
    /// Total actions executed.
    pub total_executed: usize,
    /// Number of successful actions.
    pub successful: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions (due to dependency failures).
    pub skipped: usize,
    /// Number of actions never started.
    pub not_started: usize,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Snapshot writes that failed after the provider call succeeded.
    pub storage_errors: Vec<String>,
    /// Whether the entire plan succeeded and was recorded.
    pub success: bool,
}

/// A provider call that succeeded, with the outcome of recording it.
struct Completed {
    provider_id: String,
    persisted: Result<()>,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.as_ref().map(|s| s.backend_type()))
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            store: None,
            lock_id: None,
            parallelism: DEFAULT_PARALLELISM,
            cancel: CancellationToken::new(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Persists the snapshot to `store` after every operation.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Refreshes the state lock `lock_id` before every write.
    #[must_use]
    pub fn with_lock(mut self, lock_id: &str) -> Self {
        self.lock_id = Some(lock_id.to_string());
        self
    }

    /// Sets the maximum number of concurrent operations (at least 1).
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Uses `token` to stop scheduling new operations.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Executes a change plan against `snapshot`.
    ///
    /// Operation failures are reported in the [`ExecutionResult`], not as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan violates guardrails.
    pub async fn execute(
        &self,
        plan: &ChangePlan,
        graph: &Graph,
        snapshot: &mut StateSnapshot,
    ) -> Result<ExecutionResult> {
        info!(
            "Executing change plan with {} actions (parallelism {})",
            plan.actions.len(),
            self.parallelism
        );

        if !plan.passes_guardrails {
            error!("Plan does not pass guardrails");
            for violation in &plan.guardrail_violations {
                error!("  - {violation}");
            }
            return Err(StackError::Plan(PlanError::GuardrailViolation {
                violations: plan.guardrail_violations.clone(),
            }));
        }

        if plan.actions.is_empty() {
            return Ok(ExecutionResult {
                success: true,
                ..ExecutionResult::default()
            });
        }

        snapshot.serial += 1;
        let shared = Mutex::new(snapshot.clone());
        let (statuses, storage_errors) = self.run(plan, graph, &shared).await;
        let mut applied = shared.into_inner();

        let results: Vec<ActionResult> = plan
            .actions
            .iter()
            .zip(statuses)
            .enumerate()
            .map(|(index, (action, (status, provider_id)))| ActionResult {
                index,
                action: action.clone(),
                status,
                provider_id,
            })
            .collect();
        let mut execution_result =
            ExecutionResult::from_results(results, self.cancel.is_cancelled(), storage_errors);

        if !plan.destroy {
            sync_dependencies(plan, graph, &mut applied);
        }
        if execution_result.success {
            applied.config_hash.clone_from(&plan.config_hash);
        }

        let operation = if plan.destroy {
            HistoryOperation::Destroy
        } else {
            HistoryOperation::Apply
        };
        let touched: BTreeSet<String> = execution_result
            .results
            .iter()
            .filter(|r| r.status == ActionStatus::Succeeded)
            .map(|r| r.action.node_id.clone())
            .collect();
        let mut entry = HistoryEntry::new(
            operation,
            &plan.config_hash,
            applied.serial,
            touched.into_iter().collect(),
        );
        if !execution_result.success {
            entry = entry.failed(&execution_result.to_report().to_string());
        }
        applied.add_history(entry);

        *snapshot = applied;
        if let Err(e) = self.persist(snapshot).await {
            error!("Could not save the final snapshot: {e}");
            execution_result.storage_errors.push(format!("final snapshot: {e}"));
            execution_result.success = false;
        }

        info!(
            "Apply finished: {} succeeded, {} failed, {} skipped, {} not started",
            execution_result.successful,
            execution_result.failed,
            execution_result.skipped,
            execution_result.not_started
        );
        Ok(execution_result)
    }

    /// Schedules every action and returns its status and provider identity,
    /// plus the snapshot writes that failed.
    async fn run(
        &self,
        plan: &ChangePlan,
        graph: &Graph,
        shared: &Mutex<StateSnapshot>,
    ) -> (Vec<(ActionStatus, Option<String>)>, Vec<String>) {
        let n = plan.actions.len();
        let mut outcomes: Vec<Option<(ActionStatus, Option<String>)>> = vec![None; n];
        let mut pending: Vec<usize> = plan.actions.iter().map(|a| a.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, action) in plan.actions.iter().enumerate() {
            for &dep in &action.dependencies {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(i);
                }
            }
        }

        let node_locks: HashMap<&str, Mutex<()>> = plan
            .actions
            .iter()
            .map(|a| (a.node_id.as_str(), Mutex::new(())))
            .collect();

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut cancelled = self.cancel.is_cancelled();
        let mut storage_errors: Vec<String> = Vec::new();

        loop {
            while !cancelled && storage_errors.is_empty() && in_flight.len() < self.parallelism {
                let Some(i) = ready.pop_first() else {
                    break;
                };
                let action = &plan.actions[i];
                let lock = node_locks.get(action.node_id.as_str());
                debug!("Starting action {i}: {action}");
                in_flight.push(async move { (i, self.run_action(action, graph, shared, lock).await) });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled(), if !cancelled => {
                    warn!(
                        "Cancellation requested, waiting for {} in-flight operations",
                        in_flight.len()
                    );
                    cancelled = true;
                }
                Some((i, outcome)) = in_flight.next() => {
                    let action = &plan.actions[i];
                    match outcome {
                        Ok(completed) => {
                            info!("Completed: {}", action.description());
                            if let Err(e) = completed.persisted {
                                error!(
                                    "State not saved after {}, not starting new operations: {e}",
                                    action.description()
                                );
                                storage_errors.push(format!("{}: {e}", action.description()));
                            }
                            outcomes[i] = Some((ActionStatus::Succeeded, Some(completed.provider_id)));
                            for &j in &dependents[i] {
                                pending[j] -= 1;
                                if pending[j] == 0 && outcomes[j].is_none() {
                                    ready.insert(j);
                                }
                            }
                        }
                        Err(e) => {
                            error!("Failed: {}: {e}", action.description());
                            outcomes[i] = Some((
                                ActionStatus::Failed { error: e.to_string() },
                                action.provider_id.clone(),
                            ));
                            skip_dependents(i, plan, &dependents, &mut outcomes);
                        }
                    }
                }
            }
        }

        let statuses = outcomes
            .into_iter()
            .map(|o| o.unwrap_or((ActionStatus::NotStarted, None)))
            .collect();
        (statuses, storage_errors)
    }

    /// Runs one action under its node lock.
    async fn run_action(
        &self,
        action: &PlannedAction,
        graph: &Graph,
        shared: &Mutex<StateSnapshot>,
        lock: Option<&Mutex<()>>,
    ) -> Result<Completed> {
        let _guard = match lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        match action.action_type {
            ActionType::Create => self.execute_create(action, graph, shared).await,
            ActionType::Update => self.execute_update(action, graph, shared).await,
            ActionType::Delete => self.execute_delete(action, shared).await,
        }
    }

    /// Executes a create action.
    async fn execute_create(
        &self,
        action: &PlannedAction,
        graph: &Graph,
        shared: &Mutex<StateSnapshot>,
    ) -> Result<Completed> {
        let node = desired_node(graph, &action.node_id)?;
        let properties = resolve_properties(node, shared).await?;

        let created = self
            .provider
            .create(&node.type_tag, &properties)
            .await
            .map_err(|source| operation_failed("create", &node.id, source))?;

        let properties_hash = self.hasher.hash_value(&properties);
        let mut snapshot = shared.lock().await;
        if action.replace == Some(ReplaceStrategy::CreateBeforeDelete)
            && let Some(old) = snapshot.depose(&node.id)
        {
            debug!("Deposed {} ({})", old.id, old.provider_id);
        }
        snapshot.set_resource(
            ResourceState::new(
                &node.id,
                &node.type_tag,
                &created.id,
                properties,
                properties_hash,
            )
            .with_outputs(created.outputs)
            .with_dependencies(graph.dependencies(&node.id).to_vec()),
        );
        let persisted = self.persist(&snapshot).await;

        info!("Created {} (ID: {})", node.id, created.id);
        Ok(Completed {
            provider_id: created.id,
            persisted,
        })
    }

    /// Executes an in-place update.
    async fn execute_update(
        &self,
        action: &PlannedAction,
        graph: &Graph,
        shared: &Mutex<StateSnapshot>,
    ) -> Result<Completed> {
        let node = desired_node(graph, &action.node_id)?;
        let properties = resolve_properties(node, shared).await?;
        let provider_id = {
            let snapshot = shared.lock().await;
            snapshot
                .get(&node.id)
                .map(|r| r.provider_id.clone())
                .or_else(|| action.provider_id.clone())
        }
        .ok_or_else(|| StackError::internal(format!("No provider identity recorded for '{}'", node.id)))?;

        let outputs = self
            .provider
            .update(&provider_id, &node.type_tag, &properties)
            .await
            .map_err(|source| operation_failed("update", &node.id, source))?;

        let properties_hash = self.hasher.hash_value(&properties);
        let mut snapshot = shared.lock().await;
        let created_at = snapshot.get(&node.id).map(|r| r.created_at);
        let mut record = ResourceState::new(
            &node.id,
            &node.type_tag,
            &provider_id,
            properties,
            properties_hash,
        )
        .with_outputs(outputs)
        .with_dependencies(graph.dependencies(&node.id).to_vec());
        if let Some(created_at) = created_at {
            record.created_at = created_at;
        }
        snapshot.set_resource(record);
        let persisted = self.persist(&snapshot).await;

        info!("Updated {} (ID: {provider_id})", node.id);
        Ok(Completed {
            provider_id,
            persisted,
        })
    }

    /// Executes a delete action.
    async fn execute_delete(
        &self,
        action: &PlannedAction,
        shared: &Mutex<StateSnapshot>,
    ) -> Result<Completed> {
        let id = action.node_id.as_str();
        let provider_id = match &action.provider_id {
            Some(provider_id) => provider_id.clone(),
            None => shared
                .lock()
                .await
                .get(id)
                .map(|r| r.provider_id.clone())
                .ok_or_else(|| StackError::internal(format!("No provider identity recorded for '{id}'")))?,
        };

        match self.provider.delete(&provider_id, &action.type_tag).await {
            Ok(()) => info!("Deleted {id} (ID: {provider_id})"),
            Err(ProviderError::NotFound { .. }) => {
                warn!("{id} ({provider_id}) was already deleted");
            }
            Err(source) => return Err(operation_failed("delete", id, source)),
        }

        let mut snapshot = shared.lock().await;
        let live = snapshot.get(id).is_some_and(|r| r.provider_id == provider_id);
        if live && !action.deposed {
            snapshot.remove_resource(id);
        } else {
            snapshot.remove_deposed(&provider_id);
        }
        let persisted = self.persist(&snapshot).await;

        Ok(Completed {
            provider_id,
            persisted,
        })
    }

    /// Saves the snapshot if a store is configured, refreshing the lock first.
    async fn persist(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(store) = &self.store {
            if let Some(lock_id) = &self.lock_id {
                store.refresh_lock(lock_id).await?;
            }
            store.save(snapshot).await?;
        }
        Ok(())
    }
}

/// Looks up the desired node an action applies.
fn desired_node<'g>(graph: &'g Graph, id: &str) -> Result<&'g ResourceNode> {
    graph
        .node(id)
        .ok_or_else(|| StackError::internal(format!("Resource '{id}' is not part of the graph")))
}

/// Resolves a node's properties against the outputs recorded so far.
async fn resolve_properties(
    node: &ResourceNode,
    shared: &Mutex<StateSnapshot>,
) -> Result<serde_json::Value> {
    let snapshot = shared.lock().await;
    node.resolve(&|r: &Reference| snapshot.output(&r.node, &r.attribute))
        .map_err(|r| {
            StackError::Apply(ApplyError::UnresolvedReference {
                node: node.id.clone(),
                target: r.node,
                attribute: r.attribute,
            })
        })
}

fn operation_failed(operation: &str, node: &str, source: ProviderError) -> StackError {
    StackError::Apply(ApplyError::OperationFailed {
        operation: operation.to_string(),
        node: node.to_string(),
        source,
    })
}

/// Marks every transitive dependent of a failed action as skipped.
fn skip_dependents(
    failed: usize,
    plan: &ChangePlan,
    dependents: &[Vec<usize>],
    outcomes: &mut [Option<(ActionStatus, Option<String>)>],
) {
    let cause = plan.actions[failed].description();
    let mut queue: VecDeque<usize> = dependents[failed].iter().copied().collect();
    while let Some(j) = queue.pop_front() {
        if outcomes[j].is_some() {
            continue;
        }
        warn!(
            "Skipping {} because {cause} failed",
            plan.actions[j].description()
        );
        outcomes[j] = Some((ActionStatus::Skipped { cause: cause.clone() }, None));
        queue.extend(dependents[j].iter().copied());
    }
}

/// Refreshes recorded dependencies of resources the plan did not touch.
fn sync_dependencies(plan: &ChangePlan, graph: &Graph, snapshot: &mut StateSnapshot) {
    for node in graph.nodes() {
        if plan.actions.iter().any(|a| a.node_id == node.id) {
            continue;
        }
        if let Some(resource) = snapshot.resources.get_mut(&node.id) {
            let dependencies = graph.dependencies(&node.id);
            if resource.dependencies != dependencies {
                resource.dependencies = dependencies.to_vec();
            }
        }
    }
}

impl ExecutionResult {
    fn from_results(results: Vec<ActionResult>, cancelled: bool, storage_errors: Vec<String>) -> Self {
        let count = |f: fn(&ActionStatus) -> bool| results.iter().filter(|r| f(&r.status)).count();
        let successful = count(|s| *s == ActionStatus::Succeeded);
        let failed = count(|s| matches!(s, ActionStatus::Failed { .. }));
        let skipped = count(|s| matches!(s, ActionStatus::Skipped { .. }));
        let not_started = count(|s| *s == ActionStatus::NotStarted);

        Self {
            total_executed: successful + failed,
            successful,
            failed,
            skipped,
            not_started,
            cancelled,
            success: successful == results.len() && storage_errors.is_empty(),
            storage_errors,
            results,
        }
    }

    /// Builds the report enumerating every action by outcome.
    #[must_use]
    pub fn to_report(&self) -> PartialApplyReport {
        let mut report = PartialApplyReport::default();
        for result in &self.results {
            let description = result.action.description();
            match &result.status {
                ActionStatus::Succeeded => report.succeeded.push(description),
                ActionStatus::Failed { error } => report.failed.push((description, error.clone())),
                ActionStatus::Skipped { .. } => report.skipped.push(description),
                ActionStatus::NotStarted => report.not_started.push(description),
            }
        }
        report.storage_errors.clone_from(&self.storage_errors);
        report
    }

    /// Converts an unsuccessful run into [`ApplyError::PartialApply`].
    ///
    /// # Errors
    ///
    /// Returns the partial apply report if any action did not succeed.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(StackError::Apply(ApplyError::PartialApply(self.to_report())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderResult, StateError};
    use crate::graph::ReferenceResolver;
    use crate::planner::DiffEngine;
    use crate::provider::{CallKind, Created, Outputs, SimulatedProvider};
    use crate::state::{LocalStateStore, LockInfo};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    mockall::mock! {
        pub Cloud {}

        #[async_trait]
        impl Provider for Cloud {
            async fn create(&self, type_tag: &str, properties: &serde_json::Value) -> ProviderResult<Created>;
            async fn update(&self, id: &str, type_tag: &str, properties: &serde_json::Value) -> ProviderResult<Outputs>;
            async fn delete(&self, id: &str, type_tag: &str) -> ProviderResult<()>;
            fn name(&self) -> &'static str;
        }
    }

    mockall::mock! {
        pub Store {}

        #[async_trait]
        impl StateStore for Store {
            async fn load(&self) -> Result<Option<StateSnapshot>>;
            async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;
            async fn delete(&self) -> Result<()>;
            async fn exists(&self) -> Result<bool>;
            async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;
            async fn release_lock(&self, lock_id: &str) -> Result<()>;
            async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;
            async fn force_unlock(&self) -> Result<()>;
            async fn get_lock_info(&self) -> Result<Option<LockInfo>>;
            fn backend_type(&self) -> &'static str;
        }
    }

    fn status<'r>(result: &'r ExecutionResult, id: &str) -> &'r ActionStatus {
        &result
            .results
            .iter()
            .find(|r| r.action.node_id == id)
            .unwrap()
            .status
    }

    fn node(id: &str, props: serde_json::Value) -> ResourceNode {
        ResourceNode::new(id, "test:core:Thing", props.as_object().unwrap()).unwrap()
    }

    fn graph(nodes: Vec<ResourceNode>) -> Graph {
        ReferenceResolver::new().resolve(nodes).unwrap()
    }

    fn plan_for(graph: &Graph, snapshot: &StateSnapshot) -> ChangePlan {
        let diff = DiffEngine::new().compute_diff(graph, snapshot).unwrap();
        ChangePlan::from_diff(&diff, graph, snapshot, None, "hash").unwrap()
    }

    async fn apply(executor: &PlanExecutor, graph: &Graph, snapshot: &mut StateSnapshot) -> ExecutionResult {
        let plan = plan_for(graph, snapshot);
        executor.execute(&plan, graph, snapshot).await.unwrap()
    }

    #[tokio::test]
    async fn test_apply_records_and_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let provider = Arc::new(SimulatedProvider::new());
        let executor = PlanExecutor::new(provider.clone()).with_store(store.clone());

        let g = graph(vec![
            node("a", json!({})),
            node("b", json!({"a": "${a.id}", "url": "https://${a.dns_name}/"})),
            node("c", json!({})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");

        let result = apply(&executor, &g, &mut snapshot).await;
        assert!(result.success);
        assert_eq!(result.successful, 3);
        assert_eq!(snapshot.serial, 1);
        assert_eq!(snapshot.config_hash, "hash");

        let a_id = snapshot.get("a").unwrap().provider_id.clone();
        let b = snapshot.get("b").unwrap();
        assert_eq!(b.properties["a"], json!(a_id));
        assert_eq!(b.properties["url"], json!(format!("https://{a_id}.core.sim.internal/")));
        assert_eq!(b.dependencies, vec![String::from("a")]);

        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.resources.len(), 3);
        assert_eq!(stored.history.len(), 1);
        assert!(stored.history[0].success);

        // A second run has nothing to do.
        assert!(plan_for(&g, &snapshot).is_empty());
        assert_eq!(provider.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let provider = Arc::new(SimulatedProvider::new().fail_on(
            CallKind::Create,
            "test:core:Broken",
            ProviderError::request(400, "bad request"),
        ));
        let executor = PlanExecutor::new(provider.clone());

        let g = graph(vec![
            ResourceNode::new("a", "test:core:Broken", json!({}).as_object().unwrap()).unwrap(),
            node("b", json!({"a": "${a.id}"})),
            node("c", json!({"b": "${b.id}"})),
            node("d", json!({})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");

        let result = apply(&executor, &g, &mut snapshot).await;
        assert!(!result.success);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 2);
        assert_eq!(result.successful, 1);
        assert_eq!(snapshot.resource_ids(), vec!["d"]);
        assert_eq!(snapshot.config_hash, "");
        assert!(!snapshot.history[0].success);

        let report = result.to_report();
        assert_eq!(report.succeeded, vec![String::from("create d")]);
        assert_eq!(report.skipped, vec![String::from("create b"), String::from("create c")]);
        assert!(report.failed[0].1.contains("create of 'a' failed"));

        let err = result.into_result().unwrap_err();
        assert!(matches!(err, StackError::Apply(ApplyError::PartialApply(_))));
    }

    #[tokio::test]
    async fn test_parallelism_bound() {
        let provider = Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(20)));
        let executor = PlanExecutor::new(provider.clone()).with_parallelism(2);

        let g = graph((0..5).map(|i| node(&format!("n{i}"), json!({}))).collect());
        let mut snapshot = StateSnapshot::new("p", "dev");

        let result = apply(&executor, &g, &mut snapshot).await;
        assert!(result.success);
        assert_eq!(provider.resource_count().await, 5);
        assert_eq!(provider.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependency() {
        let provider = Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(5)));
        let executor = PlanExecutor::new(provider.clone());

        let g = graph(vec![
            node("b", json!({"a": "${a.id}"})),
            node("a", json!({})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        apply(&executor, &g, &mut snapshot).await;

        let calls = provider.calls().await;
        let a_id = snapshot.get("a").unwrap().provider_id.clone();
        assert_eq!(calls[0].id.as_deref(), Some(a_id.as_str()));
        assert_eq!(provider.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_finish() {
        let provider = Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(50)));
        let token = CancellationToken::new();
        let executor = PlanExecutor::new(provider.clone())
            .with_parallelism(1)
            .with_cancellation(token.clone());

        let g = graph(vec![node("a", json!({})), node("b", json!({})), node("c", json!({}))]);
        let mut snapshot = StateSnapshot::new("p", "dev");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let result = apply(&executor, &g, &mut snapshot).await;

        assert!(result.cancelled);
        assert_eq!(result.successful, 1);
        assert_eq!(result.not_started, 2);
        assert_eq!(snapshot.resource_ids(), vec!["a"]);
        assert_eq!(result.to_report().not_started.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let executor = PlanExecutor::new(Arc::new(SimulatedProvider::new()));
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot.set_resource(ResourceState::new(
            "gone",
            "test:core:Thing",
            "thing-999999",
            json!({}),
            String::new(),
        ));

        let result = apply(&executor, &graph(vec![]), &mut snapshot).await;
        assert!(result.success);
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_create_before_delete_replacement() {
        let provider = Arc::new(SimulatedProvider::new());
        let executor = PlanExecutor::new(provider.clone());
        let mut snapshot = StateSnapshot::new("p", "dev");

        let v1 = graph(vec![
            node("a", json!({"cidr": "10.0.0.0/16"})).with_immutable(["cidr"]),
            node("b", json!({"a": "${a.id}"})),
        ]);
        apply(&executor, &v1, &mut snapshot).await;
        let old_a = snapshot.get("a").unwrap().provider_id.clone();

        let v2 = graph(vec![
            node("a", json!({"cidr": "10.1.0.0/16"})).with_immutable(["cidr"]),
            node("b", json!({"a": "${a.id}"})),
        ]);
        let result = apply(&executor, &v2, &mut snapshot).await;
        assert!(result.success);

        let new_a = snapshot.get("a").unwrap().provider_id.clone();
        assert_ne!(old_a, new_a);
        assert_eq!(snapshot.get("b").unwrap().properties["a"], json!(new_a));
        assert!(snapshot.deposed.is_empty());
        assert!(!provider.exists(&old_a).await);

        // The old instance is deleted only after b was re-pointed.
        let calls = provider.calls().await;
        let kinds: Vec<CallKind> = calls[2..].iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::Create, CallKind::Update, CallKind::Delete]);
        assert!(plan_for(&v2, &snapshot).is_empty());
    }

    #[tokio::test]
    async fn test_failed_cbd_delete_leaves_deposed_instance() {
        let mut snapshot = StateSnapshot::new("p", "dev");
        let versioned = |cidr: &str| {
            graph(vec![
                node("a", json!({ "cidr": cidr }))
                    .with_immutable(["cidr"])
                    .with_replace_strategy(ReplaceStrategy::CreateBeforeDelete),
            ])
        };
        let v1 = versioned("old");
        apply(&PlanExecutor::new(Arc::new(SimulatedProvider::new())), &v1, &mut snapshot).await;

        let failing = Arc::new(SimulatedProvider::new().fail_on(
            CallKind::Delete,
            "test:core:Thing",
            ProviderError::network("connection reset"),
        ));
        let v2 = versioned("new");
        let result = apply(&PlanExecutor::new(failing), &v2, &mut snapshot).await;

        assert_eq!(result.failed, 1);
        assert_eq!(snapshot.deposed.len(), 1);
        assert_eq!(snapshot.get("a").unwrap().properties["cidr"], json!("new"));

        let retry = plan_for(&v2, &snapshot);
        assert_eq!(retry.action_count(), 1);
        assert!(retry.actions[0].deposed);
    }

    #[tokio::test]
    async fn test_provider_error_is_wrapped() {
        let mut cloud = MockCloud::new();
        cloud.expect_create().times(1).returning(|_, _| {
            Err(ProviderError::Rejected {
                message: String::from("quota exceeded"),
            })
        });
        cloud.expect_delete().never();
        cloud.expect_name().return_const("mock");

        let executor = PlanExecutor::new(Arc::new(cloud));
        let g = graph(vec![node("a", json!({})), node("b", json!({"a": "${a.id}"}))]);
        let mut snapshot = StateSnapshot::new("p", "dev");

        let result = apply(&executor, &g, &mut snapshot).await;
        let ActionStatus::Failed { error } = &result.results[0].status else {
            panic!("expected failure");
        };
        assert!(error.contains("create of 'a' failed"));
        assert!(error.contains("quota exceeded"));
        assert_eq!(
            result.results[1].status,
            ActionStatus::Skipped {
                cause: String::from("create a")
            }
        );
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_action_succeeded() {
        let mut store = MockStore::new();
        store
            .expect_save()
            .returning(|_| Err(StackError::State(StateError::write("disk full"))));
        let provider = Arc::new(SimulatedProvider::new());
        let executor = PlanExecutor::new(provider.clone())
            .with_store(Arc::new(store))
            .with_parallelism(1);

        let g = graph(vec![
            node("a", json!({})),
            node("b", json!({"a": "${a.id}"})),
            node("c", json!({})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        let result = apply(&executor, &g, &mut snapshot).await;

        assert_eq!(*status(&result, "a"), ActionStatus::Succeeded);
        assert_eq!(*status(&result, "b"), ActionStatus::NotStarted);
        assert_eq!(*status(&result, "c"), ActionStatus::NotStarted);
        assert!(!result.success);
        assert_eq!(result.failed, 0);
        assert_eq!(result.storage_errors.len(), 2);
        assert!(result.storage_errors[0].starts_with("create a: "));
        assert!(result.to_report().to_string().contains("state not saved: create a"));

        assert!(snapshot.get("a").is_some());
        assert_eq!(provider.resource_count().await, 1);
    }

    #[tokio::test]
    async fn test_lock_refreshed_on_every_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let lock = store.acquire_lock("runner").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let executor = PlanExecutor::new(Arc::new(SimulatedProvider::new()))
            .with_store(store.clone())
            .with_lock(&lock.lock_id);
        let g = graph(vec![node("a", json!({}))]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        let result = apply(&executor, &g, &mut snapshot).await;
        assert!(result.success);

        let current = store.get_lock_info().await.unwrap().unwrap();
        assert_eq!(current.lock_id, lock.lock_id);
        assert!(current.expires_at > lock.expires_at);
    }

    #[tokio::test]
    async fn test_lost_lock_stops_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let lock = store.acquire_lock("runner").await.unwrap();
        store.force_unlock().await.unwrap();
        let intruder = store.acquire_lock("intruder").await.unwrap();

        let executor = PlanExecutor::new(Arc::new(SimulatedProvider::new()))
            .with_store(store.clone())
            .with_lock(&lock.lock_id)
            .with_parallelism(1);
        let g = graph(vec![node("a", json!({})), node("b", json!({}))]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        let result = apply(&executor, &g, &mut snapshot).await;

        assert!(!result.success);
        assert_eq!(result.successful, 1);
        assert_eq!(result.not_started, 1);
        assert!(result.storage_errors[0].contains("no longer held"));
        assert!(store.load().await.unwrap().is_none());
        assert_eq!(store.get_lock_info().await.unwrap(), Some(intruder));
    }

    #[tokio::test]
    async fn test_guardrail_violation_blocks_execution() {
        let executor = PlanExecutor::new(Arc::new(SimulatedProvider::new()));
        let mut plan = ChangePlan::empty("hash", 0);
        plan.passes_guardrails = false;
        plan.guardrail_violations = vec![String::from("too many deletes")];

        let err = executor
            .execute(&plan, &Graph::default(), &mut StateSnapshot::new("p", "dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Plan(PlanError::GuardrailViolation { .. })));
    }
}
