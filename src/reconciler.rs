//! Reconciler for converging a stack to its definition.
//!
//! This module drives one run end to end: validate the definition, build
//! the graph, load the snapshot, plan, and apply the plan under the state
//! lock.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, StackConfig};
use crate::error::{ApplyError, ConfigError, PartialApplyReport, Result, StackError, StateError};
use crate::graph::{Graph, ReferenceResolver};
use crate::planner::{ActionType, ChangePlan, DiffEngine, ExecutionResult, PlanExecutor};
use crate::provider::Provider;
use crate::state::{StateSnapshot, StateStore, generate_holder_id};

/// Reconciler for a single stack.
pub struct Reconciler<'a> {
    /// Stack definition.
    config: &'a StackConfig,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Provider.
    provider: Arc<dyn Provider>,
    /// Definition hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Maximum concurrent operations.
    parallelism: usize,
    /// Cancellation for in-progress applies.
    cancel: CancellationToken,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct ReconciliationResult {
    /// Whether every operation succeeded.
    pub success: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated in place.
    pub updated: usize,
    /// Number of resources replaced.
    pub replaced: usize,
    /// Number of resources deleted.
    pub deleted: usize,
    /// Number of resources unchanged.
    pub unchanged: usize,
    /// Snapshot serial after the run.
    pub serial: u64,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Per-operation outcome.
    #[serde(skip)]
    pub report: PartialApplyReport,
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("stack", &self.config.qualified_name())
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        config: &'a StackConfig,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            parallelism: config.settings.parallelism,
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the configured parallelism.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Uses `token` to cancel applies.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Validates the definition and builds its graph.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, a reference dangles, or the
    /// graph has a cycle.
    pub fn graph(&self) -> Result<Graph> {
        let validation = ConfigValidator::new().validate(self.config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        ReferenceResolver::new().resolve_config(self.config)
    }

    /// Loads the snapshot, or an empty one if nothing was applied yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read.
    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        let snapshot = self.store.load().await?.unwrap_or_else(|| {
            StateSnapshot::new(&self.config.project.name, &self.config.project.environment)
        });

        if snapshot.project != self.config.project.name
            || snapshot.environment != self.config.project.environment
        {
            return Err(StackError::State(StateError::Corrupted {
                message: format!(
                    "State belongs to {}/{} but the definition is {}",
                    snapshot.project,
                    snapshot.environment,
                    self.config.qualified_name()
                ),
            }));
        }
        Ok(snapshot)
    }

    /// Computes the plan converging the stack to its definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be built or the plan cannot be
    /// ordered.
    pub async fn plan(&self) -> Result<ChangePlan> {
        let graph = self.graph()?;
        let snapshot = self.snapshot().await?;
        self.build_plan(&graph, &snapshot, false)
    }

    /// Computes the plan deleting every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read.
    pub async fn plan_destroy(&self) -> Result<ChangePlan> {
        let snapshot = self.snapshot().await?;
        self.build_plan(&Graph::default(), &snapshot, true)
    }

    /// Applies `saved`, or a fresh plan, under the state lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, the saved plan is stale,
    /// or planning fails. Operation failures are reported in the result.
    pub async fn apply(&self, saved: Option<&ChangePlan>) -> Result<ReconciliationResult> {
        let destroy = saved.is_some_and(|p| p.destroy);
        self.run_locked(saved, destroy).await
    }

    /// Deletes every recorded resource under the state lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or planning fails.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        self.run_locked(None, true).await
    }

    async fn run_locked(
        &self,
        saved: Option<&ChangePlan>,
        destroy: bool,
    ) -> Result<ReconciliationResult> {
        info!(
            "Starting {} for {}",
            if destroy { "destroy" } else { "apply" },
            self.config.qualified_name()
        );

        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        let outcome = self.run_once(saved, destroy, &lock.lock_id).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        outcome
    }

    async fn run_once(
        &self,
        saved: Option<&ChangePlan>,
        destroy: bool,
        lock_id: &str,
    ) -> Result<ReconciliationResult> {
        let graph = if destroy {
            Graph::default()
        } else {
            self.graph()?
        };
        let mut snapshot = self.snapshot().await?;

        let plan = match saved {
            Some(plan) => {
                self.check_saved(plan, &snapshot)?;
                plan.clone()
            }
            None => self.build_plan(&graph, &snapshot, destroy)?,
        };

        if plan.is_empty() {
            info!("No changes required - state is converged");
            return Ok(ReconciliationResult::converged(&plan, snapshot.serial));
        }

        let executor = PlanExecutor::new(Arc::clone(&self.provider))
            .with_store(Arc::clone(&self.store))
            .with_lock(lock_id)
            .with_parallelism(self.parallelism)
            .with_cancellation(self.cancel.clone());
        let execution = executor.execute(&plan, &graph, &mut snapshot).await?;

        Ok(ReconciliationResult::from_execution(
            &plan,
            &execution,
            snapshot.serial,
        ))
    }

    fn build_plan(
        &self,
        graph: &Graph,
        snapshot: &StateSnapshot,
        destroy: bool,
    ) -> Result<ChangePlan> {
        let diff = self.diff_engine.compute_diff(graph, snapshot)?;
        info!("Diff: {}", diff.summary());

        let config_hash = self.hasher.hash_config(self.config);
        let plan = ChangePlan::from_diff(
            &diff,
            graph,
            snapshot,
            self.config.guardrails.as_ref(),
            &config_hash,
        )?;
        Ok(if destroy { plan.into_destroy() } else { plan })
    }

    /// Refuses a saved plan computed against another definition or snapshot.
    fn check_saved(&self, plan: &ChangePlan, snapshot: &StateSnapshot) -> Result<()> {
        let config_hash = self.hasher.hash_config(self.config);
        if !ConfigHasher::hashes_match(&plan.config_hash, &config_hash) {
            return Err(StackError::Config(ConfigError::validation_general(format!(
                "Stack definition changed since the plan was saved (planned {}, now {})",
                self.hasher.short_hash(&plan.config_hash),
                self.hasher.short_hash(&config_hash)
            ))));
        }
        if plan.serial != snapshot.serial {
            return Err(StackError::State(StateError::StalePlan {
                planned: plan.serial,
                current: snapshot.serial,
            }));
        }
        debug!("Saved plan matches definition and serial {}", snapshot.serial);
        Ok(())
    }
}

impl ReconciliationResult {
    fn converged(plan: &ChangePlan, serial: u64) -> Self {
        Self {
            success: true,
            created: 0,
            updated: 0,
            replaced: 0,
            deleted: 0,
            unchanged: plan.unchanged,
            serial,
            cancelled: false,
            errors: vec![],
            report: PartialApplyReport::default(),
        }
    }

    fn from_execution(plan: &ChangePlan, execution: &ExecutionResult, serial: u64) -> Self {
        let report = execution.to_report();
        let replaced = plan.replace_count();
        let plain = |action_type: ActionType| {
            plan.actions
                .iter()
                .filter(|a| a.action_type == action_type && a.replace.is_none())
                .count()
        };

        Self {
            success: execution.success,
            created: plain(ActionType::Create),
            updated: plain(ActionType::Update),
            replaced,
            deleted: plain(ActionType::Delete),
            unchanged: plan.unchanged,
            serial,
            cancelled: execution.cancelled,
            errors: report
                .failed
                .iter()
                .map(|(op, message)| format!("{op}: {message}"))
                .chain(
                    report
                        .storage_errors
                        .iter()
                        .map(|message| format!("state not saved: {message}")),
                )
                .collect(),
            report,
        }
    }

    /// Converts an unsuccessful run into [`ApplyError::PartialApply`].
    ///
    /// # Errors
    ///
    /// Returns the partial apply report if any operation did not succeed.
    pub fn ensure_success(&self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(StackError::Apply(ApplyError::PartialApply(self.report.clone())))
        }
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Apply {status} (serial {}):", self.serial)?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Replaced: {}", self.replaced)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        if !self.success {
            writeln!(f, "{}", self.report)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::provider::SimulatedProvider;
    use crate::state::LocalStateStore;
    use tokio_test::{assert_err, assert_ok};

    const STACK: &str = r#"
project:
  name: demo
  environment: dev
resources:
  - id: vpc
    type: aws:ec2:Vpc
    properties:
      max_azs: 2
  - id: sg
    type: aws:ec2:SecurityGroup
    properties:
      vpc_id: "${vpc.id}"
  - id: bucket
    type: aws:s3:Bucket
    properties:
      name: logs
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<LocalStateStore>,
        provider: Arc<SimulatedProvider>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
            Self {
                _dir: dir,
                store,
                provider: Arc::new(SimulatedProvider::new()),
            }
        }

        fn reconciler<'a>(&self, config: &'a StackConfig) -> Reconciler<'a> {
            Reconciler::new(config, self.store.clone(), self.provider.clone())
        }
    }

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[tokio::test]
    async fn test_apply_converges() {
        let fixture = Fixture::new();
        let config = parse(STACK);
        let reconciler = fixture.reconciler(&config);

        let first = reconciler.apply(None).await.unwrap();
        assert!(first.success);
        assert_eq!(first.created, 3);
        assert_eq!(first.serial, 1);

        let second = reconciler.apply(None).await.unwrap();
        assert!(second.success);
        assert_eq!(second.created, 0);
        assert_eq!(second.unchanged, 3);
        assert_eq!(second.serial, 1);

        assert!(!fixture.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_updated_output_reaches_dependents() {
        let fixture = Fixture::new();
        let yaml = r#"
project:
  name: demo
resources:
  - id: a
    type: aws:s3:Bucket
    properties:
      name: x
  - id: b
    type: aws:sns:Topic
    properties:
      target: "${a.name}"
"#;
        let before = parse(yaml);
        assert_ok!(fixture.reconciler(&before).apply(None).await);

        let after = parse(&yaml.replace("name: x", "name: y"));
        let reconciler = fixture.reconciler(&after);
        let plan = assert_ok!(reconciler.plan().await);
        assert_eq!(plan.count(ActionType::Update), 2);

        let result = assert_ok!(reconciler.apply(None).await);
        assert!(result.success);
        assert_eq!(result.updated, 2);

        let snapshot = assert_ok!(reconciler.snapshot().await);
        assert_eq!(snapshot.get("b").unwrap().properties["target"], serde_json::json!("y"));
        assert!(assert_ok!(reconciler.plan().await).is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let fixture = Fixture::new();
        let config = parse(STACK);
        let reconciler = fixture.reconciler(&config);
        reconciler.apply(None).await.unwrap();

        let plan = reconciler.plan_destroy().await.unwrap();
        assert!(plan.destroy);
        assert_eq!(plan.count(ActionType::Delete), 3);

        let result = reconciler.destroy().await.unwrap();
        assert!(result.success);
        assert_eq!(result.deleted, 3);
        assert_eq!(fixture.provider.resource_count().await, 0);
        assert!(reconciler.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saved_plan_refused_after_serial_changes() {
        let fixture = Fixture::new();
        let config = parse(STACK);
        let reconciler = fixture.reconciler(&config);

        let saved = reconciler.plan().await.unwrap();
        reconciler.apply(Some(&saved)).await.unwrap();

        let err = reconciler.apply(Some(&saved)).await.unwrap_err();
        assert!(matches!(
            err,
            StackError::State(StateError::StalePlan {
                planned: 0,
                current: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_saved_plan_refused_after_definition_changes() {
        let fixture = Fixture::new();
        let config = parse(STACK);
        let saved = fixture.reconciler(&config).plan().await.unwrap();

        let changed = parse(&STACK.replace("max_azs: 2", "max_azs: 3"));
        let err = fixture.reconciler(&changed).apply(Some(&saved)).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_provider_calls() {
        let fixture = Fixture::new();
        let config = parse(
            r#"
project:
  name: demo
resources:
  - id: a
    type: aws:ec2:Vpc
    properties:
      peer: "${b.id}"
  - id: b
    type: aws:ec2:Vpc
    properties:
      peer: "${a.id}"
"#,
        );

        let err = assert_err!(fixture.reconciler(&config).apply(None).await);
        assert!(matches!(err, StackError::Graph(_)));
        assert!(fixture.provider.calls().await.is_empty());
        assert!(!fixture.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_state_is_refused() {
        let fixture = Fixture::new();
        let config = parse(STACK);
        fixture.store.acquire_lock("someone-else").await.unwrap();

        let err = fixture.reconciler(&config).apply(None).await.unwrap_err();
        assert!(matches!(
            err,
            StackError::State(StateError::LockedByOther { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_for_other_stack_is_rejected() {
        let fixture = Fixture::new();
        fixture
            .store
            .save(&StateSnapshot::new("other", "prod"))
            .await
            .unwrap();
        let config = parse(STACK);

        let err = fixture.reconciler(&config).plan().await.unwrap_err();
        assert!(matches!(err, StackError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_starter_template_converges() {
        let fixture = Fixture::new();
        let template = include_str!("../templates/stack.yaml");
        let private = parse(template);

        let result = fixture.reconciler(&private).apply(None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.created, 44);

        let snapshot = fixture.reconciler(&private).snapshot().await.unwrap();
        let endpoint_id = &snapshot.get("apigw_endpoint").unwrap().provider_id;
        let policy = &snapshot.get("rest_api_policy").unwrap().properties;
        assert_eq!(
            policy["statements"][0]["condition"]["string_not_equals"]["aws:SourceVpce"],
            serde_json::json!(endpoint_id)
        );
        let uri = snapshot.get("external_method").unwrap().properties["uri"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(uri.starts_with("http://networkloadbalancer-"));
        assert!(uri.ends_with(".elbv2.sim.internal:3000/external/"));

        let public = parse(&template.replace("api_endpoint: private", "api_endpoint: public"));
        assert!(ConfigValidator::new().check(&public).errors.is_empty());
        let reconciler = fixture.reconciler(&public);
        let plan = assert_ok!(reconciler.plan().await);
        assert!(plan.passes_guardrails);
        assert_eq!(plan.replace_count(), 1);
        assert_eq!(plan.count(ActionType::Update), 4);
        assert_eq!(plan.count(ActionType::Delete), 3);

        let create_api = plan
            .actions
            .iter()
            .find(|a| a.node_id == "rest_api" && a.action_type == ActionType::Create)
            .unwrap();
        let endpoint_types = create_api
            .details
            .iter()
            .find(|d| d.field == "endpoint_types")
            .unwrap();
        assert!(endpoint_types.forces_replacement);
        assert_eq!(endpoint_types.new_value, Some(serde_json::json!(["REGIONAL"])));

        let deleted: Vec<&str> = plan
            .actions
            .iter()
            .filter(|a| a.action_type == ActionType::Delete && a.replace.is_none())
            .map(|a| a.node_id.as_str())
            .collect();
        assert_eq!(deleted, vec!["rest_api_policy", "apigw_endpoint"]);

        let result = assert_ok!(reconciler.apply(None).await);
        assert!(result.success);
        assert_eq!(result.replaced, 1);

        let snapshot = assert_ok!(reconciler.snapshot().await);
        let api = snapshot.get("rest_api").unwrap();
        assert_eq!(api.properties["endpoint_types"], serde_json::json!(["REGIONAL"]));
        assert_eq!(
            snapshot.get("external_method").unwrap().properties["rest_api_id"],
            serde_json::json!(api.provider_id)
        );
        assert!(snapshot.get("apigw_endpoint").is_none());
        assert!(snapshot.deposed.is_empty());
        assert!(assert_ok!(reconciler.plan().await).is_empty());
    }

    #[test]
    fn test_partial_result_reports() {
        let result = ReconciliationResult {
            success: false,
            created: 1,
            updated: 0,
            replaced: 0,
            deleted: 0,
            unchanged: 0,
            serial: 2,
            cancelled: false,
            errors: vec![String::from("create a: boom")],
            report: PartialApplyReport {
                failed: vec![(String::from("create a"), String::from("boom"))],
                ..PartialApplyReport::default()
            },
        };
        assert!(result.ensure_success().is_err());
        assert!(result.to_string().contains("failed: create a: boom"));
    }
}
