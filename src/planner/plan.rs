//! Change plan types and construction.
//!
//! This module turns a [`DiffResult`] into an ordered list of provider
//! operations. Every action lists the indices of the actions it waits for;
//! the list itself is sorted in waves, so everything in one wave can run
//! concurrently once the previous waves are done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::config::{GuardrailsConfig, ReplaceStrategy};
use crate::error::{ConfigError, PlanError, Result, StackError};
use crate::graph::Graph;
use crate::state::StateSnapshot;

use super::diff::{DiffDetail, DiffResult, DiffType, ResourceDiff};

/// A complete change plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Definition hash this plan is based on.
    pub config_hash: String,
    /// Snapshot serial this plan was computed against.
    pub serial: u64,
    /// True for plans that delete every resource.
    #[serde(default)]
    pub destroy: bool,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
    /// Number of declared resources left untouched.
    #[serde(default)]
    pub unchanged: usize,
    /// Whether the plan passes guardrails.
    pub passes_guardrails: bool,
    /// Guardrail violations (if any).
    #[serde(default)]
    pub guardrail_violations: Vec<String>,
}

/// A single planned action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Node id.
    pub node_id: String,
    /// Type tag.
    pub type_tag: String,
    /// Reason for this action.
    pub reason: String,
    /// Strategy of the replacement this action is a half of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<ReplaceStrategy>,
    /// Provider identity of the instance updated or deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// True when deleting a deposed instance.
    #[serde(default)]
    pub deposed: bool,
    /// Desired properties hash, when known at plan time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,
    /// Field-level changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DiffDetail>,
    /// Wave this action belongs to.
    #[serde(default)]
    pub wave: usize,
    /// Dependencies (action indices that must complete first).
    #[serde(default)]
    pub dependencies: Vec<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new instance.
    Create,
    /// Update an instance in place.
    Update,
    /// Delete an instance.
    Delete,
}

/// Action indices per node, used to wire dependencies.
#[derive(Default)]
struct ActionIndex<'a> {
    creates: HashMap<&'a str, usize>,
    updates: HashMap<&'a str, usize>,
    deletes: HashMap<&'a str, usize>,
}

impl ActionIndex<'_> {
    /// Action after which `id` no longer refers to anything it used to.
    fn release(&self, id: &str) -> Option<usize> {
        self.deletes
            .get(id)
            .or_else(|| self.updates.get(id))
            .copied()
    }
}

impl ChangePlan {
    /// Creates a new plan from a diff result.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyResolutionFailed`] if the actions
    /// cannot be ordered.
    pub fn from_diff(
        diff: &DiffResult,
        graph: &Graph,
        snapshot: &StateSnapshot,
        guardrails: Option<&GuardrailsConfig>,
        config_hash: &str,
    ) -> Result<Self> {
        let mut actions = Vec::new();
        let mut index = ActionIndex::default();

        for resource_diff in &diff.diffs {
            let id = resource_diff.id.as_str();
            match resource_diff.diff_type {
                DiffType::Create => {
                    index.creates.insert(id, actions.len());
                    actions.push(PlannedAction::from_diff(ActionType::Create, resource_diff));
                }
                DiffType::Update => {
                    index.updates.insert(id, actions.len());
                    actions.push(PlannedAction::from_diff(ActionType::Update, resource_diff));
                }
                DiffType::Replace => {
                    let strategy = resource_diff
                        .strategy
                        .unwrap_or(ReplaceStrategy::DeleteBeforeCreate);
                    let halves = match strategy {
                        ReplaceStrategy::CreateBeforeDelete => [ActionType::Create, ActionType::Delete],
                        _ => [ActionType::Delete, ActionType::Create],
                    };
                    for action_type in halves {
                        let slot = if action_type == ActionType::Create {
                            &mut index.creates
                        } else {
                            &mut index.deletes
                        };
                        slot.insert(id, actions.len());
                        let mut action = PlannedAction::from_diff(action_type, resource_diff);
                        action.replace = Some(strategy);
                        actions.push(action);
                    }
                }
                DiffType::Delete => {
                    if !resource_diff.deposed {
                        index.deletes.insert(id, actions.len());
                    }
                    actions.push(PlannedAction::from_diff(ActionType::Delete, resource_diff));
                }
                DiffType::NoChange => {}
            }
        }

        let mut wiring = Vec::with_capacity(actions.len());
        for action in &actions {
            let id = action.node_id.as_str();
            let mut deps: Vec<usize> = Vec::new();
            match action.action_type {
                ActionType::Create | ActionType::Update => {
                    for target in graph.dependencies(id) {
                        deps.extend(index.creates.get(target.as_str()));
                        deps.extend(index.updates.get(target.as_str()));
                    }
                    if action.replace == Some(ReplaceStrategy::DeleteBeforeCreate) {
                        deps.extend(index.deletes.get(id));
                    }
                }
                ActionType::Delete => {
                    for dependent in snapshot.recorded_dependents(id) {
                        if dependent != id {
                            deps.extend(index.release(dependent));
                        }
                    }
                    if action.replace == Some(ReplaceStrategy::CreateBeforeDelete) {
                        deps.extend(index.creates.get(id));
                    }
                }
            }
            deps.sort_unstable();
            deps.dedup();
            wiring.push(deps);
        }
        for (action, deps) in actions.iter_mut().zip(wiring) {
            action.dependencies = deps;
        }

        let actions = order_in_waves(actions)?;
        let guardrail_violations = guardrails
            .map(|g| Self::check_guardrails(g, &actions))
            .unwrap_or_default();

        debug!(
            "Planned {} actions in {} waves",
            actions.len(),
            actions.last().map_or(0, |a| a.wave + 1)
        );

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            serial: snapshot.serial,
            destroy: false,
            actions,
            unchanged: diff.unchanged,
            passes_guardrails: guardrail_violations.is_empty(),
            guardrail_violations,
        })
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(config_hash: &str, serial: u64) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            serial,
            destroy: false,
            actions: vec![],
            unchanged: 0,
            passes_guardrails: true,
            guardrail_violations: vec![],
        }
    }

    /// Marks the plan as a destroy plan.
    #[must_use]
    pub const fn into_destroy(mut self) -> Self {
        self.destroy = true;
        self
    }

    /// Checks guardrails for the plan.
    fn check_guardrails(guardrails: &GuardrailsConfig, actions: &[PlannedAction]) -> Vec<String> {
        let mut violations = Vec::new();
        let deletes: Vec<&PlannedAction> = actions
            .iter()
            .filter(|a| a.action_type == ActionType::Delete)
            .collect();

        if let Some(max_deletes) = guardrails.max_deletes
            && deletes.len() > max_deletes
        {
            violations.push(format!(
                "Plan deletes {} resources but max_deletes is {max_deletes}",
                deletes.len()
            ));
        }

        for action in deletes.iter().filter(|a| !a.deposed) {
            if guardrails.prevent_destroy.contains(&action.node_id) {
                let how = if action.replace.is_some() { "replaces" } else { "deletes" };
                violations.push(format!(
                    "Plan {how} protected resource '{}'",
                    action.node_id
                ));
            }
        }

        violations
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of a type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Returns the number of nodes being replaced.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.replace.is_some() && a.action_type == ActionType::Create)
            .count()
    }

    /// Returns action indices grouped by wave.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut waves: Vec<Vec<usize>> = Vec::new();
        for (i, action) in self.actions.iter().enumerate() {
            if waves.len() <= action.wave {
                waves.resize_with(action.wave + 1, Vec::new);
            }
            waves[action.wave].push(i);
        }
        waves
    }

    /// Writes the plan as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StackError::internal(format!("Failed to serialize plan: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads a plan written by [`ChangePlan::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not a valid plan.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }
        let content = std::fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Invalid plan file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        if let Some((i, bad)) = plan
            .actions
            .iter()
            .enumerate()
            .find(|(i, a)| a.dependencies.iter().any(|d| d >= i))
        {
            return Err(StackError::Plan(PlanError::DependencyResolutionFailed {
                message: format!("action {i} ({bad}) waits on a later action"),
            }));
        }
        Ok(plan)
    }
}

/// Sorts actions into waves, ties broken by insertion order, and remaps
/// dependency indices to the new positions.
fn order_in_waves(actions: Vec<PlannedAction>) -> Result<Vec<PlannedAction>> {
    let n = actions.len();
    let mut pending: Vec<usize> = actions.iter().map(|a| a.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, action) in actions.iter().enumerate() {
        for &dep in &action.dependencies {
            dependents[dep].push(i);
        }
    }

    let mut wave_of = vec![0; n];
    let mut order = Vec::with_capacity(n);
    let mut current: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
    let mut wave = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            wave_of[i] = wave;
            order.push(i);
            for &j in &dependents[i] {
                pending[j] -= 1;
                if pending[j] == 0 {
                    next.push(j);
                }
            }
        }
        next.sort_unstable();
        current = next;
        wave += 1;
    }

    if order.len() < n {
        let stuck: Vec<String> = actions
            .iter()
            .enumerate()
            .filter(|(i, _)| pending[*i] > 0)
            .map(|(_, a)| format!("{} {}", a.action_type, a.node_id))
            .collect();
        return Err(StackError::Plan(PlanError::DependencyResolutionFailed {
            message: format!("actions wait on each other: {}", stuck.join(", ")),
        }));
    }

    let mut position = vec![0; n];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }

    let mut slots: Vec<Option<PlannedAction>> = actions.into_iter().map(Some).collect();
    Ok(order
        .iter()
        .filter_map(|&i| {
            let mut action = slots[i].take()?;
            action.wave = wave_of[i];
            action.dependencies = action.dependencies.iter().map(|&d| position[d]).collect();
            action.dependencies.sort_unstable();
            Some(action)
        })
        .collect())
}

impl PlannedAction {
    /// Builds one action from a resource diff.
    fn from_diff(action_type: ActionType, diff: &ResourceDiff) -> Self {
        let creates = action_type == ActionType::Create;
        Self {
            action_type,
            node_id: diff.id.clone(),
            type_tag: diff.type_tag.clone(),
            reason: diff.reason.clone(),
            replace: None,
            provider_id: if creates { None } else { diff.provider_id.clone() },
            deposed: diff.deposed,
            new_hash: if action_type == ActionType::Delete {
                None
            } else {
                diff.new_hash.clone()
            },
            details: if action_type == ActionType::Delete {
                vec![]
            } else {
                diff.details.clone()
            },
            wave: 0,
            dependencies: vec![],
        }
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        format!("{} {}", self.action_type, self.node_id)
    }

    /// Display symbol of the action.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match (self.action_type, self.replace.is_some()) {
            (ActionType::Create, false) => "+",
            (ActionType::Update, _) => "~",
            (ActionType::Delete, false) => "-",
            (ActionType::Create, true) => "+/-",
            (ActionType::Delete, true) => "-/+",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.node_id)?;
        if self.deposed
            && let Some(id) = &self.provider_id
        {
            write!(f, " (deposed {id})")?;
        }
        if let Some(strategy) = self.replace {
            write!(f, " [replace, {strategy}]")?;
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChangePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Change Plan ({} actions):", self.actions.len())?;
        for (wave, indices) in self.waves().iter().enumerate() {
            writeln!(f, "  wave {wave}:")?;
            for &i in indices {
                if let Some(action) = self.actions.get(i) {
                    writeln!(f, "    {i}. {} {action}", action.symbol())?;
                }
            }
        }

        if !self.guardrail_violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.guardrail_violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ReferenceResolver, ResourceNode};
    use crate::planner::DiffEngine;
    use crate::state::ResourceState;
    use serde_json::json;

    fn node(id: &str, props: serde_json::Value) -> ResourceNode {
        ResourceNode::new(id, "test:core:Thing", props.as_object().unwrap()).unwrap()
    }

    fn graph(nodes: Vec<ResourceNode>) -> Graph {
        ReferenceResolver::new().resolve(nodes).unwrap()
    }

    fn record(snapshot: &mut StateSnapshot, id: &str, props: serde_json::Value, deps: &[&str]) {
        let provider_id = format!("{id}-1");
        snapshot.set_resource(
            ResourceState::new(id, "test:core:Thing", &provider_id, props, String::new())
                .with_dependencies(deps.iter().map(ToString::to_string).collect()),
        );
    }

    fn plan(graph: &Graph, snapshot: &StateSnapshot) -> ChangePlan {
        let diff = DiffEngine::new().compute_diff(graph, snapshot).unwrap();
        ChangePlan::from_diff(&diff, graph, snapshot, None, "hash").unwrap()
    }

    fn described(plan: &ChangePlan) -> Vec<(usize, String)> {
        plan.actions
            .iter()
            .map(|a| (a.wave, a.description()))
            .collect()
    }

    fn position(plan: &ChangePlan, description: &str) -> usize {
        plan.actions
            .iter()
            .position(|a| a.description() == description)
            .unwrap()
    }

    #[test]
    fn test_scenario_create_then_remove() {
        let g = graph(vec![
            node("a", json!({})),
            node("b", json!({"a": "${a.id}"})),
            node("c", json!({})),
        ]);
        let snapshot = StateSnapshot::new("p", "dev");

        let first = plan(&g, &snapshot);
        assert_eq!(
            described(&first),
            vec![
                (0, String::from("create a")),
                (0, String::from("create c")),
                (1, String::from("create b")),
            ]
        );
        assert_eq!(first.actions[2].dependencies, vec![0]);

        let mut applied = StateSnapshot::new("p", "dev");
        record(&mut applied, "a", json!({}), &[]);
        record(&mut applied, "b", json!({"a": "a-1"}), &["a"]);
        record(&mut applied, "c", json!({}), &[]);
        assert!(plan(&g, &applied).is_empty());

        let without_b = graph(vec![node("a", json!({})), node("c", json!({}))]);
        let last = plan(&without_b, &applied);
        assert_eq!(described(&last), vec![(0, String::from("delete b"))]);
        assert_eq!(last.actions[0].provider_id.as_deref(), Some("b-1"));
    }

    #[test]
    fn test_deletes_run_before_dependency_deletes() {
        let g = graph(vec![]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({}), &[]);
        record(&mut snapshot, "b", json!({}), &["a"]);
        record(&mut snapshot, "c", json!({}), &["b"]);

        let p = plan(&g, &snapshot);
        assert_eq!(
            described(&p),
            vec![
                (0, String::from("delete c")),
                (1, String::from("delete b")),
                (2, String::from("delete a")),
            ]
        );
    }

    #[test]
    fn test_cbd_replace_ordering() {
        let g = graph(vec![
            node("a", json!({"cidr": "new"})).with_immutable(["cidr"]),
            node("b", json!({"a": "${a.id}"})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"cidr": "old"}), &[]);
        record(&mut snapshot, "b", json!({"a": "a-1"}), &["a"]);

        let p = plan(&g, &snapshot);
        assert_eq!(
            described(&p),
            vec![
                (0, String::from("create a")),
                (1, String::from("update b")),
                (2, String::from("delete a")),
            ]
        );
        assert_eq!(p.actions[2].replace, Some(ReplaceStrategy::CreateBeforeDelete));
        assert_eq!(p.actions[2].dependencies, vec![0, 1]);
        assert_eq!(p.replace_count(), 1);
        assert_eq!(p.actions[0].symbol(), "+/-");
    }

    #[test]
    fn test_dbd_replace_ordering() {
        let g = graph(vec![
            node("a", json!({"cidr": "new"}))
                .with_immutable(["cidr"])
                .with_replace_strategy(ReplaceStrategy::DeleteBeforeCreate),
            node("b", json!({"a": "${a.id}"})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"cidr": "old"}), &[]);
        record(&mut snapshot, "b", json!({"a": "a-1"}), &["a"]);

        let p = plan(&g, &snapshot);
        // b is escalated to replacement, so the old b goes before the old a
        // and nothing live ever points at a deleted identity.
        let delete_b = position(&p, "delete b");
        let delete_a = position(&p, "delete a");
        let create_a = position(&p, "create a");
        let create_b = position(&p, "create b");
        assert!(delete_b < delete_a);
        assert!(delete_a < create_a);
        assert!(create_a < create_b);
        assert!(p.actions[delete_a].dependencies.contains(&delete_b));
    }

    #[test]
    fn test_guardrails() {
        let g = graph(vec![]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "vpc", json!({}), &[]);
        record(&mut snapshot, "sg", json!({}), &["vpc"]);

        let diff = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        let guardrails = GuardrailsConfig {
            max_deletes: Some(1),
            prevent_destroy: vec![String::from("vpc")],
        };
        let p = ChangePlan::from_diff(&diff, &g, &snapshot, Some(&guardrails), "hash").unwrap();

        assert!(!p.passes_guardrails);
        assert_eq!(p.guardrail_violations.len(), 2);
        assert!(p.guardrail_violations[1].contains("'vpc'"));
    }

    #[test]
    fn test_cyclic_actions_are_rejected() {
        let mut a = PlannedAction::from_diff(
            ActionType::Create,
            &ResourceDiff {
                id: String::from("a"),
                type_tag: String::from("t"),
                diff_type: DiffType::Create,
                details: vec![],
                reason: String::new(),
                strategy: None,
                provider_id: None,
                deposed: false,
                old_hash: None,
                new_hash: None,
            },
        );
        a.dependencies = vec![1];
        let mut b = a.clone();
        b.node_id = String::from("b");
        b.dependencies = vec![0];

        let err = order_in_waves(vec![a, b]).unwrap_err();
        assert!(matches!(
            err,
            StackError::Plan(PlanError::DependencyResolutionFailed { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        let g = graph(vec![node("a", json!({})), node("b", json!({"a": "${a.id}"}))]);
        let p = plan(&g, &StateSnapshot::new("p", "dev"));

        p.save(&path).unwrap();
        let loaded = ChangePlan::load(&path).unwrap();
        assert_eq!(loaded.actions, p.actions);
        assert_eq!(loaded.config_hash, "hash");

        assert!(ChangePlan::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_display() {
        let g = graph(vec![node("a", json!({}))]);
        let p = plan(&g, &StateSnapshot::new("p", "dev"));
        let text = p.to_string();
        assert!(text.starts_with("Change Plan (1 actions):"));
        assert!(text.contains("0. + create a: not present in state"));
        assert_eq!(ChangePlan::empty("h", 0).to_string(), "No changes required");
    }
}
