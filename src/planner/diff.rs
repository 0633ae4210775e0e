//! Diff engine for comparing the desired graph with the last snapshot.
//!
//! Each desired node is classified as create, update, replace or no-op by
//! comparing its resolved properties with the ones recorded in the snapshot.
//! Values that reference a node being created or replaced are "known after
//! apply" and always count as changed. Replacements then get a concrete
//! strategy, which may force further replacements; the classification is
//! repeated until no new replacement is forced.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{ConfigHasher, ReplaceStrategy};
use crate::error::{PlanError, Result, StackError};
use crate::graph::{Graph, Reference, ResourceNode};
use crate::state::StateSnapshot;

/// Engine for computing diffs between the desired graph and the snapshot.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Property hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Node id.
    pub id: String,
    /// Type tag (desired, or recorded for deletes).
    pub type_tag: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Field-level changes.
    pub details: Vec<DiffDetail>,
    /// Human-readable justification.
    pub reason: String,
    /// Concrete strategy, for replacements.
    pub strategy: Option<ReplaceStrategy>,
    /// Provider identity of the existing instance, if any.
    pub provider_id: Option<String>,
    /// True when the existing instance is a deposed one.
    pub deposed: bool,
    /// Recorded properties hash, if any.
    pub old_hash: Option<String>,
    /// Desired properties hash, when every value is known.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be deleted and created again.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Change to a single property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffDetail {
    /// Property name.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<serde_json::Value>,
    /// Desired value; `None` when removed or known only after apply.
    pub new_value: Option<serde_json::Value>,
    /// The desired value depends on a node that does not exist yet.
    #[serde(default)]
    pub known_after_apply: bool,
    /// The property is immutable, so the change forces a replacement.
    #[serde(default)]
    pub forces_replacement: bool,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Desired nodes in topological order, then deletions.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of instances to delete (deposed ones included).
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the desired graph and the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ConflictingOperations`] when a delete-before-create
    /// replacement has a dependent that must be replaced create-before-delete.
    pub fn compute_diff(&self, graph: &Graph, snapshot: &StateSnapshot) -> Result<DiffResult> {
        let order = graph.topological_order();
        let mut forced: BTreeMap<String, String> = BTreeMap::new();

        loop {
            let mut diffs: IndexMap<String, ResourceDiff> = IndexMap::with_capacity(order.len());
            for id in &order {
                let Some(node) = graph.node(id) else {
                    continue;
                };
                let diff = self.diff_node(node, snapshot, &diffs, forced.get(*id));
                diffs.insert((*id).to_string(), diff);
            }

            let escalations = Self::resolve_strategies(graph, &order, &mut diffs)?;
            let before = forced.len();
            for (id, reason) in escalations {
                forced.entry(id).or_insert(reason);
            }

            if forced.len() == before {
                return Ok(Self::finish(diffs, graph, snapshot));
            }
            debug!(
                "{} dependents escalated to replacement, re-diffing",
                forced.len() - before
            );
        }
    }

    /// Classifies one desired node.
    fn diff_node(
        &self,
        node: &ResourceNode,
        snapshot: &StateSnapshot,
        planned: &IndexMap<String, ResourceDiff>,
        forced: Option<&String>,
    ) -> ResourceDiff {
        // References to nodes that get a new identity in this run, or to
        // outputs an in-place update rewrites, resolve only after apply.
        let lookup = |r: &Reference| match planned.get(&r.node) {
            Some(target) if matches!(target.diff_type, DiffType::Create | DiffType::Replace) => {
                None
            }
            Some(target)
                if target.diff_type == DiffType::Update && !survives_update(target, &r.attribute) =>
            {
                None
            }
            _ => snapshot.output(&r.node, &r.attribute),
        };
        let new_hash = node
            .resolve(&lookup)
            .ok()
            .map(|props| self.hasher.hash_value(&props));

        let Some(prior) = snapshot.get(&node.id) else {
            let details = node
                .properties
                .iter()
                .map(|(field, value)| {
                    let resolved = value.resolve(&lookup).ok();
                    DiffDetail {
                        field: field.clone(),
                        old_value: None,
                        known_after_apply: resolved.is_none(),
                        new_value: resolved,
                        forces_replacement: false,
                    }
                })
                .collect();
            return ResourceDiff {
                id: node.id.clone(),
                type_tag: node.type_tag.clone(),
                diff_type: DiffType::Create,
                details,
                reason: String::from("not present in state"),
                strategy: None,
                provider_id: None,
                deposed: false,
                old_hash: None,
                new_hash,
            };
        };

        let recorded = prior.properties.as_object();
        let mut details = Vec::new();

        for (field, value) in &node.properties {
            let old_value = recorded.and_then(|m| m.get(field)).cloned();
            let forces_replacement = node.immutable.contains(field);
            match value.resolve(&lookup) {
                Ok(new_value) if old_value.as_ref() == Some(&new_value) => {}
                Ok(new_value) => details.push(DiffDetail {
                    field: field.clone(),
                    old_value,
                    new_value: Some(new_value),
                    known_after_apply: false,
                    forces_replacement,
                }),
                Err(_) => details.push(DiffDetail {
                    field: field.clone(),
                    old_value,
                    new_value: None,
                    known_after_apply: true,
                    forces_replacement,
                }),
            }
        }

        for (field, old_value) in recorded.into_iter().flatten() {
            if !node.properties.contains_key(field) {
                details.push(DiffDetail {
                    field: field.clone(),
                    old_value: Some(old_value.clone()),
                    new_value: None,
                    known_after_apply: false,
                    forces_replacement: node.immutable.contains(field),
                });
            }
        }

        let immutable_changed: Vec<&str> = details
            .iter()
            .filter(|d| d.forces_replacement)
            .map(|d| d.field.as_str())
            .collect();

        let (diff_type, reason) = if let Some(reason) = forced {
            (DiffType::Replace, reason.clone())
        } else if prior.type_tag != node.type_tag {
            (
                DiffType::Replace,
                format!("type changed from {} to {}", prior.type_tag, node.type_tag),
            )
        } else if !immutable_changed.is_empty() {
            (
                DiffType::Replace,
                format!("immutable {} changed", field_list(&immutable_changed)),
            )
        } else if !details.is_empty() {
            let fields: Vec<&str> = details.iter().map(|d| d.field.as_str()).collect();
            (DiffType::Update, format!("{} changed", field_list(&fields)))
        } else {
            (DiffType::NoChange, String::from("up to date"))
        };

        ResourceDiff {
            id: node.id.clone(),
            type_tag: node.type_tag.clone(),
            diff_type,
            details,
            reason,
            strategy: None,
            provider_id: Some(prior.provider_id.clone()),
            deposed: false,
            old_hash: Some(prior.properties_hash.clone()),
            new_hash,
        }
    }

    /// Picks a concrete strategy for every replacement, dependents first.
    ///
    /// Returns the dependents that must be escalated to replacement.
    fn resolve_strategies(
        graph: &Graph,
        order: &[&str],
        diffs: &mut IndexMap<String, ResourceDiff>,
    ) -> Result<Vec<(String, String)>> {
        let mut escalations = Vec::new();

        for id in order.iter().rev() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if diffs.get(*id).map(|d| d.diff_type) != Some(DiffType::Replace) {
                continue;
            }

            let dependents: Vec<(&str, DiffType, Option<ReplaceStrategy>)> = graph
                .dependents(id)
                .iter()
                .filter_map(|dep| {
                    diffs
                        .get(dep)
                        .map(|d| (dep.as_str(), d.diff_type, d.strategy))
                })
                .collect();

            let strategy = match node.replace_strategy {
                ReplaceStrategy::CreateBeforeDelete => ReplaceStrategy::CreateBeforeDelete,
                ReplaceStrategy::Auto => {
                    let needs_live_old = dependents.iter().any(|(_, diff_type, strategy)| {
                        *diff_type == DiffType::Update
                            || (*diff_type == DiffType::Replace
                                && *strategy == Some(ReplaceStrategy::CreateBeforeDelete))
                    });
                    if needs_live_old {
                        ReplaceStrategy::CreateBeforeDelete
                    } else {
                        ReplaceStrategy::DeleteBeforeCreate
                    }
                }
                ReplaceStrategy::DeleteBeforeCreate => {
                    for (dep, diff_type, strategy) in &dependents {
                        if *diff_type == DiffType::Update {
                            escalations.push((
                                (*dep).to_string(),
                                format!("'{id}' is replaced delete-before-create"),
                            ));
                        } else if *diff_type == DiffType::Replace
                            && *strategy == Some(ReplaceStrategy::CreateBeforeDelete)
                        {
                            return Err(StackError::Plan(PlanError::ConflictingOperations {
                                message: format!(
                                    "'{id}' is replaced delete-before-create, but its dependent '{dep}' is replaced create-before-delete and needs '{id}' to stay live"
                                ),
                            }));
                        }
                    }
                    ReplaceStrategy::DeleteBeforeCreate
                }
            };

            if let Some(diff) = diffs.get_mut(*id) {
                diff.strategy = Some(strategy);
            }
        }

        Ok(escalations)
    }

    /// Appends deletions and computes the summary.
    fn finish(
        diffs: IndexMap<String, ResourceDiff>,
        graph: &Graph,
        snapshot: &StateSnapshot,
    ) -> DiffResult {
        let mut diffs: Vec<ResourceDiff> = diffs.into_values().collect();

        for resource in snapshot.resources.values() {
            if !graph.contains(&resource.id) {
                debug!("Resource '{}' no longer declared", resource.id);
                diffs.push(ResourceDiff {
                    id: resource.id.clone(),
                    type_tag: resource.type_tag.clone(),
                    diff_type: DiffType::Delete,
                    details: vec![],
                    reason: String::from("no longer declared"),
                    strategy: None,
                    provider_id: Some(resource.provider_id.clone()),
                    deposed: false,
                    old_hash: Some(resource.properties_hash.clone()),
                    new_hash: None,
                });
            }
        }

        for deposed in &snapshot.deposed {
            diffs.push(ResourceDiff {
                id: deposed.id.clone(),
                type_tag: deposed.type_tag.clone(),
                diff_type: DiffType::Delete,
                details: vec![],
                reason: format!("deposed instance {} left by an earlier replacement", deposed.provider_id),
                strategy: None,
                provider_id: Some(deposed.provider_id.clone()),
                deposed: true,
                old_hash: None,
                new_hash: None,
            });
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }
}

/// Formats field names as a readable list.
fn field_list(fields: &[&str]) -> String {
    match fields {
        [] => String::from("nothing"),
        [one] => format!("field '{one}'"),
        [init @ .., last] => {
            let init: Vec<String> = init.iter().map(|f| format!("'{f}'")).collect();
            format!("fields {} and '{last}'", init.join(", "))
        }
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.deletes > 0
    }

    /// Returns a summary string.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.creates, self.updates, self.replaces, self.deletes, self.unchanged
        )
    }

    /// Gets the diff for a node id. Deposed deletions are not returned.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.id == id && !d.deposed)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

/// True when `attribute` of an updated node keeps its recorded value.
///
/// The provider identity never changes in place. Other outputs echo the
/// property of the same name, so they change with it.
fn survives_update(target: &ResourceDiff, attribute: &str) -> bool {
    if attribute == "id" {
        return true;
    }
    let field = attribute.split('.').next().unwrap_or(attribute);
    !target.details.iter().any(|d| d.field == field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ReferenceResolver;
    use crate::state::ResourceState;
    use serde_json::json;

    fn node(id: &str, props: serde_json::Value) -> ResourceNode {
        ResourceNode::new(id, "test:core:Thing", props.as_object().unwrap()).unwrap()
    }

    fn graph(nodes: Vec<ResourceNode>) -> Graph {
        ReferenceResolver::new().resolve(nodes).unwrap()
    }

    /// Records `id` as applied with `props`, outputs `{id: <id>-1}`.
    fn record(snapshot: &mut StateSnapshot, id: &str, props: serde_json::Value, deps: &[&str]) {
        let provider_id = format!("{id}-1");
        let mut outputs = crate::provider::Outputs::new();
        outputs.insert(String::from("id"), json!(provider_id));
        snapshot.set_resource(
            ResourceState::new(id, "test:core:Thing", &provider_id, props, String::new())
                .with_outputs(outputs)
                .with_dependencies(deps.iter().map(ToString::to_string).collect()),
        );
    }

    fn diff_type(result: &DiffResult, id: &str) -> DiffType {
        result.get(id).unwrap().diff_type
    }

    #[test]
    fn test_fresh_graph_is_all_creates() {
        let g = graph(vec![node("a", json!({})), node("b", json!({"a": "${a.id}"}))]);
        let result = DiffEngine::new()
            .compute_diff(&g, &StateSnapshot::new("p", "dev"))
            .unwrap();

        assert_eq!(result.creates, 2);
        let b = result.get("b").unwrap();
        assert!(b.details[0].known_after_apply);
        assert!(b.new_hash.is_none());
        assert!(result.get("a").unwrap().new_hash.is_some());
    }

    #[test]
    fn test_applied_graph_is_unchanged() {
        let g = graph(vec![node("a", json!({"size": 1})), node("b", json!({"a": "${a.id}"}))]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"size": 1}), &[]);
        record(&mut snapshot, "b", json!({"a": "a-1"}), &["a"]);

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        assert!(!result.has_changes());
        assert_eq!(result.unchanged, 2);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let g = graph(vec![node("a", json!({"size": 2}))]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"size": 1, "old": true}), &[]);

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        let a = result.get("a").unwrap();
        assert_eq!(a.diff_type, DiffType::Update);
        assert_eq!(a.reason, "fields 'size' and 'old' changed");
        assert_eq!(a.details.len(), 2);
    }

    #[test]
    fn test_removed_node_is_delete() {
        let g = graph(vec![node("a", json!({}))]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({}), &[]);
        record(&mut snapshot, "b", json!({"a": "a-1"}), &["a"]);

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        assert_eq!(diff_type(&result, "b"), DiffType::Delete);
        assert_eq!(result.get("b").unwrap().provider_id.as_deref(), Some("b-1"));
        assert_eq!(result.summary(), "0 to create, 0 to update, 0 to replace, 1 to delete, 1 unchanged");
    }

    #[test]
    fn test_auto_replace_with_updated_dependent_is_cbd() {
        let g = graph(vec![
            node("a", json!({"cidr": "10.1.0.0/16"})).with_immutable(["cidr"]),
            node("b", json!({"a": "${a.id}"})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"cidr": "10.0.0.0/16"}), &[]);
        record(&mut snapshot, "b", json!({"a": "a-1"}), &["a"]);

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        let a = result.get("a").unwrap();
        assert_eq!(a.diff_type, DiffType::Replace);
        assert_eq!(a.strategy, Some(ReplaceStrategy::CreateBeforeDelete));
        assert_eq!(a.reason, "immutable field 'cidr' changed");

        let b = result.get("b").unwrap();
        assert_eq!(b.diff_type, DiffType::Update);
        assert!(b.details[0].known_after_apply);
    }

    #[test]
    fn test_reference_to_updated_output_is_known_after_apply() {
        let g = graph(vec![
            node("a", json!({"name": "y", "size": 1})),
            node("b", json!({"target": "${a.name}"})),
            node("c", json!({"a": "${a.id}"})),
            node("d", json!({"size": "${a.size}"})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"name": "x", "size": 1}), &[]);
        snapshot.resources.get_mut("a").unwrap().outputs.extend([
            (String::from("name"), json!("x")),
            (String::from("size"), json!(1)),
        ]);
        record(&mut snapshot, "b", json!({"target": "x"}), &["a"]);
        record(&mut snapshot, "c", json!({"a": "a-1"}), &["a"]);
        record(&mut snapshot, "d", json!({"size": 1}), &["a"]);

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        assert_eq!(diff_type(&result, "a"), DiffType::Update);

        let b = result.get("b").unwrap();
        assert_eq!(b.diff_type, DiffType::Update);
        assert!(b.details[0].known_after_apply);
        assert!(b.new_hash.is_none());

        assert_eq!(diff_type(&result, "c"), DiffType::NoChange);
        assert_eq!(diff_type(&result, "d"), DiffType::NoChange);
    }

    #[test]
    fn test_auto_replace_without_dependents_is_dbd() {
        let g = graph(vec![node("a", json!({"cidr": "10.1.0.0/16"})).with_immutable(["cidr"])]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"cidr": "10.0.0.0/16"}), &[]);

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        assert_eq!(
            result.get("a").unwrap().strategy,
            Some(ReplaceStrategy::DeleteBeforeCreate)
        );
    }

    #[test]
    fn test_explicit_dbd_escalates_updated_dependent() {
        let g = graph(vec![
            node("a", json!({"cidr": "10.1.0.0/16"}))
                .with_immutable(["cidr"])
                .with_replace_strategy(ReplaceStrategy::DeleteBeforeCreate),
            node("b", json!({"a": "${a.id}"})),
            node("c", json!({"b": "${b.id}"})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"cidr": "10.0.0.0/16"}), &[]);
        record(&mut snapshot, "b", json!({"a": "a-1"}), &["a"]);
        record(&mut snapshot, "c", json!({"b": "b-1"}), &["b"]);

        let err = DiffEngine::new().compute_diff(&g, &snapshot).unwrap_err();
        // b is forced to replace; its updated dependent c makes b
        // create-before-delete, which a cannot allow.
        assert!(matches!(
            err,
            StackError::Plan(PlanError::ConflictingOperations { .. })
        ));
    }

    #[test]
    fn test_explicit_dbd_escalation_cascades_dbd() {
        let g = graph(vec![
            node("a", json!({"cidr": "10.1.0.0/16"}))
                .with_immutable(["cidr"])
                .with_replace_strategy(ReplaceStrategy::DeleteBeforeCreate),
            node("b", json!({"a": "${a.id}"})),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({"cidr": "10.0.0.0/16"}), &[]);
        record(&mut snapshot, "b", json!({"a": "a-1"}), &["a"]);

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        let b = result.get("b").unwrap();
        assert_eq!(b.diff_type, DiffType::Replace);
        assert_eq!(b.strategy, Some(ReplaceStrategy::DeleteBeforeCreate));
        assert_eq!(b.reason, "'a' is replaced delete-before-create");
    }

    #[test]
    fn test_type_change_forces_replace_and_deposed_is_deleted() {
        let g = graph(vec![
            ResourceNode::new("a", "test:core:Other", json!({}).as_object().unwrap()).unwrap(),
        ]);
        let mut snapshot = StateSnapshot::new("p", "dev");
        record(&mut snapshot, "a", json!({}), &[]);
        record(&mut snapshot, "z", json!({}), &[]);
        snapshot.depose("z");

        let result = DiffEngine::new().compute_diff(&g, &snapshot).unwrap();
        assert_eq!(diff_type(&result, "a"), DiffType::Replace);
        let deposed = result.diffs.iter().find(|d| d.deposed).unwrap();
        assert_eq!(deposed.provider_id.as_deref(), Some("z-1"));
        assert_eq!(result.deletes, 1);
    }

    #[test]
    fn test_field_list() {
        assert_eq!(field_list(&["a"]), "field 'a'");
        assert_eq!(field_list(&["a", "b", "c"]), "fields 'a', 'b' and 'c'");
    }
}
