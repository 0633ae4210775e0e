//! State types for the last applied snapshot.
//!
//! The snapshot is the sole source of truth for diffing: it records, per
//! resource, the provider identity, the resolved properties that were sent,
//! the outputs that came back and the dependencies in force at the time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::provider::Outputs;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied definition.
    pub config_hash: String,
    /// Incremented once per apply that changed anything.
    #[serde(default)]
    pub serial: u64,
    /// Live resources by node id.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Old instances of create-before-delete replacements still to delete.
    #[serde(default)]
    pub deposed: Vec<DeposedResource>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Recorded state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Node id.
    pub id: String,
    /// Type tag.
    pub type_tag: String,
    /// Provider-assigned identity.
    pub provider_id: String,
    /// Resolved properties sent on the last create or update.
    pub properties: serde_json::Value,
    /// Hash of `properties`.
    pub properties_hash: String,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Outputs,
    /// Node ids this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A replaced instance that has not been deleted yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeposedResource {
    /// Node id the instance belonged to.
    pub id: String,
    /// Type tag.
    pub type_tag: String,
    /// Provider-assigned identity of the old instance.
    pub provider_id: String,
    /// When the instance was deposed.
    pub deposed_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: HistoryOperation,
    /// Definition hash applied.
    pub config_hash: String,
    /// Snapshot serial after the run.
    pub serial: u64,
    /// Operations that succeeded, as `"<op> <node>"`.
    pub resources: Vec<String>,
    /// Whether every operation succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// A regular apply.
    Apply,
    /// A destroy.
    Destroy,
}

impl StateSnapshot {
    /// Creates a new empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            serial: 0,
            resources: BTreeMap::new(),
            deposed: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.deposed.is_empty()
    }

    /// Gets a resource by node id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Adds or replaces a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        self.resources.insert(resource.id.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by node id.
    pub fn remove_resource(&mut self, id: &str) -> Option<ResourceState> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Moves the live instance of `id` to the deposed list.
    pub fn depose(&mut self, id: &str) -> Option<DeposedResource> {
        let resource = self.resources.remove(id)?;
        let deposed = DeposedResource {
            id: resource.id,
            type_tag: resource.type_tag,
            provider_id: resource.provider_id,
            deposed_at: Utc::now(),
        };
        self.deposed.push(deposed.clone());
        self.last_updated = Utc::now();
        Some(deposed)
    }

    /// Removes a deposed instance by provider identity.
    pub fn remove_deposed(&mut self, provider_id: &str) -> Option<DeposedResource> {
        let index = self.deposed.iter().position(|d| d.provider_id == provider_id)?;
        self.last_updated = Utc::now();
        Some(self.deposed.remove(index))
    }

    /// Looks up an output attribute of a live resource. `id` falls back to
    /// the provider identity when the provider did not report it.
    #[must_use]
    pub fn output(&self, node: &str, attribute: &str) -> Option<serde_json::Value> {
        let resource = self.resources.get(node)?;
        resource.outputs.get(attribute).cloned().or_else(|| {
            (attribute == "id").then(|| serde_json::Value::String(resource.provider_id.clone()))
        })
    }

    /// Returns the ids of recorded resources that depended on `id`.
    #[must_use]
    pub fn recorded_dependents(&self, id: &str) -> Vec<&str> {
        self.resources
            .values()
            .filter(|r| r.dependencies.iter().any(|d| d == id))
            .map(|r| r.id.as_str())
            .collect()
    }

    /// Returns all resource ids.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl ResourceState {
    /// Creates a resource record.
    #[must_use]
    pub fn new(
        id: &str,
        type_tag: &str,
        provider_id: &str,
        properties: serde_json::Value,
        properties_hash: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            type_tag: type_tag.to_string(),
            provider_id: provider_id.to_string(),
            properties,
            properties_hash,
            outputs: Outputs::new(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Outputs) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(
        operation: HistoryOperation,
        config_hash: &str,
        serial: u64,
        resources: Vec<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            serial,
            resources,
            success: true,
            error: None,
        }
    }

    /// Marks the entry as failed.
    #[must_use]
    pub fn failed(mut self, error: &str) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(id: &str, deps: &[&str]) -> ResourceState {
        ResourceState::new(id, "aws:ec2:Vpc", &format!("{id}-1"), json!({}), String::new())
            .with_dependencies(deps.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_output_falls_back_to_provider_id() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        let mut outputs = Outputs::new();
        outputs.insert(String::from("arn"), json!("arn:vpc"));
        snapshot.set_resource(resource("vpc", &[]).with_outputs(outputs));

        assert_eq!(snapshot.output("vpc", "arn"), Some(json!("arn:vpc")));
        assert_eq!(snapshot.output("vpc", "id"), Some(json!("vpc-1")));
        assert_eq!(snapshot.output("vpc", "dns_name"), None);
        assert_eq!(snapshot.output("nlb", "id"), None);
    }

    #[test]
    fn test_depose_moves_instance() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        snapshot.set_resource(resource("nlb", &[]));

        let deposed = snapshot.depose("nlb").unwrap();
        assert_eq!(deposed.provider_id, "nlb-1");
        assert!(snapshot.get("nlb").is_none());
        assert!(!snapshot.is_empty());

        assert!(snapshot.remove_deposed("nlb-1").is_some());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_recorded_dependents() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        snapshot.set_resource(resource("vpc", &[]));
        snapshot.set_resource(resource("sg", &["vpc"]));
        snapshot.set_resource(resource("alb", &["sg", "vpc"]));

        assert_eq!(snapshot.recorded_dependents("vpc"), vec!["alb", "sg"]);
        assert!(snapshot.recorded_dependents("alb").is_empty());
    }

    #[test]
    fn test_history_is_capped() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        for serial in 0..105 {
            snapshot.add_history(HistoryEntry::new(HistoryOperation::Apply, "h", serial, vec![]));
        }
        assert_eq!(snapshot.history.len(), 100);
        assert_eq!(snapshot.history[0].serial, 5);
    }

    #[test]
    fn test_snapshot_serde() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        snapshot.set_resource(resource("vpc", &[]));
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
