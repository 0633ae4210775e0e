//! Definition file types for a stack.
//!
//! This module defines the structs that map to `stackplan.yaml`. Together
//! they fully describe the desired state; property values are kept as raw
//! YAML-derived JSON and only turned into graph nodes by [`crate::graph`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The root structure of a stack definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine settings.
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Values substituted for `${var.<name>}` expressions.
    #[serde(default)]
    pub variables: IndexMap<String, serde_json::Value>,
    /// Shared base property objects, merged via `extends`.
    #[serde(default)]
    pub defaults: IndexMap<String, serde_json::Map<String, serde_json::Value>>,
    /// Optional guardrails configuration.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsConfig {
    /// Which API endpoint flavour the stack is built for.
    #[serde(default)]
    pub api_endpoint: EndpointVisibility,
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

/// Visibility of the API front door.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointVisibility {
    /// Reachable only through the VPC interface endpoint.
    #[default]
    Private,
    /// Reachable from the internet.
    Public,
}

/// Per-resource preference for how a replacement is carried out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Let the planner pick the safe strategy.
    #[default]
    Auto,
    /// Delete the old instance, then create the new one.
    DeleteBeforeCreate,
    /// Create the new instance, re-point dependents, then delete the old one.
    CreateBeforeDelete,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Unique id within the stack.
    pub id: String,
    /// Type tag, `provider:service:Kind`.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Property bag; strings may contain `${node.attr}` references.
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Explicit dependencies in addition to the ones implied by references.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Properties whose change forces a replacement.
    #[serde(default)]
    pub immutable: Vec<String>,
    /// Defaults blocks merged under the properties, in order.
    #[serde(default)]
    pub extends: Vec<String>,
    /// Replacement strategy preference.
    #[serde(default)]
    pub replace_strategy: ReplaceStrategy,
    /// Only declare this resource for the given endpoint visibility.
    #[serde(default)]
    pub endpoint: Option<EndpointVisibility>,
}

/// Guardrails applied to plans.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GuardrailsConfig {
    /// Maximum number of delete operations (including replacements).
    #[serde(default)]
    pub max_deletes: Option<usize>,
    /// Resource ids that must never be deleted or replaced.
    #[serde(default)]
    pub prevent_destroy: Vec<String>,
}

// Default value functions

const fn default_parallelism() -> usize {
    10
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            api_endpoint: EndpointVisibility::default(),
            parallelism: default_parallelism(),
        }
    }
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the resources enabled for the configured endpoint visibility.
    pub fn active_resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        let visibility = self.settings.api_endpoint;
        self.resources
            .iter()
            .filter(move |r| r.endpoint.is_none_or(|e| e == visibility))
    }

    /// Returns the ids of the enabled resources.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.active_resources().map(|r| r.id.as_str()).collect()
    }
}

impl std::fmt::Display for EndpointVisibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Public => write!(f, "public"),
        }
    }
}

impl std::str::FromStr for EndpointVisibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(Self::Private),
            "public" => Ok(Self::Public),
            other => Err(format!("Invalid endpoint visibility: {other}. Expected: private or public")),
        }
    }
}

impl std::fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::DeleteBeforeCreate => "delete_before_create",
            Self::CreateBeforeDelete => "create_before_delete",
        };
        write!(f, "{s}")
    }
}
