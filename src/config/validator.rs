//! Validation for stack definitions.
//!
//! This module checks a parsed definition for values that are well-formed
//! YAML but cannot describe a valid stack, before any graph is built.

use crate::error::{ConfigError, Result, StackError};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::spec::{EndpointVisibility, ResourceConfig, StackConfig, StateBackend, StateConfig};

/// Validator for stack definitions.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack definition.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Stack definition validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_settings(config, &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_guardrails(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(config: &StackConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {}
        }
    }

    /// Validates engine settings.
    fn validate_settings(config: &StackConfig, result: &mut ValidationResult) {
        if config.settings.parallelism == 0 {
            result.errors.push(ValidationError {
                field: String::from("settings.parallelism"),
                message: String::from("Parallelism must be at least 1"),
            });
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result.warnings.push(String::from("No resources defined in stack"));
            return;
        }

        let mut declared: HashMap<&str, Vec<Option<EndpointVisibility>>> = HashMap::new();
        let mut used_defaults = HashSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            // An id may be declared once per endpoint visibility.
            let gates = declared.entry(resource.id.as_str()).or_default();
            let overlaps = gates.iter().any(|gate| match (gate, resource.endpoint) {
                (Some(existing), Some(endpoint)) => *existing == endpoint,
                _ => true,
            });
            if overlaps {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!("Duplicate resource id: {}", resource.id),
                });
            }
            gates.push(resource.endpoint);

            if !is_valid_id(&resource.id) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!(
                        "Resource id '{}' is invalid. Must start with a letter and contain only lowercase letters, digits, '_' or '-'.",
                        resource.id
                    ),
                });
            }

            if !is_valid_type_tag(&resource.type_tag) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!(
                        "Type tag '{}' is invalid. Expected 'provider:service:Kind'.",
                        resource.type_tag
                    ),
                });
            }

            for (j, name) in resource.extends.iter().enumerate() {
                if config.defaults.contains_key(name) {
                    used_defaults.insert(name.as_str());
                } else {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.extends[{j}]"),
                        message: format!("Unknown defaults block: {name}"),
                    });
                }
            }

            Self::validate_resource_fields(resource, &prefix, result);
        }

        for name in config.defaults.keys() {
            if !used_defaults.contains(name.as_str()) {
                result
                    .warnings
                    .push(format!("defaults.{name}: Defaults block is never extended"));
            }
        }

        let mut used_variables = HashSet::new();
        for resource in &config.resources {
            for value in resource.properties.values() {
                collect_variable_uses(value, &mut used_variables);
            }
        }
        for block in config.defaults.values() {
            for value in block.values() {
                collect_variable_uses(value, &mut used_variables);
            }
        }
        for name in config.variables.keys() {
            if !used_variables.contains(name) {
                result
                    .warnings
                    .push(format!("variables.{name}: Variable is never used"));
            }
        }
    }

    /// Validates per-resource field consistency.
    fn validate_resource_fields(
        resource: &ResourceConfig,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        if resource.properties.is_empty() && resource.extends.is_empty() {
            result
                .warnings
                .push(format!("{prefix}: Resource '{}' declares no properties", resource.id));
        }

        if resource.depends_on.iter().any(|d| d == &resource.id) {
            result.errors.push(ValidationError {
                field: format!("{prefix}.depends_on"),
                message: format!("Resource '{}' cannot depend on itself", resource.id),
            });
        }

        let mut seen = HashSet::new();
        for (j, field) in resource.immutable.iter().enumerate() {
            if !seen.insert(field) {
                result.warnings.push(format!(
                    "{prefix}.immutable[{j}]: Field '{field}' listed more than once"
                ));
            }
        }
    }

    /// Validates guardrails configuration.
    fn validate_guardrails(config: &StackConfig, result: &mut ValidationResult) {
        if let Some(guardrails) = &config.guardrails {
            for (i, id) in guardrails.prevent_destroy.iter().enumerate() {
                if !config.resources.iter().any(|r| &r.id == id) {
                    result.errors.push(ValidationError {
                        field: format!("guardrails.prevent_destroy[{i}]"),
                        message: format!("Unknown resource id: {id}"),
                    });
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource ids also allow underscores, and may not contain '.', which
/// separates the id from the attribute in a reference.
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Records every `${var.<name>}` found in string leaves of `value`.
fn collect_variable_uses(value: &serde_json::Value, used: &mut HashSet<String>) {
    match value {
        serde_json::Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${var.") {
                let after = &rest[start + 6..];
                let Some(end) = after.find('}') else { break };
                used.insert(after[..end].to_string());
                rest = &after[end..];
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_variable_uses(item, used);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_variable_uses(item, used);
            }
        }
        _ => {}
    }
}

/// Type tags have three non-empty, colon-separated segments.
fn is_valid_type_tag(tag: &str) -> bool {
    let parts: Vec<&str> = tag.split(':').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
