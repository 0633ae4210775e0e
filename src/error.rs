//! Error types for the stackplan engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! loading the definition, resolving the graph, planning, talking to a
//! provider, persisting state and applying a plan.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the stackplan engine.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph construction errors (references, cycles).
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors raised outside of a plan operation.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A `${var.name}` expression names an undefined variable.
    #[error("Undefined variable '{name}' used by resource '{resource}'")]
    UndefinedVariable {
        /// Variable name.
        name: String,
        /// Resource using it.
        resource: String,
    },

    /// An `extends` entry names an undefined defaults block.
    #[error("Resource '{resource}' extends unknown defaults '{name}'")]
    UnknownDefaults {
        /// Defaults block name.
        name: String,
        /// Resource extending it.
        resource: String,
    },
}

/// Errors raised while building or resolving the resource graph.
///
/// Both variants of interest here fail fast before any provider call.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A property or explicit dependency points at an undeclared node.
    #[error("Resource '{node}' references unknown resource '{target}' (in {location})")]
    DanglingReference {
        /// Node holding the reference.
        node: String,
        /// Missing target id.
        target: String,
        /// Property path or `depends_on`.
        location: String,
    },

    /// The graph contains a cycle.
    #[error("Cyclic dependency detected: {}", format_cycle(.cycle))]
    CyclicDependency {
        /// Member ids of the cycle, in traversal order.
        cycle: Vec<String>,
    },

    /// Two nodes share an id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// A reference expression could not be parsed.
    #[error("Invalid reference '{expression}' in resource '{node}': {reason}")]
    InvalidReference {
        /// Node holding the expression.
        node: String,
        /// The raw expression.
        expression: String,
        /// Why it is invalid.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State file could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock this run holds was released or taken over.
    #[error("State lock {lock_id} is no longer held by this run")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// The snapshot changed since a saved plan was produced.
    #[error("Saved plan is stale: planned against serial {planned}, state is at serial {current}")]
    StalePlan {
        /// Serial the plan was built against.
        planned: u64,
        /// Serial currently stored.
        current: u64,
    },
}

/// Errors returned by a provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Request failed with a non-success status.
    #[error("Provider request failed: {status} - {message}")]
    RequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Resource not found.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider identity of the missing resource.
        id: String,
    },

    /// The provider refused the requested change.
    #[error("Provider rejected the request: {message}")]
    Rejected {
        /// Reason given by the provider.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Conflicting operations in plan.
    #[error("Conflicting operations in plan: {message}")]
    ConflictingOperations {
        /// Description of the conflict.
        message: String,
    },

    /// Dependency resolution failed.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },

    /// Plan violates configured guardrails.
    #[error("Plan violates guardrails: {}", .violations.join("; "))]
    GuardrailViolation {
        /// All violations found.
        violations: Vec<String>,
    },
}

/// Errors raised while applying a plan.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A provider call failed for one operation.
    #[error("{operation} of '{node}' failed: {source}")]
    OperationFailed {
        /// Operation kind (create, update, delete).
        operation: String,
        /// Node id.
        node: String,
        /// Underlying provider failure.
        #[source]
        source: ProviderError,
    },

    /// A reference could not be resolved against the snapshot.
    #[error("Resource '{node}' references '{target}.{attribute}' which has no recorded value")]
    UnresolvedReference {
        /// Node holding the reference.
        node: String,
        /// Target node id.
        target: String,
        /// Target output attribute.
        attribute: String,
    },

    /// At least one operation did not succeed.
    #[error("{0}")]
    PartialApply(PartialApplyReport),
}

/// Summary of an apply run in which not every operation succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialApplyReport {
    /// Operations that succeeded, as `"<op> <node>"`.
    pub succeeded: Vec<String>,
    /// Operations that failed, with the error message.
    pub failed: Vec<(String, String)>,
    /// Operations skipped because a dependency failed.
    pub skipped: Vec<String>,
    /// Operations never started because the run was cancelled or halted.
    pub not_started: Vec<String>,
    /// Snapshot writes that failed after the provider call succeeded.
    pub storage_errors: Vec<String>,
}

impl fmt::Display for PartialApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Partial apply: {} succeeded, {} failed, {} skipped, {} not started",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.not_started.len()
        )?;
        for (op, message) in &self.failed {
            write!(f, "\n  failed: {op}: {message}")?;
        }
        for op in &self.skipped {
            write!(f, "\n  skipped: {op}")?;
        }
        for op in &self.not_started {
            write!(f, "\n  not started: {op}")?;
        }
        for message in &self.storage_errors {
            write!(f, "\n  state not saved: {message}")?;
        }
        Ok(())
    }
}

/// Formats a cycle path for display.
fn format_cycle(cycle: &[String]) -> String {
    let Some(first) = cycle.first() else {
        return String::from("empty cycle");
    };
    format!("{} -> {first}", cycle.join(" -> "))
}

/// Result type alias for stackplan operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(e) => e.retry_delay_secs(),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if this error was raised by validation, before any
    /// provider call could have been made.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a request error.
    #[must_use]
    pub fn request(status: u16, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::NetworkError { .. })
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::NetworkError { .. } => Some(5),
            _ => None,
        }
    }
}
