//! Error types for the stackwright orchestrator.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph validation, planning, provider calls, state
//! management, and apply.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stackwright.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The description does not form a valid resource graph.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors raised outside of an apply run.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Apply-time errors.
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

    /// A setting failed validation.
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
}

/// Errors raised while turning a description into a resource graph.
///
/// These are always fatal and are raised before any side effect.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A reference names a resource that is not declared.
    #[error("Resource '{resource}' references undeclared resource '{reference}' ({via})")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The unresolved logical name.
        reference: String,
        /// Where the reference appeared (`depends_on`, a property key, a grant).
        via: String,
    },

    /// The type tag is not part of the resource vocabulary.
    #[error("Resource '{resource}' has unknown type '{type_tag}'")]
    UnknownType {
        /// Resource carrying the tag.
        resource: String,
        /// The unrecognised tag.
        type_tag: String,
    },

    /// A resource depends on itself.
    #[error("Resource '{resource}' depends on itself")]
    SelfDependency {
        /// The offending resource.
        resource: String,
    },

    /// The dependency graph has a cycle.
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle {
        /// Logical names on the cycle, first name repeated at the end.
        cycle: Vec<String>,
    },

    /// A property has the wrong kind or an invalid value.
    #[error("Resource '{resource}' property '{property}': {message}")]
    InvalidProperty {
        /// Resource holding the property.
        resource: String,
        /// Property key.
        property: String,
        /// What is wrong with it.
        message: String,
    },

    /// A required property is absent.
    #[error("Resource '{resource}' is missing required property '{property}'")]
    MissingProperty {
        /// Resource missing the property.
        resource: String,
        /// Property key.
        property: String,
    },

    /// The property key is not known for the resource type.
    #[error("Resource '{resource}' has unknown property '{property}' for type {resource_type}")]
    UnknownProperty {
        /// Resource holding the property.
        resource: String,
        /// Property key.
        property: String,
        /// Declared type.
        resource_type: String,
    },

    /// An access grant is not allowed.
    #[error("Resource '{resource}' has an invalid grant on '{target}': {message}")]
    InvalidGrant {
        /// Resource carrying the grant.
        resource: String,
        /// Grant target.
        target: String,
        /// What is wrong with it.
        message: String,
    },

    /// The recorded type cannot be reconciled with the declared one.
    #[error("Resource '{resource}' is recorded as {recorded} but declared as {declared}: {message}")]
    TypeConflict {
        /// Logical name.
        resource: String,
        /// Type in the state snapshot.
        recorded: String,
        /// Type in the description.
        declared: String,
        /// Why the change cannot be planned.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// No ordering satisfies the step constraints.
    #[error("No valid ordering exists; steps stuck on a cycle: {}", .steps.join(", "))]
    CyclicPlan {
        /// Steps that could not be scheduled.
        steps: Vec<String>,
    },

    /// The plan replaces resources with downtime and nobody accepted it.
    #[error("Plan replaces {} with downtime; re-run with --accept-downtime to proceed", .resources.join(", "))]
    DowntimeNotAcknowledged {
        /// Resources replaced delete-before-create.
        resources: Vec<String>,
    },
}

/// An error reported by a provider for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Short machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether retrying the same request may succeed.
    pub retryable: bool,
    /// Minimum delay requested by the provider before retrying, in milliseconds.
    pub retry_after_ms: Option<u64>,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Another run holds the lease and the bounded wait elapsed.
    #[error(
        "State is locked by another run (holder: {holder}, since: {since}); gave up after {waited_secs}s"
    )]
    LockContention {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
        /// How long this run waited.
        waited_secs: u64,
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

    /// State belongs to another project or environment.
    #[error("State belongs to {found}, not {expected}")]
    ProjectMismatch {
        /// Project/environment of this run.
        expected: String,
        /// Project/environment recorded in the state.
        found: String,
    },
}

/// Errors raised while applying a plan.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A step failed and the run halted.
    #[error(
        "{operation} of '{resource}' failed: {reason} ({committed} committed, {failed} failed, {skipped} not attempted)"
    )]
    Halted {
        /// Logical name of the failing resource.
        resource: String,
        /// Operation kind of the failing step.
        operation: String,
        /// Failure reason.
        reason: String,
        /// Steps committed before the halt.
        committed: usize,
        /// Steps that failed.
        failed: usize,
        /// Steps never attempted.
        skipped: usize,
    },
}

/// Result type alias for stackwright operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Process exit status for a failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Configuration or validation failure.
    Validation,
    /// Planning failure.
    Planning,
    /// Failure while applying.
    Apply,
    /// Another run holds the state lease.
    LockContention,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Returns the process exit code for this failure kind.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Validation => 2,
            Self::Planning => 3,
            Self::Apply => 4,
            Self::LockContention => 5,
            Self::Other => 1,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Planning => write!(f, "planning"),
            Self::Apply => write!(f, "apply"),
            Self::LockContention => write!(f, "lock contention"),
            Self::Other => write!(f, "error"),
        }
    }
}

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classifies this error for exit-code reporting.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) | Self::Validation(_) => FailureKind::Validation,
            Self::Plan(_) => FailureKind::Planning,
            Self::Provider(_) | Self::Apply(_) => FailureKind::Apply,
            Self::State(StateError::LockContention { .. }) => FailureKind::LockContention,
            Self::State(_) | Self::Io(_) | Self::Internal(_) => FailureKind::Other,
        }
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

impl ValidationError {
    /// Creates an invalid-property error.
    #[must_use]
    pub fn property(
        resource: impl Into<String>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidProperty {
            resource: resource.into(),
            property: property.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-grant error.
    #[must_use]
    pub fn grant(
        resource: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidGrant {
            resource: resource.into(),
            target: target.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a non-retryable error.
    #[must_use]
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            retry_after_ms: None,
        }
    }

    /// Creates a retryable error.
    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
            retry_after_ms: None,
        }
    }

    /// Creates a throttling error with the provider's retry hint.
    #[must_use]
    pub fn throttled(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self {
            code: Self::THROTTLED.to_string(),
            message: message.into(),
            retryable: true,
            retry_after_ms,
        }
    }

    /// Creates a not-found error for a physical identifier.
    #[must_use]
    pub fn not_found(physical_id: &str) -> Self {
        Self::fatal(Self::NOT_FOUND, format!("no resource with id {physical_id}"))
    }

    /// Creates a transport-level error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::transient(Self::NETWORK, message)
    }

    /// Returns true if the provider reported the resource as absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }

    /// Code for rate limiting.
    pub const THROTTLED: &'static str = "throttled";
    /// Code for server-side failures.
    pub const UNAVAILABLE: &'static str = "unavailable";
    /// Code for unknown identifiers.
    pub const NOT_FOUND: &'static str = "not_found";
    /// Code for name or state conflicts.
    pub const CONFLICT: &'static str = "conflict";
    /// Code for rejected requests.
    pub const REJECTED: &'static str = "rejected";
    /// Code for transport failures.
    pub const NETWORK: &'static str = "network";
    /// Code for malformed responses.
    pub const INVALID_RESPONSE: &'static str = "invalid_response";
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_per_kind() {
        let validation: StackError = ValidationError::SelfDependency {
            resource: "a".to_string(),
        }
        .into();
        assert_eq!(validation.kind().exit_code(), 2);

        let plan: StackError = PlanError::CyclicPlan { steps: vec![] }.into();
        assert_eq!(plan.kind().exit_code(), 3);

        let lock: StackError = StateError::LockContention {
            holder: "h".to_string(),
            since: "now".to_string(),
            waited_secs: 1,
        }
        .into();
        assert_eq!(lock.kind().exit_code(), 5);

        let apply: StackError = ApplyError::Halted {
            resource: "a".to_string(),
            operation: "create".to_string(),
            reason: "boom".to_string(),
            committed: 2,
            failed: 1,
            skipped: 2,
        }
        .into();
        assert_eq!(apply.kind().exit_code(), 4);
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ValidationError::Cycle {
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }
}
