//! Configuration specification types for stackwright.
//!
//! This module defines the structs that map to the `stackwright.yaml` file.
//! The `resources` section is the declarative description of the stack; the
//! other sections describe where state lives, which provider to talk to, and
//! how a run is executed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::graph::PropertyValue;

/// The root configuration structure for a stackwright project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Run execution settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDecl>,
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

/// Provider selection and connection settings.
///
/// Everything a provider needs is carried here and handed over at
/// construction time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider implementation.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Control-plane base URL (http provider).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Target region passed with every create request.
    #[serde(default)]
    pub region: Option<String>,
    /// Per-request timeout in seconds (http provider).
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    /// File the simulated provider persists its instances to.
    #[serde(default)]
    pub path: Option<String>,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process sandbox provider.
    #[default]
    Simulated,
    /// REST control-plane provider.
    Http,
}

/// Run execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of steps in flight (1 = strictly sequential).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// How long to wait for the state lease before giving up.
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
    /// Interval between lease acquisition attempts.
    #[serde(default = "default_lock_poll")]
    pub lock_poll_ms: u64,
    /// Bound on how long a run waits for provider operations.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry settings for transient provider errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

/// A declared resource as written in the description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Type tag (checked by the graph builder).
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Typed property bag.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Explicit dependencies in addition to references.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Access grants held by this resource.
    #[serde(default)]
    pub grants: Vec<GrantDecl>,
}

/// A declared access grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantDecl {
    /// Logical name of the resource access is granted on.
    pub resource: String,
    /// Access level (`read`, `write`, `read-write`).
    pub access: String,
}

// Default value functions

const fn default_request_timeout() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    1
}

const fn default_lock_wait() -> u64 {
    30
}

const fn default_lock_poll() -> u64 {
    500
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_delay() -> u64 {
    250
}

const fn default_max_delay() -> u64 {
    8_000
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            region: None,
            timeout_secs: default_request_timeout(),
            path: None,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            lock_wait_secs: default_lock_wait(),
            lock_poll_ms: default_lock_poll(),
            run_timeout_secs: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns declared logical names in order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let yaml = "project:\n  name: plant-report\n";
        let config: StackConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Simulated);
        assert_eq!(config.execution.parallelism, 1);
        assert_eq!(config.execution.retry.max_attempts, 5);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_resource_decl_with_reference() {
        let yaml = r"
project:
  name: plant-report
resources:
  report-fn:
    type: compute-function
    properties:
      name: plant-report
      memory_mb: 128
      env.TABLE_NAME: { ref: plant-table }
    grants:
      - resource: plant-table
        access: read
";
        let config: StackConfig = serde_yaml::from_str(yaml).unwrap();
        let decl = &config.resources["report-fn"];

        assert_eq!(decl.type_tag, "compute-function");
        assert_eq!(
            decl.properties["env.TABLE_NAME"],
            PropertyValue::reference("plant-table")
        );
        assert_eq!(decl.properties["memory_mb"], PropertyValue::Number(128.0));
        assert_eq!(decl.grants[0].access, "read");
    }
}
