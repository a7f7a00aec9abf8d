//! Configuration validation for stack descriptions.
//!
//! Structural checks on the settings sections and on logical names. Graph
//! rules (types, references, schemas, cycles) live in the graph builder.

use crate::error::{ConfigError, Result, StackError};
use std::collections::BTreeMap;
use tracing::debug;

use super::spec::{
    ExecutionConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceDecl, StackConfig,
    StateBackend, StateConfig,
};
use crate::graph::{PropertyValue, ResourceType, schema_for};

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all issues found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationIssue>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationIssue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings never fail validation.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        if result.errors.is_empty() {
            debug!(
                "Configuration validation passed with {} warnings",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!("Environment '{}' is invalid", project.environment),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push("state.bucket is ignored by the local backend".to_string());
                }
            }
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error(
                        "provider.endpoint",
                        "An endpoint is required for the http provider",
                    );
                }
                Some(endpoint) => match reqwest::Url::parse(endpoint) {
                    Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                    Ok(url) => result.error(
                        "provider.endpoint",
                        format!("Unsupported endpoint scheme '{}'", url.scheme()),
                    ),
                    Err(e) => result.error(
                        "provider.endpoint",
                        format!("Invalid endpoint '{endpoint}': {e}"),
                    ),
                },
            },
            ProviderKind::Simulated => {
                result.warnings.push(
                    "Using the simulated provider; no real infrastructure will be changed"
                        .to_string(),
                );
            }
        }

        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Request timeout must be positive");
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.error("execution.parallelism", "Parallelism must be at least 1");
        }
        if execution.lock_poll_ms == 0 {
            result.error("execution.lock_poll_ms", "Lock poll interval must be positive");
        }
        if execution.run_timeout_secs == Some(0) {
            result.error("execution.run_timeout_secs", "Run timeout must be positive");
        }
        if execution.retry.max_attempts == 0 {
            result.error(
                "execution.retry.max_attempts",
                "At least one attempt is required",
            );
        }
        if execution.retry.initial_delay_ms > execution.retry.max_delay_ms {
            result.error(
                "execution.retry.initial_delay_ms",
                "Initial retry delay exceeds the maximum delay",
            );
        }
    }

    fn validate_resources(
        resources: &BTreeMap<String, ResourceDecl>,
        result: &mut ValidationResult,
    ) {
        if resources.is_empty() {
            result
                .warnings
                .push("No resources declared; apply will remove everything in state".to_string());
        }

        let mut physical_names: BTreeMap<(&str, &str), &str> = BTreeMap::new();

        for (name, decl) in resources {
            let field = format!("resources.{name}");
            if !is_valid_name(name) {
                result.error(
                    field.clone(),
                    format!(
                        "Resource name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."
                    ),
                );
            }

            let Ok(resource_type) = decl.type_tag.parse::<ResourceType>() else {
                // Reported by the graph builder.
                continue;
            };

            if schema_for(resource_type).unique_name {
                if let Some(PropertyValue::String(physical)) = decl.properties.get("name") {
                    if let Some(other) =
                        physical_names.insert((resource_type.as_str(), physical.as_str()), name.as_str())
                    {
                        result.error(
                            format!("{field}.properties.name"),
                            format!(
                                "'{other}' and '{name}' both use the {resource_type} name '{physical}'"
                            ),
                        );
                    }
                }
            }

            if resource_type == ResourceType::ComputeFunction {
                for (key, value) in &decl.properties {
                    let Some(target) = value.as_reference() else {
                        continue;
                    };
                    let grantable = resources
                        .get(target)
                        .and_then(|t| t.type_tag.parse::<ResourceType>().ok())
                        .is_some_and(ResourceType::is_grantable);
                    if grantable && !decl.grants.iter().any(|g| g.resource == target) {
                        result.warnings.push(format!(
                            "Resource '{name}' references '{target}' in {key} without an access grant"
                        ));
                    }
                }
            }
        }
    }
}

/// Checks if a name is valid (lowercase alphanumeric with hyphens).
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase() {
            return false;
        }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if there are no errors.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, GrantDecl};

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("plant-table"));
        assert!(is_valid_name("fn-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Plant")); // uppercase
        assert!(!is_valid_name("2fn")); // starts with number
        assert!(!is_valid_name("plant_table")); // underscore
        assert!(!is_valid_name("plant-")); // ends with hyphen
        assert!(!is_valid_name("plant--table")); // consecutive hyphens
    }

    #[test]
    fn test_http_provider_needs_endpoint() {
        let config = parse("project: { name: p }\nprovider: { kind: http }\n");
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(matches!(
            err,
            StackError::Config(ConfigError::ValidationError { field: Some(f), .. }) if f == "provider.endpoint"
        ));
    }

    #[test]
    fn test_s3_backend_needs_bucket() {
        let config = parse("project: { name: p }\nstate: { backend: s3 }\n");
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_physical_name_rejected() {
        let config = parse(
            r"
project: { name: p }
resources:
  a: { type: storage-bucket, properties: { name: reports } }
  b: { type: storage-bucket, properties: { name: reports } }
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_missing_grant_is_warning() {
        let yaml = r"
project: { name: p }
resources:
  table: { type: key-value-table, properties: { name: t, partition_key: id } }
  fn:
    type: compute-function
    properties: { name: f, runtime: go1.x, handler: main, env.TABLE: { ref: table } }
";
        let mut config = parse(yaml);
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("without an access grant")));

        config.resources.get_mut("fn").unwrap().grants.push(GrantDecl {
            resource: "table".to_string(),
            access: "read".to_string(),
        });
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(!result.warnings.iter().any(|w| w.contains("without an access grant")));
    }
}
