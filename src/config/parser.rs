//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StackError};
use std::path::Path;
use tracing::{debug, info};

use super::spec::StackConfig;

/// Configuration parser for loading stack descriptions.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `STACKWRIGHT_<SECTION>_<KEY>` (e.g., `STACKWRIGHT_PROJECT_NAME`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut StackConfig) {
        if let Ok(name) = std::env::var("STACKWRIGHT_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("STACKWRIGHT_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("STACKWRIGHT_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("STACKWRIGHT_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("STACKWRIGHT_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackwright.yaml", "stackwright.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StateBackend};
    use crate::graph::PropertyValue;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
state:
  backend: local
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
project:
  name: plant-report
  environment: prod

state:
  backend: s3
  bucket: stackwright-state
  prefix: plant-report/prod

provider:
  kind: http
  endpoint: https://control.example.com
  region: eu-west-1

execution:
  parallelism: 4
  run_timeout_secs: 900
  retry:
    max_attempts: 3

resources:
  report-bucket:
    type: storage-bucket
    properties:
      name: plant-reports
      versioned: true
  plant-table:
    type: key-value-table
    properties:
      name: plants
      partition_key: PlantID
      partition_key_type: string
      billing_mode: pay-per-request
  report-fn:
    type: compute-function
    properties:
      name: plant-report
      runtime: go1.x
      handler: main
      artifact: dist/plant-report.zip
      env.TABLE_NAME: { ref: plant-table }
      env.BUCKET_NAME: { ref: report-bucket }
    grants:
      - { resource: plant-table, access: read }
      - { resource: report-bucket, access: write }
  plant-route:
    type: api-route
    properties:
      name: plant
      path: /plant
      method: POST
      target: { ref: report-fn }
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.provider.kind, ProviderKind::Http);
        assert_eq!(config.execution.parallelism, 4);
        assert_eq!(config.execution.retry.max_attempts, 3);
        assert_eq!(config.execution.retry.initial_delay_ms, 250);
        assert_eq!(config.resources.len(), 4);
        assert_eq!(
            config.resources["report-bucket"].properties["versioned"],
            PropertyValue::Boolean(true)
        );
        assert_eq!(
            config.resources["plant-route"].properties["target"],
            PropertyValue::reference("report-fn")
        );
    }

    #[test]
    fn test_init_template_is_valid() {
        let config = ConfigParser::new()
            .parse_yaml(include_str!("../../templates/stackwright.yaml"), None)
            .unwrap();
        crate::config::ConfigValidator::new().validate(&config).unwrap();
        let graph = crate::graph::GraphBuilder::new().build_config(&config).unwrap();
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_invalid_yaml_reports_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", Some(Path::new("stackwright.yaml")))
            .unwrap_err();
        match err {
            StackError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("stackwright.yaml"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("stackwright.yaml"), "project: { name: x }").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("stackwright.yaml"));
    }
}
