//! Configuration module for stackwright.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackwright.yaml`
//! - Validation of settings and logical names
//! - Computing description hashes and resource fingerprints

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    ExecutionConfig, GrantDecl, ProjectConfig, ProviderConfig, ProviderKind, ResourceDecl,
    RetryConfig, StackConfig, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationIssue, ValidationResult, is_valid_name};
pub use hash::ConfigHasher;
