//! Provider module for stackwright.
//!
//! A provider turns resolved requests into real infrastructure. This module
//! provides:
//! - The [`Provider`] trait and its request types
//! - A REST control-plane client ([`HttpProvider`])
//! - An in-process sandbox with fault injection ([`SimulatedProvider`])
//! - Retry with exponential backoff ([`RetryPolicy`])

mod client;
mod retry;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProviderError;
use crate::graph::{AccessLevel, ResourceType};

pub use client::HttpProvider;
pub use retry::RetryPolicy;
pub use simulated::{SimulatedInstance, SimulatedProvider};

/// Result of a provider call.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A property value with every reference replaced by a physical identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedValue {
    /// Boolean value.
    Boolean(bool),
    /// Numeric value.
    Number(f64),
    /// String value (resolved references become strings).
    String(String),
}

impl fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// An access grant on a resolved target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedGrant {
    /// Physical identifier of the target.
    pub target: String,
    /// Access level.
    pub access: AccessLevel,
}

/// Request to create a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Logical name, for provider-side labelling.
    pub logical_name: String,
    /// Resolved properties.
    pub properties: BTreeMap<String, ResolvedValue>,
    /// Resolved access grants.
    #[serde(default)]
    pub grants: Vec<ResolvedGrant>,
}

/// Request to change a resource in place.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Properties to set.
    #[serde(default)]
    pub set: BTreeMap<String, ResolvedValue>,
    /// Properties to remove.
    #[serde(default)]
    pub unset: Vec<String>,
    /// Full replacement grant list, when grants changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grants: Option<Vec<ResolvedGrant>>,
}

impl UpdateRequest {
    /// Returns true if the request changes nothing on the provider side.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.grants.is_none()
    }
}

/// Interface to an infrastructure provider.
///
/// Calls are not cancellable once issued: a caller that stops waiting does
/// not stop the provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource and returns its physical identifier.
    async fn create(&self, request: &CreateRequest) -> ProviderResult<String>;

    /// Changes a resource in place.
    async fn update(&self, physical_id: &str, request: &UpdateRequest) -> ProviderResult<()>;

    /// Deletes a resource.
    async fn delete(&self, physical_id: &str) -> ProviderResult<()>;

    /// Returns the provider name.
    fn name(&self) -> &'static str;
}
