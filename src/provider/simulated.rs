//! In-process sandbox provider.
//!
//! [`SimulatedProvider`] keeps instances in memory, optionally mirrored to a
//! JSON file so that successive CLI runs see the same "cloud". Faults can be
//! injected on a given mutating call to exercise retry and halt paths.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ProviderError, Result, StackError};
use crate::graph::{ResourceType, schema_for};

use super::{CreateRequest, Provider, ProviderResult, ResolvedGrant, ResolvedValue, UpdateRequest};

/// An instance held by the simulated provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedInstance {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Logical name the instance was created for.
    pub logical_name: String,
    /// Current properties.
    pub properties: BTreeMap<String, ResolvedValue>,
    /// Current grants.
    #[serde(default)]
    pub grants: Vec<ResolvedGrant>,
}

/// Sandbox provider with optional file persistence and fault injection.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    instances: Mutex<BTreeMap<String, SimulatedInstance>>,
    path: Option<PathBuf>,
    latency: Duration,
    calls: AtomicUsize,
    faults: Mutex<BTreeMap<usize, ProviderError>>,
    log: Mutex<Vec<String>>,
}

const fn id_prefix(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::StorageBucket => "bkt",
        ResourceType::KeyValueTable => "tbl",
        ResourceType::ComputeFunction => "fn",
        ResourceType::ApiRoute => "route",
    }
}

fn new_physical_id(resource_type: ResourceType) -> String {
    let mut suffix = uuid::Uuid::new_v4().simple().to_string();
    suffix.truncate(8);
    format!("{}-{suffix}", id_prefix(resource_type))
}

impl SimulatedProvider {
    /// Creates an empty in-memory provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider mirrored to `path`, loading existing instances.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let instances = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content).map_err(|e| {
                StackError::internal(format!(
                    "Simulated provider file {} is corrupted: {e}",
                    path.display()
                ))
            })?
        } else {
            BTreeMap::new()
        };

        debug!(
            "Loaded {} simulated instances from {}",
            instances.len(),
            path.display()
        );

        Ok(Self {
            instances: Mutex::new(instances),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Delays every mutating call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the `call`-th mutating call (1-based) fail with `error`.
    pub async fn fail_call(&self, call: usize, error: ProviderError) {
        self.faults.lock().await.insert(call, error);
    }

    /// Makes every call in `calls` fail with `error`.
    pub async fn fail_calls(&self, calls: impl IntoIterator<Item = usize>, error: ProviderError) {
        let mut faults = self.faults.lock().await;
        for call in calls {
            faults.insert(call, error.clone());
        }
    }

    /// Returns the number of mutating calls received, including failed ones.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns a log line per call, e.g. `create storage-bucket reports`.
    pub async fn call_log(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    /// Returns a copy of every live instance keyed by physical identifier.
    pub async fn instances(&self) -> BTreeMap<String, SimulatedInstance> {
        self.instances.lock().await.clone()
    }

    /// Returns one instance.
    pub async fn instance(&self, physical_id: &str) -> Option<SimulatedInstance> {
        self.instances.lock().await.get(physical_id).cloned()
    }

    /// Returns the file this provider persists to, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Counts the call, applies latency, and returns an injected fault if any.
    async fn begin(&self, entry: String) -> ProviderResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().await.push(entry);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(error) = self.faults.lock().await.remove(&call) {
            debug!(call, error = %error, "Injecting simulated fault");
            return Err(error);
        }
        Ok(())
    }

    async fn persist(&self, instances: &BTreeMap<String, SimulatedInstance>) -> ProviderResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(instances)
            .map_err(|e| ProviderError::fatal("io", format!("Failed to serialize instances: {e}")))?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::fatal("io", e.to_string()))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ProviderError::fatal("io", e.to_string()))
    }
}

fn check_grants(
    instances: &BTreeMap<String, SimulatedInstance>,
    grants: &[ResolvedGrant],
) -> ProviderResult<()> {
    for grant in grants {
        let grantable = instances
            .get(&grant.target)
            .is_some_and(|i| i.resource_type.is_grantable());
        if !grantable {
            return Err(ProviderError::fatal(
                ProviderError::REJECTED,
                format!("grant target {} does not exist or cannot be granted", grant.target),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(&self, request: &CreateRequest) -> ProviderResult<String> {
        let declared = request.properties.get("name").map(ToString::to_string);
        self.begin(format!(
            "create {} {}",
            request.resource_type,
            declared.as_deref().unwrap_or(&request.logical_name)
        ))
        .await?;

        let mut instances = self.instances.lock().await;

        if schema_for(request.resource_type).unique_name
            && let Some(name) = request.properties.get("name")
            && let Some((existing, _)) = instances.iter().find(|(_, i)| {
                i.resource_type == request.resource_type && i.properties.get("name") == Some(name)
            })
        {
            return Err(ProviderError::fatal(
                ProviderError::CONFLICT,
                format!(
                    "{} named {name} already exists as {existing}",
                    request.resource_type
                ),
            ));
        }

        check_grants(&instances, &request.grants)?;

        let physical_id = new_physical_id(request.resource_type);
        instances.insert(
            physical_id.clone(),
            SimulatedInstance {
                resource_type: request.resource_type,
                logical_name: request.logical_name.clone(),
                properties: request.properties.clone(),
                grants: request.grants.clone(),
            },
        );
        self.persist(&instances).await?;

        info!(
            "Simulated {} '{}' created as {physical_id}",
            request.resource_type, request.logical_name
        );
        Ok(physical_id)
    }

    async fn update(&self, physical_id: &str, request: &UpdateRequest) -> ProviderResult<()> {
        self.begin(format!("update {physical_id}")).await?;

        let mut instances = self.instances.lock().await;
        if let Some(grants) = &request.grants {
            check_grants(&instances, grants)?;
        }

        let instance = instances
            .get_mut(physical_id)
            .ok_or_else(|| ProviderError::not_found(physical_id))?;

        for key in &request.unset {
            instance.properties.remove(key);
        }
        for (key, value) in &request.set {
            instance.properties.insert(key.clone(), value.clone());
        }
        if let Some(grants) = &request.grants {
            instance.grants.clone_from(grants);
        }

        self.persist(&instances).await?;
        debug!("Simulated {physical_id} updated");
        Ok(())
    }

    async fn delete(&self, physical_id: &str) -> ProviderResult<()> {
        self.begin(format!("delete {physical_id}")).await?;

        let mut instances = self.instances.lock().await;
        if instances.remove(physical_id).is_none() {
            return Err(ProviderError::not_found(physical_id));
        }

        self.persist(&instances).await?;
        info!("Simulated {physical_id} deleted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AccessLevel;

    fn request(resource_type: ResourceType, name: &str) -> CreateRequest {
        CreateRequest {
            resource_type,
            logical_name: name.to_string(),
            properties: BTreeMap::from([(
                "name".to_string(),
                ResolvedValue::String(name.to_string()),
            )]),
            grants: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let provider = SimulatedProvider::new();
        let id = provider
            .create(&request(ResourceType::StorageBucket, "reports"))
            .await
            .unwrap();
        assert!(id.starts_with("bkt-"));

        let update = UpdateRequest {
            set: BTreeMap::from([("versioned".to_string(), ResolvedValue::Boolean(true))]),
            ..UpdateRequest::default()
        };
        provider.update(&id, &update).await.unwrap();
        let instance = provider.instance(&id).await.unwrap();
        assert_eq!(
            instance.properties.get("versioned"),
            Some(&ResolvedValue::Boolean(true))
        );

        provider.delete(&id).await.unwrap();
        assert!(provider.delete(&id).await.unwrap_err().is_not_found());
        assert_eq!(provider.call_count(), 4);
    }

    #[tokio::test]
    async fn test_unique_name_conflict() {
        let provider = SimulatedProvider::new();
        provider
            .create(&request(ResourceType::KeyValueTable, "plants"))
            .await
            .unwrap();
        let err = provider
            .create(&request(ResourceType::KeyValueTable, "plants"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ProviderError::CONFLICT);

        // Routes may share a name.
        provider.create(&request(ResourceType::ApiRoute, "r")).await.unwrap();
        provider.create(&request(ResourceType::ApiRoute, "r")).await.unwrap();
    }

    #[tokio::test]
    async fn test_grant_target_must_exist() {
        let provider = SimulatedProvider::new();
        let mut function = request(ResourceType::ComputeFunction, "report");
        function.grants.push(ResolvedGrant {
            target: "tbl-missing".to_string(),
            access: AccessLevel::Read,
        });
        let err = provider.create(&function).await.unwrap_err();
        assert_eq!(err.code, ProviderError::REJECTED);
    }

    #[tokio::test]
    async fn test_injected_fault_consumes_call() {
        let provider = SimulatedProvider::new();
        provider
            .fail_call(1, ProviderError::transient(ProviderError::UNAVAILABLE, "down"))
            .await;

        let req = request(ResourceType::StorageBucket, "reports");
        assert!(provider.create(&req).await.unwrap_err().retryable);
        assert!(provider.create(&req).await.is_ok());
        assert_eq!(provider.instances().await.len(), 1);
        assert_eq!(provider.call_log().await.len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim").join("cloud.json");

        let provider = SimulatedProvider::persistent(&path).await.unwrap();
        let id = provider
            .create(&request(ResourceType::StorageBucket, "reports"))
            .await
            .unwrap();
        drop(provider);

        let reopened = SimulatedProvider::persistent(&path).await.unwrap();
        assert!(reopened.instance(&id).await.is_some());
        assert_eq!(reopened.path(), Some(path.as_path()));
    }
}
