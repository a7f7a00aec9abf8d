//! State types for tracking provisioned resources.
//!
//! The [`StateSnapshot`] is the durable record of what exists: one
//! [`ResourceRecord`] per logical name, with its physical identifier and the
//! declaration it was last applied from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::StateError;
use crate::graph::{AccessGrant, PropertyMap, ResourceNode, ResourceType};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of run history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete state snapshot of a project environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every committed change.
    #[serde(default)]
    pub serial: u64,
    /// Hash of the last applied description.
    #[serde(default)]
    pub description_hash: String,
    /// Provisioned resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// The recorded state of one provisioned resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Provider-assigned identifier of the current instance.
    pub physical_id: String,
    /// Declared properties as last applied.
    pub properties: PropertyMap,
    /// Access grants as last applied.
    #[serde(default)]
    pub grants: Vec<AccessGrant>,
    /// Dependency set as last applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Old instances awaiting deletion after a create-before-delete replacement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// Fingerprint of the applied declaration.
    pub fingerprint: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHistoryEntry {
    /// Unique run identifier.
    pub run_id: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub kind: RunKind,
    /// Description hash the run applied.
    pub description_hash: String,
    /// Steps committed.
    pub committed: usize,
    /// Steps failed.
    pub failed: usize,
    /// Steps never attempted.
    pub skipped: usize,
    /// Whether the run converged.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Apply a description.
    Apply,
    /// Delete everything in the snapshot.
    Destroy,
}

impl StateSnapshot {
    /// Creates a new empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            description_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks that this snapshot can be used for the given project.
    ///
    /// # Errors
    ///
    /// Returns an error on a format version or project/environment mismatch.
    pub fn check_owner(&self, project: &str, environment: &str) -> Result<(), StateError> {
        if self.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        if self.project != project || self.environment != environment {
            return Err(StateError::ProjectMismatch {
                expected: format!("{project}/{environment}"),
                found: format!("{}/{}", self.project, self.environment),
            });
        }
        Ok(())
    }

    /// Gets a record by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Gets a mutable record by logical name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResourceRecord> {
        self.resources.get_mut(name)
    }

    /// Returns the physical identifier recorded for a logical name.
    #[must_use]
    pub fn physical_id(&self, name: &str) -> Option<&str> {
        self.resources.get(name).map(|r| r.physical_id.as_str())
    }

    /// Adds or replaces a record.
    pub fn upsert(&mut self, record: ResourceRecord) {
        self.resources.insert(record.name.clone(), record);
        self.touch();
    }

    /// Removes a record by logical name.
    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.touch();
        }
        result
    }

    /// Drops a deposed instance from a record.
    ///
    /// Returns true if the identifier was recorded.
    pub fn clear_deposed(&mut self, name: &str, physical_id: &str) -> bool {
        let Some(record) = self.resources.get_mut(name) else {
            return false;
        };
        let before = record.deposed.len();
        record.deposed.retain(|id| id != physical_id);
        let changed = record.deposed.len() != before;
        if changed {
            record.updated_at = Utc::now();
            self.touch();
        }
        changed
    }

    /// Marks the snapshot as changed.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all logical names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly created instance of `node`.
    #[must_use]
    pub fn from_node(node: &ResourceNode, physical_id: &str, fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            name: node.name.clone(),
            resource_type: node.resource_type,
            physical_id: physical_id.to_string(),
            properties: node.properties.clone(),
            grants: node.grants.clone(),
            dependencies: node.dependencies.clone(),
            deposed: Vec::new(),
            fingerprint: fingerprint.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records that `node` has been applied in place.
    pub fn apply_node(&mut self, node: &ResourceNode, fingerprint: &str) {
        self.properties = node.properties.clone();
        self.grants = node.grants.clone();
        self.dependencies = node.dependencies.clone();
        self.fingerprint = fingerprint.to_string();
        self.updated_at = Utc::now();
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(kind: RunKind, description_hash: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            description_hash: description_hash.to_string(),
            committed: 0,
            failed: 0,
            skipped: 0,
            success: true,
            error: None,
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ResourceRecord {
        let now = Utc::now();
        ResourceRecord {
            name: name.to_string(),
            resource_type: ResourceType::StorageBucket,
            physical_id: format!("bkt-{name}"),
            properties: PropertyMap::new(),
            grants: Vec::new(),
            dependencies: BTreeSet::new(),
            deposed: vec!["bkt-old".to_string()],
            fingerprint: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_serial_increments_on_change() {
        let mut snapshot = StateSnapshot::new("proj", "dev");
        snapshot.upsert(record("a"));
        assert_eq!(snapshot.serial, 1);

        assert!(snapshot.clear_deposed("a", "bkt-old"));
        assert_eq!(snapshot.serial, 2);
        assert!(!snapshot.clear_deposed("a", "bkt-old"));
        assert_eq!(snapshot.serial, 2);

        assert!(snapshot.remove("a").is_some());
        assert!(snapshot.remove("a").is_none());
        assert_eq!(snapshot.serial, 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new("proj", "dev");
        for _ in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(RunHistoryEntry::new(RunKind::Apply, "hash"));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_check_owner() {
        let snapshot = StateSnapshot::new("proj", "dev");
        assert!(snapshot.check_owner("proj", "dev").is_ok());
        assert!(matches!(
            snapshot.check_owner("proj", "prod"),
            Err(StateError::ProjectMismatch { .. })
        ));
    }
}
