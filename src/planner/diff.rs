//! Diff engine for comparing the desired graph with the state snapshot.
//!
//! Every logical name present on either side yields at most one
//! [`Operation`], plus one cleanup delete per deposed instance. Unchanged
//! resources are recognised by fingerprint and left out.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::ValidationError;
use crate::graph::{PropertyValue, ResourceGraph, ResourceNode, ResourceType, schema_for};
use crate::state::{ResourceRecord, StateSnapshot};

/// Engine for computing operations between desired graph and snapshot.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Fingerprint hasher.
    hasher: ConfigHasher,
}

/// Kind of change required for one logical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Resource needs to be created.
    Create,
    /// Resource can be changed in place.
    Update,
    /// Resource must be recreated.
    Replace,
    /// Resource (or a deposed instance of it) needs to be deleted.
    Delete,
}

/// How a replacement is sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Create the new instance, re-point dependents, then delete the old one.
    CreateBeforeDelete,
    /// Delete the old instance first; the resource is unavailable in between.
    DeleteBeforeCreate,
}

/// One changed property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Property key.
    pub key: String,
    /// Value as last applied.
    pub old: Option<PropertyValue>,
    /// Declared value; `None` when the key was removed.
    pub new: Option<PropertyValue>,
}

/// What changed between a record and its declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PropertyDelta {
    /// Changed properties, ordered by key.
    pub changes: Vec<PropertyChange>,
    /// Whether the grant list changed.
    pub grants_changed: bool,
    /// Whether the dependency set changed.
    pub dependencies_changed: bool,
    /// Replaced resources whose identifiers must be re-resolved.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub rebind: BTreeSet<String>,
}

impl PropertyDelta {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
            && !self.grants_changed
            && !self.dependencies_changed
            && self.rebind.is_empty()
    }

    /// Returns the changed keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.key.as_str())
    }
}

/// A single change the planner has to schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Logical name.
    pub name: String,
    /// Resource type (the declared one when both sides exist).
    pub resource_type: ResourceType,
    /// Desired node, absent for deletes.
    #[serde(skip)]
    pub desired: Option<ResourceNode>,
    /// Prior record, absent for creates.
    #[serde(skip)]
    pub prior: Option<ResourceRecord>,
    /// Property delta (updates and replaces).
    pub delta: PropertyDelta,
    /// Replacement strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ReplaceStrategy>,
    /// Deposed identifier for cleanup deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposed_id: Option<String>,
    /// Why this operation is needed.
    pub reason: String,
}

/// Warning raised when a replacement leaves a gap with no live instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplacementDowntimeWarning {
    /// Logical name being replaced.
    pub resource: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Why the replacement cannot overlap.
    pub reason: String,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Operations ordered by logical name.
    pub operations: Vec<Operation>,
    /// Downtime warnings for delete-before-create replacements.
    pub warnings: Vec<ReplacementDowntimeWarning>,
    /// Number of resources left untouched.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the operations that converge `snapshot` onto `graph`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TypeConflict` when a record with deposed
    /// instances is redeclared with another type.
    pub fn compute(
        &self,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> Result<DiffResult, ValidationError> {
        let mut result = DiffResult::default();
        let mut by_name: BTreeMap<String, Operation> = BTreeMap::new();
        let mut cleanups: Vec<Operation> = Vec::new();
        // Names whose current or deposed instances go away during this run.
        let mut moving: BTreeSet<String> = BTreeSet::new();

        for node in graph.nodes() {
            let Some(record) = snapshot.get(&node.name) else {
                debug!("Resource {} needs to be created", node.name);
                by_name.insert(node.name.clone(), Self::create(node));
                // Recorded dependents still hold the identifier of a deleted instance.
                if snapshot
                    .resources
                    .values()
                    .any(|r| r.dependencies.contains(&node.name))
                {
                    moving.insert(node.name.clone());
                }
                continue;
            };

            if record.resource_type != node.resource_type && !record.deposed.is_empty() {
                return Err(ValidationError::TypeConflict {
                    resource: node.name.clone(),
                    recorded: record.resource_type.to_string(),
                    declared: node.resource_type.to_string(),
                    message: format!(
                        "{} deposed instance(s) must be cleaned up before the type can change",
                        record.deposed.len()
                    ),
                });
            }

            for id in &record.deposed {
                cleanups.push(Self::cleanup(record, id));
                moving.insert(node.name.clone());
            }

            match self.compare(node, record) {
                Some(op) => {
                    debug!("Resource {} needs {:?}", node.name, op.kind);
                    if op.kind == OperationKind::Replace {
                        moving.insert(node.name.clone());
                        if op.strategy == Some(ReplaceStrategy::DeleteBeforeCreate) {
                            result.warnings.push(ReplacementDowntimeWarning {
                                resource: node.name.clone(),
                                resource_type: node.resource_type,
                                reason: op.reason.clone(),
                            });
                        }
                    }
                    by_name.insert(node.name.clone(), op);
                }
                None => result.unchanged += 1,
            }
        }

        for (name, record) in &snapshot.resources {
            if graph.contains(name) {
                continue;
            }
            debug!("Resource {name} is no longer declared");
            for id in &record.deposed {
                cleanups.push(Self::cleanup(record, id));
            }
            by_name.insert(name.clone(), Self::delete(record));
        }

        // Dependents of a moving resource must pick up its new identifier.
        for target in &moving {
            for dependent in graph.dependents_of(target) {
                if !dependent.resolves_against(target) {
                    continue;
                }
                match by_name.get_mut(&dependent.name) {
                    Some(op) if op.kind == OperationKind::Update => {
                        op.delta.rebind.insert(target.clone());
                    }
                    Some(_) => {}
                    None => {
                        let Some(record) = snapshot.get(&dependent.name) else {
                            continue;
                        };
                        let mut op = Self::update(dependent, record, PropertyDelta::default());
                        op.delta.rebind.insert(target.clone());
                        op.reason = format!("re-point references to replaced '{target}'");
                        result.unchanged = result.unchanged.saturating_sub(1);
                        by_name.insert(dependent.name.clone(), op);
                    }
                }
            }
        }

        result.operations = by_name.into_values().collect();
        result.operations.extend(cleanups);
        result
            .operations
            .sort_by(|a, b| a.name.cmp(&b.name).then(a.kind.cmp(&b.kind)));

        Ok(result)
    }

    /// Compares a declared node with its record; `None` means unchanged.
    fn compare(&self, node: &ResourceNode, record: &ResourceRecord) -> Option<Operation> {
        if record.resource_type != node.resource_type {
            let mut op = Self::replace(
                node,
                record,
                Self::property_delta(node, record),
                ReplaceStrategy::CreateBeforeDelete,
            );
            op.reason = format!(
                "type changes from {} to {}",
                record.resource_type, node.resource_type
            );
            return Some(op);
        }

        if self.hasher.hash_node(node) == record.fingerprint {
            return None;
        }

        let delta = Self::property_delta(node, record);
        if delta.is_empty() {
            // Fingerprint drift only (e.g. recorded by an older release).
            return None;
        }

        let schema = schema_for(node.resource_type);
        let immutable: Vec<&str> = delta.keys().filter(|k| schema.is_immutable(k)).collect();

        if immutable.is_empty() {
            let reason = describe_delta(&delta);
            let mut op = Self::update(node, record, delta);
            op.reason = reason;
            return Some(op);
        }

        let name_changed = immutable.contains(&"name");
        let strategy = if schema.unique_name && !name_changed {
            ReplaceStrategy::DeleteBeforeCreate
        } else {
            ReplaceStrategy::CreateBeforeDelete
        };
        let reason = format!("immutable {} changed", immutable.join(", "));
        let mut op = Self::replace(node, record, delta, strategy);
        op.reason = match strategy {
            ReplaceStrategy::CreateBeforeDelete => reason,
            ReplaceStrategy::DeleteBeforeCreate => format!(
                "{reason}; {} name '{}' cannot exist twice",
                node.resource_type,
                node.declared_name().unwrap_or(&node.name)
            ),
        };
        Some(op)
    }

    fn property_delta(node: &ResourceNode, record: &ResourceRecord) -> PropertyDelta {
        let keys: BTreeSet<&String> = node
            .properties
            .keys()
            .chain(record.properties.keys())
            .collect();

        let changes = keys
            .into_iter()
            .filter_map(|key| {
                let old = record.properties.get(key);
                let new = node.properties.get(key);
                (old != new).then(|| PropertyChange {
                    key: key.clone(),
                    old: old.cloned(),
                    new: new.cloned(),
                })
            })
            .collect();

        PropertyDelta {
            changes,
            grants_changed: node.grants != record.grants,
            dependencies_changed: node.dependencies != record.dependencies,
            rebind: BTreeSet::new(),
        }
    }

    fn create(node: &ResourceNode) -> Operation {
        Operation {
            kind: OperationKind::Create,
            name: node.name.clone(),
            resource_type: node.resource_type,
            desired: Some(node.clone()),
            prior: None,
            delta: PropertyDelta::default(),
            strategy: None,
            deposed_id: None,
            reason: String::from("declared but not provisioned"),
        }
    }

    fn update(node: &ResourceNode, record: &ResourceRecord, delta: PropertyDelta) -> Operation {
        Operation {
            kind: OperationKind::Update,
            name: node.name.clone(),
            resource_type: node.resource_type,
            desired: Some(node.clone()),
            prior: Some(record.clone()),
            delta,
            strategy: None,
            deposed_id: None,
            reason: String::new(),
        }
    }

    fn replace(
        node: &ResourceNode,
        record: &ResourceRecord,
        delta: PropertyDelta,
        strategy: ReplaceStrategy,
    ) -> Operation {
        Operation {
            kind: OperationKind::Replace,
            name: node.name.clone(),
            resource_type: node.resource_type,
            desired: Some(node.clone()),
            prior: Some(record.clone()),
            delta,
            strategy: Some(strategy),
            deposed_id: None,
            reason: String::new(),
        }
    }

    fn delete(record: &ResourceRecord) -> Operation {
        Operation {
            kind: OperationKind::Delete,
            name: record.name.clone(),
            resource_type: record.resource_type,
            desired: None,
            prior: Some(record.clone()),
            delta: PropertyDelta::default(),
            strategy: None,
            deposed_id: None,
            reason: String::from("no longer declared"),
        }
    }

    fn cleanup(record: &ResourceRecord, physical_id: &str) -> Operation {
        Operation {
            kind: OperationKind::Delete,
            name: record.name.clone(),
            resource_type: record.resource_type,
            desired: None,
            prior: Some(record.clone()),
            delta: PropertyDelta::default(),
            strategy: None,
            deposed_id: Some(physical_id.to_string()),
            reason: format!("deposed instance {physical_id} left by an earlier replacement"),
        }
    }
}

fn describe_delta(delta: &PropertyDelta) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !delta.changes.is_empty() {
        parts.push(delta.keys().collect::<Vec<_>>().join(", "));
    }
    if delta.grants_changed {
        parts.push(String::from("grants"));
    }
    if delta.dependencies_changed {
        parts.push(String::from("dependencies"));
    }
    format!("{} changed", parts.join(", "))
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.operations.is_empty()
    }

    /// Counts operations of one kind.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|o| o.kind == kind).count()
    }

    /// Returns the operation for a logical name (ignoring cleanups).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|o| o.name == name && o.deposed_id.is_none())
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBeforeDelete => write!(f, "create-before-delete"),
            Self::DeleteBeforeCreate => write!(f, "delete-before-create"),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;

    pub(crate) const PLANT_STACK: &str = r"
project: { name: plant-report }
resources:
  report-bucket:
    type: storage-bucket
    properties: { name: plant-reports, versioned: true }
  plant-table:
    type: key-value-table
    properties: { name: plants, partition_key: PlantID, partition_key_type: string, billing_mode: pay-per-request }
  report-fn:
    type: compute-function
    properties:
      name: plant-report
      runtime: go1.x
      handler: main
      artifact: report.zip
      env.TABLE_NAME: { ref: plant-table }
      env.BUCKET_NAME: { ref: report-bucket }
    grants:
      - { resource: plant-table, access: read }
      - { resource: report-bucket, access: write }
  plant-route:
    type: api-route
    properties: { name: plant, path: /plant, method: POST, target: { ref: report-fn } }
";

    pub(crate) fn graph(yaml: &str) -> ResourceGraph {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new().build_config(&config).unwrap()
    }

    /// Records every node of `graph` as provisioned.
    pub(crate) fn provisioned(graph: &ResourceGraph) -> StateSnapshot {
        let hasher = ConfigHasher::new();
        let mut snapshot = StateSnapshot::new("plant-report", "dev");
        for node in graph.nodes() {
            snapshot.upsert(ResourceRecord::from_node(
                node,
                &format!("id-{}", node.name),
                &hasher.hash_node(node),
            ));
        }
        snapshot
    }

    fn edit(yaml: &str, from: &str, to: &str) -> String {
        assert!(yaml.contains(from), "fixture does not contain {from}");
        yaml.replacen(from, to, 1)
    }

    #[test]
    fn test_empty_snapshot_creates_everything() {
        let graph = graph(PLANT_STACK);
        let diff = DiffEngine::new()
            .compute(&graph, &StateSnapshot::new("plant-report", "dev"))
            .unwrap();
        assert_eq!(diff.count(OperationKind::Create), 4);
        assert!(diff.warnings.is_empty());
    }

    #[test]
    fn test_unchanged_is_noop() {
        let graph = graph(PLANT_STACK);
        let diff = DiffEngine::new().compute(&graph, &provisioned(&graph)).unwrap();
        assert!(!diff.has_changes());
        assert_eq!(diff.unchanged, 4);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let old = graph(PLANT_STACK);
        let new = graph(&edit(PLANT_STACK, "versioned: true", "versioned: false"));
        let diff = DiffEngine::new().compute(&new, &provisioned(&old)).unwrap();

        let op = diff.get("report-bucket").unwrap();
        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(op.delta.keys().collect::<Vec<_>>(), vec!["versioned"]);
        assert_eq!(diff.operations.len(), 1);
    }

    #[test]
    fn test_immutable_change_is_replace() {
        let old = graph(PLANT_STACK);
        let new = graph(&edit(PLANT_STACK, "name: plants", "name: plants-v2"));
        let diff = DiffEngine::new().compute(&new, &provisioned(&old)).unwrap();

        let op = diff.get("plant-table").unwrap();
        assert_eq!(op.kind, OperationKind::Replace);
        assert_eq!(op.strategy, Some(ReplaceStrategy::CreateBeforeDelete));
        assert!(diff.warnings.is_empty());

        // The function reads the table name, so it is re-pointed.
        let dependent = diff.get("report-fn").unwrap();
        assert_eq!(dependent.kind, OperationKind::Update);
        assert!(dependent.delta.rebind.contains("plant-table"));
    }

    #[test]
    fn test_same_name_replacement_has_downtime() {
        let old = graph(PLANT_STACK);
        let new = graph(&edit(PLANT_STACK, "partition_key: PlantID", "partition_key: PlantId"));
        let diff = DiffEngine::new().compute(&new, &provisioned(&old)).unwrap();

        let op = diff.get("plant-table").unwrap();
        assert_eq!(op.kind, OperationKind::Replace);
        assert_eq!(op.strategy, Some(ReplaceStrategy::DeleteBeforeCreate));
        assert_eq!(diff.warnings.len(), 1);
        assert_eq!(diff.warnings[0].resource, "plant-table");
    }

    #[test]
    fn test_route_replacement_never_has_downtime() {
        let old = graph(PLANT_STACK);
        let new = graph(&edit(PLANT_STACK, "path: /plant", "path: /plants"));
        let diff = DiffEngine::new().compute(&new, &provisioned(&old)).unwrap();

        let op = diff.get("plant-route").unwrap();
        assert_eq!(op.strategy, Some(ReplaceStrategy::CreateBeforeDelete));
        assert!(diff.warnings.is_empty());
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let old = graph(PLANT_STACK);
        let mut snapshot = provisioned(&old);
        snapshot.upsert(ResourceRecord {
            name: "legacy".to_string(),
            ..snapshot.get("report-bucket").unwrap().clone()
        });

        let diff = DiffEngine::new().compute(&old, &snapshot).unwrap();
        let op = diff.get("legacy").unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert!(op.deposed_id.is_none());
    }

    #[test]
    fn test_deposed_instances_are_cleaned_up() {
        let graph = graph(PLANT_STACK);
        let mut snapshot = provisioned(&graph);
        snapshot
            .get_mut("plant-table")
            .unwrap()
            .deposed
            .push("tbl-old".to_string());

        let diff = DiffEngine::new().compute(&graph, &snapshot).unwrap();
        let cleanup = diff
            .operations
            .iter()
            .find(|o| o.deposed_id.as_deref() == Some("tbl-old"))
            .unwrap();
        assert_eq!(cleanup.kind, OperationKind::Delete);
        assert_eq!(cleanup.name, "plant-table");
        assert!(diff.get("report-fn").unwrap().delta.rebind.contains("plant-table"));
    }

    #[test]
    fn test_recreated_resource_repoints_recorded_dependents() {
        let graph = graph(PLANT_STACK);
        let mut snapshot = provisioned(&graph);
        snapshot.remove("plant-table");

        let diff = DiffEngine::new().compute(&graph, &snapshot).unwrap();
        assert_eq!(diff.get("plant-table").unwrap().kind, OperationKind::Create);

        let dependent = diff.get("report-fn").unwrap();
        assert_eq!(dependent.kind, OperationKind::Update);
        assert!(dependent.delta.rebind.contains("plant-table"));
        assert!(diff.get("plant-route").is_none());
    }

    #[test]
    fn test_type_change_with_deposed_is_conflict() {
        let old = graph(PLANT_STACK);
        let mut snapshot = provisioned(&old);
        snapshot
            .get_mut("report-bucket")
            .unwrap()
            .deposed
            .push("bkt-old".to_string());

        let new = graph(
            r"
project: { name: plant-report }
resources:
  report-bucket:
    type: key-value-table
    properties: { name: plant-reports, partition_key: id }
",
        );
        let err = DiffEngine::new().compute(&new, &snapshot).unwrap_err();
        assert!(matches!(err, ValidationError::TypeConflict { .. }));
    }

    #[test]
    fn test_type_change_is_replace() {
        let old = graph(PLANT_STACK);
        let snapshot = provisioned(&old);
        let new = graph(
            r"
project: { name: plant-report }
resources:
  report-bucket:
    type: key-value-table
    properties: { name: plant-reports, partition_key: id }
",
        );
        let diff = DiffEngine::new().compute(&new, &snapshot).unwrap();
        let op = diff.get("report-bucket").unwrap();
        assert_eq!(op.kind, OperationKind::Replace);
        assert_eq!(op.resource_type, ResourceType::KeyValueTable);
        assert!(op.reason.contains("type changes"));
    }
}
