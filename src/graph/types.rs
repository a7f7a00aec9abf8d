//! Resource graph types.
//!
//! A [`ResourceGraph`] is the validated, immutable form of the `resources`
//! section of a description. Nodes are kept ordered by logical name.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// The closed set of resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    /// Object storage bucket.
    StorageBucket,
    /// Key-value table.
    KeyValueTable,
    /// Serverless compute function.
    ComputeFunction,
    /// HTTP API route.
    ApiRoute,
}

impl ResourceType {
    /// All resource types.
    pub const ALL: [Self; 4] = [
        Self::StorageBucket,
        Self::KeyValueTable,
        Self::ComputeFunction,
        Self::ApiRoute,
    ];

    /// Returns the type tag used in descriptions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StorageBucket => "storage-bucket",
            Self::KeyValueTable => "key-value-table",
            Self::ComputeFunction => "compute-function",
            Self::ApiRoute => "api-route",
        }
    }

    /// Returns true if grants may target this type.
    #[must_use]
    pub const fn is_grantable(self) -> bool {
        matches!(self, Self::StorageBucket | Self::KeyValueTable)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown resource type: {s}"))
    }
}

/// A typed property value.
///
/// References are resolved to physical identifiers at apply time; a provider
/// never sees a [`PropertyValue::Reference`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean value.
    Boolean(bool),
    /// Numeric value.
    Number(f64),
    /// String value.
    String(String),
    /// Reference to another resource by logical name.
    Reference {
        /// Logical name of the referenced resource.
        #[serde(rename = "ref")]
        target: String,
    },
}

impl PropertyValue {
    /// Creates a reference value.
    #[must_use]
    pub fn reference(target: impl Into<String>) -> Self {
        Self::Reference {
            target: target.into(),
        }
    }

    /// Creates a string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Returns the referenced logical name, if this is a reference.
    #[must_use]
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Self::Reference { target } => Some(target),
            _ => None,
        }
    }

    /// Returns the string contents, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a short name for the value kind.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Reference { .. } => "reference",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Reference { target } => write!(f, "ref({target})"),
        }
    }
}

/// Property bag of a resource.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Access level carried by a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessLevel {
    /// Read-only access.
    Read,
    /// Write-only access.
    Write,
    /// Read and write access.
    ReadWrite,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "read-write" => Ok(Self::ReadWrite),
            other => Err(format!(
                "unknown access level '{other}', expected read, write or read-write"
            )),
        }
    }
}

/// An explicit access grant from one resource to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Logical name of the target resource.
    pub resource: String,
    /// Access level.
    pub access: AccessLevel,
}

impl fmt::Display for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.access, self.resource)
    }
}

/// A validated resource node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Logical name, unique within the graph.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Declared properties.
    pub properties: PropertyMap,
    /// Access grants, sorted.
    pub grants: Vec<AccessGrant>,
    /// Union of explicit dependencies, property references and grant targets.
    pub dependencies: BTreeSet<String>,
}

impl ResourceNode {
    /// Returns `(property key, target)` pairs for every reference property.
    pub fn references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter_map(|(key, value)| value.as_reference().map(|target| (key.as_str(), target)))
    }

    /// Returns true if a property or grant resolves against `target`.
    #[must_use]
    pub fn resolves_against(&self, target: &str) -> bool {
        self.references().any(|(_, t)| t == target) || self.grants.iter().any(|g| g.resource == target)
    }

    /// Returns the `name` property if present.
    #[must_use]
    pub fn declared_name(&self) -> Option<&str> {
        self.properties.get("name").and_then(PropertyValue::as_str)
    }
}

/// A validated, acyclic resource graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
}

impl ResourceGraph {
    /// Builds a graph from already validated nodes.
    pub(crate) fn from_nodes(mut nodes: Vec<ResourceNode>) -> Self {
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        Self { nodes, index }
    }

    /// Returns an empty graph.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the node with the given logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Returns true if the graph declares the given logical name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns all nodes ordered by logical name.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns every `(dependent, dependency)` edge.
    #[must_use]
    pub fn edges(&self) -> BTreeSet<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.dependencies
                    .iter()
                    .map(move |d| (n.name.clone(), d.clone()))
            })
            .collect()
    }

    /// Returns nodes that depend on `name`.
    pub fn dependents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ResourceNode> + 'a {
        self.nodes
            .iter()
            .filter(move |n| n.dependencies.contains(name))
    }
}
