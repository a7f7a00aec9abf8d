//! Hashing for change detection.
//!
//! Descriptions and resource nodes are hashed deterministically so that an
//! unchanged resource can be recognised without comparing field by field,
//! and so the state snapshot records which description it was applied from.

use sha2::{Digest, Sha256};

use super::spec::StackConfig;
use crate::graph::{PropertyValue, ResourceNode, ResourceType};

/// Hasher for computing description hashes and resource fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn update_value(hasher: &mut Sha256, value: &PropertyValue) {
    match value {
        PropertyValue::Boolean(b) => {
            hasher.update([b'b']);
            hasher.update([u8::from(*b)]);
        }
        PropertyValue::Number(n) => {
            hasher.update([b'n']);
            hasher.update(n.to_be_bytes());
        }
        PropertyValue::String(s) => {
            hasher.update([b's']);
            update_field(hasher, s.as_bytes());
        }
        PropertyValue::Reference { target } => {
            hasher.update([b'r']);
            update_field(hasher, target.as_bytes());
        }
    }
}

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole description.
    ///
    /// This hash changes when the project identity or any declared resource
    /// changes.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        update_field(&mut hasher, config.project.name.as_bytes());
        update_field(&mut hasher, config.project.environment.as_bytes());

        for (name, decl) in &config.resources {
            update_field(&mut hasher, name.as_bytes());
            update_field(&mut hasher, decl.type_tag.as_bytes());
            for (key, value) in &decl.properties {
                update_field(&mut hasher, key.as_bytes());
                update_value(&mut hasher, value);
            }
            let mut depends_on: Vec<_> = decl.depends_on.iter().collect();
            depends_on.sort();
            for dep in depends_on {
                update_field(&mut hasher, dep.as_bytes());
            }
            let mut grants: Vec<_> = decl
                .grants
                .iter()
                .map(|g| (g.resource.as_str(), g.access.as_str()))
                .collect();
            grants.sort_unstable();
            for (resource, access) in grants {
                update_field(&mut hasher, resource.as_bytes());
                update_field(&mut hasher, access.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a resource node.
    ///
    /// Two nodes with equal fingerprints have the same type, properties,
    /// grants, and dependency set.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        self.fingerprint(
            node.resource_type,
            node.properties.iter(),
            node.grants.iter().map(|g| (g.resource.as_str(), g.access.to_string())),
            node.dependencies.iter().map(String::as_str),
        )
    }

    /// Computes a fingerprint from the parts of a resource.
    ///
    /// Callers pass properties and dependencies in sorted order.
    #[must_use]
    pub fn fingerprint<'a>(
        &self,
        resource_type: ResourceType,
        properties: impl Iterator<Item = (&'a String, &'a PropertyValue)>,
        grants: impl Iterator<Item = (&'a str, String)>,
        dependencies: impl Iterator<Item = &'a str>,
    ) -> String {
        let mut hasher = Sha256::new();

        update_field(&mut hasher, resource_type.as_str().as_bytes());

        hasher.update([b'P']);
        for (key, value) in properties {
            update_field(&mut hasher, key.as_bytes());
            update_value(&mut hasher, value);
        }

        hasher.update([b'G']);
        for (resource, access) in grants {
            update_field(&mut hasher, resource.as_bytes());
            update_field(&mut hasher, access.as_bytes());
        }

        hasher.update([b'D']);
        for dep in dependencies {
            update_field(&mut hasher, dep.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash (first 12 characters).
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}
