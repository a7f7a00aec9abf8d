//! Builds a validated [`ResourceGraph`] from declared resources.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::schema::schema_for;
use super::types::{AccessGrant, AccessLevel, ResourceGraph, ResourceNode, ResourceType};
use crate::config::{ResourceDecl, StackConfig};
use crate::error::ValidationError;

/// Turns declared resources into a resource graph.
///
/// The builder is pure: it reads only the declarations it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph for a configuration's `resources` section.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the declarations do not form a valid DAG.
    pub fn build_config(&self, config: &StackConfig) -> Result<ResourceGraph, ValidationError> {
        self.build(&config.resources)
    }

    /// Builds a graph from declarations keyed by logical name.
    ///
    /// Edges are the union of `depends_on`, property references, and grant
    /// targets.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` on an unknown type, a schema violation, an
    /// invalid grant, an unresolved reference, a self-dependency, or a cycle.
    pub fn build(
        &self,
        resources: &BTreeMap<String, ResourceDecl>,
    ) -> Result<ResourceGraph, ValidationError> {
        let mut types = BTreeMap::new();
        for (name, decl) in resources {
            let resource_type = decl.type_tag.parse::<ResourceType>().map_err(|_| {
                ValidationError::UnknownType {
                    resource: name.clone(),
                    type_tag: decl.type_tag.clone(),
                }
            })?;
            types.insert(name.as_str(), resource_type);
        }

        let mut nodes = Vec::with_capacity(resources.len());
        for (name, decl) in resources {
            let resource_type = types[name.as_str()];
            schema_for(resource_type).validate(name, resource_type, &decl.properties)?;

            let grants = Self::build_grants(name, resource_type, decl, &types)?;

            let mut dependencies = BTreeSet::new();
            for dep in &decl.depends_on {
                Self::check_target(name, dep, "depends_on", &types)?;
                dependencies.insert(dep.clone());
            }
            for (key, value) in &decl.properties {
                if let Some(target) = value.as_reference() {
                    Self::check_target(name, target, &format!("property '{key}'"), &types)?;
                    dependencies.insert(target.to_string());
                }
            }
            for grant in &grants {
                dependencies.insert(grant.resource.clone());
            }

            nodes.push(ResourceNode {
                name: name.clone(),
                resource_type,
                properties: decl.properties.clone(),
                grants,
                dependencies,
            });
        }

        if let Some(cycle) = find_cycle(&nodes) {
            return Err(ValidationError::Cycle { cycle });
        }

        debug!("Built resource graph with {} nodes", nodes.len());
        Ok(ResourceGraph::from_nodes(nodes))
    }

    fn check_target(
        resource: &str,
        target: &str,
        via: &str,
        types: &BTreeMap<&str, ResourceType>,
    ) -> Result<(), ValidationError> {
        if target == resource {
            return Err(ValidationError::SelfDependency {
                resource: resource.to_string(),
            });
        }
        if !types.contains_key(target) {
            return Err(ValidationError::UnresolvedReference {
                resource: resource.to_string(),
                reference: target.to_string(),
                via: via.to_string(),
            });
        }
        Ok(())
    }

    fn build_grants(
        name: &str,
        resource_type: ResourceType,
        decl: &ResourceDecl,
        types: &BTreeMap<&str, ResourceType>,
    ) -> Result<Vec<AccessGrant>, ValidationError> {
        if !decl.grants.is_empty() && resource_type != ResourceType::ComputeFunction {
            return Err(ValidationError::grant(
                name,
                &decl.grants[0].resource,
                format!("{resource_type} resources cannot hold access grants"),
            ));
        }

        let mut grants: Vec<AccessGrant> = Vec::with_capacity(decl.grants.len());
        for grant in &decl.grants {
            Self::check_target(name, &grant.resource, "grant", types)?;

            let target_type = types[grant.resource.as_str()];
            if !target_type.is_grantable() {
                return Err(ValidationError::grant(
                    name,
                    &grant.resource,
                    format!("access cannot be granted on a {target_type}"),
                ));
            }

            let access = grant
                .access
                .parse::<AccessLevel>()
                .map_err(|e| ValidationError::grant(name, &grant.resource, e))?;

            if grants.iter().any(|g| g.resource == grant.resource) {
                return Err(ValidationError::grant(
                    name,
                    &grant.resource,
                    "declared more than once; use read-write for combined access",
                ));
            }

            grants.push(AccessGrant {
                resource: grant.resource.clone(),
                access,
            });
        }
        grants.sort();
        Ok(grants)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

/// Returns the first dependency cycle found, as a path that starts and ends
/// at the same node.
fn find_cycle(nodes: &[ResourceNode]) -> Option<Vec<String>> {
    fn dfs<'a>(
        node: &'a str,
        adjacency: &BTreeMap<&'a str, &'a BTreeSet<String>>,
        state: &mut BTreeMap<&'a str, VisitState>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        state.insert(node, VisitState::Visiting);
        stack.push(node);

        if let Some(&targets) = adjacency.get(node) {
            for target in targets {
                match state.get(target.as_str()) {
                    Some(VisitState::Visiting) => {
                        let pos = stack.iter().position(|n| *n == target.as_str())?;
                        let mut cycle: Vec<String> =
                            stack[pos..].iter().map(|n| (*n).to_string()).collect();
                        cycle.push(target.clone());
                        return Some(cycle);
                    }
                    Some(VisitState::Visited) => {}
                    None => {
                        if let Some(cycle) = dfs(target, adjacency, state, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        stack.pop();
        state.insert(node, VisitState::Visited);
        None
    }

    let adjacency: BTreeMap<&str, &BTreeSet<String>> = nodes
        .iter()
        .map(|n| (n.name.as_str(), &n.dependencies))
        .collect();
    let mut state = BTreeMap::new();
    let mut stack = Vec::new();

    for node in adjacency.keys().copied() {
        if !state.contains_key(node) {
            if let Some(cycle) = dfs(node, &adjacency, &mut state, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
