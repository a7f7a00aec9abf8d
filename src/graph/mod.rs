//! Resource graph module.
//!
//! This module turns the declarative `resources` section into a validated,
//! acyclic graph of typed resource nodes:
//! - Typed property values and access grants
//! - Per-type property schemas
//! - Reference resolution and cycle detection

mod builder;
mod schema;
mod types;

pub use builder::GraphBuilder;
pub use schema::{PropertySpec, TypeSchema, ValueKind, schema_for};
pub use types::{
    AccessGrant, AccessLevel, PropertyMap, PropertyValue, ResourceGraph, ResourceNode,
    ResourceType,
};
