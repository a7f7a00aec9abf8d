//! Per-type property schemas.
//!
//! Each resource type declares its required and optional keys, the value
//! kind each key accepts, and which keys cannot change in place.

use super::types::{PropertyMap, PropertyValue, ResourceType};
use crate::error::ValidationError;

/// Value kinds a property key accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// A string.
    String,
    /// A number.
    Number,
    /// A boolean.
    Boolean,
    /// A reference to another resource.
    Reference,
    /// A string or a reference.
    StringOrReference,
}

impl ValueKind {
    const fn accepts(self, value: &PropertyValue) -> bool {
        matches!(
            (self, value),
            (Self::String | Self::StringOrReference, PropertyValue::String(_))
                | (Self::Number, PropertyValue::Number(_))
                | (Self::Boolean, PropertyValue::Boolean(_))
                | (
                    Self::Reference | Self::StringOrReference,
                    PropertyValue::Reference { .. }
                )
        )
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Reference => "a reference ({ ref: <name> })",
            Self::StringOrReference => "a string or a reference",
        }
    }
}

/// Schema entry for a single key or key prefix.
#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    /// Key, or prefix ending in `.` for prefixed keys.
    pub key: &'static str,
    /// Accepted value kind.
    pub kind: ValueKind,
    /// Allowed string values; empty means any.
    pub allowed: &'static [&'static str],
}

impl PropertySpec {
    const fn new(key: &'static str, kind: ValueKind) -> Self {
        Self {
            key,
            kind,
            allowed: &[],
        }
    }

    const fn one_of(key: &'static str, allowed: &'static [&'static str]) -> Self {
        Self {
            key,
            kind: ValueKind::String,
            allowed,
        }
    }
}

/// Property schema of a resource type.
#[derive(Debug)]
pub struct TypeSchema {
    /// Keys that must be present.
    pub required: &'static [PropertySpec],
    /// Keys that may be present.
    pub optional: &'static [PropertySpec],
    /// Key prefixes that may be present with any suffix.
    pub prefixes: &'static [PropertySpec],
    /// Keys whose change forces a replacement.
    pub immutable: &'static [&'static str],
    /// Whether two instances with the same `name` cannot coexist.
    pub unique_name: bool,
}

const TAGS: PropertySpec = PropertySpec::new("tags.", ValueKind::String);

static STORAGE_BUCKET: TypeSchema = TypeSchema {
    required: &[PropertySpec::new("name", ValueKind::String)],
    optional: &[
        PropertySpec::new("versioned", ValueKind::Boolean),
        PropertySpec::new("region", ValueKind::String),
    ],
    prefixes: &[TAGS],
    immutable: &["name", "region"],
    unique_name: true,
};

static KEY_VALUE_TABLE: TypeSchema = TypeSchema {
    required: &[
        PropertySpec::new("name", ValueKind::String),
        PropertySpec::new("partition_key", ValueKind::String),
    ],
    optional: &[
        PropertySpec::one_of("partition_key_type", &["string", "number", "binary"]),
        PropertySpec::new("sort_key", ValueKind::String),
        PropertySpec::one_of("billing_mode", &["pay-per-request", "provisioned"]),
    ],
    prefixes: &[TAGS],
    immutable: &["name", "partition_key", "partition_key_type", "sort_key"],
    unique_name: true,
};

static COMPUTE_FUNCTION: TypeSchema = TypeSchema {
    required: &[
        PropertySpec::new("name", ValueKind::String),
        PropertySpec::new("runtime", ValueKind::String),
        PropertySpec::new("handler", ValueKind::String),
    ],
    optional: &[
        PropertySpec::new("artifact", ValueKind::String),
        PropertySpec::new("memory_mb", ValueKind::Number),
        PropertySpec::new("timeout_secs", ValueKind::Number),
    ],
    prefixes: &[PropertySpec::new("env.", ValueKind::StringOrReference), TAGS],
    immutable: &["name"],
    unique_name: true,
};

static API_ROUTE: TypeSchema = TypeSchema {
    required: &[
        PropertySpec::new("name", ValueKind::String),
        PropertySpec::new("path", ValueKind::String),
        PropertySpec::one_of("method", &["GET", "POST", "PUT", "PATCH", "DELETE", "ANY"]),
        PropertySpec::new("target", ValueKind::Reference),
    ],
    optional: &[PropertySpec::new("proxy", ValueKind::Boolean)],
    prefixes: &[TAGS],
    immutable: &["path", "method"],
    unique_name: false,
};

/// Returns the schema of a resource type.
#[must_use]
pub fn schema_for(resource_type: ResourceType) -> &'static TypeSchema {
    match resource_type {
        ResourceType::StorageBucket => &STORAGE_BUCKET,
        ResourceType::KeyValueTable => &KEY_VALUE_TABLE,
        ResourceType::ComputeFunction => &COMPUTE_FUNCTION,
        ResourceType::ApiRoute => &API_ROUTE,
    }
}

impl TypeSchema {
    /// Returns true if changing `key` forces a replacement.
    #[must_use]
    pub fn is_immutable(&self, key: &str) -> bool {
        self.immutable.contains(&key)
    }

    /// Looks up the schema entry for a key.
    #[must_use]
    pub fn spec_for(&self, key: &str) -> Option<&PropertySpec> {
        self.required
            .iter()
            .chain(self.optional)
            .find(|s| s.key == key)
            .or_else(|| {
                self.prefixes
                    .iter()
                    .find(|s| key.len() > s.key.len() && key.starts_with(s.key))
            })
    }

    /// Validates a property bag against this schema.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for the first missing, unknown, or
    /// ill-typed property.
    pub fn validate(
        &self,
        resource: &str,
        resource_type: ResourceType,
        properties: &PropertyMap,
    ) -> Result<(), ValidationError> {
        for spec in self.required {
            if !properties.contains_key(spec.key) {
                return Err(ValidationError::MissingProperty {
                    resource: resource.to_string(),
                    property: spec.key.to_string(),
                });
            }
        }

        for (key, value) in properties {
            let Some(spec) = self.spec_for(key) else {
                return Err(ValidationError::UnknownProperty {
                    resource: resource.to_string(),
                    property: key.clone(),
                    resource_type: resource_type.to_string(),
                });
            };

            if !spec.kind.accepts(value) {
                return Err(ValidationError::property(
                    resource,
                    key,
                    format!("expected {}, found {}", spec.kind.describe(), value.kind_name()),
                ));
            }

            match value {
                PropertyValue::String(s) if s.is_empty() => {
                    return Err(ValidationError::property(resource, key, "must not be empty"));
                }
                PropertyValue::String(s)
                    if !spec.allowed.is_empty() && !spec.allowed.contains(&s.as_str()) =>
                {
                    return Err(ValidationError::property(
                        resource,
                        key,
                        format!("'{s}' is not one of {}", spec.allowed.join(", ")),
                    ));
                }
                PropertyValue::Number(n) if !n.is_finite() || *n < 0.0 => {
                    return Err(ValidationError::property(
                        resource,
                        key,
                        "must be a finite, non-negative number",
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, PropertyValue)]) -> PropertyMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_table_schema_accepts_original_shape() {
        let schema = schema_for(ResourceType::KeyValueTable);
        let properties = props(&[
            ("name", PropertyValue::string("plants")),
            ("partition_key", PropertyValue::string("PlantID")),
            ("partition_key_type", PropertyValue::string("string")),
            ("billing_mode", PropertyValue::string("pay-per-request")),
        ]);
        assert!(schema
            .validate("plant-table", ResourceType::KeyValueTable, &properties)
            .is_ok());
        assert!(schema.is_immutable("partition_key"));
        assert!(!schema.is_immutable("billing_mode"));
    }

    #[test]
    fn test_missing_required_property() {
        let schema = schema_for(ResourceType::StorageBucket);
        let err = schema
            .validate("bucket", ResourceType::StorageBucket, &PropertyMap::new())
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingProperty { property, .. } if property == "name"));
    }

    #[test]
    fn test_enum_value_rejected() {
        let schema = schema_for(ResourceType::ApiRoute);
        let properties = props(&[
            ("name", PropertyValue::string("plant")),
            ("path", PropertyValue::string("/plant")),
            ("method", PropertyValue::string("FETCH")),
            ("target", PropertyValue::reference("report-fn")),
        ]);
        let err = schema
            .validate("route", ResourceType::ApiRoute, &properties)
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidProperty { property, .. } if property == "method"));
    }

    #[test]
    fn test_prefixed_keys() {
        let schema = schema_for(ResourceType::ComputeFunction);
        assert!(schema.spec_for("env.TABLE_NAME").is_some());
        assert!(schema.spec_for("env.").is_none());
        assert!(schema_for(ResourceType::StorageBucket).spec_for("env.X").is_none());
    }

    #[test]
    fn test_reference_only_where_allowed() {
        let schema = schema_for(ResourceType::StorageBucket);
        let properties = props(&[("name", PropertyValue::reference("other"))]);
        assert!(schema
            .validate("bucket", ResourceType::StorageBucket, &properties)
            .is_err());
    }
}
