//! Schema seam.
//!
//! The type registry lives outside the engine. The engine only asks it a
//! handful of questions: how an attribute is typed, which relationship refs
//! are single-valued, which relationship types are refs, which timestamps an
//! entity type carries and which fields can be aggregated.

use std::collections::HashSet;

/// Storage kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Stored as text with a `.keyword` sub-field.
    Text,
    Date,
    Numeric,
    Boolean,
}

impl AttributeKind {
    /// Date, numeric and boolean attributes are compared on their raw value.
    pub fn is_raw(self) -> bool {
        !matches!(self, AttributeKind::Text)
    }
}

/// Questions the engine asks about the document schema.
pub trait SchemaRegistry: Send + Sync {
    /// Storage kind of an attribute.
    fn attribute_kind(&self, attribute: &str) -> AttributeKind;

    /// Whether `relationship_type` refs are single-valued on `entity_type`.
    fn is_single_ref(&self, entity_type: &str, relationship_type: &str) -> bool;

    /// Whether a relationship type is a ref (meta) relationship.
    fn is_ref_relationship(&self, relationship_type: &str) -> bool;

    /// Modification timestamps declared for an entity type.
    fn timestamp_attributes(&self, entity_type: &str) -> Vec<&'static str>;

    /// Whether terms aggregation is allowed on a field.
    fn is_aggregatable(&self, field: &str) -> bool;
}

const DATE_ATTRIBUTES: &[&str] = &[
    "created_at",
    "updated_at",
    "created",
    "modified",
    "valid_from",
    "valid_until",
    "first_seen",
    "last_seen",
    "start_time",
    "stop_time",
    "published",
    "first_observed",
    "last_observed",
    "refreshed_at",
];

const NUMERIC_ATTRIBUTES: &[&str] = &[
    "confidence",
    "x_opencti_score",
    "x_opencti_order",
    "number_observed",
    "base_score",
    "attribute_order",
];

const BOOLEAN_ATTRIBUTES: &[&str] = &["revoked", "x_opencti_detection", "is_family"];

const SINGLE_REFS: &[&str] = &["created-by"];

const REF_RELATIONSHIPS: &[&str] = &[
    "created-by",
    "object-marking",
    "object-label",
    "object-assignee",
    "object-participant",
    "object",
    "external-reference",
    "kill-chain-phase",
    "granted",
    "operating-system",
    "sample",
];

const INTERNAL_TYPES: &[&str] = &[
    "Settings",
    "User",
    "Group",
    "Role",
    "Capability",
    "Workspace",
    "Marking-Definition",
];

const AGGREGATABLE_FIELDS: &[&str] = &[
    "entity_type",
    "parent_types",
    "creator_id",
    "x_opencti_workflow_id",
    "revoked",
    "confidence",
    "x_opencti_score",
    "x_opencti_reliability",
    "relationship_type",
];

/// Built-in schema used when no registry is supplied.
pub struct DefaultSchema {
    dates: HashSet<&'static str>,
    numerics: HashSet<&'static str>,
    booleans: HashSet<&'static str>,
}

impl DefaultSchema {
    pub fn new() -> Self {
        Self {
            dates: DATE_ATTRIBUTES.iter().copied().collect(),
            numerics: NUMERIC_ATTRIBUTES.iter().copied().collect(),
            booleans: BOOLEAN_ATTRIBUTES.iter().copied().collect(),
        }
    }
}

impl Default for DefaultSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry for DefaultSchema {
    fn attribute_kind(&self, attribute: &str) -> AttributeKind {
        // Nested paths are typed by their last segment
        let leaf = attribute.rsplit('.').next().unwrap_or(attribute);
        if self.dates.contains(leaf) {
            AttributeKind::Date
        } else if self.numerics.contains(leaf) {
            AttributeKind::Numeric
        } else if self.booleans.contains(leaf) {
            AttributeKind::Boolean
        } else {
            AttributeKind::Text
        }
    }

    fn is_single_ref(&self, _entity_type: &str, relationship_type: &str) -> bool {
        SINGLE_REFS.contains(&relationship_type)
    }

    fn is_ref_relationship(&self, relationship_type: &str) -> bool {
        REF_RELATIONSHIPS.contains(&relationship_type)
    }

    fn timestamp_attributes(&self, entity_type: &str) -> Vec<&'static str> {
        if INTERNAL_TYPES.contains(&entity_type) {
            vec!["updated_at"]
        } else {
            vec!["updated_at", "modified"]
        }
    }

    fn is_aggregatable(&self, field: &str) -> bool {
        AGGREGATABLE_FIELDS.contains(&field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_kinds() {
        let schema = DefaultSchema::new();
        assert_eq!(schema.attribute_kind("created_at"), AttributeKind::Date);
        assert_eq!(schema.attribute_kind("confidence"), AttributeKind::Numeric);
        assert_eq!(schema.attribute_kind("revoked"), AttributeKind::Boolean);
        assert_eq!(schema.attribute_kind("name"), AttributeKind::Text);
        assert_eq!(
            schema.attribute_kind("connections.first_seen"),
            AttributeKind::Date
        );
        assert!(!AttributeKind::Text.is_raw());
        assert!(AttributeKind::Boolean.is_raw());
    }

    #[test]
    fn refs_and_timestamps() {
        let schema = DefaultSchema::new();
        assert!(schema.is_single_ref("Malware", "created-by"));
        assert!(!schema.is_single_ref("Malware", "object-marking"));
        assert!(schema.is_ref_relationship("object-marking"));
        assert!(!schema.is_ref_relationship("uses"));
        assert_eq!(schema.timestamp_attributes("User"), vec!["updated_at"]);
        assert_eq!(
            schema.timestamp_attributes("Malware"),
            vec!["updated_at", "modified"]
        );
    }
}
