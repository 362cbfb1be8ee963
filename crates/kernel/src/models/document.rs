//! Stored documents, relationship connections and inferences.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};

/// Prefix of denormalized relationship-derived attributes (`rel_<type>.internal_id`).
pub const REL_INDEX_PREFIX: &str = "rel_";

/// Suffix of the id list inside a denormalized relationship attribute.
pub const REL_ID_SUFFIX: &str = ".internal_id";

/// Prefix of rule-derived inferred attributes (`i_rule_<rule id>`).
pub const RULE_PREFIX: &str = "i_rule_";

/// Parent type shared by every relationship document.
pub const BASIC_RELATIONSHIP: &str = "basic-relationship";

/// Role suffix of the source connection.
pub const ROLE_FROM_SUFFIX: &str = "_from";

/// Role suffix of the target connection.
pub const ROLE_TO_SUFFIX: &str = "_to";

/// Denormalized attribute name for a relationship type.
pub fn rel_field(relationship_type: &str) -> String {
    format!("{REL_INDEX_PREFIX}{relationship_type}{REL_ID_SUFFIX}")
}

/// Embedded summary of one relationship endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub internal_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub types: Vec<String>,
    pub role: String,
}

impl Connection {
    /// Most specific type of the endpoint.
    pub fn entity_type(&self) -> &str {
        self.types.first().map(String::as_str).unwrap_or_default()
    }
}

/// Which end of a relationship a connection sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    From,
    To,
}

impl Side {
    /// Role of this side for a relationship type.
    pub fn role(self, relationship_type: &str) -> String {
        match self {
            Side::From => format!("{relationship_type}{ROLE_FROM_SUFFIX}"),
            Side::To => format!("{relationship_type}{ROLE_TO_SUFFIX}"),
        }
    }
}

/// Both ends of a relationship document.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipEnds<'a> {
    pub from: &'a Connection,
    pub to: &'a Connection,
}

impl<'a> RelationshipEnds<'a> {
    /// Connection at `side`.
    pub fn at(&self, side: Side) -> &'a Connection {
        match side {
            Side::From => self.from,
            Side::To => self.to,
        }
    }

    /// Connection opposite `side`.
    pub fn opposite(&self, side: Side) -> &'a Connection {
        match side {
            Side::From => self.to,
            Side::To => self.from,
        }
    }
}

/// One attribute value produced by an inference rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredAttribute {
    pub field: String,
    pub value: Value,
}

/// Normalized view of one rule application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub rule: String,
    #[serde(default)]
    pub explanation: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<InferredAttribute>,
}

/// Generic stored unit: an entity or a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub internal_id: String,

    #[serde(default)]
    pub standard_id: String,

    pub entity_type: String,

    #[serde(default)]
    pub parent_types: Vec<String>,

    /// Index the document lives in. Never part of the stored source.
    #[serde(default)]
    pub index_name: String,

    /// Present only on relationship documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<Connection>>,

    /// Filled by the data converter from `i_rule_*` attributes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inferences: Vec<Inference>,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Document {
    /// Create an entity document.
    pub fn new(
        internal_id: impl Into<String>,
        entity_type: impl Into<String>,
        index_name: impl Into<String>,
    ) -> Self {
        Self {
            internal_id: internal_id.into(),
            standard_id: String::new(),
            entity_type: entity_type.into(),
            parent_types: Vec::new(),
            index_name: index_name.into(),
            connections: None,
            inferences: Vec::new(),
            attributes: Map::new(),
        }
    }

    /// Rebuild a document from a backend hit.
    pub fn from_hit(index: &str, source: Value) -> EngineResult<Self> {
        let mut doc: Document = serde_json::from_value(source)
            .map_err(|e| EngineError::Unsupported(format!("malformed stored document: {e}")))?;
        doc.index_name = index.to_string();
        Ok(doc)
    }

    /// Source body written to the backend.
    pub fn to_source(&self) -> Value {
        let mut source = self.attributes.clone();
        source.insert("internal_id".into(), Value::String(self.internal_id.clone()));
        source.insert("standard_id".into(), Value::String(self.standard_id.clone()));
        source.insert("entity_type".into(), Value::String(self.entity_type.clone()));
        source.insert(
            "parent_types".into(),
            Value::Array(
                self.parent_types
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        if let Some(ref connections) = self.connections {
            source.insert(
                "connections".into(),
                serde_json::to_value(connections).unwrap_or(Value::Null),
            );
        }
        Value::Object(source)
    }

    /// Whether this document stores a relationship.
    pub fn is_relationship(&self) -> bool {
        self.connections.is_some() || self.parent_types.iter().any(|t| t == BASIC_RELATIONSHIP)
    }

    /// Type used for roles and denormalized fields.
    pub fn relationship_type(&self) -> &str {
        self.attributes
            .get("relationship_type")
            .and_then(Value::as_str)
            .unwrap_or(&self.entity_type)
    }

    /// Locate the `_from` and `_to` connections. Fails on a malformed relationship.
    pub fn relationship_ends(&self) -> EngineResult<RelationshipEnds<'_>> {
        let connections = self.connections.as_deref().unwrap_or_default();
        let from = connections
            .iter()
            .find(|c| c.role.ends_with(ROLE_FROM_SUFFIX));
        let to = connections.iter().find(|c| c.role.ends_with(ROLE_TO_SUFFIX));
        match (from, to) {
            (Some(from), Some(to)) => Ok(RelationshipEnds { from, to }),
            _ => Err(EngineError::Functional(format!(
                "relationship {} ({}) is missing its from/to connection",
                self.internal_id, self.entity_type
            ))),
        }
    }

    /// Whether the document is of `type_name` directly or through a parent type.
    pub fn is_of_type(&self, type_name: &str) -> bool {
        self.entity_type == type_name || self.parent_types.iter().any(|t| t == type_name)
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Read an attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Every id the document can be looked up by.
    pub fn lookup_ids(&self) -> Vec<String> {
        let mut ids = vec![self.internal_id.clone()];
        if !self.standard_id.is_empty() {
            ids.push(self.standard_id.clone());
        }
        if let Some(Value::Array(stix_ids)) = self.attributes.get("x_opencti_stix_ids") {
            ids.extend(stix_ids.iter().filter_map(Value::as_str).map(str::to_string));
        }
        ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relationship() -> Document {
        let mut doc = Document::new("r1", "uses", "kestrel_stix_core_relationships");
        doc.parent_types = vec![BASIC_RELATIONSHIP.to_string()];
        doc.connections = Some(vec![
            Connection {
                internal_id: "X".into(),
                name: "Malware X".into(),
                types: vec!["Malware".into()],
                role: "uses_from".into(),
            },
            Connection {
                internal_id: "Y".into(),
                name: "Tool Y".into(),
                types: vec!["Tool".into()],
                role: "uses_to".into(),
            },
        ]);
        doc
    }

    #[test]
    fn relationship_ends_by_role_suffix() {
        let doc = relationship();
        let ends = doc.relationship_ends().unwrap();
        assert_eq!(ends.from.internal_id, "X");
        assert_eq!(ends.to.internal_id, "Y");
        assert_eq!(ends.opposite(Side::From).internal_id, "Y");
        assert_eq!(ends.at(Side::To).entity_type(), "Tool");
    }

    #[test]
    fn relationship_missing_connection_fails() {
        let mut doc = relationship();
        doc.connections = Some(vec![doc.connections.unwrap().remove(0)]);
        assert!(matches!(
            doc.relationship_ends(),
            Err(EngineError::Functional(_))
        ));

        let mut doc = relationship();
        doc.connections = None;
        assert!(doc.is_relationship(), "parent type still marks it");
        assert!(doc.relationship_ends().is_err());
    }

    #[test]
    fn hit_source_round_trip_keeps_attributes() {
        let source = json!({
            "internal_id": "a",
            "standard_id": "malware--a",
            "entity_type": "Malware",
            "parent_types": ["Stix-Domain-Object"],
            "name": "Emotet",
            "rel_object-marking.internal_id": ["m1"]
        });
        let doc = Document::from_hit("kestrel_stix_domain_objects", source).unwrap();
        assert_eq!(doc.index_name, "kestrel_stix_domain_objects");
        assert_eq!(doc.attribute("name"), Some(&json!("Emotet")));
        assert!(doc.is_of_type("Stix-Domain-Object"));
        assert!(!doc.is_relationship());

        let stored = doc.to_source();
        assert!(stored.get("index_name").is_none());
        assert_eq!(stored["rel_object-marking.internal_id"], json!(["m1"]));
    }

    #[test]
    fn lookup_ids_include_stix_aliases() {
        let doc = Document::new("a", "Malware", "idx")
            .with_attribute("x_opencti_stix_ids", json!(["malware--old"]));
        let mut doc = doc;
        doc.standard_id = "malware--a".into();
        assert_eq!(doc.lookup_ids(), vec!["a", "malware--a", "malware--old"]);
    }

    #[test]
    fn rel_field_naming() {
        assert_eq!(rel_field("object-marking"), "rel_object-marking.internal_id");
        assert_eq!(Side::To.role("uses"), "uses_to");
    }
}
