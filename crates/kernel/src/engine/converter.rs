//! Data converter.
//!
//! Turns a stored, flattened document back into the view callers expect:
//! relationships get `from*`/`to*` fields instead of the raw `connections`
//! array, denormalized refs become single values or lists, and rule-derived
//! attributes are regrouped into `inferences`.

use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::models::document::{REL_ID_SUFFIX, REL_INDEX_PREFIX, RULE_PREFIX};
use crate::models::{Connection, Document, Inference, InferredAttribute};
use crate::schema::SchemaRegistry;

fn endpoint_fields(prefix: &str, connection: &Connection, attributes: &mut Map<String, Value>) {
    attributes.insert(
        format!("{prefix}Id"),
        Value::String(connection.internal_id.clone()),
    );
    attributes.insert(
        format!("{prefix}Type"),
        Value::String(connection.entity_type().to_string()),
    );
    attributes.insert(format!("{prefix}Role"), Value::String(connection.role.clone()));
    attributes.insert(format!("{prefix}Name"), Value::String(connection.name.clone()));
}

/// Relationship type of a denormalized attribute name.
pub fn rel_type_of(field: &str) -> Option<&str> {
    field
        .strip_prefix(REL_INDEX_PREFIX)
        .and_then(|rest| rest.strip_suffix(REL_ID_SUFFIX))
}

fn normalize_ref(value: Value, single: bool) -> Value {
    match (value, single) {
        (Value::Array(mut values), true) => {
            if values.is_empty() {
                Value::Null
            } else {
                values.swap_remove(0)
            }
        }
        (Value::Array(values), false) => Value::Array(values),
        (Value::Null, false) => Value::Array(Vec::new()),
        (scalar, true) => scalar,
        (scalar, false) => Value::Array(vec![scalar]),
    }
}

fn parse_inferences(rule: &str, value: Value) -> Vec<Inference> {
    let applications = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    applications
        .into_iter()
        .filter_map(|application| {
            let Value::Object(mut application) = application else {
                return None;
            };
            let explanation = match application.remove("explanation") {
                Some(Value::Array(ids)) => ids
                    .into_iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            let attributes = match application.remove("data") {
                Some(Value::Object(data)) => data
                    .into_iter()
                    .map(|(field, value)| InferredAttribute { field, value })
                    .collect(),
                _ => Vec::new(),
            };
            Some(Inference {
                rule: rule.to_string(),
                explanation,
                attributes,
            })
        })
        .collect()
}

/// One end of a relationship, raw or converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub role: String,
    pub entity_type: String,
}

impl Endpoint {
    fn from_connection(connection: &Connection) -> Self {
        Self {
            id: connection.internal_id.clone(),
            role: connection.role.clone(),
            entity_type: connection.entity_type().to_string(),
        }
    }

    fn from_attributes(doc: &Document, prefix: &str) -> Option<Self> {
        let read = |suffix: &str| {
            doc.attribute(&format!("{prefix}{suffix}"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Some(Self {
            id: read("Id")?,
            role: read("Role")?,
            entity_type: read("Type").unwrap_or_default(),
        })
    }
}

/// Source and target of a relationship, from its connections when stored
/// raw or from the `from*`/`to*` fields once converted.
pub fn endpoints(doc: &Document) -> EngineResult<(Endpoint, Endpoint)> {
    if doc.connections.is_some() {
        let ends = doc.relationship_ends()?;
        return Ok((
            Endpoint::from_connection(ends.from),
            Endpoint::from_connection(ends.to),
        ));
    }
    match (
        Endpoint::from_attributes(doc, "from"),
        Endpoint::from_attributes(doc, "to"),
    ) {
        (Some(from), Some(to)) => Ok((from, to)),
        _ => Err(EngineError::Functional(format!(
            "relationship {} ({}) is missing its from/to connection",
            doc.internal_id, doc.entity_type
        ))),
    }
}

/// Convert a stored document into its caller view.
///
/// Relationships missing a connection fail.
pub fn convert_document(mut doc: Document, schema: &dyn SchemaRegistry) -> EngineResult<Document> {
    if doc.connections.is_some() {
        let mut fields = Map::new();
        {
            let ends = doc.relationship_ends()?;
            endpoint_fields("from", ends.from, &mut fields);
            endpoint_fields("to", ends.to, &mut fields);
        }
        doc.attributes.extend(fields);
        doc.connections = None;
    }

    let keys: Vec<String> = doc
        .attributes
        .keys()
        .filter(|k| k.starts_with(REL_INDEX_PREFIX) || k.starts_with(RULE_PREFIX))
        .cloned()
        .collect();

    for key in keys {
        let Some(value) = doc.attributes.remove(&key) else {
            continue;
        };
        if let Some(rule) = key.strip_prefix(RULE_PREFIX) {
            doc.inferences.extend(parse_inferences(rule, value));
        } else if let Some(relationship_type) = rel_type_of(&key) {
            let single = schema.is_single_ref(&doc.entity_type, relationship_type);
            doc.attributes.insert(key, normalize_ref(value, single));
        } else {
            doc.attributes.insert(key, value);
        }
    }

    Ok(doc)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::document::BASIC_RELATIONSHIP;
    use crate::schema::DefaultSchema;
    use serde_json::json;

    fn uses(x: &str, y: &str) -> Document {
        let mut doc = Document::new("r1", "uses", "kestrel_stix_core_relationships");
        doc.parent_types = vec![BASIC_RELATIONSHIP.into()];
        doc.connections = Some(vec![
            Connection {
                internal_id: y.into(),
                name: "Tool".into(),
                types: vec!["Tool".into(), "Stix-Domain-Object".into()],
                role: "uses_to".into(),
            },
            Connection {
                internal_id: x.into(),
                name: "Malware".into(),
                types: vec!["Malware".into()],
                role: "uses_from".into(),
            },
        ]);
        doc
    }

    #[test]
    fn relationship_endpoints_rebuilt() {
        let converted = convert_document(uses("X", "Y"), &DefaultSchema::new()).unwrap();
        assert!(converted.connections.is_none());
        assert_eq!(converted.attribute("fromId"), Some(&json!("X")));
        assert_eq!(converted.attribute("fromRole"), Some(&json!("uses_from")));
        assert_eq!(converted.attribute("toId"), Some(&json!("Y")));
        assert_eq!(converted.attribute("toRole"), Some(&json!("uses_to")));
        assert_eq!(converted.attribute("toType"), Some(&json!("Tool")));
        assert_eq!(converted.attribute("fromName"), Some(&json!("Malware")));
    }

    #[test]
    fn broken_relationship_fails() {
        let mut doc = uses("X", "Y");
        if let Some(ref mut connections) = doc.connections {
            connections.retain(|c| c.role.ends_with("_from"));
        }
        assert!(matches!(
            convert_document(doc, &DefaultSchema::new()),
            Err(EngineError::Functional(_))
        ));
    }

    #[test]
    fn refs_single_or_multiple() {
        let doc = Document::new("a", "Malware", "idx")
            .with_attribute("rel_created-by.internal_id", json!(["identity-1"]))
            .with_attribute("rel_object-marking.internal_id", json!("m1"))
            .with_attribute("rel_uses.internal_id", json!(["t1", "t2"]));
        let converted = convert_document(doc, &DefaultSchema::new()).unwrap();
        assert_eq!(
            converted.attribute("rel_created-by.internal_id"),
            Some(&json!("identity-1"))
        );
        assert_eq!(
            converted.attribute("rel_object-marking.internal_id"),
            Some(&json!(["m1"]))
        );
        assert_eq!(
            converted.attribute("rel_uses.internal_id"),
            Some(&json!(["t1", "t2"]))
        );
    }

    #[test]
    fn rule_attributes_regrouped() {
        let doc = Document::new("a", "Malware", "idx")
            .with_attribute("name", json!("n"))
            .with_attribute(
                "i_rule_location_targets",
                json!([{
                    "explanation": ["r1", "r2"],
                    "dependencies": ["r1"],
                    "data": { "confidence": 50 }
                }]),
            );
        let converted = convert_document(doc, &DefaultSchema::new()).unwrap();
        assert!(converted.attribute("i_rule_location_targets").is_none());
        assert_eq!(converted.inferences.len(), 1);
        let inference = &converted.inferences[0];
        assert_eq!(inference.rule, "location_targets");
        assert_eq!(inference.explanation, vec!["r1", "r2"]);
        assert_eq!(inference.attributes[0].field, "confidence");
        assert_eq!(inference.attributes[0].value, json!(50));
        assert_eq!(converted.attribute("name"), Some(&json!("n")));
    }

    #[test]
    fn endpoints_raw_and_converted() {
        let raw = uses("X", "Y");
        let (from, to) = endpoints(&raw).unwrap();
        assert_eq!(from.id, "X");
        assert_eq!(to.role, "uses_to");

        let converted = convert_document(raw, &DefaultSchema::new()).unwrap();
        let (from, to) = endpoints(&converted).unwrap();
        assert_eq!(from.entity_type, "Malware");
        assert_eq!(to.id, "Y");

        assert!(endpoints(&Document::new("e", "Malware", "idx")).is_err());
    }

    #[test]
    fn rel_type_extraction() {
        assert_eq!(rel_type_of("rel_object-marking.internal_id"), Some("object-marking"));
        assert_eq!(rel_type_of("rel_object-marking"), None);
        assert_eq!(rel_type_of("name"), None);
    }
}
