//! Kestrel test utilities.
//!
//! Document, relationship and caller fixtures, plus [`MemoryBackend`], an
//! in-process search backend so engine behavior can be tested without a
//! cluster.

mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use kestrel_kernel::config::EngineConfig;
use kestrel_kernel::engine::Engine;
use kestrel_kernel::models::access::BYPASS;
use kestrel_kernel::models::document::BASIC_RELATIONSHIP;
use kestrel_kernel::models::{AccessContext, Connection, Document, MarkingRef, Side};
use kestrel_kernel::schema::{DefaultSchema, SchemaRegistry};

pub use memory::MemoryBackend;

/// Index holding domain objects.
pub const DOMAIN_INDEX: &str = "kestrel_stix_domain_objects";

/// Index holding meta objects such as markings and labels.
pub const META_INDEX: &str = "kestrel_stix_meta_objects";

/// Index holding core relationships.
pub const RELATIONSHIPS_INDEX: &str = "kestrel_stix_core_relationships";

/// Index holding ref relationships.
pub const META_RELATIONSHIPS_INDEX: &str = "kestrel_stix_meta_relationships";

/// A fresh time-ordered id.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// A named domain entity stored in [`DOMAIN_INDEX`].
pub fn entity(id: &str, entity_type: &str, name: &str) -> Document {
    let mut doc = Document::new(id, entity_type, DOMAIN_INDEX)
        .with_attribute("name", json!(name))
        .with_attribute("created_at", json!("2024-01-01T00:00:00.000Z"));
    doc.standard_id = format!("{}--{id}", entity_type.to_lowercase());
    doc.parent_types = vec![
        "Stix-Domain-Object".to_string(),
        "Stix-Core-Object".to_string(),
    ];
    doc
}

/// A marking definition stored in [`META_INDEX`].
pub fn marking(id: &str, definition_type: &str, name: &str) -> Document {
    let mut doc = Document::new(id, "Marking-Definition", META_INDEX)
        .with_attribute("definition_type", json!(definition_type))
        .with_attribute("definition", json!(name));
    doc.standard_id = format!("marking-definition--{id}");
    doc.parent_types = vec!["Stix-Meta-Object".to_string()];
    doc
}

/// An author identity with a reliability rating.
pub fn identity(id: &str, name: &str, reliability: &str) -> Document {
    let mut doc = entity(id, "Organization", name)
        .with_attribute("x_opencti_reliability", json!(reliability));
    doc.parent_types.push("Identity".to_string());
    doc
}

fn connection(doc: &Document, role: String) -> Connection {
    let mut types = vec![doc.entity_type.clone()];
    types.extend(doc.parent_types.iter().cloned());
    Connection {
        internal_id: doc.internal_id.clone(),
        name: doc
            .attribute("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        types,
        role,
    }
}

/// A relationship `from -> to` of `relationship_type`.
///
/// Ref relationship types land in [`META_RELATIONSHIPS_INDEX`].
pub fn relationship(id: &str, relationship_type: &str, from: &Document, to: &Document) -> Document {
    let schema = DefaultSchema::new();
    let (index, parent) = if schema.is_ref_relationship(relationship_type) {
        (META_RELATIONSHIPS_INDEX, "stix-ref-relationship")
    } else {
        (RELATIONSHIPS_INDEX, "stix-core-relationship")
    };

    let mut doc = Document::new(id, relationship_type, index)
        .with_attribute("relationship_type", json!(relationship_type));
    doc.standard_id = format!("relationship--{id}");
    doc.parent_types = vec![parent.to_string(), BASIC_RELATIONSHIP.to_string()];
    doc.connections = Some(vec![
        connection(from, Side::From.role(relationship_type)),
        connection(to, Side::To.role(relationship_type)),
    ]);
    doc
}

/// Tag a document with marking ids.
pub fn marked(doc: Document, markings: &[&str]) -> Document {
    doc.with_attribute("rel_object-marking.internal_id", json!(markings))
}

/// The internal system caller.
pub fn system() -> AccessContext {
    AccessContext::system()
}

/// A regular caller with no marking clearance.
pub fn user(id: &str) -> AccessContext {
    AccessContext {
        user_id: id.to_string(),
        groups: vec![format!("{id}-group")],
        ..Default::default()
    }
}

/// A regular caller with the bypass capability.
pub fn bypass_user(id: &str) -> AccessContext {
    AccessContext {
        capabilities: vec![BYPASS.to_string()],
        ..user(id)
    }
}

/// A caller cleared for `allowed` out of the platform's `all` markings.
///
/// Markings are given as `(id, definition_type)` pairs.
pub fn user_with_markings(id: &str, allowed: &[(&str, &str)], all: &[(&str, &str)]) -> AccessContext {
    let mut all_markings_by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (marking, definition_type) in all {
        all_markings_by_type
            .entry(definition_type.to_string())
            .or_default()
            .push(marking.to_string());
    }
    AccessContext {
        markings_allowed: allowed
            .iter()
            .map(|(marking, definition_type)| MarkingRef {
                id: marking.to_string(),
                definition_type: definition_type.to_string(),
            })
            .collect(),
        all_markings_by_type,
        ..user(id)
    }
}

/// Engine over `backend` with default knobs.
pub fn engine(backend: Arc<MemoryBackend>) -> Engine {
    engine_with(backend, EngineConfig::default())
}

/// Engine over `backend` with custom knobs.
pub fn engine_with(backend: Arc<MemoryBackend>, config: EngineConfig) -> Engine {
    Engine::new(backend, config, Arc::new(DefaultSchema::new()))
}

/// Backend pre-loaded with `documents`, and an engine over it.
pub fn seeded(documents: &[Document]) -> (Arc<MemoryBackend>, Engine) {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(documents);
    let engine = engine(backend.clone());
    (backend, engine)
}
