#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Write-side integration tests: indexing with denormalized refs, element
//! updates and cascade deletes.

use std::sync::Arc;

use serde_json::{Value, json};

use kestrel_kernel::config::EngineConfig;
use kestrel_kernel::engine::PatchExpression;
use kestrel_kernel::error::EngineError;
use kestrel_kernel::models::Document;
use kestrel_test_utils::{
    MemoryBackend, engine, engine_with, entity, marking, relationship,
};

fn ids(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// A uses B, C targets A, D is related to the A-uses-B relationship.
fn graph() -> Vec<Document> {
    let a = entity("A", "Intrusion-Set", "APT-A");
    let b = entity("B", "Malware", "Bad");
    let c = entity("C", "Campaign", "Camp");
    let d = entity("D", "Note", "Note on usage");
    let r1 = relationship("R1", "uses", &a, &b);
    let r2 = relationship("R2", "targets", &c, &a);
    let r3 = relationship("R3", "related-to", &d, &r1);
    vec![a, b, c, d, r1, r2, r3]
}

// -------------------------------------------------------------------------
// Indexing
// -------------------------------------------------------------------------

#[tokio::test]
async fn indexing_relationships_updates_both_endpoints() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(backend.clone());

    let indexed = engine.index_elements(&graph()).await.unwrap();
    assert_eq!(indexed, 7);
    assert_eq!(backend.len(), 7);

    let a = backend.source("A").unwrap();
    assert_eq!(ids(a.get("rel_uses.internal_id")), vec!["B"]);
    assert_eq!(ids(a.get("rel_targets.internal_id")), vec!["C"]);
    assert!(a.contains_key("updated_at"), "from endpoint is touched");
    assert!(a.contains_key("modified"));

    let b = backend.source("B").unwrap();
    assert_eq!(ids(b.get("rel_uses.internal_id")), vec!["A"]);
    assert!(!b.contains_key("modified"), "to endpoint keeps its timestamps");

    let r1 = backend.source("R1").unwrap();
    assert_eq!(ids(r1.get("rel_related-to.internal_id")), vec!["D"]);
}

#[tokio::test]
async fn reindexing_does_not_duplicate_refs() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(backend.clone());
    let docs = graph();

    engine.index_elements(&docs).await.unwrap();
    engine.index_elements(&docs[4..5]).await.unwrap();

    let a = backend.source("A").unwrap();
    assert_eq!(ids(a.get("rel_uses.internal_id")), vec!["B"]);
}

#[tokio::test]
async fn endpoints_outside_the_batch_are_looked_up() {
    let backend = Arc::new(MemoryBackend::new());
    let a = entity("A", "Intrusion-Set", "APT-A");
    let b = entity("B", "Malware", "Bad");
    backend.seed(&[a.clone(), b.clone()]);
    let engine = engine(backend.clone());

    engine
        .index_elements(&[relationship("R1", "uses", &a, &b)])
        .await
        .unwrap();
    assert_eq!(
        ids(backend.source("B").unwrap().get("rel_uses.internal_id")),
        vec!["A"]
    );
}

#[tokio::test]
async fn unimpacted_roles_get_no_refs() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(backend.clone());
    let a = entity("A", "Report", "Report A");
    let red = marking("M", "TLP", "TLP:RED");
    let rm = relationship("RM", "object-marking", &a, &red);

    engine.index_elements(&[a, red, rm]).await.unwrap();

    let a = backend.source("A").unwrap();
    assert_eq!(ids(a.get("rel_object-marking.internal_id")), vec!["M"]);
    let m = backend.source("M").unwrap();
    assert!(!m.contains_key("rel_object-marking.internal_id"));
}

#[tokio::test]
async fn malformed_relationship_fails_before_any_write() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(backend.clone());
    let a = entity("A", "Intrusion-Set", "APT-A");
    let b = entity("B", "Malware", "Bad");
    let mut broken = relationship("R1", "uses", &a, &b);
    if let Some(connections) = broken.connections.as_mut() {
        connections.pop();
    }

    let err = engine.index_elements(&[a, b, broken]).await.unwrap_err();
    assert!(matches!(err, EngineError::Functional(_)));
    assert_eq!(backend.bulk_calls(), 0);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn document_without_index_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(backend.clone());
    let doc = Document::new("X", "Malware", "");
    let err = engine.index(&doc).await.unwrap_err();
    assert!(matches!(err, EngineError::Functional(_)));
    assert_eq!(backend.bulk_calls(), 0);
}

#[tokio::test]
async fn bulk_is_split_into_batches() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        bulk_batch_size: 2,
        ..Default::default()
    };
    let engine = engine_with(backend.clone(), config);
    let docs: Vec<Document> = (0..5)
        .map(|i| entity(&format!("e{i}"), "Malware", "m"))
        .collect();

    engine.index_elements(&docs).await.unwrap();
    assert_eq!(backend.bulk_calls(), 3);
    assert_eq!(backend.bulk_operations(), 5);
}

// -------------------------------------------------------------------------
// Updates
// -------------------------------------------------------------------------

#[tokio::test]
async fn update_element_sets_and_removes_fields() {
    let backend = Arc::new(MemoryBackend::new());
    let original = entity("A", "Malware", "Old").with_attribute("description", json!("d"));
    backend.seed(&[original]);
    let engine = engine(backend.clone());

    let change = Document::new("A", "Malware", kestrel_test_utils::DOMAIN_INDEX)
        .with_attribute("name", json!("New"))
        .with_attribute("description", Value::Null);
    engine.update_element(&change).await.unwrap();

    let stored = backend.source("A").unwrap();
    assert_eq!(stored["name"], json!("New"));
    assert!(!stored.contains_key("description"));
    assert_eq!(stored["entity_type"], json!("Malware"));
}

#[tokio::test]
async fn updating_a_missing_document_fails() {
    let backend = Arc::new(MemoryBackend::new());
    backend.create_index(kestrel_test_utils::DOMAIN_INDEX);
    let engine = engine(backend.clone());

    let err = engine
        .update(
            kestrel_test_utils::DOMAIN_INDEX,
            "ghost",
            PatchExpression::append_refs("rel_uses.internal_id", vec!["A".into()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Database { .. }));

    engine
        .delete(kestrel_test_utils::DOMAIN_INDEX, "ghost")
        .await
        .expect("deleting an absent document is not an error");
}

// -------------------------------------------------------------------------
// Cascade delete
// -------------------------------------------------------------------------

async fn indexed_graph(config: EngineConfig) -> (Arc<MemoryBackend>, kestrel_kernel::engine::Engine) {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_with(backend.clone(), config);
    engine.index_elements(&graph()).await.unwrap();
    (backend, engine)
}

#[tokio::test]
async fn delete_cascades_through_relationship_chains() {
    let (backend, engine) = indexed_graph(EngineConfig::default()).await;
    let target = entity("A", "Intrusion-Set", "APT-A");

    let report = engine.delete_elements(&[target]).await.unwrap();
    assert_eq!(report.deleted, 4);
    assert!(report.cleanup_failures.is_empty());
    assert_eq!(report.cleaned, 3);

    let mut dependencies: Vec<&str> = report
        .dependencies
        .iter()
        .map(|d| d.internal_id.as_str())
        .collect();
    dependencies.sort_unstable();
    assert_eq!(dependencies, vec!["R1", "R2", "R3"]);

    for gone in ["A", "R1", "R2", "R3"] {
        assert!(!backend.contains(gone), "{gone} should be deleted");
    }

    let b = backend.source("B").unwrap();
    assert!(!b.contains_key("rel_uses.internal_id"));
    let c = backend.source("C").unwrap();
    assert!(!c.contains_key("rel_targets.internal_id"));
    let d = backend.source("D").unwrap();
    assert!(!d.contains_key("rel_related-to.internal_id"));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (backend, engine) = indexed_graph(EngineConfig::default()).await;
    let target = entity("A", "Intrusion-Set", "APT-A");

    engine.delete_elements(&[target.clone()]).await.unwrap();
    let bulk_calls = backend.bulk_calls();

    let report = engine.delete_elements(&[target]).await.unwrap();
    assert_eq!(report.deleted, 0);
    assert!(report.dependencies.is_empty());
    assert_eq!(backend.bulk_calls(), bulk_calls);
}

#[tokio::test]
async fn discovery_groups_respect_term_limits() {
    let config = EngineConfig {
        max_terms: 1,
        cascade_concurrency: 2,
        ..Default::default()
    };
    let (backend, engine) = indexed_graph(config).await;

    let report = engine
        .delete_elements(&[entity("A", "Intrusion-Set", "APT-A"), entity("C", "Campaign", "Camp")])
        .await
        .unwrap();
    assert_eq!(report.deleted, 5);
    assert_eq!(report.cleaned, 2, "B and D survive");
    assert_eq!(backend.len(), 2);
}

#[tokio::test]
async fn deleting_a_relationship_cleans_its_endpoints() {
    let (backend, engine) = indexed_graph(EngineConfig::default()).await;
    let r2 = graph().remove(5);

    let report = engine.delete_elements(&[r2]).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(report.dependencies.is_empty());
    assert_eq!(report.cleaned, 2);

    let a = backend.source("A").unwrap();
    assert!(!a.contains_key("rel_targets.internal_id"));
    assert_eq!(ids(a.get("rel_uses.internal_id")), vec!["B"]);
}

#[tokio::test]
async fn ref_relationships_are_not_reported_as_dependencies() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(backend.clone());
    let a = entity("A", "Report", "Report A");
    let red = marking("M", "TLP", "TLP:RED");
    let rm = relationship("RM", "object-marking", &a, &red);
    engine
        .index_elements(&[a.clone(), red, rm])
        .await
        .unwrap();

    let report = engine.delete_elements(&[a]).await.unwrap();
    assert_eq!(report.deleted, 2);
    assert!(report.dependencies.is_empty());
    assert_eq!(report.cleaned, 0, "markings keep no back-references");
    assert!(backend.contains("M"));
}

#[tokio::test]
async fn relationship_without_parent_types_still_cleans_endpoints() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(backend.clone());
    let a = entity("A", "Intrusion-Set", "APT-A");
    let b = entity("B", "Malware", "Bad");
    let mut bare = relationship("R1", "uses", &a, &b);
    bare.parent_types.clear();
    engine.index_elements(&[a, b, bare.clone()]).await.unwrap();
    assert_eq!(
        ids(backend.source("A").unwrap().get("rel_uses.internal_id")),
        vec!["B"]
    );

    let report = engine.delete_elements(&[bare]).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.cleaned, 2, "endpoints come from the converted from/to fields");
    assert!(!backend.source("A").unwrap().contains_key("rel_uses.internal_id"));
    assert!(!backend.source("B").unwrap().contains_key("rel_uses.internal_id"));
}
