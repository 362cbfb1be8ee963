//! Cascade delete.
//!
//! Deleting documents also deletes every relationship that depends on them,
//! transitively (relationships can point at relationships). Discovery runs as
//! a worklist over depths with a visited set; each depth fans out groups of
//! ids with bounded concurrency. After the closure is deleted, surviving
//! endpoints get the removed ids stripped from their denormalized refs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::Engine;
use super::bulk::is_impacted_role;
use super::converter::endpoints;
use super::dsl::strings;
use super::patch::PatchExpression;
use super::types::{Filter, FilterGroup, PaginateOptions};
use crate::backend::BulkOperation;
use crate::error::{EngineError, EngineResult};
use crate::models::{AccessContext, Document, rel_field};

/// Outcome of a cascade delete.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeReport {
    /// Documents removed, targets and dependent relationships.
    pub deleted: usize,

    /// Removed relationships that are not ref relationships.
    pub dependencies: Vec<Document>,

    /// Surviving endpoints whose denormalized refs were cleaned.
    pub cleaned: usize,

    /// Cleanup errors. The deletion itself already happened.
    pub cleanup_failures: Vec<String>,
}

/// Remove patches for the surviving endpoints of deleted relationships.
///
/// Relationships whose connections cannot be read are reported instead.
pub fn cleanup_patches(
    relationships: &[&Document],
    deleting: &HashSet<String>,
) -> (BTreeMap<String, PatchExpression>, Vec<String>) {
    let mut patches: BTreeMap<String, PatchExpression> = BTreeMap::new();
    let mut failures = Vec::new();

    for relationship in relationships {
        let (from, to) = match endpoints(relationship) {
            Ok(ends) => ends,
            Err(e) => {
                failures.push(format!("{}: {e}", relationship.internal_id));
                continue;
            }
        };
        let field = rel_field(relationship.relationship_type());

        for (survivor, removed) in [(&from, &to), (&to, &from)] {
            if deleting.contains(&survivor.id) || !is_impacted_role(&survivor.role) {
                continue;
            }
            let patch = PatchExpression::remove_refs(field.clone(), vec![removed.id.clone()]);
            match patches.get_mut(&survivor.id) {
                Some(existing) => {
                    existing.merge(patch);
                }
                None => {
                    patches.insert(survivor.id.clone(), patch);
                }
            }
        }
    }

    (patches, failures)
}

impl Engine {
    /// Relationships whose connections reference any of `ids`.
    async fn connected_relationships(&self, ids: Vec<String>) -> EngineResult<Vec<Document>> {
        let filter = Filter::nested(
            "connections",
            vec![Filter::eq("internal_id", strings(&ids))],
        );
        self.list_all(
            Some(&FilterGroup::and(vec![filter])),
            &AccessContext::system(),
            &PaginateOptions::default(),
        )
        .await
    }

    /// Every relationship transitively depending on `ids`.
    pub async fn discover_dependencies(&self, ids: &[String]) -> EngineResult<Vec<Document>> {
        let group_size = self.config().max_terms.max(1);
        let semaphore = Arc::new(Semaphore::new(self.config().cascade_concurrency.max(1)));
        let mut visited: HashSet<String> = ids.iter().cloned().collect();
        let mut frontier: Vec<String> = ids.to_vec();
        let mut discovered = Vec::new();
        let mut depth = 0;

        while !frontier.is_empty() {
            let mut tasks = JoinSet::new();
            for group in frontier.chunks(group_size) {
                let engine = self.clone();
                let semaphore = semaphore.clone();
                let group = group.to_vec();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|e| {
                        EngineError::Configuration(format!("cascade semaphore closed: {e}"))
                    })?;
                    engine.connected_relationships(group).await
                });
            }

            let mut next = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let found = joined.map_err(|e| {
                    EngineError::database("cascade discovery task failed", json!({ "depth": depth }), e)
                })??;
                for relationship in found {
                    if visited.insert(relationship.internal_id.clone()) {
                        next.push(relationship.internal_id.clone());
                        discovered.push(relationship);
                    }
                }
            }

            debug!(depth, found = next.len(), "cascade discovery level");
            frontier = next;
            depth += 1;
        }

        Ok(discovered)
    }

    /// Delete documents and every relationship depending on them, then clean
    /// the denormalized refs of the surviving endpoints.
    pub async fn delete_elements(&self, documents: &[Document]) -> EngineResult<CascadeReport> {
        let ids: Vec<String> = documents.iter().map(|d| d.internal_id.clone()).collect();
        if ids.is_empty() {
            return Ok(CascadeReport::default());
        }

        let system = AccessContext::system();
        let wanted: HashSet<&String> = ids.iter().collect();
        let targets: Vec<Document> = self
            .find_by_ids(&ids, &system, &PaginateOptions::default())
            .await?
            .into_iter()
            .filter(|d| wanted.contains(&d.internal_id))
            .collect();
        if targets.is_empty() {
            debug!(requested = ids.len(), "nothing left to delete");
            return Ok(CascadeReport::default());
        }

        let target_ids: Vec<String> = targets.iter().map(|d| d.internal_id.clone()).collect();
        let relationships = self.discover_dependencies(&target_ids).await?;

        let deleting: HashSet<String> = targets
            .iter()
            .chain(relationships.iter())
            .map(|d| d.internal_id.clone())
            .collect();
        let operations = targets
            .iter()
            .chain(relationships.iter())
            .map(|d| BulkOperation::delete(d.index_name.as_str(), d.internal_id.as_str()))
            .collect();
        let deleted = self.bulk(operations).await?;

        let removed: Vec<&Document> = targets
            .iter()
            .filter(|d| d.is_relationship() || endpoints(d).is_ok())
            .chain(relationships.iter())
            .collect();
        let (patches, mut cleanup_failures) = cleanup_patches(&removed, &deleting);

        let mut cleaned = 0;
        if !patches.is_empty() {
            let survivors: Vec<String> = patches.keys().cloned().collect();
            match self.resolve_indices(&survivors, &[]).await {
                Ok(indices) => {
                    let updates = self.patch_operations(patches, &indices);
                    let count = updates.len();
                    match self.bulk(updates).await {
                        Ok(_) => cleaned = count,
                        Err(e) => cleanup_failures.push(e.to_string()),
                    }
                }
                Err(e) => cleanup_failures.push(e.to_string()),
            }
        }
        if !cleanup_failures.is_empty() {
            error!(failures = ?cleanup_failures, "denormalized ref cleanup failed");
        }

        let schema = self.schema();
        let dependencies: Vec<Document> = relationships
            .into_iter()
            .filter(|r| !schema.is_ref_relationship(r.relationship_type()))
            .collect();

        info!(
            targets = targets.len(),
            deleted,
            dependencies = dependencies.len(),
            cleaned,
            "cascade delete complete"
        );

        Ok(CascadeReport {
            deleted,
            dependencies,
            cleaned,
            cleanup_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Connection;
    use crate::models::document::BASIC_RELATIONSHIP;

    fn relationship(id: &str, kind: &str, from: &str, to: &str) -> Document {
        let mut doc = Document::new(id, kind, "kestrel_stix_core_relationships");
        doc.parent_types = vec![BASIC_RELATIONSHIP.into()];
        doc.connections = Some(vec![
            Connection {
                internal_id: from.into(),
                name: String::new(),
                types: vec!["Malware".into()],
                role: format!("{kind}_from"),
            },
            Connection {
                internal_id: to.into(),
                name: String::new(),
                types: vec!["Tool".into()],
                role: format!("{kind}_to"),
            },
        ]);
        doc
    }

    fn deleting(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn survivors_lose_removed_ids() {
        let r1 = relationship("r1", "uses", "A", "B");
        let r2 = relationship("r2", "uses", "C", "A");
        let (patches, failures) = cleanup_patches(&[&r1, &r2], &deleting(&["A", "r1", "r2"]));
        assert!(failures.is_empty());
        assert_eq!(patches.len(), 2);
        assert_eq!(
            patches["B"],
            PatchExpression::remove_refs("rel_uses.internal_id", vec!["A".into()])
        );
        assert_eq!(
            patches["C"],
            PatchExpression::remove_refs("rel_uses.internal_id", vec!["A".into()])
        );
    }

    #[test]
    fn unimpacted_survivors_are_left_alone() {
        let marking = relationship("r1", "object-marking", "A", "M");
        let (patches, _) = cleanup_patches(&[&marking], &deleting(&["A", "r1"]));
        assert!(patches.is_empty());
    }

    #[test]
    fn deleted_relationship_cleans_both_sides() {
        let r1 = relationship("r1", "uses", "A", "B");
        let (patches, _) = cleanup_patches(&[&r1], &deleting(&["r1"]));
        assert_eq!(
            patches["A"],
            PatchExpression::remove_refs("rel_uses.internal_id", vec!["B".into()])
        );
        assert_eq!(
            patches["B"],
            PatchExpression::remove_refs("rel_uses.internal_id", vec!["A".into()])
        );
    }

    #[test]
    fn unreadable_relationship_is_reported() {
        let mut broken = relationship("r1", "uses", "A", "B");
        broken.connections = Some(vec![]);
        let (patches, failures) = cleanup_patches(&[&broken], &deleting(&["A"]));
        assert!(patches.is_empty());
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("r1:"));
    }
}
