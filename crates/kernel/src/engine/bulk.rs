//! Bulk mutation coordinator.
//!
//! All writes go through [`Engine::bulk`], which splits operations into
//! batches and fails the whole call when any item fails. Indexing
//! relationships also appends the opposite endpoint id to each impacted
//! endpoint's `rel_<type>.internal_id` list.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use super::Engine;
use super::patch::PatchExpression;
use super::types::PaginateOptions;
use crate::backend::BulkOperation;
use crate::error::{EngineError, EngineResult};
use crate::models::{AccessContext, Document, Side, rel_field};
use crate::schema::SchemaRegistry;

/// Roles whose endpoint never receives a denormalized reference.
///
/// Markings, labels, authors and similar targets are shared by a huge number
/// of documents and are never filtered through their back-references.
pub const UNIMPACTED_ROLES: &[&str] = &[
    "created-by_to",
    "object-marking_to",
    "object-label_to",
    "kill-chain-phase_to",
    "object-assignee_to",
    "object-participant_to",
    "external-reference_to",
    "granted_to",
    "indicates_to",
];

/// Whether the endpoint holding `role` keeps a denormalized reference.
pub fn is_impacted_role(role: &str) -> bool {
    !UNIMPACTED_ROLES.contains(&role)
}

/// Append patches implied by indexing `documents`, keyed by endpoint id.
///
/// Fails on the first relationship missing a connection, before anything
/// is written.
pub fn relationship_impacts(
    documents: &[Document],
    schema: &dyn SchemaRegistry,
    now: &str,
) -> EngineResult<BTreeMap<String, PatchExpression>> {
    let mut patches: BTreeMap<String, PatchExpression> = BTreeMap::new();

    for doc in documents.iter().filter(|d| d.is_relationship()) {
        let ends = doc.relationship_ends()?;
        let field = rel_field(doc.relationship_type());

        for side in [Side::From, Side::To] {
            let endpoint = ends.at(side);
            if !is_impacted_role(&endpoint.role) {
                continue;
            }
            let mut patch = PatchExpression::append_refs(
                field.clone(),
                vec![ends.opposite(side).internal_id.clone()],
            );
            if side == Side::From {
                for attribute in schema.timestamp_attributes(endpoint.entity_type()) {
                    patch = patch.touching(attribute, json!(now));
                }
            }
            match patches.get_mut(&endpoint.internal_id) {
                Some(existing) => {
                    if let Some(rest) = existing.merge(patch) {
                        warn!(id = %endpoint.internal_id, ?rest, "unmergeable patch dropped");
                    }
                }
                None => {
                    patches.insert(endpoint.internal_id.clone(), patch);
                }
            }
        }
    }

    Ok(patches)
}

impl Engine {
    /// Send operations in batches. Any failed item fails the call.
    ///
    /// Returns the number of operations applied.
    pub async fn bulk(&self, operations: Vec<BulkOperation>) -> EngineResult<usize> {
        let batch_size = self.config().bulk_batch_size.max(1);
        let mut applied = 0;

        for batch in operations.chunks(batch_size) {
            let response = self.backend().bulk(batch).await?;
            let failures = response.failures();
            if !failures.is_empty() {
                let details: Vec<String> = failures
                    .iter()
                    .map(|item| {
                        format!(
                            "{} {}/{}: {}",
                            item.action,
                            item.index,
                            item.id,
                            item.error.as_deref().unwrap_or_default()
                        )
                    })
                    .collect();
                error!(
                    failed = failures.len(),
                    total = batch.len(),
                    "bulk call failed"
                );
                return Err(EngineError::database(
                    format!(
                        "bulk call failed for {} of {} operations",
                        failures.len(),
                        batch.len()
                    ),
                    json!({ "path": "_bulk", "failures": details }),
                    anyhow!(details.join("; ")),
                ));
            }
            applied += batch.len();
        }

        debug!(applied, "bulk applied");
        Ok(applied)
    }

    /// Write one document.
    pub async fn index(&self, doc: &Document) -> EngineResult<()> {
        self.bulk(vec![index_operation(doc)?]).await.map(|_| ())
    }

    /// Apply a patch to one document.
    pub async fn update(&self, index: &str, id: &str, patch: PatchExpression) -> EngineResult<()> {
        let retry = self.config().retry_on_conflict;
        self.bulk(vec![BulkOperation::update(index, id, patch, retry)])
            .await
            .map(|_| ())
    }

    /// Remove one document. Removing an absent document is not an error.
    pub async fn delete(&self, index: &str, id: &str) -> EngineResult<()> {
        self.bulk(vec![BulkOperation::delete(index, id)])
            .await
            .map(|_| ())
    }

    /// Replace the given attributes of a stored document; `null` removes one.
    pub async fn update_element(&self, doc: &Document) -> EngineResult<()> {
        if doc.index_name.is_empty() {
            return Err(EngineError::Functional(format!(
                "cannot update {}: no index",
                doc.internal_id
            )));
        }
        let patch = PatchExpression::set_fields(doc.attributes.clone());
        self.update(&doc.index_name, &doc.internal_id, patch).await
    }

    /// Index documents, then update the denormalized refs of every endpoint
    /// impacted by the relationships among them.
    pub async fn index_elements(&self, documents: &[Document]) -> EngineResult<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let impacts = relationship_impacts(documents, self.schema(), &now)?;
        let operations = documents
            .iter()
            .map(index_operation)
            .collect::<EngineResult<Vec<_>>>()?;
        self.bulk(operations).await?;

        if !impacts.is_empty() {
            let targets: Vec<String> = impacts.keys().cloned().collect();
            let indices = self.resolve_indices(&targets, documents).await?;
            let updates = self.patch_operations(impacts, &indices);
            debug!(endpoints = updates.len(), "denormalized refs appended");
            self.bulk(updates).await?;
        }

        Ok(documents.len())
    }

    /// Index name of every id, from `known` first and a lookup otherwise.
    pub(crate) async fn resolve_indices(
        &self,
        ids: &[String],
        known: &[Document],
    ) -> EngineResult<HashMap<String, String>> {
        let wanted: HashSet<&String> = ids.iter().collect();
        let mut indices: HashMap<String, String> = known
            .iter()
            .filter(|d| wanted.contains(&d.internal_id) && !d.index_name.is_empty())
            .map(|d| (d.internal_id.clone(), d.index_name.clone()))
            .collect();

        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !indices.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self
                .find_by_ids(&missing, &AccessContext::system(), &PaginateOptions::default())
                .await?;
            for doc in found {
                indices.insert(doc.internal_id, doc.index_name);
            }
        }

        Ok(indices)
    }

    /// Update operations for patches whose target could be located.
    pub(crate) fn patch_operations(
        &self,
        patches: BTreeMap<String, PatchExpression>,
        indices: &HashMap<String, String>,
    ) -> Vec<BulkOperation> {
        let retry = self.config().retry_on_conflict;
        patches
            .into_iter()
            .filter_map(|(id, patch)| match indices.get(&id) {
                Some(index) => Some(BulkOperation::update(index.as_str(), id, patch, retry)),
                None => {
                    warn!(id = %id, "endpoint not found, denormalized update skipped");
                    None
                }
            })
            .collect()
    }
}

fn index_operation(doc: &Document) -> EngineResult<BulkOperation> {
    if doc.index_name.is_empty() {
        return Err(EngineError::Functional(format!(
            "cannot index {} ({}): no index",
            doc.internal_id, doc.entity_type
        )));
    }
    let source: Value = doc.to_source();
    Ok(BulkOperation::index(
        doc.index_name.as_str(),
        doc.internal_id.as_str(),
        source,
    ))
}
