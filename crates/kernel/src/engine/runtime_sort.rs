//! Runtime-computed sort fields.
//!
//! Some orderings sort on a label that is not stored on the document, such as
//! the creator's name or a marking's definition. Each entry names the stored
//! id field, the reference documents to pre-load, and the attribute used as
//! label. The backend computes the sort key with a painless script over a
//! `labels` map passed as params.

use serde_json::{Map, Value, json};

use super::dsl::keyword;

const LABEL_SCRIPT: &str = "def field = params.field; \
if (doc.containsKey(field) && doc[field].size() > 0) { \
def id = doc[field].value; \
emit(params.labels.containsKey(id) ? params.labels[id] : id); \
} else { emit(''); }";

/// One runtime sort entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSort {
    /// Order-by name callers use.
    pub name: &'static str,
    /// Stored field holding the referenced id.
    pub source_field: &'static str,
    /// Entity type of the reference documents.
    pub reference_type: &'static str,
    /// Reference attribute used as sort label.
    pub label_attribute: &'static str,
}

impl RuntimeSort {
    /// Name of the computed field in `runtime_mappings`.
    pub fn runtime_field(&self) -> String {
        format!("{}_sort", self.name)
    }

    /// Runtime mapping entry, given the pre-loaded id to label map.
    pub fn mapping(&self, labels: Map<String, Value>) -> Value {
        json!({
            "type": "keyword",
            "script": {
                "source": LABEL_SCRIPT,
                "params": {
                    "field": keyword(self.source_field),
                    "labels": labels
                }
            }
        })
    }
}

/// Registered runtime sorts.
pub const RUNTIME_SORTS: &[RuntimeSort] = &[
    RuntimeSort {
        name: "creator",
        source_field: "creator_id",
        reference_type: "User",
        label_attribute: "name",
    },
    RuntimeSort {
        name: "objectAssignee",
        source_field: "rel_object-assignee.internal_id",
        reference_type: "User",
        label_attribute: "name",
    },
    RuntimeSort {
        name: "objectMarking",
        source_field: "rel_object-marking.internal_id",
        reference_type: "Marking-Definition",
        label_attribute: "definition",
    },
];

/// Registry entry for an order-by name.
pub fn runtime_sort(name: &str) -> Option<&'static RuntimeSort> {
    RUNTIME_SORTS.iter().find(|s| s.name == name)
}
