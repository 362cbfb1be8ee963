//! Scripted partial updates.
//!
//! A [`PatchExpression`] describes a partial update independently of the
//! backend. HTTP drivers render it to a painless script with params; the
//! in-process target applies it directly to a stored source.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

const APPEND_REFS_SCRIPT: &str = "for (entry in params.refs.entrySet()) { \
def key = entry.getKey(); \
if (ctx._source[key] == null) { ctx._source[key] = new ArrayList(); } \
else if (!(ctx._source[key] instanceof List)) { def current = ctx._source[key]; ctx._source[key] = new ArrayList(); ctx._source[key].add(current); } \
for (id in entry.getValue()) { if (!ctx._source[key].contains(id)) { ctx._source[key].add(id); } } \
} \
for (entry in params.touch.entrySet()) { ctx._source[entry.getKey()] = entry.getValue(); }";

const REMOVE_REFS_SCRIPT: &str = "for (entry in params.refs.entrySet()) { \
def key = entry.getKey(); \
if (ctx._source[key] != null) { \
if (ctx._source[key] instanceof List) { ctx._source[key].removeAll(entry.getValue()); if (ctx._source[key].isEmpty()) { ctx._source.remove(key); } } \
else if (entry.getValue().contains(ctx._source[key])) { ctx._source.remove(key); } \
} \
}";

const SET_FIELDS_SCRIPT: &str = "for (entry in params.fields.entrySet()) { \
if (entry.getValue() == null) { ctx._source.remove(entry.getKey()); } \
else { ctx._source[entry.getKey()] = entry.getValue(); } \
}";

/// Backend-agnostic partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchExpression {
    /// Append ids to list fields when absent, then overwrite `touch` fields.
    AppendRefs {
        refs: BTreeMap<String, Vec<String>>,
        touch: Map<String, Value>,
    },
    /// Remove ids from list fields, dropping fields that become empty.
    RemoveRefs { refs: BTreeMap<String, Vec<String>> },
    /// Overwrite fields; `null` removes the field.
    SetFields { fields: Map<String, Value> },
}

impl PatchExpression {
    /// Append `ids` to `field`.
    pub fn append_refs(field: impl Into<String>, ids: Vec<String>) -> Self {
        let mut refs = BTreeMap::new();
        refs.insert(field.into(), ids);
        PatchExpression::AppendRefs {
            refs,
            touch: Map::new(),
        }
    }

    /// Remove `ids` from `field`.
    pub fn remove_refs(field: impl Into<String>, ids: Vec<String>) -> Self {
        let mut refs = BTreeMap::new();
        refs.insert(field.into(), ids);
        PatchExpression::RemoveRefs { refs }
    }

    /// Overwrite `fields`.
    pub fn set_fields(fields: Map<String, Value>) -> Self {
        PatchExpression::SetFields { fields }
    }

    /// Also overwrite `field` with `value` after appending.
    ///
    /// No-op on other variants.
    pub fn touching(mut self, field: impl Into<String>, value: Value) -> Self {
        if let PatchExpression::AppendRefs { ref mut touch, .. } = self {
            touch.insert(field.into(), value);
        }
        self
    }

    /// Fold another patch of the same kind into this one.
    ///
    /// Returns the other patch untouched when kinds differ.
    pub fn merge(&mut self, other: PatchExpression) -> Option<PatchExpression> {
        match (self, other) {
            (
                PatchExpression::AppendRefs { refs, touch },
                PatchExpression::AppendRefs {
                    refs: other_refs,
                    touch: other_touch,
                },
            ) => {
                merge_refs(refs, other_refs);
                touch.extend(other_touch);
                None
            }
            (
                PatchExpression::RemoveRefs { refs },
                PatchExpression::RemoveRefs { refs: other_refs },
            ) => {
                merge_refs(refs, other_refs);
                None
            }
            (
                PatchExpression::SetFields { fields },
                PatchExpression::SetFields {
                    fields: other_fields,
                },
            ) => {
                fields.extend(other_fields);
                None
            }
            (_, other) => Some(other),
        }
    }

    /// Render as a painless script body.
    pub fn to_script(&self) -> Value {
        let (source, params) = match self {
            PatchExpression::AppendRefs { refs, touch } => (
                APPEND_REFS_SCRIPT,
                json!({ "refs": refs, "touch": touch }),
            ),
            PatchExpression::RemoveRefs { refs } => (REMOVE_REFS_SCRIPT, json!({ "refs": refs })),
            PatchExpression::SetFields { fields } => {
                (SET_FIELDS_SCRIPT, json!({ "fields": fields }))
            }
        };
        json!({ "source": source, "lang": "painless", "params": params })
    }

    /// Apply the patch to a stored source in process.
    pub fn apply(&self, source: &mut Map<String, Value>) {
        match self {
            PatchExpression::AppendRefs { refs, touch } => {
                for (field, ids) in refs {
                    let entry = source
                        .entry(field.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if !entry.is_array() {
                        let current = entry.take();
                        *entry = Value::Array(vec![current]);
                    }
                    if let Value::Array(list) = entry {
                        for id in ids {
                            let id = Value::String(id.clone());
                            if !list.contains(&id) {
                                list.push(id);
                            }
                        }
                    }
                }
                for (field, value) in touch {
                    source.insert(field.clone(), value.clone());
                }
            }
            PatchExpression::RemoveRefs { refs } => {
                for (field, ids) in refs {
                    let remove = match source.get_mut(field) {
                        Some(Value::Array(list)) => {
                            list.retain(|v| {
                                !v.as_str().is_some_and(|s| ids.iter().any(|i| i.as_str() == s))
                            });
                            list.is_empty()
                        }
                        Some(Value::String(s)) => ids.iter().any(|i| i.as_str() == s.as_str()),
                        _ => false,
                    };
                    if remove {
                        source.remove(field);
                    }
                }
            }
            PatchExpression::SetFields { fields } => {
                for (field, value) in fields {
                    if value.is_null() {
                        source.remove(field);
                    } else {
                        source.insert(field.clone(), value.clone());
                    }
                }
            }
        }
    }
}

fn merge_refs(target: &mut BTreeMap<String, Vec<String>>, other: BTreeMap<String, Vec<String>>) {
    for (field, ids) in other {
        let existing = target.entry(field).or_default();
        for id in ids {
            if !existing.contains(&id) {
                existing.push(id);
            }
        }
    }
}
