//! Filter compiler.
//!
//! Recursively turns a [`FilterGroup`] into a backend `bool` clause. Every
//! level is expressed as a `should` list whose `minimum_should_match` encodes
//! the AND/OR mode, so groups compose uniformly.

use serde_json::{Value, json};

use super::dsl::{any_of, exists, keyword, missing, not, should, term};
use super::types::{Filter, FilterGroup, FilterMode, FilterOperator};
use crate::error::{EngineError, EngineResult};
use crate::models::rel_field;
use crate::schema::SchemaRegistry;

/// Filter key widened to `entity_type` and `parent_types`.
pub const TYPE_FILTER: &str = "entity_type";

/// Filter key widened to every id a document is known by.
pub const IDS_FILTER: &str = "ids";

/// Filter key resolved through author identities before compiling.
pub const SOURCE_RELIABILITY_FILTER: &str = "source_reliability";

/// Attribute holding an identity's reliability rating.
pub const RELIABILITY_ATTRIBUTE: &str = "x_opencti_reliability";

/// Literal value meaning "field present" whatever the operator.
pub const EXISTS_VALUE: &str = "EXISTS";

/// Placeholder id that matches nothing.
pub const INVALID_ID: &str = "<invalid id>";

const FILTER_ALIASES: &[(&str, &str)] = &[
    ("objectMarking", "object-marking"),
    ("objectLabel", "object-label"),
    ("createdBy", "created-by"),
    ("objectAssignee", "object-assignee"),
    ("killChainPhases", "kill-chain-phase"),
    ("objectOrganization", "granted"),
];

/// Target fields of one filter key.
fn widen_key(key: &str) -> Vec<String> {
    match key {
        TYPE_FILTER | "type" => vec!["entity_type".into(), "parent_types".into()],
        IDS_FILTER => vec![
            "internal_id".into(),
            "standard_id".into(),
            "x_opencti_stix_ids".into(),
        ],
        _ => match FILTER_ALIASES.iter().find(|(alias, _)| *alias == key) {
            Some((_, relationship_type)) => vec![rel_field(relationship_type)],
            None => vec![key.to_string()],
        },
    }
}

fn single_key(filter: &Filter) -> EngineResult<&str> {
    match filter.key.as_slice() {
        [key] => Ok(key.as_str()),
        keys => Err(EngineError::Unsupported(format!(
            "{:?} filter requires exactly one key, got {keys:?}",
            filter.operator
        ))),
    }
}

fn minimum_for(mode: FilterMode, clauses: usize) -> usize {
    match mode {
        FilterMode::And => clauses,
        FilterMode::Or => 1,
    }
}

/// One clause when alone, an OR of clauses otherwise.
fn one_of(mut clauses: Vec<Value>) -> Value {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        any_of(clauses)
    }
}

/// Escape query-string syntax, keeping `*` and `?` as wildcards.
pub fn wildcard_query(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if "+-=&|><!(){}[]^\"~:\\/ ".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Compiles filter trees against a schema.
pub struct FilterCompiler<'a> {
    schema: &'a dyn SchemaRegistry,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(schema: &'a dyn SchemaRegistry) -> Self {
        Self { schema }
    }

    /// Field compared for a key: raw for typed values, keyword for text.
    pub fn value_field(&self, key: &str) -> String {
        if key.starts_with('_') || self.schema.attribute_kind(key).is_raw() {
            key.to_string()
        } else {
            keyword(key)
        }
    }

    /// Compile a group. Empty groups yield `None`.
    pub fn compile_group(&self, group: &FilterGroup) -> EngineResult<Option<Value>> {
        let mut clauses = Vec::with_capacity(group.filters.len() + group.filter_groups.len());
        for filter in &group.filters {
            clauses.push(self.compile_filter(filter)?);
        }
        for inner in &group.filter_groups {
            if let Some(clause) = self.compile_group(inner)? {
                clauses.push(clause);
            }
        }
        if clauses.is_empty() {
            return Ok(None);
        }
        let minimum = minimum_for(group.mode, clauses.len());
        Ok(Some(should(clauses, minimum)))
    }

    /// Compile one filter.
    pub fn compile_filter(&self, filter: &Filter) -> EngineResult<Value> {
        if let Some(ref nested) = filter.nested {
            return self.compile_nested(filter, nested);
        }

        match filter.operator {
            FilterOperator::Nil | FilterOperator::NotNil => {
                let fields = widen_key(single_key(filter)?);
                let field = fields.first().map(String::as_str).unwrap_or_default();
                return Ok(if filter.operator == FilterOperator::Nil {
                    missing(field)
                } else {
                    exists(field)
                });
            }
            op if op.range_key().is_some() => {
                single_key(filter)?;
            }
            _ => {}
        }

        let keys: Vec<String> = filter.key.iter().flat_map(|k| widen_key(k)).collect();
        let mut clauses = Vec::with_capacity(filter.values.len());
        for value in &filter.values {
            if value.as_str() == Some(EXISTS_VALUE) {
                clauses.push(one_of(keys.iter().map(|k| exists(k)).collect()));
            } else {
                clauses.push(self.value_clause(filter.operator, &keys, value)?);
            }
        }

        if clauses.is_empty() {
            return Err(EngineError::Unsupported(format!(
                "invalid filter on {:?}: no values",
                filter.key
            )));
        }

        let minimum = minimum_for(filter.mode, clauses.len());
        Ok(should(clauses, minimum))
    }

    fn value_clause(
        &self,
        operator: FilterOperator,
        keys: &[String],
        value: &Value,
    ) -> EngineResult<Value> {
        let clause = match operator {
            FilterOperator::Eq => self.eq_clause(keys, value),
            FilterOperator::NotEq => not(self.eq_clause(keys, value)),
            FilterOperator::Match => json!({
                "multi_match": { "fields": keys, "query": value, "lenient": true }
            }),
            FilterOperator::Wildcard => {
                let fields: Vec<String> = keys.iter().map(|k| self.value_field(k)).collect();
                json!({
                    "query_string": {
                        "query": wildcard_query(value),
                        "fields": fields,
                        "analyze_wildcard": true
                    }
                })
            }
            FilterOperator::Script => {
                let source = value.as_str().ok_or_else(|| {
                    EngineError::Unsupported("script filter value must be a string".into())
                })?;
                json!({ "script": { "script": { "source": source, "lang": "painless" } } })
            }
            FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte => {
                let bound = operator.range_key().unwrap_or("gte");
                let field = keys.first().map(|k| self.value_field(k)).unwrap_or_default();
                json!({ "range": { field: { bound: value } } })
            }
            FilterOperator::Nil | FilterOperator::NotNil => {
                return Err(EngineError::Unsupported(
                    "existence operators take no values".into(),
                ));
            }
        };
        Ok(clause)
    }

    fn eq_clause(&self, keys: &[String], value: &Value) -> Value {
        one_of(
            keys.iter()
                .map(|k| term(&self.value_field(k), value.clone()))
                .collect(),
        )
    }

    fn compile_nested(&self, filter: &Filter, nested: &[Filter]) -> EngineResult<Value> {
        let path = single_key(filter)?;
        let mut must = Vec::new();
        let mut must_not = Vec::new();

        for inner in nested {
            let field = self.value_field(&format!("{path}.{}", single_key(inner)?));
            if inner.values.is_empty() {
                return Err(EngineError::Unsupported(format!(
                    "invalid nested filter on {path}: no values"
                )));
            }
            if inner.operator == FilterOperator::NotEq {
                must_not.extend(inner.values.iter().map(|v| term(&field, v.clone())));
                continue;
            }
            let clauses: Vec<Value> = inner
                .values
                .iter()
                .map(|value| match inner.operator {
                    FilterOperator::Eq => Ok(term(&field, value.clone())),
                    FilterOperator::Wildcard => Ok(json!({
                        "query_string": {
                            "query": wildcard_query(value),
                            "fields": [field],
                            "analyze_wildcard": true
                        }
                    })),
                    op => match op.range_key() {
                        Some(bound) => Ok(json!({ "range": { field.as_str(): { bound: value } } })),
                        None => Err(EngineError::Unsupported(format!(
                            "{op:?} is not supported inside nested filter on {path}"
                        ))),
                    },
                })
                .collect::<EngineResult<_>>()?;
            let minimum = minimum_for(filter.mode, clauses.len());
            must.push(should(clauses, minimum));
        }

        if must.is_empty() && must_not.is_empty() {
            return Err(EngineError::Unsupported(format!(
                "invalid nested filter on {path}: no inner filters"
            )));
        }

        Ok(json!({
            "nested": {
                "path": path,
                "query": { "bool": { "must": must, "must_not": must_not } }
            }
        }))
    }
}

/// Reliability filters of a group, in walk order.
pub fn reliability_filters(group: &FilterGroup) -> Vec<Filter> {
    let mut found: Vec<Filter> = group
        .filters
        .iter()
        .filter(|f| f.key.iter().any(|k| k == SOURCE_RELIABILITY_FILTER))
        .cloned()
        .collect();
    for inner in &group.filter_groups {
        found.extend(reliability_filters(inner));
    }
    found
}

/// Lookup selecting the author identities a reliability filter refers to.
pub fn reliability_lookup(filter: &Filter) -> FilterGroup {
    let operator = match filter.operator {
        FilterOperator::NotEq => FilterOperator::Eq,
        other => other,
    };
    let mut lookup = Filter::with_operator(RELIABILITY_ATTRIBUTE, operator, filter.values.clone());
    lookup.mode = filter.mode;
    FilterGroup::and(vec![lookup])
}

/// Replace reliability filters, in walk order, with author-id filters.
pub fn substitute_reliability<I>(group: &FilterGroup, resolved: &mut I) -> FilterGroup
where
    I: Iterator<Item = Vec<String>>,
{
    let filters = group
        .filters
        .iter()
        .map(|filter| {
            if !filter.key.iter().any(|k| k == SOURCE_RELIABILITY_FILTER) {
                return filter.clone();
            }
            let mut author_ids = resolved.next().unwrap_or_default();
            if author_ids.is_empty() {
                author_ids.push(INVALID_ID.to_string());
            }
            let operator = match filter.operator {
                FilterOperator::NotEq => FilterOperator::NotEq,
                _ => FilterOperator::Eq,
            };
            let values = author_ids.into_iter().map(Value::String).collect();
            let mut rewritten = Filter::with_operator(rel_field("created-by"), operator, values);
            if operator == FilterOperator::NotEq {
                rewritten.mode = FilterMode::And;
            }
            rewritten
        })
        .collect();
    let filter_groups = group
        .filter_groups
        .iter()
        .map(|inner| substitute_reliability(inner, &mut *resolved))
        .collect();
    FilterGroup {
        mode: group.mode,
        filters,
        filter_groups,
    }
}
