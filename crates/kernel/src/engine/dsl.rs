//! Small helpers for building query DSL clauses.

use serde_json::{Value, json};

/// Keyword sub-field of a text attribute.
pub fn keyword(field: &str) -> String {
    format!("{field}.keyword")
}

pub fn term(field: &str, value: Value) -> Value {
    json!({ "term": { field: value } })
}

pub fn terms(field: &str, values: Vec<Value>) -> Value {
    json!({ "terms": { field: values } })
}

pub fn exists(field: &str) -> Value {
    json!({ "exists": { "field": field } })
}

/// Matches documents that do not have `field`.
pub fn missing(field: &str) -> Value {
    not(exists(field))
}

pub fn not(clause: Value) -> Value {
    json!({ "bool": { "must_not": [clause] } })
}

/// `should` list with a minimum match count.
pub fn should(clauses: Vec<Value>, minimum: usize) -> Value {
    json!({ "bool": { "should": clauses, "minimum_should_match": minimum } })
}

/// `should` list where any clause is enough.
pub fn any_of(clauses: Vec<Value>) -> Value {
    should(clauses, 1)
}

pub fn strings(values: &[String]) -> Vec<Value> {
    values.iter().cloned().map(Value::String).collect()
}

/// Top-level `bool` query.
pub fn bool_query(must: Vec<Value>, must_not: Vec<Value>) -> Value {
    json!({ "bool": { "must": must, "must_not": must_not } })
}
