//! Full-text search clause.
//!
//! The search string is split into `"quoted phrases"` and free words. Every
//! token must match, either on one of the boosted attributes of the document
//! or on the name of one of its relationship connections.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use super::dsl::{any_of, should};
use super::filters::wildcard_query;

/// Attributes searched, with their relevance boost.
pub const SEARCH_FIELDS: &[&str] = &[
    "name^5",
    "aliases^5",
    "x_opencti_aliases^5",
    "x_mitre_id^5",
    "external_id^5",
    "value^5",
    "standard_id^3",
    "x_opencti_stix_ids^3",
    "description^2",
    "x_opencti_description^2",
    "x_opencti_additional_names",
    "pattern",
    "url",
    "hashes.MD5",
    "hashes.SHA-1",
    "hashes.SHA-256",
    "attribute_abstract",
    "content",
    "source_name",
];

/// Connection attributes searched inside relationships.
pub const CONNECTION_SEARCH_FIELDS: &[&str] = &["connections.name^5", "connections.types"];

static PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r#""([^"]+)""#).unwrap()
});

/// One search token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchToken {
    Phrase(String),
    Word(String),
}

/// Split a search string into quoted phrases and free words.
pub fn tokenize(search: &str) -> Vec<SearchToken> {
    let mut tokens: Vec<SearchToken> = PHRASE
        .captures_iter(search)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|p| !p.is_empty())
        .map(SearchToken::Phrase)
        .collect();

    let remainder = PHRASE.replace_all(search, " ");
    tokens.extend(
        remainder
            .split_whitespace()
            .map(|w| w.trim_matches('"'))
            .filter(|w| !w.is_empty())
            .map(|w| SearchToken::Word(w.to_string())),
    );
    tokens
}

fn connections_clause(query: Value) -> Value {
    json!({ "nested": { "path": "connections", "query": query } })
}

fn token_clause(token: &SearchToken) -> Value {
    match token {
        SearchToken::Phrase(phrase) => {
            let on = |fields: &[&str]| {
                json!({
                    "multi_match": {
                        "type": "phrase",
                        "query": phrase,
                        "fields": fields,
                        "lenient": true
                    }
                })
            };
            any_of(vec![
                on(SEARCH_FIELDS),
                connections_clause(on(CONNECTION_SEARCH_FIELDS)),
            ])
        }
        SearchToken::Word(word) => {
            let query = format!("*{}*", wildcard_query(&Value::String(word.clone())));
            let on = |fields: &[&str]| {
                json!({
                    "query_string": {
                        "query": query,
                        "fields": fields,
                        "analyze_wildcard": true,
                        "lenient": true
                    }
                })
            };
            any_of(vec![
                on(SEARCH_FIELDS),
                connections_clause(on(CONNECTION_SEARCH_FIELDS)),
            ])
        }
    }
}

/// Clause requiring every token of `search`. Blank searches yield `None`.
pub fn build_search_clause(search: &str) -> Option<Value> {
    let clauses: Vec<Value> = tokenize(search).iter().map(token_clause).collect();
    if clauses.is_empty() {
        return None;
    }
    let minimum = clauses.len();
    Some(should(clauses, minimum))
}
