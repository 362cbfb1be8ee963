//! In-process search backend.
//!
//! [`MemoryBackend`] stores sources per index and evaluates the subset of the
//! query DSL the engine emits: `bool`, `term`, `terms`, `exists`, `range`,
//! `multi_match`, `query_string`, `nested` and `match_all`. Scripts never
//! match. Sorting, `search_after` and the `terms` / `date_histogram`
//! aggregations are supported, which is enough to drive paging, cascades and
//! access control end to end.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use kestrel_kernel::backend::{
    BulkAction, BulkItemResult, BulkOperation, BulkResponse, CountRequest, SearchBackend,
    SearchHit, SearchRequest, SearchResponse, ShardFailure, ShardStats,
};
use kestrel_kernel::error::{EngineError, EngineResult, INDEX_NOT_FOUND};
use kestrel_kernel::models::Document;

static NULL: Value = Value::Null;

type Store = BTreeMap<String, BTreeMap<String, Map<String, Value>>>;

/// Search backend keeping every document in memory.
#[derive(Default)]
pub struct MemoryBackend {
    indices: Mutex<Store>,
    runtime_mappings: bool,
    shard_failures: Mutex<Vec<ShardFailure>>,
    last_search: Mutex<Option<SearchRequest>>,
    search_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
    bulk_operations: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim runtime-mapping support. Runtime fields still evaluate as missing.
    pub fn with_runtime_mappings(mut self) -> Self {
        self.runtime_mappings = true;
        self
    }

    /// Report these shard failures with every search response.
    pub fn fail_shards(&self, failures: Vec<ShardFailure>) {
        *self.shard_failures.lock() = failures;
    }

    /// Store documents directly, without going through bulk.
    pub fn seed(&self, documents: &[Document]) {
        let mut indices = self.indices.lock();
        for doc in documents {
            if let Value::Object(source) = doc.to_source() {
                indices
                    .entry(doc.index_name.clone())
                    .or_default()
                    .insert(doc.internal_id.clone(), source);
            }
        }
    }

    /// Create an empty index.
    pub fn create_index(&self, index: &str) {
        self.indices.lock().entry(index.to_string()).or_default();
    }

    /// Stored source of a document, searched across all indices.
    pub fn source(&self, id: &str) -> Option<Map<String, Value>> {
        self.indices.lock()
            .values()
            .find_map(|docs| docs.get(id).cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.source(id).is_some()
    }

    /// Number of stored documents across all indices.
    pub fn len(&self) -> usize {
        self.indices.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(AtomicOrdering::SeqCst)
    }

    /// Operations received across all bulk calls.
    pub fn bulk_operations(&self) -> usize {
        self.bulk_operations.load(AtomicOrdering::SeqCst)
    }

    /// Most recent search request.
    pub fn last_search(&self) -> Option<SearchRequest> {
        self.last_search.lock().clone()
    }

    /// Sources matching `query` in `patterns`, with their index name.
    fn matching(
        &self,
        patterns: &[String],
        query: &Value,
        describe: impl FnOnce() -> Value,
    ) -> EngineResult<Vec<(String, String, Map<String, Value>)>> {
        let indices = self.indices.lock();

        if let Some(missing) = patterns
            .iter()
            .find(|p| !p.contains('*') && !indices.contains_key(p.as_str()))
        {
            return Err(EngineError::database(
                format!("no such index [{missing}]"),
                describe(),
                anyhow!("index_not_found_exception: {missing}"),
            )
            .with_kind(Some(INDEX_NOT_FOUND.to_string())));
        }

        let mut found = Vec::new();
        for (name, docs) in indices.iter() {
            if !patterns.iter().any(|p| index_matches(p, name)) {
                continue;
            }
            for (id, source) in docs {
                if matches(query, source) {
                    found.push((name.clone(), id.clone(), source.clone()));
                }
            }
        }
        Ok(found)
    }
}

fn index_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_runtime_mappings(&self) -> bool {
        self.runtime_mappings
    }

    async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse> {
        self.search_calls.fetch_add(1, AtomicOrdering::SeqCst);
        *self.last_search.lock() = Some(request.clone());

        let mut found = self.matching(&request.indices, &request.query, || request.describe())?;
        let total = found.len() as u64;

        let aggregations = request
            .aggregations
            .as_ref()
            .map(|aggs| aggregate(aggs, &found));

        let sort = sort_spec(&request.sort);
        let mut keyed: Vec<(Vec<Value>, (String, String, Map<String, Value>))> = found
            .drain(..)
            .map(|entry| (sort_key(&sort, &entry.2), entry))
            .collect();
        keyed.sort_by(|a, b| compare_keys(&sort, &a.0, &b.0));

        if let Some(ref after) = request.search_after {
            keyed.retain(|(key, _)| compare_keys(&sort, key, after) == Ordering::Greater);
        }

        let hits = keyed
            .into_iter()
            .take(request.size)
            .map(|(key, (index, id, source))| SearchHit {
                index,
                id,
                source: Value::Object(source),
                sort: (!sort.is_empty()).then_some(key),
            })
            .collect();

        let failures = self.shard_failures.lock().clone();
        Ok(SearchResponse {
            total,
            hits,
            shards: ShardStats {
                total: 1 + failures.len() as u64,
                failed: failures.len() as u64,
                failures,
            },
            aggregations,
        })
    }

    async fn count(&self, request: &CountRequest) -> EngineResult<u64> {
        let found = self.matching(&request.indices, &request.query, || request.describe())?;
        Ok(found.len() as u64)
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> EngineResult<BulkResponse> {
        self.bulk_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.bulk_operations
            .fetch_add(operations.len(), AtomicOrdering::SeqCst);

        let mut indices = self.indices.lock();
        let mut items = Vec::with_capacity(operations.len());
        for op in operations {
            let (status, error) = match &op.action {
                BulkAction::Index { document } => {
                    let source = match document {
                        Value::Object(map) => map.clone(),
                        _ => Map::new(),
                    };
                    let docs = indices.entry(op.index.clone()).or_default();
                    let status = if docs.insert(op.id.clone(), source).is_some() {
                        200
                    } else {
                        201
                    };
                    (status, None)
                }
                BulkAction::Update { patch, .. } => {
                    match indices.get_mut(&op.index).and_then(|d| d.get_mut(&op.id)) {
                        Some(source) => {
                            patch.apply(source);
                            (200, None)
                        }
                        None => (
                            404,
                            Some(format!(
                                "document_missing_exception: [{}]: document missing",
                                op.id
                            )),
                        ),
                    }
                }
                BulkAction::Delete => {
                    match indices.get_mut(&op.index).and_then(|d| d.remove(&op.id)) {
                        Some(_) => (200, None),
                        None => (404, None),
                    }
                }
            };
            items.push(BulkItemResult {
                action: op.action_name().to_string(),
                index: op.index.clone(),
                id: op.id.clone(),
                status,
                error,
            });
        }

        Ok(BulkResponse { items })
    }

    async fn ping(&self) -> bool {
        true
    }
}

// Field access

/// Every leaf value at `path`, descending through objects and arrays.
///
/// Stored keys may themselves contain dots (`rel_uses.internal_id`), so
/// every split point is tried.
fn field_values<'a>(source: &'a Map<String, Value>, path: &str) -> Vec<&'a Value> {
    let path = path.strip_suffix(".keyword").unwrap_or(path);
    let mut out = Vec::new();
    collect(source, path, &mut out);
    out
}

fn collect<'a>(source: &'a Map<String, Value>, path: &str, out: &mut Vec<&'a Value>) {
    if let Some(value) = source.get(path) {
        flatten(value, out);
    }
    for (i, _) in path.match_indices('.') {
        let (head, rest) = (&path[..i], &path[i + 1..]);
        if let Some(value) = source.get(head) {
            descend(value, rest, out);
        }
    }
}

fn descend<'a>(value: &'a Value, rest: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => collect(map, rest, out),
        Value::Array(items) => {
            for item in items {
                descend(item, rest, out);
            }
        }
        _ => {}
    }
}

fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten(item, out);
            }
        }
        Value::Null => {}
        other => out.push(other),
    }
}

fn strip_boost(field: &str) -> &str {
    field.split('^').next().unwrap_or(field)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// Query evaluation

fn matches(query: &Value, source: &Map<String, Value>) -> bool {
    let Some(object) = query.as_object() else {
        return true;
    };
    object.iter().all(|(kind, body)| match kind.as_str() {
        "bool" => matches_bool(body, source),
        "term" => single_field(body).is_some_and(|(field, value)| {
            let value = value.get("value").unwrap_or(value);
            field_values(source, field)
                .into_iter()
                .any(|v| values_equal(v, value))
        }),
        "terms" => single_field(body).is_some_and(|(field, wanted)| {
            let wanted = wanted.as_array().map(Vec::as_slice).unwrap_or_default();
            field_values(source, field)
                .into_iter()
                .any(|v| wanted.iter().any(|w| values_equal(v, w)))
        }),
        "exists" => body["field"]
            .as_str()
            .is_some_and(|field| !field_values(source, field).is_empty()),
        "range" => single_field(body).is_some_and(|(field, bounds)| {
            field_values(source, field)
                .into_iter()
                .any(|v| within(v, bounds))
        }),
        "multi_match" => matches_multi(body, source),
        "query_string" => matches_query_string(body, source),
        "nested" => matches_nested(body, source),
        "match_all" => true,
        _ => false,
    })
}

fn single_field(body: &Value) -> Option<(&str, &Value)> {
    body.as_object()?
        .iter()
        .find(|(k, _)| k.as_str() != "boost")
        .map(|(k, v)| (k.as_str(), v))
}

fn matches_bool(body: &Value, source: &Map<String, Value>) -> bool {
    let must = clauses(body, "must");
    let filter = clauses(body, "filter");
    let must_not = clauses(body, "must_not");
    let should = clauses(body, "should");

    if !must.iter().chain(filter.iter()).all(|q| matches(q, source)) {
        return false;
    }
    if must_not.iter().any(|q| matches(q, source)) {
        return false;
    }
    if should.is_empty() {
        return true;
    }

    let default_minimum = if must.is_empty() && filter.is_empty() {
        1
    } else {
        0
    };
    let minimum = body
        .get("minimum_should_match")
        .and_then(Value::as_u64)
        .map_or(default_minimum, |m| m as usize);
    should.iter().filter(|q| matches(q, source)).count() >= minimum
}

/// A bool occurrence given as a list or as a single clause.
fn clauses<'a>(body: &'a Value, key: &str) -> Vec<&'a Value> {
    match body.get(key) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(clause) if clause.is_object() => vec![clause],
        _ => Vec::new(),
    }
}

fn values_equal(stored: &Value, wanted: &Value) -> bool {
    match (stored, wanted) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => {
            b.parse::<f64>().ok() == a.as_f64()
        }
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b == &a.to_string()
        }
        _ => stored == wanted,
    }
}

fn within(value: &Value, bounds: &Value) -> bool {
    let Some(bounds) = bounds.as_object() else {
        return false;
    };
    bounds.iter().all(|(op, bound)| {
        let ordering = compare_values(value, bound);
        match op.as_str() {
            "gt" => ordering == Ordering::Greater,
            "gte" => ordering != Ordering::Less,
            "lt" => ordering == Ordering::Less,
            "lte" => ordering != Ordering::Greater,
            _ => true,
        }
    })
}

fn query_fields(body: &Value) -> Vec<&str> {
    body["fields"]
        .as_array()
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(strip_boost)
                .collect()
        })
        .unwrap_or_default()
}

fn texts(source: &Map<String, Value>, fields: &[&str]) -> Vec<String> {
    fields
        .iter()
        .flat_map(|f| field_values(source, f))
        .filter_map(as_text)
        .map(|t| t.to_lowercase())
        .collect()
}

fn matches_multi(body: &Value, source: &Map<String, Value>) -> bool {
    let Some(query) = as_text(&body["query"]) else {
        return false;
    };
    let query = query.to_lowercase();
    let values = texts(source, &query_fields(body));

    if body["type"].as_str() == Some("phrase") {
        return values.iter().any(|v| v.contains(&query));
    }
    let words: Vec<&str> = query.split_whitespace().collect();
    values.iter().any(|v| {
        v.split(|c: char| !c.is_alphanumeric())
            .any(|token| words.contains(&token))
    })
}

fn matches_query_string(body: &Value, source: &Map<String, Value>) -> bool {
    let Some(query) = body["query"].as_str() else {
        return false;
    };
    let pattern = glob_pattern(&query.to_lowercase());
    texts(source, &query_fields(body))
        .iter()
        .any(|v| glob_matches(&pattern, v))
}

#[derive(Debug, PartialEq)]
enum GlobToken {
    Literal(char),
    AnyChar,
    AnyRun,
}

/// Unescape a query-string value into glob tokens.
fn glob_pattern(query: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::new();
    let mut chars = query.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    tokens.push(GlobToken::Literal(escaped));
                }
            }
            '*' => tokens.push(GlobToken::AnyRun),
            '?' => tokens.push(GlobToken::AnyChar),
            other => tokens.push(GlobToken::Literal(other)),
        }
    }
    tokens
}

fn glob_matches(pattern: &[GlobToken], text: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    // matched[j]: pattern prefix matches text prefix of length j
    let mut matched = vec![false; text.len() + 1];
    matched[0] = true;
    for token in pattern {
        let mut next = vec![false; text.len() + 1];
        for j in 0..=text.len() {
            match token {
                GlobToken::AnyRun => {
                    next[j] = matched[j] || (j > 0 && next[j - 1]);
                }
                GlobToken::AnyChar => {
                    next[j] = j > 0 && matched[j - 1];
                }
                GlobToken::Literal(c) => {
                    next[j] = j > 0 && matched[j - 1] && text[j - 1] == *c;
                }
            }
        }
        matched = next;
    }
    matched[text.len()]
}

fn matches_nested(body: &Value, source: &Map<String, Value>) -> bool {
    let Some(path) = body["path"].as_str() else {
        return false;
    };
    let query = &body["query"];
    let elements: Vec<&Value> = match source.get(path) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value) if value.is_object() => vec![value],
        _ => Vec::new(),
    };
    elements.into_iter().any(|element| {
        let mut scoped = Map::new();
        scoped.insert(path.to_string(), element.clone());
        matches(query, &scoped)
    })
}

// Sorting

struct SortField {
    field: String,
    descending: bool,
}

fn sort_spec(sort: &[Value]) -> Vec<SortField> {
    sort.iter()
        .filter_map(Value::as_object)
        .filter_map(|entry| entry.iter().next())
        .map(|(field, spec)| SortField {
            field: field.clone(),
            descending: spec["order"].as_str() == Some("desc"),
        })
        .collect()
}

fn sort_key(sort: &[SortField], source: &Map<String, Value>) -> Vec<Value> {
    sort.iter()
        .map(|s| {
            let values = field_values(source, &s.field);
            let picked = if s.descending {
                values.into_iter().max_by(|a, b| compare_values(a, b))
            } else {
                values.into_iter().min_by(|a, b| compare_values(a, b))
            };
            picked.cloned().unwrap_or(Value::Null)
        })
        .collect()
}

/// Missing values sort last in both directions.
fn compare_keys(sort: &[SortField], a: &[Value], b: &[Value]) -> Ordering {
    for (i, s) in sort.iter().enumerate() {
        let (x, y) = (
            a.get(i).unwrap_or(&NULL),
            b.get(i).unwrap_or(&NULL),
        );
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if s.descending => compare_values(y, x),
            (false, false) => compare_values(x, y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => as_text(a).cmp(&as_text(b)),
    }
}

// Aggregations

fn aggregate(aggs: &Value, found: &[(String, String, Map<String, Value>)]) -> Value {
    let mut result = Map::new();
    let Some(aggs) = aggs.as_object() else {
        return Value::Object(result);
    };
    for (name, spec) in aggs {
        let buckets = if let Some(terms) = spec.get("terms") {
            terms_buckets(terms, found)
        } else if let Some(histogram) = spec.get("date_histogram") {
            histogram_buckets(histogram, found)
        } else {
            Vec::new()
        };
        result.insert(name.clone(), json!({ "buckets": buckets }));
    }
    Value::Object(result)
}

fn terms_buckets(spec: &Value, found: &[(String, String, Map<String, Value>)]) -> Vec<Value> {
    let field = spec["field"].as_str().unwrap_or_default();
    let size = spec["size"].as_u64().unwrap_or(10) as usize;

    let mut counts: BTreeMap<String, (Value, u64)> = BTreeMap::new();
    for (_, _, source) in found {
        let mut seen = Vec::new();
        for value in field_values(source, field) {
            let Some(label) = as_text(value) else {
                continue;
            };
            if seen.contains(&label) {
                continue;
            }
            seen.push(label.clone());
            counts.entry(label).or_insert_with(|| (value.clone(), 0)).1 += 1;
        }
    }

    let mut buckets: Vec<(Value, u64)> = counts.into_values().collect();
    buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| compare_values(&a.0, &b.0)));
    buckets
        .into_iter()
        .take(size)
        .map(|(key, count)| json!({ "key": key, "doc_count": count }))
        .collect()
}

fn truncate(date: DateTime<Utc>, interval: &str) -> Option<DateTime<Utc>> {
    let day = Utc
        .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()?;
    match interval {
        "year" => Utc.with_ymd_and_hms(date.year(), 1, 1, 0, 0, 0).single(),
        "quarter" => {
            let month = (date.month0() / 3) * 3 + 1;
            Utc.with_ymd_and_hms(date.year(), month, 1, 0, 0, 0).single()
        }
        "month" => Utc
            .with_ymd_and_hms(date.year(), date.month(), 1, 0, 0, 0)
            .single(),
        "week" => Some(day - Duration::days(i64::from(date.weekday().num_days_from_monday()))),
        "day" => Some(day),
        "hour" => Some(day + Duration::hours(i64::from(date.hour()))),
        "minute" => Some(
            day + Duration::hours(i64::from(date.hour()))
                + Duration::minutes(i64::from(date.minute())),
        ),
        _ => None,
    }
}

fn histogram_buckets(spec: &Value, found: &[(String, String, Map<String, Value>)]) -> Vec<Value> {
    let field = spec["field"].as_str().unwrap_or_default();
    let interval = spec["calendar_interval"].as_str().unwrap_or("day");

    let mut counts: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
    for (_, _, source) in found {
        let bucket = field_values(source, field)
            .into_iter()
            .filter_map(Value::as_str)
            .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .filter_map(|date| truncate(date.with_timezone(&Utc), interval))
            .next();
        if let Some(bucket) = bucket {
            *counts.entry(bucket).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .map(|(date, count)| {
            json!({
                "key": date.timestamp_millis(),
                "key_as_string": date.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "doc_count": count
            })
        })
        .collect()
}
