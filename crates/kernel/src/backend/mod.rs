//! Search backend drivers.
//!
//! Every engine component talks to the document store through the
//! [`SearchBackend`] trait. Two HTTP drivers implement it, one for
//! Elasticsearch and one for OpenSearch; [`connect`] probes the cluster once
//! at startup and returns the matching driver.

mod elastic;
mod http;
mod opensearch;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

pub use elastic::ElasticsearchBackend;
pub use http::{HttpTransport, parse_bulk_response, parse_search_response};
pub use opensearch::OpenSearchBackend;

use crate::config::{Config, EngineKind};
use crate::engine::patch::PatchExpression;
use crate::error::{EngineError, EngineResult};

/// Search request sent to the backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchRequest {
    /// Target index names or patterns.
    #[serde(skip)]
    pub indices: Vec<String>,

    /// A `bool` query tree.
    pub query: Value,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_after: Option<Vec<Value>>,

    pub size: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_mappings: Option<Value>,

    #[serde(rename = "aggs", skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Value>,

    pub track_total_hits: bool,
}

impl SearchRequest {
    /// JSON body of the request.
    pub fn body(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Indices and body, attached to errors for diagnostics.
    pub fn describe(&self) -> Value {
        json!({ "index": self.indices, "body": self.body() })
    }
}

/// Count request sent to the backend.
#[derive(Debug, Clone, Default)]
pub struct CountRequest {
    pub indices: Vec<String>,
    pub query: Value,
}

impl CountRequest {
    pub fn describe(&self) -> Value {
        json!({ "index": self.indices, "body": { "query": self.query } })
    }
}

/// One stored document returned by a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub source: Value,
    /// Sort values of the hit, present when the request sorted.
    pub sort: Option<Vec<Value>>,
}

/// A single shard failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardFailure {
    pub reason_type: String,
    pub reason: String,
}

impl ShardFailure {
    /// Sorting on a field that some index has no mapping for.
    pub fn is_missing_mapping(&self) -> bool {
        self.reason.contains("No mapping found")
    }
}

/// Shard statistics of a search response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardStats {
    pub total: u64,
    pub failed: u64,
    pub failures: Vec<ShardFailure>,
}

/// Parsed search response.
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub total: u64,
    pub hits: Vec<SearchHit>,
    pub shards: ShardStats,
    pub aggregations: Option<Value>,
}

/// Bulk action kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Full document write.
    Index { document: Value },
    /// Scripted partial update.
    Update {
        patch: PatchExpression,
        retry_on_conflict: u32,
    },
    Delete,
}

/// One operation inside a bulk call.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    pub index: String,
    pub id: String,
    pub action: BulkAction,
}

impl BulkOperation {
    pub fn index(index: impl Into<String>, id: impl Into<String>, document: Value) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            action: BulkAction::Index { document },
        }
    }

    pub fn update(
        index: impl Into<String>,
        id: impl Into<String>,
        patch: PatchExpression,
        retry_on_conflict: u32,
    ) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            action: BulkAction::Update {
                patch,
                retry_on_conflict,
            },
        }
    }

    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            action: BulkAction::Delete,
        }
    }

    /// Bulk API action name.
    pub fn action_name(&self) -> &'static str {
        match self.action {
            BulkAction::Index { .. } => "index",
            BulkAction::Update { .. } => "update",
            BulkAction::Delete => "delete",
        }
    }

    /// NDJSON lines for this operation.
    pub fn to_lines(&self) -> Vec<Value> {
        match &self.action {
            BulkAction::Index { document } => vec![
                json!({ "index": { "_index": self.index, "_id": self.id } }),
                document.clone(),
            ],
            BulkAction::Update {
                patch,
                retry_on_conflict,
            } => vec![
                json!({ "update": {
                    "_index": self.index,
                    "_id": self.id,
                    "retry_on_conflict": retry_on_conflict,
                } }),
                json!({ "script": patch.to_script() }),
            ],
            BulkAction::Delete => vec![json!({ "delete": { "_index": self.index, "_id": self.id } })],
        }
    }
}

/// Per-item outcome of a bulk call.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub action: String,
    pub index: String,
    pub id: String,
    pub status: u16,
    /// Backend error reason when the item failed.
    pub error: Option<String>,
}

/// Parsed bulk response.
#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    /// Items that carry an error.
    pub fn failures(&self) -> Vec<&BulkItemResult> {
        self.items.iter().filter(|i| i.error.is_some()).collect()
    }
}

/// Document-search backend interface.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Driver name (e.g., "elasticsearch", "opensearch").
    fn name(&self) -> &'static str;

    /// Whether `runtime_mappings` may be sent with a search.
    fn supports_runtime_mappings(&self) -> bool;

    /// Run a search.
    async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse>;

    /// Count matching documents.
    async fn count(&self, request: &CountRequest) -> EngineResult<u64>;

    /// Execute a bulk call. Item failures are reported, not raised.
    async fn bulk(&self, operations: &[BulkOperation]) -> EngineResult<BulkResponse>;

    /// Whether the backend answers.
    async fn ping(&self) -> bool;
}

/// Probe the configured cluster and build the matching driver.
pub async fn connect(config: &Config) -> EngineResult<Arc<dyn SearchBackend>> {
    let transport = HttpTransport::new(config)?;
    let info = transport.get_json("/").await.map_err(|e| {
        EngineError::Configuration(format!(
            "search engine unreachable at {}: {e}",
            config.engine_url
        ))
    })?;

    let version = info["version"]["number"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let distribution = info["version"]["distribution"]
        .as_str()
        .unwrap_or("elasticsearch");

    let kind = match config.engine_kind {
        EngineKind::Auto if distribution == "opensearch" => EngineKind::OpenSearch,
        EngineKind::Auto => EngineKind::Elasticsearch,
        explicit => explicit,
    };

    let backend: Arc<dyn SearchBackend> = match kind {
        EngineKind::OpenSearch => Arc::new(OpenSearchBackend::new(transport)),
        _ => Arc::new(ElasticsearchBackend::new(transport, &version)?),
    };

    info!(
        driver = backend.name(),
        version = %version,
        runtime_mappings = backend.supports_runtime_mappings(),
        "search engine connected"
    );

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_request_body_skips_empty_parts() {
        let request = SearchRequest {
            indices: vec!["kestrel_*".into()],
            query: json!({ "bool": { "must": [], "must_not": [] } }),
            size: 10,
            ..Default::default()
        };
        let body = request.body();
        assert!(body.get("sort").is_none());
        assert!(body.get("search_after").is_none());
        assert!(body.get("runtime_mappings").is_none());
        assert!(body.get("indices").is_none());
        assert_eq!(body["size"], json!(10));
        assert_eq!(request.describe()["index"], json!(["kestrel_*"]));
    }

    #[test]
    fn bulk_lines() {
        let op = BulkOperation::update(
            "idx",
            "a",
            PatchExpression::append_refs("rel_uses.internal_id", vec!["b".into()]),
            5,
        );
        let lines = op.to_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["update"]["retry_on_conflict"], json!(5));
        assert_eq!(lines[1]["script"]["lang"], json!("painless"));

        let op = BulkOperation::delete("idx", "a");
        assert_eq!(op.to_lines().len(), 1);
        assert_eq!(op.action_name(), "delete");
    }

    #[test]
    fn missing_mapping_failure() {
        let failure = ShardFailure {
            reason_type: "query_shard_exception".into(),
            reason: "No mapping found for [name.keyword] in order to sort on".into(),
        };
        assert!(failure.is_missing_mapping());
    }
}
