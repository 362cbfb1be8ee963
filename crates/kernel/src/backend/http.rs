//! HTTP transport shared by the Elasticsearch and OpenSearch drivers.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::{
    BulkItemResult, BulkOperation, BulkResponse, CountRequest, SearchHit, SearchRequest,
    SearchResponse, ShardFailure, ShardStats,
};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};

/// Authenticated HTTP access to the cluster REST API.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
    request_timeout: Duration,
    bulk_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport from configuration.
    pub fn new(config: &Config) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let mut base_url = config.engine_url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            api_key: config.engine_api_key.clone(),
            username: config.engine_username.clone(),
            password: config.engine_password.clone(),
            request_timeout: config.engine.request_timeout,
            bulk_timeout: config.engine.bulk_timeout,
        })
    }

    fn url(&self, path: &str) -> EngineResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| EngineError::Configuration(format!("invalid engine path {path}: {e}")))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        if let Some(ref key) = self.api_key {
            builder.header("Authorization", format!("ApiKey {key}"))
        } else if let Some(ref username) = self.username {
            builder.basic_auth(username, self.password.as_ref())
        } else {
            builder
        }
    }

    /// GET a JSON document.
    pub async fn get_json(&self, path: &str) -> EngineResult<Value> {
        let builder = self
            .client
            .get(self.url(path)?)
            .timeout(self.request_timeout);
        self.execute(builder, json!({ "method": "GET", "path": path }))
            .await
    }

    /// Run a search against the cluster.
    pub async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse> {
        let path = format!("{}/_search", request.indices.join(","));
        let body = request.body();
        debug!(path = %path, size = request.size, "engine search");
        let builder = self
            .client
            .post(self.url(&path)?)
            .timeout(self.request_timeout)
            .json(&body);
        let response = self.execute(builder, request.describe()).await?;
        Ok(parse_search_response(&response))
    }

    /// Count documents matching a query.
    pub async fn count(&self, request: &CountRequest) -> EngineResult<u64> {
        let path = format!("{}/_count", request.indices.join(","));
        let builder = self
            .client
            .post(self.url(&path)?)
            .timeout(self.request_timeout)
            .json(&json!({ "query": request.query }));
        let response = self.execute(builder, request.describe()).await?;
        Ok(response["count"].as_u64().unwrap_or(0))
    }

    /// Send a bulk call with refresh so subsequent reads see the writes.
    pub async fn bulk(&self, operations: &[BulkOperation]) -> EngineResult<BulkResponse> {
        let mut payload = String::new();
        for line in operations.iter().flat_map(BulkOperation::to_lines) {
            payload.push_str(&line.to_string());
            payload.push('\n');
        }
        let describe = json!({
            "path": "_bulk",
            "operations": operations.len(),
            "ids": operations.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
        });
        let builder = self
            .client
            .post(self.url("_bulk?refresh=true")?)
            .timeout(self.bulk_timeout)
            .header("Content-Type", "application/x-ndjson")
            .body(payload);
        let response = self.execute(builder, describe).await?;
        Ok(parse_bulk_response(&response))
    }

    async fn execute(&self, builder: RequestBuilder, describe: Value) -> EngineResult<Value> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| EngineError::database("search engine call failed", describe.clone(), e))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            EngineError::database("search engine returned invalid JSON", describe.clone(), e)
        })?;

        if status.is_success() {
            return Ok(body);
        }

        let kind = body["error"]["type"].as_str().map(str::to_string);
        let reason = body["error"]["reason"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        Err(EngineError::database(
            format!("search engine responded {status}"),
            describe,
            anyhow::anyhow!(reason),
        )
        .with_kind(kind))
    }
}

/// Parse a `_search` response body.
pub fn parse_search_response(body: &Value) -> SearchResponse {
    let total = match &body["hits"]["total"] {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        other => other["value"].as_u64().unwrap_or(0),
    };

    let hits = body["hits"]["hits"]
        .as_array()
        .map(|hits| {
            hits.iter()
                .map(|hit| SearchHit {
                    index: hit["_index"].as_str().unwrap_or_default().to_string(),
                    id: hit["_id"].as_str().unwrap_or_default().to_string(),
                    source: hit["_source"].clone(),
                    sort: hit["sort"].as_array().cloned(),
                })
                .collect()
        })
        .unwrap_or_default();

    let failures = body["_shards"]["failures"]
        .as_array()
        .map(|failures| {
            failures
                .iter()
                .map(|f| ShardFailure {
                    reason_type: f["reason"]["type"].as_str().unwrap_or_default().to_string(),
                    reason: f["reason"]["reason"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    SearchResponse {
        total,
        hits,
        shards: ShardStats {
            total: body["_shards"]["total"].as_u64().unwrap_or(0),
            failed: body["_shards"]["failed"].as_u64().unwrap_or(0),
            failures,
        },
        aggregations: body.get("aggregations").cloned(),
    }
}

/// Parse a `_bulk` response body.
pub fn parse_bulk_response(body: &Value) -> BulkResponse {
    let items = body["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let (action, detail) = item.as_object()?.iter().next()?;
                    let error = match &detail["error"] {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        err => Some(
                            err["reason"]
                                .as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| err.to_string()),
                        ),
                    };
                    Some(BulkItemResult {
                        action: action.clone(),
                        index: detail["_index"].as_str().unwrap_or_default().to_string(),
                        id: detail["_id"].as_str().unwrap_or_default().to_string(),
                        status: detail["status"].as_u64().unwrap_or(0) as u16,
                        error,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    BulkResponse { items }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_search_hits_and_shards() {
        let body = json!({
            "hits": {
                "total": { "value": 2, "relation": "eq" },
                "hits": [
                    { "_index": "kestrel_a", "_id": "1", "_source": { "internal_id": "1" }, "sort": ["1"] },
                    { "_index": "kestrel_a", "_id": "2", "_source": { "internal_id": "2" } }
                ]
            },
            "_shards": {
                "total": 3,
                "failed": 1,
                "failures": [{ "reason": { "type": "query_shard_exception", "reason": "No mapping found for [x]" } }]
            }
        });
        let response = parse_search_response(&body);
        assert_eq!(response.total, 2);
        assert_eq!(response.hits.len(), 2);
        assert_eq!(response.hits[0].sort, Some(vec![json!("1")]));
        assert_eq!(response.hits[1].sort, None);
        assert_eq!(response.shards.failed, 1);
        assert!(response.shards.failures[0].is_missing_mapping());
    }

    #[test]
    fn parse_legacy_total() {
        let response = parse_search_response(&json!({ "hits": { "total": 7, "hits": [] } }));
        assert_eq!(response.total, 7);
    }

    #[test]
    fn parse_bulk_items_with_errors() {
        let body = json!({
            "errors": true,
            "items": [
                { "index": { "_index": "i", "_id": "a", "status": 201 } },
                { "update": { "_index": "i", "_id": "b", "status": 409,
                    "error": { "type": "version_conflict_engine_exception", "reason": "conflict" } } },
                { "delete": { "_index": "i", "_id": "c", "status": 404, "result": "not_found" } }
            ]
        });
        let response = parse_bulk_response(&body);
        assert_eq!(response.items.len(), 3);
        let failures = response.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "b");
        assert_eq!(failures[0].error.as_deref(), Some("conflict"));
    }
}
