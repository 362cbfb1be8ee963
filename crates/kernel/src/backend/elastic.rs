//! Elasticsearch driver.

use async_trait::async_trait;

use super::{
    BulkOperation, BulkResponse, CountRequest, HttpTransport, SearchBackend, SearchRequest,
    SearchResponse,
};
use crate::error::{EngineError, EngineResult};

/// First version with search-time runtime fields.
const RUNTIME_MAPPINGS_SINCE: (u64, u64) = (7, 12);

/// Elasticsearch 7.x / 8.x cluster.
pub struct ElasticsearchBackend {
    transport: HttpTransport,
    runtime_mappings: bool,
}

impl ElasticsearchBackend {
    /// Create the driver for a cluster reporting `version`.
    pub fn new(transport: HttpTransport, version: &str) -> EngineResult<Self> {
        let (major, minor) = parse_version(version);
        if major != 0 && major < 7 {
            return Err(EngineError::Configuration(format!(
                "Elasticsearch {version} is not supported, 7.x or later is required"
            )));
        }
        Ok(Self {
            transport,
            runtime_mappings: (major, minor) >= RUNTIME_MAPPINGS_SINCE,
        })
    }
}

fn parse_version(version: &str) -> (u64, u64) {
    let mut parts = version.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (major, minor)
}

#[async_trait]
impl SearchBackend for ElasticsearchBackend {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    fn supports_runtime_mappings(&self) -> bool {
        self.runtime_mappings
    }

    async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse> {
        if request.runtime_mappings.is_some() && !self.runtime_mappings {
            return Err(EngineError::Unsupported(
                "runtime mappings require Elasticsearch 7.12 or later".to_string(),
            ));
        }
        self.transport.search(request).await
    }

    async fn count(&self, request: &CountRequest) -> EngineResult<u64> {
        self.transport.count(request).await
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> EngineResult<BulkResponse> {
        self.transport.bulk(operations).await
    }

    async fn ping(&self) -> bool {
        self.transport.get_json("/").await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("8.11.3"), (8, 11));
        assert_eq!(parse_version("7.12.0"), (7, 12));
        assert_eq!(parse_version(""), (0, 0));
        assert!((7, 17) >= RUNTIME_MAPPINGS_SINCE);
        assert!((7, 10) < RUNTIME_MAPPINGS_SINCE);
    }
}
