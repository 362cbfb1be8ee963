//! OpenSearch driver.

use async_trait::async_trait;

use super::{
    BulkOperation, BulkResponse, CountRequest, HttpTransport, SearchBackend, SearchRequest,
    SearchResponse,
};
use crate::error::{EngineError, EngineResult};

/// OpenSearch 1.x / 2.x cluster. Search-time runtime fields are not available.
pub struct OpenSearchBackend {
    transport: HttpTransport,
}

impl OpenSearchBackend {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SearchBackend for OpenSearchBackend {
    fn name(&self) -> &'static str {
        "opensearch"
    }

    fn supports_runtime_mappings(&self) -> bool {
        false
    }

    async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse> {
        if request.runtime_mappings.is_some() {
            return Err(EngineError::Unsupported(
                "runtime mappings are not supported by OpenSearch".to_string(),
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
