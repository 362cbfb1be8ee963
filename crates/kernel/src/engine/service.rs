//! Engine facade: the read side.
//!
//! Every read goes through the same pipeline: resolve indirect filters, build
//! the caller's access restrictions, compile the query, send it, check shard
//! health and convert the hits. Writes live in `bulk` and `cascade`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::access::{AccessRestrictions, build_access_restrictions};
use super::converter::convert_document;
use super::cursor::Cursor;
use super::dsl::{any_of, bool_query, keyword, strings, term, terms};
use super::filters::{
    FilterCompiler, IDS_FILTER, reliability_filters, reliability_lookup, substitute_reliability,
};
use super::query_builder::{IDENTITY_FIELD, QueryBuilder, RuntimeLabels};
use super::runtime_sort::RuntimeSort;
use super::settings::{PlatformSettings, SETTINGS_TYPE, SettingsCache};
use super::types::{
    AggregationBucket, Edge, Filter, FilterGroup, HISTOGRAM_INTERVALS, HistogramBucket,
    PaginateOptions, PaginationResult,
};
use crate::backend::{CountRequest, SearchBackend, SearchRequest, SearchResponse};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::document::REL_INDEX_PREFIX;
use crate::models::{AccessContext, Document};
use crate::schema::{AttributeKind, SchemaRegistry};

/// Entity type of author identities.
const IDENTITY_TYPE: &str = "Identity";

/// Query/access-control compiler and mutation engine.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    backend: Arc<dyn SearchBackend>,
    config: EngineConfig,
    schema: Arc<dyn SchemaRegistry>,
    settings: SettingsCache,
}

impl Engine {
    /// Create an engine over a connected backend.
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        config: EngineConfig,
        schema: Arc<dyn SchemaRegistry>,
    ) -> Self {
        let settings = SettingsCache::new(config.settings_ttl);
        Self {
            inner: Arc::new(EngineInner {
                backend,
                config,
                schema,
                settings,
            }),
        }
    }

    pub fn backend(&self) -> &dyn SearchBackend {
        self.inner.backend.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn schema(&self) -> &dyn SchemaRegistry {
        self.inner.schema.as_ref()
    }

    fn builder(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(
            &self.inner.config,
            self.inner.schema.as_ref(),
            self.inner.backend.supports_runtime_mappings(),
        )
    }

    /// Platform settings, cached.
    pub async fn platform_settings(&self) -> EngineResult<PlatformSettings> {
        self.inner
            .settings
            .get_or_load(self.load_platform_settings())
            .await
    }

    /// Forget cached platform settings after they changed.
    pub async fn invalidate_settings(&self) {
        self.inner.settings.invalidate().await;
    }

    async fn load_platform_settings(&self) -> EngineResult<PlatformSettings> {
        let query = bool_query(
            vec![term(&keyword("entity_type"), json!(SETTINGS_TYPE))],
            vec![],
        );
        let docs = self
            .scan(vec![self.inner.config.internal_objects_index()], query, Some(1))
            .await?;
        Ok(docs
            .first()
            .map(PlatformSettings::from_document)
            .unwrap_or_default())
    }

    /// Access restrictions for `ctx`. Settings are only read when they matter.
    pub async fn restrictions(
        &self,
        ctx: &AccessContext,
        include_authorities: bool,
    ) -> EngineResult<AccessRestrictions> {
        let settings = if ctx.is_system() || ctx.is_bypass() {
            PlatformSettings::default()
        } else {
            self.platform_settings().await?
        };
        Ok(build_access_restrictions(ctx, &settings, include_authorities))
    }

    /// Rewrite reliability filters into author-id filters.
    pub async fn resolve_filters(&self, group: &FilterGroup) -> EngineResult<FilterGroup> {
        let indirections = reliability_filters(group);
        if indirections.is_empty() {
            return Ok(group.clone());
        }

        let compiler = FilterCompiler::new(self.inner.schema.as_ref());
        let mut resolved = Vec::with_capacity(indirections.len());
        for filter in &indirections {
            let mut must = vec![type_clause(&[IDENTITY_TYPE.to_string()])];
            if let Some(clause) = compiler.compile_group(&reliability_lookup(filter))? {
                must.push(clause);
            }
            let authors = self
                .scan(self.inner.config.read_indices(), bool_query(must, vec![]), None)
                .await?;
            debug!(authors = authors.len(), "reliability filter resolved");
            resolved.push(authors.into_iter().map(|d| d.internal_id).collect());
        }

        Ok(substitute_reliability(group, &mut resolved.into_iter()))
    }

    async fn prepare_query(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
    ) -> EngineResult<Value> {
        let resolved = match filters {
            Some(group) => Some(self.resolve_filters(group).await?),
            None => None,
        };
        let restrictions = self.restrictions(ctx, options.include_authorities).await?;
        self.builder()
            .build_query(&restrictions, resolved.as_ref(), options)
    }

    async fn load_runtime_labels(&self, sorts: &[&'static RuntimeSort]) -> EngineResult<RuntimeLabels> {
        let mut labels = RuntimeLabels::new();
        for sort in sorts {
            if labels.contains_key(sort.name) {
                continue;
            }
            let query = bool_query(vec![type_clause(&[sort.reference_type.to_string()])], vec![]);
            let references = self
                .scan(self.inner.config.read_indices(), query, None)
                .await?;
            let map: Map<String, Value> = references
                .into_iter()
                .map(|doc| {
                    let label = doc
                        .attribute(sort.label_attribute)
                        .cloned()
                        .unwrap_or_else(|| Value::String(doc.internal_id.clone()));
                    (doc.internal_id, label)
                })
                .collect();
            labels.insert(sort.name, map);
        }
        Ok(labels)
    }

    /// Reject responses with more failed shards than tolerated.
    ///
    /// In `lenient` mode, failures caused by a missing sort mapping are ignored.
    fn check_shards(&self, response: &SearchResponse, lenient: bool) -> EngineResult<()> {
        let shards = &response.shards;
        if shards.failed == 0 {
            return Ok(());
        }

        let relevant: Vec<_> = shards
            .failures
            .iter()
            .filter(|f| !(lenient && f.is_missing_mapping()))
            .collect();
        let ignored = (shards.failures.len() - relevant.len()) as u64;
        let failed = shards.failed.saturating_sub(ignored);
        let threshold = self.inner.config.max_shards_failure;

        if failed > threshold {
            return Err(EngineError::EngineShards {
                failed,
                threshold,
                reasons: relevant.iter().map(|f| f.reason.clone()).collect(),
            });
        }
        if failed > 0 || ignored > 0 {
            warn!(failed, ignored, threshold, "tolerated shard failures");
        }
        Ok(())
    }

    /// Search on the paging path. Missing indices yield `None`.
    async fn search_page(&self, request: &SearchRequest) -> EngineResult<Option<SearchResponse>> {
        match self.inner.backend.search(request).await {
            Ok(response) => {
                self.check_shards(&response, true)?;
                Ok(Some(response))
            }
            Err(e) if e.is_missing_index() => {
                debug!(indices = ?request.indices, "index not created yet, empty page");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Raw paged read with no access control, filter resolution or runtime sort.
    async fn scan(
        &self,
        indices: Vec<String>,
        query: Value,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Document>> {
        let page_size = self.inner.config.max_page_size;
        let mut documents = Vec::new();
        let mut search_after = None;

        loop {
            let request = SearchRequest {
                indices: indices.clone(),
                query: query.clone(),
                sort: vec![json!({ keyword(IDENTITY_FIELD): { "order": "asc" } })],
                search_after: search_after.take(),
                size: limit.map_or(page_size, |l| l.min(page_size)),
                runtime_mappings: None,
                aggregations: None,
                track_total_hits: false,
            };
            let Some(response) = self.search_page(&request).await? else {
                break;
            };
            let count = response.hits.len();
            for hit in response.hits {
                search_after = hit.sort.clone();
                documents.push(Document::from_hit(&hit.index, hit.source)?);
            }
            if count < request.size
                || search_after.is_none()
                || limit.is_some_and(|l| documents.len() >= l)
            {
                break;
            }
        }

        Ok(documents)
    }

    /// One page of documents visible to `ctx`.
    pub async fn paginate(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
    ) -> EngineResult<PaginationResult> {
        let builder = self.builder();
        let sorts = builder.runtime_sorts(&options.order_by)?;
        let offset = match options.after {
            Some(ref after) if !after.is_empty() => Cursor::decode(after)?.position,
            _ => 0,
        };

        let query = self.prepare_query(filters, ctx, options).await?;
        let labels = self.load_runtime_labels(&sorts).await?;
        let request = builder.build_search(query, options, &labels)?;
        if offset.checked_add(request.size as u64).is_none() {
            return Err(EngineError::Functional(format!(
                "cursor position {offset} is out of range"
            )));
        }
        debug!(indices = ?request.indices, size = request.size, offset, "paginate");

        let Some(response) = self.search_page(&request).await? else {
            return Ok(PaginationResult::empty());
        };

        let mut edges = Vec::with_capacity(response.hits.len());
        for (i, hit) in response.hits.into_iter().enumerate() {
            let position = offset.saturating_add(i as u64 + 1);
            let cursor = Cursor::new(position, hit.sort.unwrap_or_default()).encode();
            let doc = Document::from_hit(&hit.index, hit.source)?;
            edges.push(Edge {
                node: convert_document(doc, self.schema())?,
                cursor,
            });
        }

        Ok(PaginationResult::new(edges, request.size, offset, response.total))
    }

    /// Drain pages into `callback` until exhausted, `max_size` is reached or
    /// the callback returns `false`. Returns the number of delivered documents.
    pub async fn list_all_with<F>(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
        mut callback: F,
    ) -> EngineResult<usize>
    where
        F: FnMut(Vec<Document>) -> bool + Send,
    {
        let mut page_options = options.clone();
        if page_options.first.is_none() {
            page_options.first = Some(self.inner.config.max_page_size);
        }

        let mut delivered = 0;
        loop {
            let page = self.paginate(filters, ctx, &page_options).await?;
            let has_next = page.page_info.has_next_page;
            let end_cursor = page.page_info.end_cursor.clone();

            let mut docs = page.into_documents();
            if let Some(max) = options.max_size {
                docs.truncate(max.saturating_sub(delivered));
            }
            if docs.is_empty() {
                break;
            }
            delivered += docs.len();

            if !callback(docs) {
                break;
            }
            if !has_next || options.max_size.is_some_and(|max| delivered >= max) {
                break;
            }
            page_options.after = Some(end_cursor);
        }

        Ok(delivered)
    }

    /// Every document visible to `ctx` matching `filters`.
    pub async fn list_all(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
    ) -> EngineResult<Vec<Document>> {
        let mut documents = Vec::new();
        self.list_all_with(filters, ctx, options, |page| {
            documents.extend(page);
            true
        })
        .await?;
        Ok(documents)
    }

    /// Documents known by any of `ids` (internal, standard or stix alias).
    pub async fn find_by_ids(
        &self,
        ids: &[String],
        ctx: &AccessContext,
        options: &PaginateOptions,
    ) -> EngineResult<Vec<Document>> {
        let mut seen = HashSet::new();
        let mut documents = Vec::new();
        for chunk in ids.chunks(self.inner.config.max_terms.max(1)) {
            let group = FilterGroup::and(vec![Filter::eq(IDS_FILTER, strings(chunk))]);
            for doc in self.list_all(Some(&group), ctx, options).await? {
                if seen.insert(doc.internal_id.clone()) {
                    documents.push(doc);
                }
            }
        }
        Ok(documents)
    }

    /// Like [`Engine::find_by_ids`], keyed by internal id and standard id.
    pub async fn find_by_ids_map(
        &self,
        ids: &[String],
        ctx: &AccessContext,
        options: &PaginateOptions,
    ) -> EngineResult<HashMap<String, Document>> {
        let mut map = HashMap::new();
        for doc in self.find_by_ids(ids, ctx, options).await? {
            if !doc.standard_id.is_empty() {
                map.insert(doc.standard_id.clone(), doc.clone());
            }
            map.insert(doc.internal_id.clone(), doc);
        }
        Ok(map)
    }

    /// Number of documents visible to `ctx` matching `filters`.
    pub async fn count(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
    ) -> EngineResult<u64> {
        let query = self.prepare_query(filters, ctx, options).await?;
        let request = CountRequest {
            indices: self.builder().indices(options),
            query,
        };
        self.inner.backend.count(&request).await
    }

    async fn aggregation(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
        aggregation: Value,
    ) -> EngineResult<Value> {
        let query = self.prepare_query(filters, ctx, options).await?;
        let request = SearchRequest {
            indices: self.builder().indices(options),
            query,
            size: 0,
            aggregations: Some(json!({ "result": aggregation })),
            track_total_hits: true,
            ..Default::default()
        };
        let response = self.inner.backend.search(&request).await?;
        self.check_shards(&response, false)?;
        Ok(response
            .aggregations
            .as_ref()
            .and_then(|aggs| aggs.get("result"))
            .and_then(|result| result.get("buckets"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Document counts per date bucket of `field`.
    pub async fn histogram(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
        field: &str,
        interval: &str,
    ) -> EngineResult<Vec<HistogramBucket>> {
        if !HISTOGRAM_INTERVALS.contains(&interval) {
            return Err(EngineError::Functional(format!(
                "unsupported histogram interval: {interval}"
            )));
        }
        if self.schema().attribute_kind(field) != AttributeKind::Date {
            return Err(EngineError::Unsupported(format!(
                "histogram requires a date field, got {field}"
            )));
        }

        let buckets = self
            .aggregation(
                filters,
                ctx,
                options,
                json!({
                    "date_histogram": {
                        "field": field,
                        "calendar_interval": interval,
                        "min_doc_count": 1
                    }
                }),
            )
            .await?;

        Ok(buckets
            .as_array()
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|b| HistogramBucket {
                        date: b["key_as_string"]
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| b["key"].to_string()),
                        value: b["doc_count"].as_u64().unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Document counts per distinct value of `field`.
    pub async fn aggregate(
        &self,
        filters: Option<&FilterGroup>,
        ctx: &AccessContext,
        options: &PaginateOptions,
        field: &str,
    ) -> EngineResult<Vec<AggregationBucket>> {
        if !(self.schema().is_aggregatable(field) || field.starts_with(REL_INDEX_PREFIX)) {
            return Err(EngineError::Unsupported(format!(
                "aggregation not allowed on {field}"
            )));
        }

        let max = self.inner.config.max_aggregation_size;
        let size = options.first.map_or(max, |first| first.min(max));
        let target = FilterCompiler::new(self.schema()).value_field(field);
        let buckets = self
            .aggregation(
                filters,
                ctx,
                options,
                json!({ "terms": { "field": target, "size": size } }),
            )
            .await?;

        Ok(buckets
            .as_array()
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|b| AggregationBucket {
                        label: b["key"]
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| b["key"].to_string()),
                        value: b["doc_count"].as_u64().unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Entity type or any parent type in `types`.
fn type_clause(types: &[String]) -> Value {
    any_of(vec![
        terms(&keyword("entity_type"), strings(types)),
        terms(&keyword("parent_types"), strings(types)),
    ])
}
