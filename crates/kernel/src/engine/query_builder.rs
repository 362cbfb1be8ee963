//! Query body builder.
//!
//! Merges access restrictions, compiled filters, type scoping and full-text
//! search into one `bool` query, then adds ordering and paging to produce the
//! [`SearchRequest`] sent to the backend.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use super::access::AccessRestrictions;
use super::cursor::Cursor;
use super::dsl::{any_of, bool_query, keyword, strings, terms};
use super::filters::FilterCompiler;
use super::runtime_sort::{RuntimeSort, runtime_sort};
use super::search::build_search_clause;
use super::types::{FilterGroup, OrderBy, PaginateOptions, SortDirection};
use crate::backend::SearchRequest;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::schema::SchemaRegistry;

/// Stable identity field used as default order and tiebreak.
pub const IDENTITY_FIELD: &str = "internal_id";

/// Pre-loaded id to label maps, keyed by runtime sort name.
pub type RuntimeLabels = HashMap<&'static str, Map<String, Value>>;

/// Builds search requests.
pub struct QueryBuilder<'a> {
    config: &'a EngineConfig,
    schema: &'a dyn SchemaRegistry,
    runtime_mappings: bool,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(
        config: &'a EngineConfig,
        schema: &'a dyn SchemaRegistry,
        runtime_mappings: bool,
    ) -> Self {
        Self {
            config,
            schema,
            runtime_mappings,
        }
    }

    /// Indices to read for `options`.
    pub fn indices(&self, options: &PaginateOptions) -> Vec<String> {
        if options.indices.is_empty() {
            self.config.read_indices()
        } else {
            options.indices.clone()
        }
    }

    /// The `bool` query: restrictions AND filters AND types AND search.
    pub fn build_query(
        &self,
        restrictions: &AccessRestrictions,
        filters: Option<&FilterGroup>,
        options: &PaginateOptions,
    ) -> EngineResult<Value> {
        let mut must = restrictions.must.clone();

        if let Some(group) = filters {
            if let Some(clause) = FilterCompiler::new(self.schema).compile_group(group)? {
                must.push(clause);
            }
        }

        if !options.types.is_empty() {
            let types = strings(&options.types);
            must.push(any_of(vec![
                terms(&keyword("entity_type"), types.clone()),
                terms(&keyword("parent_types"), types),
            ]));
        }

        if let Some(clause) = options.search.as_deref().and_then(build_search_clause) {
            must.push(clause);
        }

        Ok(bool_query(must, restrictions.must_not.clone()))
    }

    /// Runtime sorts referenced by `order_by`.
    ///
    /// Fails when one is requested but the backend cannot compute it.
    pub fn runtime_sorts(&self, order_by: &[OrderBy]) -> EngineResult<Vec<&'static RuntimeSort>> {
        let sorts: Vec<&'static RuntimeSort> = order_by
            .iter()
            .filter_map(|o| runtime_sort(&o.field))
            .collect();
        if !sorts.is_empty() && !self.runtime_mappings {
            return Err(EngineError::Unsupported(format!(
                "sorting by {} requires runtime mappings, not supported by this backend",
                sorts
                    .iter()
                    .map(|s| s.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(sorts)
    }

    fn sort_field(&self, field: &str) -> String {
        if field.starts_with('_') || self.schema.attribute_kind(field).is_raw() {
            field.to_string()
        } else {
            keyword(field)
        }
    }

    /// Sort list and runtime mappings for `order_by`.
    pub fn build_sort(
        &self,
        order_by: &[OrderBy],
        labels: &RuntimeLabels,
    ) -> EngineResult<(Vec<Value>, Option<Value>)> {
        let mut sort = Vec::with_capacity(order_by.len() + 1);
        let mut mappings = Map::new();
        let mut has_identity = false;

        for order in order_by {
            let direction = order.direction.as_str();
            if let Some(runtime) = runtime_sort(&order.field) {
                if !self.runtime_mappings {
                    return Err(EngineError::Unsupported(format!(
                        "sorting by {} requires runtime mappings",
                        runtime.name
                    )));
                }
                let field = runtime.runtime_field();
                let params = labels.get(runtime.name).cloned().unwrap_or_default();
                mappings.insert(field.clone(), runtime.mapping(params));
                sort.push(json!({ field: { "order": direction } }));
                continue;
            }
            if order.field == IDENTITY_FIELD {
                has_identity = true;
            }
            sort.push(json!({ self.sort_field(&order.field): { "order": direction } }));
        }

        if !has_identity {
            sort.push(json!({
                keyword(IDENTITY_FIELD): { "order": SortDirection::Asc.as_str() }
            }));
        }

        let mappings = (!mappings.is_empty()).then_some(Value::Object(mappings));
        Ok((sort, mappings))
    }

    /// Full search request for one page.
    pub fn build_search(
        &self,
        query: Value,
        options: &PaginateOptions,
        labels: &RuntimeLabels,
    ) -> EngineResult<SearchRequest> {
        let size = options.page_size();
        if size > self.config.max_page_size {
            return Err(EngineError::Functional(format!(
                "page size {size} exceeds the maximum of {}",
                self.config.max_page_size
            )));
        }

        let search_after = match options.after {
            Some(ref after) if !after.is_empty() => Some(Cursor::decode(after)?.sort),
            _ => None,
        };

        let (sort, runtime_mappings) = self.build_sort(&options.order_by, labels)?;

        Ok(SearchRequest {
            indices: self.indices(options),
            query,
            sort,
            search_after,
            size,
            runtime_mappings,
            aggregations: None,
            track_total_hits: true,
        })
    }
}
