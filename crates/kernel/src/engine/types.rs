//! Engine query types.
//!
//! Provides the backend-agnostic query description compiled by the engine:
//! - FilterGroup / Filter: recursive filter tree
//! - PaginateOptions: ordering, paging, search and scoping
//! - PaginationResult: cursor-paginated documents

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::models::Document;

/// Default page size when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// How sibling clauses combine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    And,
    Or,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Exact match.
    #[default]
    Eq,
    /// Negated exact match.
    NotEq,
    /// Analyzed text match.
    Match,
    /// Pattern match.
    Wildcard,
    /// Raw backend expression, trusted internal callers only.
    Script,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field is absent.
    Nil,
    /// Field is present.
    NotNil,
}

impl FilterOperator {
    /// Range comparison operator name.
    pub fn range_key(self) -> Option<&'static str> {
        match self {
            FilterOperator::Gt => Some("gt"),
            FilterOperator::Gte => Some("gte"),
            FilterOperator::Lt => Some("lt"),
            FilterOperator::Lte => Some("lte"),
            _ => None,
        }
    }
}

/// One filter condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    /// Field(s) to filter on. Accepts a single string or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub key: Vec<String>,

    #[serde(default)]
    pub operator: FilterOperator,

    #[serde(default)]
    pub values: Vec<Value>,

    /// How the values combine.
    #[serde(default = "default_values_mode")]
    pub mode: FilterMode,

    /// Inner conditions over an embedded-document path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Vec<Filter>>,
}

fn default_values_mode() -> FilterMode {
    FilterMode::Or
}

impl Filter {
    /// Equality filter on one key.
    pub fn eq(key: impl Into<String>, values: Vec<Value>) -> Self {
        Self::with_operator(key, FilterOperator::Eq, values)
    }

    /// Filter on one key with an explicit operator.
    pub fn with_operator(key: impl Into<String>, operator: FilterOperator, values: Vec<Value>) -> Self {
        Self {
            key: vec![key.into()],
            operator,
            values,
            mode: FilterMode::Or,
            nested: None,
        }
    }

    /// Embedded-document filter over `path`.
    pub fn nested(path: impl Into<String>, nested: Vec<Filter>) -> Self {
        Self {
            key: vec![path.into()],
            operator: FilterOperator::Eq,
            values: Vec::new(),
            mode: FilterMode::Or,
            nested: Some(nested),
        }
    }

    /// Combine values with AND instead of OR.
    pub fn all(mut self) -> Self {
        self.mode = FilterMode::And;
        self
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(key) => vec![key],
        OneOrMany::Many(keys) => keys,
    })
}

/// Recursive group of filters.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterGroup {
    #[serde(default)]
    pub mode: FilterMode,

    #[serde(default)]
    pub filters: Vec<Filter>,

    #[serde(default)]
    pub filter_groups: Vec<FilterGroup>,
}

impl FilterGroup {
    /// AND group of filters.
    pub fn and(filters: Vec<Filter>) -> Self {
        Self {
            mode: FilterMode::And,
            filters,
            filter_groups: Vec::new(),
        }
    }

    /// OR group of filters.
    pub fn or(filters: Vec<Filter>) -> Self {
        Self {
            mode: FilterMode::Or,
            filters,
            filter_groups: Vec::new(),
        }
    }

    /// Add a nested group.
    pub fn with_group(mut self, group: FilterGroup) -> Self {
        self.filter_groups.push(group);
        self
    }

    /// Whether the group contributes no constraint.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.filter_groups.iter().all(FilterGroup::is_empty)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// One ordering criterion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Paging, ordering, search and scoping options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PaginateOptions {
    /// Page size (default: 500).
    #[serde(default)]
    pub first: Option<usize>,

    /// Cursor of the last row already returned.
    #[serde(default)]
    pub after: Option<String>,

    #[serde(default)]
    pub order_by: Vec<OrderBy>,

    /// Full-text search string.
    #[serde(default)]
    pub search: Option<String>,

    /// Restrict to these entity types (directly or through a parent type).
    #[serde(default)]
    pub types: Vec<String>,

    /// Indices to read; empty means every data index.
    #[serde(default)]
    pub indices: Vec<String>,

    /// Also grant visibility through `authorized_authorities`.
    #[serde(default)]
    pub include_authorities: bool,

    /// Stop `list_all` after this many documents.
    #[serde(default)]
    pub max_size: Option<usize>,
}

impl PaginateOptions {
    pub fn first(mut self, first: usize) -> Self {
        self.first = Some(first);
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    pub fn page_size(&self) -> usize {
        self.first.unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

/// One row of a paginated result.
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub node: Document,
    pub cursor: String,
}

/// Paging metadata.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub start_cursor: String,
    pub end_cursor: String,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub global_count: u64,
}

/// Cursor-paginated documents.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PaginationResult {
    pub edges: Vec<Edge>,
    pub page_info: PageInfo,
}

impl PaginationResult {
    /// Build a page. `offset` is the number of rows before this page.
    pub fn new(edges: Vec<Edge>, first: usize, offset: u64, global_count: u64) -> Self {
        let page_info = PageInfo {
            start_cursor: edges.first().map(|e| e.cursor.clone()).unwrap_or_default(),
            end_cursor: edges.last().map(|e| e.cursor.clone()).unwrap_or_default(),
            has_next_page: (first as u64).saturating_add(offset) < global_count,
            has_previous_page: offset > 0,
            global_count,
        };
        Self { edges, page_info }
    }

    /// Result for a query that cannot match anything yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Documents of the page.
    pub fn into_documents(self) -> Vec<Document> {
        self.edges.into_iter().map(|e| e.node).collect()
    }
}

/// Supported date-histogram intervals.
pub const HISTOGRAM_INTERVALS: &[&str] = &["year", "quarter", "month", "week", "day", "hour", "minute"];

/// One date-histogram bucket.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistogramBucket {
    pub date: String,
    pub value: u64,
}

/// One terms-aggregation bucket.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregationBucket {
    pub label: String,
    pub value: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_group_deserialization() {
        let group: FilterGroup = serde_json::from_value(json!({
            "mode": "and",
            "filters": [
                { "key": "entity_type", "values": ["Malware"] },
                { "key": ["name", "description"], "operator": "match", "values": ["emotet"], "mode": "and" }
            ],
            "filterGroups": []
        }))
        .unwrap();
        assert_eq!(group.mode, FilterMode::And);
        assert_eq!(group.filters[0].key, vec!["entity_type"]);
        assert_eq!(group.filters[0].operator, FilterOperator::Eq);
        assert_eq!(group.filters[0].mode, FilterMode::Or, "values default to OR");
        assert_eq!(group.filters[1].key.len(), 2);
        assert_eq!(group.filters[1].operator, FilterOperator::Match);
    }

    #[test]
    fn empty_group_detection() {
        assert!(FilterGroup::default().is_empty());
        assert!(FilterGroup::and(vec![]).with_group(FilterGroup::or(vec![])).is_empty());
        assert!(!FilterGroup::and(vec![Filter::eq("name", vec![json!("x")])]).is_empty());
    }

    #[test]
    fn has_next_page_law() {
        for (first, offset, total) in [(10, 0, 25), (10, 10, 25), (10, 20, 25), (10, 15, 25), (5, 0, 5), (5, 0, 0)] {
            let page = PaginationResult::new(vec![], first, offset, total);
            assert_eq!(
                page.page_info.has_next_page,
                (first as u64) + offset < total,
                "first={first} offset={offset} total={total}"
            );
        }
        assert!(PaginationResult::new(vec![], 10, 10, 25).page_info.has_previous_page);
        assert!(!PaginationResult::new(vec![], 10, 0, 25).page_info.has_previous_page);
        assert!(!PaginationResult::new(vec![], 10, u64::MAX, 25).page_info.has_next_page);
    }

    #[test]
    fn operator_serialization() {
        assert_eq!(serde_json::to_string(&FilterOperator::NotNil).unwrap(), "\"not_nil\"");
        assert_eq!(FilterOperator::Gte.range_key(), Some("gte"));
        assert_eq!(FilterOperator::Eq.range_key(), None);
    }

    #[test]
    fn options_deserialize_camel_case() {
        let options: PaginateOptions = serde_json::from_value(json!({
            "first": 20,
            "orderBy": [{ "field": "created_at", "direction": "desc" }],
            "includeAuthorities": true
        }))
        .unwrap();
        assert_eq!(options.page_size(), 20);
        assert_eq!(options.order_by[0].direction, SortDirection::Desc);
        assert!(options.include_authorities);
        assert_eq!(PaginateOptions::default().page_size(), DEFAULT_PAGE_SIZE);
    }
}
