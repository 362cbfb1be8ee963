//! Query/access-control compiler and mutation-cascade engine.
//!
//! Reads: filters and search are compiled together with the caller's access
//! restrictions into one backend query, and hits come back converted.
//! Writes: documents are bulk-indexed with their relationships mirrored onto
//! endpoint documents; deletes cascade to dependent relationships.

pub mod access;
pub mod bulk;
pub mod cascade;
pub mod converter;
pub mod cursor;
mod dsl;
pub mod filters;
pub mod patch;
pub mod query_builder;
pub mod runtime_sort;
pub mod search;
mod service;
pub mod settings;
pub mod types;

pub use access::{AccessRestrictions, build_access_restrictions};
pub use cascade::CascadeReport;
pub use cursor::Cursor;
pub use patch::PatchExpression;
pub use service::Engine;
pub use settings::PlatformSettings;
pub use types::{
    AggregationBucket, Edge, Filter, FilterGroup, FilterMode, FilterOperator, HistogramBucket,
    OrderBy, PageInfo, PaginateOptions, PaginationResult, SortDirection,
};
