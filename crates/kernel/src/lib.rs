//! Kestrel kernel library.
//!
//! Query/access-control compiler and mutation-cascade engine over a
//! document-search backend. The `kestrel` binary serves it over HTTP.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod routes;
pub mod schema;
pub mod state;
