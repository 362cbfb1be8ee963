//! Document and access models.

pub mod access;
pub mod document;

pub use access::{AccessContext, MarkingRef};
pub use document::{
    Connection, Document, Inference, InferredAttribute, RelationshipEnds, Side, rel_field,
};
