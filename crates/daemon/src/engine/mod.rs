// CRDT engine: schema-bound replicas built on yrs.

pub mod replica;
pub mod schema;

pub use replica::Replica;
pub use schema::{FieldKind, FieldSpec, Schema};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrdtError {
    #[error("{0}")]
    InvalidAttributes(String),
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    #[error("malformed state: {0}")]
    MalformedState(String),
}
