//! Data models shared by the execution core and its callers.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{ConnectionKey, DialectKind};
pub use query::{
    DEFAULT_DECIMAL_PRECISION, DEFAULT_DECIMAL_SCALE, Parameter, QueryDescriptor, QueryKind,
    QueryOptions, QueryOutput, QueryParam, QueryParams, ResultSet, Row, UpsertAction, WireType,
};
pub use schema::{
    ColumnDescription, ForeignKeyRef, IndexDescription, ModelDescriptor, TableRef, UniqueKey,
};
