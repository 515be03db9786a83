//! Database layer.
//!
//! This module provides database access functionality:
//! - Single-connection lifecycle with one open transaction (`context`)
//! - Statement execution and result shapes
//! - Named placeholder rewriting and parameter binding
//! - Row decoding into JSON maps
//! - Schema introspection statements
//! - Database dispatch macros for reducing code duplication

pub mod connection;
pub mod context;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod schema;
pub mod types;

pub use connection::DbConnection;
pub use context::{DatabaseContext, SqlRequest};
pub use executor::{ResultShape, SqlOutcome};
pub use schema::{
    ColumnMetadata, ColumnsMetadataQuery, FunctionExistsQuery, StoredProcedureExistsQuery,
    TableOrViewExistsQuery, ValidatorFunctionCreateCommand,
};
pub use types::JsonRow;
