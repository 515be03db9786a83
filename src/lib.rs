//! sqlx-cqrs
//!
//! A CQRS-style data access layer over sqlx. Application code describes each
//! database operation as a query or command object; a [`CommandQueryContext`]
//! runs them inside one managed connection and transaction, and a validator
//! routine can check every statement against the live schema without
//! executing it.

pub mod config;
pub mod cqrs;
pub mod db;
pub mod error;
pub mod models;
pub mod tools;

pub use config::ContextConfig;
pub use cqrs::{
    BlockingCommandQueryContext, Command, CommandQueryContext, DatabaseSession, Query,
    SqlDatabaseSession, Statement,
};
pub use db::DatabaseContext;
pub use error::{DbError, DbResult};
pub use models::{DynamicParameters, IsolationLevel, ParamSet};
