//! Query and command objects.
//!
//! - `statement`: the `Statement`, `Query` and `Command` traits
//! - `session`: the execution surface statements run against
//! - `dispatcher`: `CommandQueryContext`, the entry point for callers
//! - `blocking`: synchronous variant of the dispatcher
//! - `type_mapper`: parameter type names for validation and debugging

pub mod blocking;
pub mod dispatcher;
pub mod session;
pub mod statement;
pub mod type_mapper;

pub use blocking::BlockingCommandQueryContext;
pub use dispatcher::CommandQueryContext;
pub use session::{DatabaseSession, SqlDatabaseSession, row_into};
pub use statement::{
    Command, Query, SQL_NOT_OVERRIDDEN, Statement, StatementDisplay, execute_scalar,
    execute_statement, fetch_all, fetch_dynamic, fetch_first, require, validate,
    validate_sql,
};
