//! Queries and commands.
//!
//! A statement object pairs one SQL text with its parameters. How it is run
//! is decided by its [`Query`] or [`Command`] implementation, which usually
//! forwards to one of the free functions in this module:
//!
//! ```ignore
//! struct ArtistById { id: i64 }
//!
//! impl Statement for ArtistById {
//!     fn sql_statement(&self) -> &str {
//!         "SELECT ArtistId, Name FROM Artist WHERE ArtistId = @id"
//!     }
//!
//!     fn parameters(&self) -> Option<ParamSet> {
//!         Some(params! { id: self.id })
//!     }
//! }
//!
//! impl Query for ArtistById {
//!     type Output = Option<Artist>;
//!
//!     async fn execute<S: DatabaseSession>(
//!         &self,
//!         session: &mut S,
//!         cancel: Option<&CancellationToken>,
//!     ) -> DbResult<Self::Output> {
//!         fetch_first(session, self, cancel).await
//!     }
//! }
//! ```

use crate::cqrs::session::DatabaseSession;
use crate::cqrs::type_mapper;
use crate::db::types::JsonRow;
use crate::error::{DbError, DbResult};
use crate::models::ParamSet;
use crate::tools::format::short_sql;
use serde::de::DeserializeOwned;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// SQL returned by a statement that does not provide its own.
///
/// Running or validating it fails loudly at the database.
pub const SQL_NOT_OVERRIDDEN: &str = "SQL Statement is not overridden in inheriting class";

/// SQL text and parameters of one operation.
pub trait Statement {
    fn sql_statement(&self) -> &str {
        SQL_NOT_OVERRIDDEN
    }

    fn parameters(&self) -> Option<ParamSet> {
        None
    }

    /// The statement preceded by a `DECLARE` block of its parameter values.
    ///
    /// Meant for pasting into a database tool; never executed.
    fn real_sql_statement(&self) -> String {
        type_mapper::real_sql_statement(self.sql_statement(), self.parameters().as_ref())
    }

    fn short_sql(&self) -> String {
        short_sql(self.sql_statement())
    }
}

/// A statement that reads data.
#[allow(async_fn_in_trait)]
pub trait Query: Statement {
    type Output;

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Self::Output>;
}

/// A statement that changes data.
#[allow(async_fn_in_trait)]
pub trait Command: Statement {
    type Output;

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Self::Output>;
}

/// `Display` adapter rendering a statement as its shortened SQL.
pub struct StatementDisplay<'a, S: Statement + ?Sized>(pub &'a S);

impl<S: Statement + ?Sized> fmt::Display for StatementDisplay<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.short_sql())
    }
}

// =============================================================================
// Default executions
// =============================================================================

/// Run the statement and deserialize every row.
pub async fn fetch_all<S, St, T>(
    session: &mut S,
    statement: &St,
    cancel: Option<&CancellationToken>,
) -> DbResult<Vec<T>>
where
    S: DatabaseSession,
    St: Statement + ?Sized,
    T: DeserializeOwned,
{
    let params = statement.parameters();
    session
        .query(statement.sql_statement(), params.as_ref(), cancel)
        .await
}

/// Run the statement and deserialize the first row, if any.
pub async fn fetch_first<S, St, T>(
    session: &mut S,
    statement: &St,
    cancel: Option<&CancellationToken>,
) -> DbResult<Option<T>>
where
    S: DatabaseSession,
    St: Statement + ?Sized,
    T: DeserializeOwned,
{
    let params = statement.parameters();
    session
        .query_first(statement.sql_statement(), params.as_ref(), cancel)
        .await
}

/// Run the statement and return its rows untyped.
pub async fn fetch_dynamic<S, St>(
    session: &mut S,
    statement: &St,
    cancel: Option<&CancellationToken>,
) -> DbResult<Vec<JsonRow>>
where
    S: DatabaseSession,
    St: Statement + ?Sized,
{
    let params = statement.parameters();
    session
        .query_dynamic(statement.sql_statement(), params.as_ref(), cancel)
        .await
}

/// Run the statement as a non-query; returns the affected row count.
pub async fn execute_statement<S, St>(
    session: &mut S,
    statement: &St,
    cancel: Option<&CancellationToken>,
) -> DbResult<u64>
where
    S: DatabaseSession,
    St: Statement + ?Sized,
{
    let params = statement.parameters();
    session
        .execute(statement.sql_statement(), params.as_ref(), cancel)
        .await
}

/// Run the statement and return the first column of the first row.
pub async fn execute_scalar<S, St, T>(
    session: &mut S,
    statement: &St,
    cancel: Option<&CancellationToken>,
) -> DbResult<T>
where
    S: DatabaseSession,
    St: Statement + ?Sized,
    T: DeserializeOwned,
{
    let params = statement.parameters();
    session
        .execute_scalar(statement.sql_statement(), params.as_ref(), cancel)
        .await
}

/// Check the statement against the live schema without running it.
///
/// Calls `SELECT <validator>(@tsql, @parameterTypes)`; anything but `OK`
/// becomes [`DbError::Syntax`] carrying the message and the statement SQL.
pub async fn validate<S, St>(session: &mut S, statement: &St) -> DbResult<()>
where
    S: DatabaseSession,
    St: Statement + ?Sized,
{
    let parameter_types = type_mapper::parameter_types(statement.parameters().as_ref());
    validate_sql(session, statement.sql_statement(), parameter_types).await
}

/// [`validate`] for bare SQL text with an explicit parameter signature,
/// e.g. `@id INT,@name NVARCHAR(4000)`.
pub async fn validate_sql<S: DatabaseSession>(
    session: &mut S,
    sql: &str,
    parameter_types: Option<String>,
) -> DbResult<()> {
    let check_sql = format!("SELECT {}(@tsql, @parameterTypes)", session.validator_function());
    let params = ParamSet::new()
        .with("tsql", sql)?
        .with("parameterTypes", parameter_types)?;

    let result: Option<Option<String>> = session.query_first(&check_sql, Some(&params), None).await?;
    match result.flatten() {
        Some(message) if message == "OK" => Ok(()),
        Some(message) => {
            debug!(sql = %short_sql(sql), %message, "Statement failed validation");
            Err(DbError::syntax(message, sql))
        }
        None => Err(DbError::syntax("Validator returned no result", sql)),
    }
}

/// Guard for constructor arguments that must be present.
///
/// ```
/// use sqlx_cqrs::cqrs::require;
///
/// assert!(require(None::<i32>, "artist").is_err());
/// assert_eq!(require(Some(3), "artist").unwrap(), 3);
/// ```
pub fn require<T>(value: Option<T>, name: &str) -> DbResult<T> {
    value.ok_or_else(|| DbError::invalid_argument(format!("{} cannot be null", name)))
}
