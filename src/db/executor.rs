//! Statement execution on a single connection.
//!
//! Every statement is run in one of three shapes: all rows, the first row, or
//! a non-query returning the affected row count. Rows are decoded to
//! [`JsonRow`]s here; turning them into caller types happens in the session.
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific execution
//! - `postgres`: PostgreSQL-specific execution
//! - `sqlite`: SQLite-specific execution
//!
//! Each submodule provides identical functionality adapted to the database's type system.
//! Timeouts and cancellation are applied one level up, by the context.

use crate::db::connection::DbConnection;
use crate::db::params::{PreparedSql, rewrite_placeholders};
use crate::db::types::{JsonRow, RowToJson};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ParamSet};
use futures_util::TryStreamExt;
use tracing::debug;

/// What the caller wants back from a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Every row.
    All,
    /// The first row, if any.
    First,
    /// Affected row count.
    Execute,
}

impl ResultShape {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::All => "query execution",
            Self::First => "single row query",
            Self::Execute => "command execution",
        }
    }
}

/// Result of a statement, matching the requested [`ResultShape`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlOutcome {
    Rows(Vec<JsonRow>),
    Row(Option<JsonRow>),
    Affected(u64),
}

impl SqlOutcome {
    pub fn into_rows(self) -> DbResult<Vec<JsonRow>> {
        match self {
            Self::Rows(rows) => Ok(rows),
            Self::Row(row) => Ok(row.into_iter().collect()),
            Self::Affected(_) => Err(DbError::internal("statement returned no result set")),
        }
    }

    pub fn into_row(self) -> DbResult<Option<JsonRow>> {
        match self {
            Self::Row(row) => Ok(row),
            Self::Rows(rows) => Ok(rows.into_iter().next()),
            Self::Affected(_) => Err(DbError::internal("statement returned no result set")),
        }
    }

    pub fn into_affected(self) -> DbResult<u64> {
        match self {
            Self::Affected(count) => Ok(count),
            _ => Err(DbError::internal("statement returned rows instead of a count")),
        }
    }
}

/// Run one statement on `conn`.
pub(crate) async fn run_statement(
    conn: &mut DbConnection,
    sql: &str,
    params: Option<&ParamSet>,
    shape: ResultShape,
) -> DbResult<SqlOutcome> {
    let prepared = prepare(sql, params, conn.db_type());

    debug!(
        db_type = %conn.db_type(),
        bindings = prepared.as_ref().map(|(p, _)| p.bindings.len()).unwrap_or(0),
        shape = ?shape,
        "Executing statement"
    );

    match conn {
        DbConnection::MySql(c) => mysql::run(c, sql, prepared, shape).await,
        DbConnection::Postgres(c) => postgres::run(c, sql, prepared, shape).await,
        DbConnection::SQLite(c) => sqlite::run(c, sql, prepared, shape).await,
    }
}

/// Rewrite the statement when it references parameters.
///
/// `None` means the statement binds nothing and can go out as raw SQL.
fn prepare<'p>(
    sql: &str,
    params: Option<&'p ParamSet>,
    db_type: DatabaseType,
) -> Option<(PreparedSql, &'p ParamSet)> {
    let params = params.filter(|p| !p.is_empty())?;
    let prepared = rewrite_placeholders(sql, params, db_type);
    if prepared.bindings.is_empty() {
        None
    } else {
        Some((prepared, params))
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use sqlx::MySqlConnection;

    pub async fn run(
        conn: &mut MySqlConnection,
        sql: &str,
        prepared: Option<(PreparedSql, &ParamSet)>,
        shape: ResultShape,
    ) -> DbResult<SqlOutcome> {
        // Without bindings, use raw SQL to avoid prepared statement issues
        // (some SQL like CREATE PROCEDURE doesn't support prepared statements)
        let Some((prepared, params)) = prepared else {
            use sqlx::Executor;
            return match shape {
                ResultShape::All => {
                    let rows: Vec<JsonRow> = (&mut *conn)
                        .fetch(sql)
                        .map_ok(|r| r.to_json_map())
                        .try_collect()
                        .await?;
                    Ok(SqlOutcome::Rows(rows))
                }
                ResultShape::First => {
                    let row = (&mut *conn).fetch_optional(sql).await?;
                    Ok(SqlOutcome::Row(row.map(|r| r.to_json_map())))
                }
                ResultShape::Execute => {
                    let result = (&mut *conn).execute(sql).await?;
                    Ok(SqlOutcome::Affected(result.rows_affected()))
                }
            };
        };

        let mut query = sqlx::query(&prepared.sql);
        for &index in &prepared.bindings {
            query = bind_mysql_param(query, &params.as_slice()[index])?;
        }

        match shape {
            ResultShape::All => {
                let rows: Vec<JsonRow> = query
                    .fetch(&mut *conn)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?;
                Ok(SqlOutcome::Rows(rows))
            }
            ResultShape::First => {
                let row = query.fetch_optional(&mut *conn).await?;
                Ok(SqlOutcome::Row(row.map(|r| r.to_json_map())))
            }
            ResultShape::Execute => {
                let result = query.execute(&mut *conn).await?;
                Ok(SqlOutcome::Affected(result.rows_affected()))
            }
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use sqlx::PgConnection;

    pub async fn run(
        conn: &mut PgConnection,
        sql: &str,
        prepared: Option<(PreparedSql, &ParamSet)>,
        shape: ResultShape,
    ) -> DbResult<SqlOutcome> {
        let Some((prepared, params)) = prepared else {
            use sqlx::Executor;
            return match shape {
                ResultShape::All => {
                    let rows: Vec<JsonRow> = (&mut *conn)
                        .fetch(sql)
                        .map_ok(|r| r.to_json_map())
                        .try_collect()
                        .await?;
                    Ok(SqlOutcome::Rows(rows))
                }
                ResultShape::First => {
                    let row = (&mut *conn).fetch_optional(sql).await?;
                    Ok(SqlOutcome::Row(row.map(|r| r.to_json_map())))
                }
                ResultShape::Execute => {
                    let result = (&mut *conn).execute(sql).await?;
                    Ok(SqlOutcome::Affected(result.rows_affected()))
                }
            };
        };

        let mut query = sqlx::query(&prepared.sql);
        for &index in &prepared.bindings {
            query = bind_postgres_param(query, &params.as_slice()[index])?;
        }

        match shape {
            ResultShape::All => {
                let rows: Vec<JsonRow> = query
                    .fetch(&mut *conn)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?;
                Ok(SqlOutcome::Rows(rows))
            }
            ResultShape::First => {
                let row = query.fetch_optional(&mut *conn).await?;
                Ok(SqlOutcome::Row(row.map(|r| r.to_json_map())))
            }
            ResultShape::Execute => {
                let result = query.execute(&mut *conn).await?;
                Ok(SqlOutcome::Affected(result.rows_affected()))
            }
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use sqlx::SqliteConnection;

    pub async fn run(
        conn: &mut SqliteConnection,
        sql: &str,
        prepared: Option<(PreparedSql, &ParamSet)>,
        shape: ResultShape,
    ) -> DbResult<SqlOutcome> {
        let Some((prepared, params)) = prepared else {
            use sqlx::Executor;
            return match shape {
                ResultShape::All => {
                    let rows: Vec<JsonRow> = (&mut *conn)
                        .fetch(sql)
                        .map_ok(|r| r.to_json_map())
                        .try_collect()
                        .await?;
                    Ok(SqlOutcome::Rows(rows))
                }
                ResultShape::First => {
                    let row = (&mut *conn).fetch_optional(sql).await?;
                    Ok(SqlOutcome::Row(row.map(|r| r.to_json_map())))
                }
                ResultShape::Execute => {
                    let result = (&mut *conn).execute(sql).await?;
                    Ok(SqlOutcome::Affected(result.rows_affected()))
                }
            };
        };

        let mut query = sqlx::query(&prepared.sql);
        for &index in &prepared.bindings {
            query = bind_sqlite_param(query, &params.as_slice()[index])?;
        }

        match shape {
            ResultShape::All => {
                let rows: Vec<JsonRow> = query
                    .fetch(&mut *conn)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?;
                Ok(SqlOutcome::Rows(rows))
            }
            ResultShape::First => {
                let row = query.fetch_optional(&mut *conn).await?;
                Ok(SqlOutcome::Row(row.map(|r| r.to_json_map())))
            }
            ResultShape::Execute => {
                let result = query.execute(&mut *conn).await?;
                Ok(SqlOutcome::Affected(result.rows_affected()))
            }
        }
    }
}
