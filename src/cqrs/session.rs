//! Database session.
//!
//! A session turns `(sql, parameters)` plus the result shape the caller expects
//! into one call on the [`DatabaseContext`]. Errors pass through unchanged; by
//! the time they reach the caller the context has already recovered.

use crate::config::{ContextConfig, DEFAULT_VALIDATOR_FUNCTION};
use crate::db::context::{DatabaseContext, SqlRequest};
use crate::db::executor::ResultShape;
use crate::db::types::JsonRow;
use crate::error::{DbError, DbResult};
use crate::models::{DynamicParameters, ParamSet};
use crate::tools::format::short_sql;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, trace};

/// Statement execution surface used by queries and commands.
///
/// Every call runs inside the current transaction of the underlying context.
#[allow(async_fn_in_trait)]
pub trait DatabaseSession {
    /// Run a query and deserialize every row into `T`.
    async fn query<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Vec<T>>;

    /// Run a query and deserialize the first row, if there is one.
    async fn query_first<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Option<T>>;

    /// Run a query and return the rows untyped.
    async fn query_dynamic(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Vec<JsonRow>>;

    /// Run a statement that returns no rows; returns the affected row count.
    async fn execute(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<u64>;

    /// Run a statement and return the first column of its first row.
    ///
    /// A missing row or a NULL value deserializes as JSON `null`, so use
    /// `Option<_>` for `T` when either can happen.
    async fn execute_scalar<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<T>;

    /// Commit the current transaction and start a new one.
    async fn commit_transaction(&mut self) -> DbResult<()>;

    /// Roll back the current transaction and start a new one.
    async fn rollback_transaction(&mut self) -> DbResult<()>;

    /// Duration of the last statement.
    fn execution_time(&self) -> Duration;

    /// Database function used to validate statements.
    fn validator_function(&self) -> &str {
        DEFAULT_VALIDATOR_FUNCTION
    }

    fn create_dynamic_parameters(&self) -> DynamicParameters {
        DynamicParameters::new()
    }
}

/// [`DatabaseSession`] backed by a [`DatabaseContext`].
#[derive(Debug)]
pub struct SqlDatabaseSession {
    context: DatabaseContext,
}

impl SqlDatabaseSession {
    pub fn new(context: DatabaseContext) -> Self {
        Self { context }
    }

    /// Create a session over a new, not yet connected context.
    pub fn from_config(config: ContextConfig) -> DbResult<Self> {
        Ok(Self::new(DatabaseContext::new(config)?))
    }

    pub fn context(&self) -> &DatabaseContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut DatabaseContext {
        &mut self.context
    }

    pub fn into_context(self) -> DatabaseContext {
        self.context
    }

    /// Commit pending work and close the connection.
    pub async fn release_connection(&mut self) -> DbResult<()> {
        self.context.release_connection().await
    }
}

fn log_call<T: ?Sized>(operation: &str, sql: &str) {
    // short_sql is not free; skip it when nobody listens
    if tracing::enabled!(Level::TRACE) {
        trace!(
            operation,
            sql = %short_sql(sql),
            returns = std::any::type_name::<T>(),
            "Session call"
        );
    }
}

impl DatabaseSession for SqlDatabaseSession {
    async fn query<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Vec<T>> {
        log_call::<T>("query", sql);
        let request = SqlRequest::new(sql, ResultShape::All)
            .with_params(params)
            .with_cancellation(cancel);
        self.context
            .execute_sql(request)
            .await?
            .into_rows()?
            .into_iter()
            .map(row_into)
            .collect()
    }

    async fn query_first<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Option<T>> {
        log_call::<T>("query_first", sql);
        let request = SqlRequest::new(sql, ResultShape::First)
            .with_params(params)
            .with_cancellation(cancel);
        self.context
            .execute_sql(request)
            .await?
            .into_row()?
            .map(row_into)
            .transpose()
    }

    async fn query_dynamic(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Vec<JsonRow>> {
        log_call::<JsonRow>("query_dynamic", sql);
        let request = SqlRequest::new(sql, ResultShape::All)
            .with_params(params)
            .with_cancellation(cancel);
        self.context.execute_sql(request).await?.into_rows()
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<u64> {
        log_call::<u64>("execute", sql);
        let request = SqlRequest::new(sql, ResultShape::Execute)
            .with_params(params)
            .with_cancellation(cancel);
        self.context.execute_sql(request).await?.into_affected()
    }

    async fn execute_scalar<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<T> {
        log_call::<T>("execute_scalar", sql);
        let request = SqlRequest::new(sql, ResultShape::First)
            .with_params(params)
            .with_cancellation(cancel);
        let row = self.context.execute_sql(request).await?.into_row()?;
        let value = row
            .and_then(|row| row.into_iter().next().map(|(_, value)| value))
            .unwrap_or(JsonValue::Null);
        decode_value(value)
    }

    async fn commit_transaction(&mut self) -> DbResult<()> {
        self.context.commit_transaction(false).await
    }

    async fn rollback_transaction(&mut self) -> DbResult<()> {
        self.context.rollback_transaction(false).await
    }

    fn execution_time(&self) -> Duration {
        self.context.execution_time()
    }

    fn validator_function(&self) -> &str {
        &self.context.config().validator_function
    }
}

/// Convert a decoded row into `T`.
///
/// A single-column row is first tried as the bare column value, which makes
/// `query::<i64>("SELECT COUNT(*) ...")` work, then as an object.
pub fn row_into<T: DeserializeOwned>(row: JsonRow) -> DbResult<T> {
    if row.len() == 1 {
        if let Some(value) = row.values().next() {
            if let Ok(single) = serde_json::from_value::<T>(value.clone()) {
                return Ok(single);
            }
        }
    }
    decode_value(JsonValue::Object(row))
}

fn decode_value<T: DeserializeOwned>(value: JsonValue) -> DbResult<T> {
    serde_json::from_value(value).map_err(|e| {
        DbError::decode(format!(
            "Cannot convert result into {}: {}",
            std::any::type_name::<T>(),
            e
        ))
    })
}
