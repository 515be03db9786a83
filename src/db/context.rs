//! Connection and transaction lifecycle of one unit of work.
//!
//! A [`DatabaseContext`] owns at most one connection and at most one open
//! transaction on it. Both are created on demand by [`DatabaseContext::begin`]
//! (and therefore by every statement), kept for the whole unit of work, and
//! torn down by [`DatabaseContext::release_connection`], which commits
//! whatever is still pending.
//!
//! A statement that fails on the server rolls the transaction back and opens
//! a fresh one on the same connection before the error is handed back, so one
//! bad statement never leaves the context unusable. Work done earlier in the
//! rolled-back transaction is lost.
//!
//! All operations take `&mut self`: a context cannot be used by two tasks at
//! the same time.

use crate::config::ContextConfig;
use crate::db::connection::DbConnection;
use crate::db::executor::{ResultShape, SqlOutcome, run_statement};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ParamSet, TransactionHandle};
use crate::tools::format::human_duration;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long the rollback after a timed-out or cancelled statement may take.
///
/// The abandoned statement can still be running on the server and the
/// rollback queues behind it; past this limit the connection is dropped
/// instead and the server rolls back when the session ends.
const ABANDONED_ROLLBACK_LIMIT: Duration = Duration::from_secs(1);

/// One statement to run through [`DatabaseContext::execute_sql`].
#[derive(Debug, Clone, Copy)]
pub struct SqlRequest<'a> {
    pub sql: &'a str,
    pub params: Option<&'a ParamSet>,
    pub shape: ResultShape,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> SqlRequest<'a> {
    pub fn new(sql: &'a str, shape: ResultShape) -> Self {
        Self {
            sql,
            params: None,
            shape,
            cancel: None,
        }
    }

    pub fn with_params(mut self, params: Option<&'a ParamSet>) -> Self {
        self.params = params;
        self
    }

    pub fn with_cancellation(mut self, cancel: Option<&'a CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug)]
struct OpenConnection {
    id: String,
    inner: DbConnection,
    opened_at: Instant,
}

/// Connection and transaction manager for one unit of work.
#[derive(Debug)]
pub struct DatabaseContext {
    config: ContextConfig,
    db_type: DatabaseType,
    connection: Option<OpenConnection>,
    transaction: Option<TransactionHandle>,
    execution_time: Duration,
}

impl DatabaseContext {
    /// Create a context. No connection is opened until the first statement.
    ///
    /// Fails with a configuration error when the connection string is blank
    /// or names an unsupported database.
    pub fn new(config: ContextConfig) -> DbResult<Self> {
        config.validate()?;
        let db_type = config.database_type()?;
        Ok(Self {
            config,
            db_type,
            connection: None,
            transaction: None,
            execution_time: Duration::ZERO,
        })
    }

    /// Create a context and open its connection and first transaction.
    pub async fn connect(config: ContextConfig) -> DbResult<Self> {
        let mut context = Self::new(config)?;
        context.begin().await?;
        Ok(context)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Make sure a connection and a transaction are open and return the transaction.
    pub async fn begin(&mut self) -> DbResult<&TransactionHandle> {
        self.ensure_connection().await?;
        if self.transaction.is_none() {
            self.open_transaction().await?;
        }
        self.transaction
            .as_ref()
            .ok_or_else(|| DbError::internal("transaction missing after begin"))
    }

    /// Run one statement inside the current transaction.
    ///
    /// The elapsed time is stored for [`DatabaseContext::execution_time`].
    /// When the statement fails on the server, times out or is cancelled, the
    /// transaction is rolled back and replaced before the error is returned.
    pub async fn execute_sql(&mut self, request: SqlRequest<'_>) -> DbResult<SqlOutcome> {
        let operation = request.shape.operation();
        if request.cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(DbError::cancelled(operation));
        }

        self.begin().await?;
        let limit = self.config.command_timeout();
        trace!(operation, "Attempting to execute SQL statement");

        let start = Instant::now();
        let result = match self.connection.as_mut() {
            Some(conn) => run_bounded(&mut conn.inner, &request, limit).await,
            None => Err(DbError::internal("connection missing after begin")),
        };
        self.execution_time = start.elapsed();

        match result {
            Ok(outcome) => {
                debug!(
                    elapsed = %human_duration(self.execution_time),
                    "SQL statement executed"
                );
                Ok(outcome)
            }
            Err(error) => {
                self.recover_after_failure(&error).await;
                Err(error)
            }
        }
    }

    /// Commit the current transaction.
    ///
    /// Unless `is_final` is set, a replacement transaction is opened right away.
    /// Without a current transaction this does nothing.
    pub async fn commit_transaction(&mut self, is_final: bool) -> DbResult<()> {
        let Some(handle) = self.transaction.take() else {
            trace!("No SQL transaction to commit");
            return Ok(());
        };
        let Some(conn) = self.connection.as_mut() else {
            trace!(transaction_id = %handle.id, "SQL transaction has no open connection to commit on");
            return Ok(());
        };

        let start = Instant::now();
        if let Err(e) = conn.inner.commit().await {
            if let Err(rollback_error) = conn.inner.rollback().await {
                warn!(transaction_id = %handle.id, error = %rollback_error, "Rollback after failed commit did not succeed");
            }
            return Err(DbError::transaction(
                format!("Commit failed: {}", e),
                handle.id,
            ));
        }
        debug!(
            transaction_id = %handle.id,
            elapsed = %human_duration(start.elapsed()),
            "Explicit transaction commit"
        );

        if !is_final {
            self.begin().await?;
        }
        Ok(())
    }

    /// Roll back the current transaction.
    ///
    /// Unless `is_final` is set, a replacement transaction is opened right away.
    /// Without a current transaction this does nothing.
    pub async fn rollback_transaction(&mut self, is_final: bool) -> DbResult<()> {
        let Some(handle) = self.transaction.take() else {
            trace!("No SQL transaction to roll back");
            return Ok(());
        };
        let Some(conn) = self.connection.as_mut() else {
            trace!(transaction_id = %handle.id, "SQL transaction has no open connection to roll back on");
            return Ok(());
        };

        if let Err(e) = conn.inner.rollback().await {
            return Err(DbError::transaction(
                format!("Rollback failed: {}", e),
                handle.id,
            ));
        }
        trace!(transaction_id = %handle.id, "Explicit transaction rollback");

        if !is_final {
            self.begin().await?;
        }
        Ok(())
    }

    /// Commit any pending transaction and close the connection.
    ///
    /// Safe to call repeatedly; calls after the first find nothing to do. The
    /// connection is closed even when the commit fails, and the commit error
    /// is returned afterwards.
    pub async fn release_connection(&mut self) -> DbResult<()> {
        let mut outcome = Ok(());

        match (self.transaction.take(), self.connection.as_mut()) {
            (Some(handle), Some(conn)) => {
                trace!(
                    transaction_id = %handle.id,
                    "SQL transaction commit in release (business operation complete)"
                );
                if let Err(e) = conn.inner.commit().await {
                    if let Err(rollback_error) = conn.inner.rollback().await {
                        warn!(transaction_id = %handle.id, error = %rollback_error, "Rollback after failed commit on release did not succeed");
                    }
                    outcome = Err(DbError::transaction(
                        format!("Commit on release failed: {}", e),
                        handle.id,
                    ));
                }
            }
            (Some(handle), None) => {
                trace!(transaction_id = %handle.id, "SQL transaction is already completed in release");
            }
            (None, _) => trace!("SQL transaction is already closed in release"),
        }

        match self.connection.take() {
            Some(conn) => {
                let id = conn.id.clone();
                let lifetime = conn.opened_at.elapsed();
                if let Err(e) = conn.inner.close().await {
                    warn!(connection_id = %id, error = %e, "Connection did not close cleanly");
                }
                debug!(
                    connection_id = %id,
                    lifetime = %human_duration(lifetime),
                    "Connection closed (release)"
                );
            }
            None => trace!("SQL connection is already closed in release"),
        }

        outcome
    }

    /// Release the connection and consume the context.
    pub async fn close(mut self) -> DbResult<()> {
        self.release_connection().await
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.id.as_str())
    }

    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction.as_ref().map(|t| t.id.as_str())
    }

    /// Duration of the last statement run through this context.
    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn ensure_connection(&mut self) -> DbResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let start = Instant::now();
        let inner = DbConnection::connect(&self.config).await?;
        let id = format!("conn_{}", uuid::Uuid::new_v4().simple());
        info!(
            connection_id = %id,
            db_type = %self.db_type,
            data_source = %self.config.data_source(),
            elapsed = %human_duration(start.elapsed()),
            "Connection opened"
        );
        self.connection = Some(OpenConnection {
            id,
            inner,
            opened_at: Instant::now(),
        });
        Ok(())
    }

    async fn open_transaction(&mut self) -> DbResult<()> {
        let isolation = self.config.isolation_level;
        let Some(conn) = self.connection.as_mut() else {
            return Err(DbError::internal("no open connection to begin a transaction on"));
        };

        if let Err(e) = conn.inner.begin(isolation).await {
            let error = DbError::transaction(format!("Failed to begin transaction: {}", e), "none");
            if matches!(e, DbError::Connection { .. }) {
                self.discard_connection();
            }
            return Err(error);
        }

        let handle = TransactionHandle::new(conn.id.as_str(), isolation);
        trace!(
            transaction_id = %handle.id,
            connection_id = %conn.id,
            isolation = %isolation,
            "Created new SQL transaction"
        );
        self.transaction = Some(handle);
        Ok(())
    }

    /// Put the context back into a usable state after `error`.
    ///
    /// Never fails: problems during recovery are logged and the original
    /// error is what the caller sees.
    async fn recover_after_failure(&mut self, error: &DbError) {
        if matches!(error, DbError::Connection { .. }) {
            warn!(error = %error, "Connection failed, discarding it");
            self.discard_connection();
            return;
        }
        if !error.triggers_rollback() {
            return;
        }
        let Some(handle) = self.transaction.take() else {
            return;
        };
        let Some(conn) = self.connection.as_mut() else {
            return;
        };

        debug!(
            transaction_id = %handle.id,
            error = %error,
            "SQL transaction rollback due to failed statement"
        );
        let rollback = if error.is_abandoned() {
            let attempt = timeout(ABANDONED_ROLLBACK_LIMIT, conn.inner.rollback()).await;
            match attempt {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        transaction_id = %handle.id,
                        "Abandoned statement is still running, discarding the connection"
                    );
                    self.discard_connection();
                    return;
                }
            }
        } else {
            conn.inner.rollback().await
        };
        if let Err(e) = rollback {
            if conn.inner.ping().await.is_err() {
                warn!(error = %e, "Rollback failed and connection is gone, discarding it");
                self.discard_connection();
                return;
            }
            warn!(error = %e, "Rollback after failed statement did not succeed");
        }

        if let Err(e) = self.open_transaction().await {
            warn!(error = %e, "Could not open a replacement transaction");
            self.discard_connection();
        }
    }

    fn discard_connection(&mut self) {
        self.transaction = None;
        if let Some(conn) = self.connection.take() {
            debug!(connection_id = %conn.id, "Connection discarded");
        }
    }

    fn take_for_finalize(&mut self) -> Option<(OpenConnection, Option<TransactionHandle>)> {
        let conn = self.connection.take()?;
        Some((conn, self.transaction.take()))
    }
}

/// Run the statement under the command timeout and the cancellation token.
async fn run_bounded(
    conn: &mut DbConnection,
    request: &SqlRequest<'_>,
    limit: Option<Duration>,
) -> DbResult<SqlOutcome> {
    let operation = request.shape.operation();
    let statement = run_statement(conn, request.sql, request.params, request.shape);
    let bounded = async {
        match limit {
            Some(limit) => match timeout(limit, statement).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(operation, limit.as_secs())),
            },
            None => statement.await,
        }
    };

    match request.cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(DbError::cancelled(operation)),
            result = bounded => result,
        },
        None => bounded.await,
    }
}

/// Commit and close what a dropped context still holds.
async fn finalize(mut conn: OpenConnection, transaction: Option<TransactionHandle>) {
    if let Some(handle) = transaction {
        match conn.inner.commit().await {
            Ok(()) => debug!(transaction_id = %handle.id, "Transaction committed on drop"),
            Err(e) => warn!(transaction_id = %handle.id, error = %e, "Commit on drop failed"),
        }
    }
    if let Err(e) = conn.inner.close().await {
        warn!(connection_id = %conn.id, error = %e, "Connection did not close cleanly on drop");
    }
}

impl Drop for DatabaseContext {
    fn drop(&mut self) {
        let Some((conn, transaction)) = self.take_for_finalize() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(
                    connection_id = %conn.id,
                    "Context dropped without release, finishing in background"
                );
                handle.spawn(finalize(conn, transaction));
            }
            Err(_) => warn!(
                connection_id = %conn.id,
                "Context dropped outside a runtime; pending transaction is rolled back by the server"
            ),
        }
    }
}

impl fmt::Display for DatabaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.connection {
            Some(conn) => write!(
                f,
                "Connection: {} (OPEN) to {} on {}; ",
                conn.id,
                self.config.data_source(),
                self.db_type
            )?,
            None => f.write_str("Connection not open")?,
        }
        if let Some(transaction) = &self.transaction {
            write!(f, "Transaction: {}; ", transaction.id)?;
        }
        Ok(())
    }
}
