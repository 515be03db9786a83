//! Entry point for running queries and commands.

use crate::config::ContextConfig;
use crate::cqrs::session::{DatabaseSession, SqlDatabaseSession};
use crate::cqrs::statement::{Command, Query};
use crate::db::context::DatabaseContext;
use crate::error::DbResult;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs [`Query`] and [`Command`] objects against one session.
///
/// All statements share the session's open transaction until
/// [`commit_transaction`](Self::commit_transaction) or
/// [`rollback_transaction`](Self::rollback_transaction) is called.
#[derive(Debug)]
pub struct CommandQueryContext<S: DatabaseSession> {
    session: S,
}

impl<S: DatabaseSession> CommandQueryContext<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }

    pub async fn query<Q: Query + ?Sized>(&mut self, query: &Q) -> DbResult<Q::Output> {
        query.execute(&mut self.session, None).await
    }

    pub async fn query_with_cancellation<Q: Query + ?Sized>(
        &mut self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> DbResult<Q::Output> {
        query.execute(&mut self.session, Some(cancel)).await
    }

    pub async fn execute<C: Command + ?Sized>(&mut self, command: &C) -> DbResult<C::Output> {
        command.execute(&mut self.session, None).await
    }

    pub async fn execute_with_cancellation<C: Command + ?Sized>(
        &mut self,
        command: &C,
        cancel: &CancellationToken,
    ) -> DbResult<C::Output> {
        command.execute(&mut self.session, Some(cancel)).await
    }

    /// Commit everything done so far; later statements run in a new transaction.
    pub async fn commit_transaction(&mut self) -> DbResult<()> {
        self.session.commit_transaction().await
    }

    /// Discard everything done since the last commit.
    pub async fn rollback_transaction(&mut self) -> DbResult<()> {
        self.session.rollback_transaction().await
    }

    /// Duration of the last statement.
    pub fn execution_time(&self) -> Duration {
        self.session.execution_time()
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }
}

impl CommandQueryContext<SqlDatabaseSession> {
    /// Connect to the configured database and open the first transaction.
    pub async fn connect(config: ContextConfig) -> DbResult<Self> {
        let context = DatabaseContext::connect(config).await?;
        debug!(context = %context, "Command/query context ready");
        Ok(Self::new(SqlDatabaseSession::new(context)))
    }

    /// Commit pending work and close the connection.
    ///
    /// The next statement reconnects.
    pub async fn release_connection(&mut self) -> DbResult<()> {
        self.session.release_connection().await
    }

    pub fn context(&self) -> &DatabaseContext {
        self.session.context()
    }
}
