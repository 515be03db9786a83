//! Synchronous façade over [`CommandQueryContext`].
//!
//! For callers without an async runtime of their own. Each call drives the
//! asynchronous implementation to completion on a private current-thread
//! runtime, so calling from inside another runtime is refused.

use crate::config::ContextConfig;
use crate::cqrs::dispatcher::CommandQueryContext;
use crate::cqrs::session::SqlDatabaseSession;
use crate::cqrs::statement::{Command, Query};
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::warn;

pub struct BlockingCommandQueryContext {
    inner: Option<CommandQueryContext<SqlDatabaseSession>>,
    runtime: Runtime,
}

impl BlockingCommandQueryContext {
    /// Create the façade. The connection opens with the first statement.
    pub fn new(config: ContextConfig) -> DbResult<Self> {
        refuse_inside_runtime("new")?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("Failed to build runtime: {}", e)))?;
        let session = SqlDatabaseSession::from_config(config)?;
        Ok(Self {
            inner: Some(CommandQueryContext::new(session)),
            runtime,
        })
    }

    pub fn query<Q: Query + ?Sized>(&mut self, query: &Q) -> DbResult<Q::Output> {
        self.run("query", |ctx| ctx.query(query))
    }

    pub fn execute<C: Command + ?Sized>(&mut self, command: &C) -> DbResult<C::Output> {
        self.run("execute", |ctx| ctx.execute(command))
    }

    pub fn commit_transaction(&mut self) -> DbResult<()> {
        self.run("commit_transaction", |ctx| ctx.commit_transaction())
    }

    pub fn rollback_transaction(&mut self) -> DbResult<()> {
        self.run("rollback_transaction", |ctx| ctx.rollback_transaction())
    }

    /// Commit pending work and close the connection.
    pub fn release_connection(&mut self) -> DbResult<()> {
        self.run("release_connection", |ctx| ctx.release_connection())
    }

    pub fn execution_time(&self) -> Duration {
        self.inner
            .as_ref()
            .map(|ctx| ctx.execution_time())
            .unwrap_or_default()
    }

    fn run<'a, T, F, Fut>(&'a mut self, operation: &str, f: F) -> DbResult<T>
    where
        F: FnOnce(&'a mut CommandQueryContext<SqlDatabaseSession>) -> Fut,
        Fut: Future<Output = DbResult<T>> + 'a,
    {
        refuse_inside_runtime(operation)?;
        let ctx = self
            .inner
            .as_mut()
            .ok_or_else(|| DbError::internal("context already released"))?;
        self.runtime.block_on(f(ctx))
    }
}

fn refuse_inside_runtime(operation: &str) -> DbResult<()> {
    if Handle::try_current().is_ok() {
        return Err(DbError::not_implemented(format!(
            "Synchronous {} cannot run inside an async runtime; use CommandQueryContext instead",
            operation
        )));
    }
    Ok(())
}

impl Drop for BlockingCommandQueryContext {
    fn drop(&mut self) {
        let Some(mut ctx) = self.inner.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            warn!("Blocking context dropped inside an async runtime; connection is not released");
            return;
        }
        if let Err(e) = self.runtime.block_on(ctx.release_connection()) {
            warn!(error = %e, "Release on drop failed");
        }
    }
}
