//! Batch validation of statement objects against a live database.
//!
//! Meant for test suites that want every query and command of an application
//! compiled by the database before release. Each statement is first run
//! through the unbounded mutation guard and then handed to the database
//! validator routine; nothing is executed.

use crate::cqrs::session::DatabaseSession;
use crate::cqrs::statement::{self, Statement};
use crate::error::{DbError, DbResult};
use crate::tools::format::short_sql;
use crate::tools::guard::check_unbounded_mutation;
use std::fmt;
use tracing::{debug, info};

/// A statement under check, labelled for the report.
pub struct NamedStatement<'a> {
    pub name: String,
    pub statement: &'a dyn Statement,
}

impl<'a> NamedStatement<'a> {
    pub fn new(name: impl Into<String>, statement: &'a dyn Statement) -> Self {
        Self {
            name: name.into(),
            statement,
        }
    }
}

/// How one statement fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Ok,
    /// The validator rejected the statement with this message.
    Syntax(String),
    /// UPDATE or DELETE without WHERE.
    UnboundedMutation(String),
    /// The check itself could not run (validator missing, connection lost...).
    Failed(String),
}

impl CheckOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    fn from_error(err: DbError) -> Self {
        match err {
            DbError::Syntax { message, .. } => Self::Syntax(message),
            DbError::UnboundedMutation { operation, .. } => {
                Self::UnboundedMutation(format!("{} statement without WHERE clause", operation))
            }
            other => Self::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatementCheck {
    pub name: String,
    pub short_sql: String,
    pub outcome: CheckOutcome,
}

/// Outcome of [`check_statements`], in input order.
#[derive(Debug, Clone, Default)]
pub struct StatementReport {
    pub checks: Vec<StatementCheck>,
}

impl StatementReport {
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &StatementCheck> {
        self.checks.iter().filter(|c| !c.outcome.is_ok())
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl fmt::Display for StatementReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            match &check.outcome {
                CheckOutcome::Ok => writeln!(f, "OK      {}", check.name)?,
                CheckOutcome::Syntax(msg) => {
                    writeln!(f, "SYNTAX  {}: {} [{}]", check.name, msg, check.short_sql)?
                }
                CheckOutcome::UnboundedMutation(msg) => {
                    writeln!(f, "UNSAFE  {}: {} [{}]", check.name, msg, check.short_sql)?
                }
                CheckOutcome::Failed(msg) => writeln!(f, "FAILED  {}: {}", check.name, msg)?,
            }
        }
        let failed = self.failures().count();
        write!(f, "{} checked, {} failed", self.checks.len(), failed)
    }
}

/// Guard check followed by database validation for one statement.
pub async fn validate_strict<S, St>(session: &mut S, statement: &St) -> DbResult<()>
where
    S: DatabaseSession,
    St: Statement + ?Sized,
{
    check_unbounded_mutation(statement.sql_statement())?;
    statement::validate(session, statement).await
}

/// Check every statement and collect the outcomes.
///
/// A failing statement does not stop the run.
pub async fn check_statements<S: DatabaseSession>(
    session: &mut S,
    statements: &[NamedStatement<'_>],
) -> StatementReport {
    let mut report = StatementReport::default();

    for named in statements {
        let outcome = match validate_strict(session, named.statement).await {
            Ok(()) => CheckOutcome::Ok,
            Err(e) => CheckOutcome::from_error(e),
        };
        debug!(statement = %named.name, ?outcome, "Statement checked");
        report.checks.push(StatementCheck {
            name: named.name.clone(),
            short_sql: short_sql(named.statement.sql_statement()),
            outcome,
        });
    }

    info!(
        checked = report.len(),
        failed = report.failures().count(),
        "Statement check complete"
    );
    report
}
