//! Integration tests for the command/query dispatcher.
//!
//! Tests verify that:
//! - Queries and commands reach the session with their SQL and parameters
//! - Statement validation maps validator answers to results
//! - Required constructor arguments fail before any database work
//! - Batch checks flag unbounded mutations separately from syntax errors
//! - The SQL-backed and blocking dispatchers work end to end on SQLite

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use sqlx_cqrs::cqrs::{
    BlockingCommandQueryContext, Command, CommandQueryContext, DatabaseSession, Query, Statement,
    StatementDisplay, execute_statement, fetch_all, fetch_first, require, row_into, validate,
};
use sqlx_cqrs::db::JsonRow;
use sqlx_cqrs::error::{DbError, DbResult};
use sqlx_cqrs::models::{ParamSet, ParamValue};
use sqlx_cqrs::tools::statement_check::{CheckOutcome, NamedStatement, check_statements};
use sqlx_cqrs::{ContextConfig, params};
use std::collections::VecDeque;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted session
// =============================================================================

enum Reply {
    Rows(Vec<JsonRow>),
    Affected(u64),
    Fail(DbError),
}

#[derive(Debug)]
struct Call {
    sql: String,
    params: Option<ParamSet>,
    cancellable: bool,
}

/// Session answering each call with the next scripted reply.
#[derive(Default)]
struct ScriptedSession {
    replies: VecDeque<Reply>,
    calls: Vec<Call>,
    commits: usize,
    rollbacks: usize,
}

impl ScriptedSession {
    fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Self::default()
        }
    }

    fn next(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Reply> {
        self.calls.push(Call {
            sql: sql.to_string(),
            params: params.cloned(),
            cancellable: cancel.is_some(),
        });
        match self.replies.pop_front() {
            Some(Reply::Fail(e)) => Err(e),
            Some(reply) => Ok(reply),
            None => Err(DbError::internal("no scripted reply left")),
        }
    }

    fn rows(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Vec<JsonRow>> {
        match self.next(sql, params, cancel)? {
            Reply::Rows(rows) => Ok(rows),
            _ => Err(DbError::internal("scripted reply is not rows")),
        }
    }
}

impl DatabaseSession for ScriptedSession {
    async fn query<T: serde::de::DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Vec<T>> {
        self.rows(sql, params, cancel)?.into_iter().map(row_into).collect()
    }

    async fn query_first<T: serde::de::DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Option<T>> {
        self.rows(sql, params, cancel)?
            .into_iter()
            .next()
            .map(row_into)
            .transpose()
    }

    async fn query_dynamic(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Vec<JsonRow>> {
        self.rows(sql, params, cancel)
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<u64> {
        match self.next(sql, params, cancel)? {
            Reply::Affected(n) => Ok(n),
            _ => Err(DbError::internal("scripted reply is not a row count")),
        }
    }

    async fn execute_scalar<T: serde::de::DeserializeOwned>(
        &mut self,
        sql: &str,
        params: Option<&ParamSet>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<T> {
        let value = self
            .rows(sql, params, cancel)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v))
            .unwrap_or(JsonValue::Null);
        serde_json::from_value(value).map_err(|e| DbError::decode(e.to_string()))
    }

    async fn commit_transaction(&mut self) -> DbResult<()> {
        self.commits += 1;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> DbResult<()> {
        self.rollbacks += 1;
        Ok(())
    }

    fn execution_time(&self) -> Duration {
        Duration::from_millis(5)
    }
}

fn row(value: JsonValue) -> JsonRow {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

fn validator_says(message: &str) -> Reply {
    Reply::Rows(vec![row(json!({ "": message }))])
}

// =============================================================================
// Statements under test
// =============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct Artist {
    id: i64,
    name: String,
}

struct ArtistByIdQuery {
    id: i64,
}

impl Statement for ArtistByIdQuery {
    fn sql_statement(&self) -> &str {
        "SELECT id, name FROM artist WHERE id = @id"
    }

    fn parameters(&self) -> Option<ParamSet> {
        Some(params! { id: self.id })
    }
}

impl Query for ArtistByIdQuery {
    type Output = Option<Artist>;

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Self::Output> {
        fetch_first(session, self, cancel).await
    }
}

struct ArtistsQuery;

impl Statement for ArtistsQuery {
    fn sql_statement(&self) -> &str {
        "SELECT id, name FROM artist ORDER BY id"
    }
}

impl Query for ArtistsQuery {
    type Output = Vec<Artist>;

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Self::Output> {
        fetch_all(session, self, cancel).await
    }
}

struct ArtistUpdateCommand {
    artist: Artist,
}

impl ArtistUpdateCommand {
    fn new(artist: Option<Artist>) -> DbResult<Self> {
        Ok(Self {
            artist: require(artist, "artist")?,
        })
    }
}

impl Statement for ArtistUpdateCommand {
    fn sql_statement(&self) -> &str {
        "UPDATE artist SET name = @name WHERE id = @id"
    }

    fn parameters(&self) -> Option<ParamSet> {
        Some(params! { id: self.artist.id, name: self.artist.name.clone() })
    }
}

impl Command for ArtistUpdateCommand {
    type Output = u64;

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<u64> {
        execute_statement(session, self, cancel).await
    }
}

struct ArtistCreateCommand {
    name: String,
}

impl Statement for ArtistCreateCommand {
    fn sql_statement(&self) -> &str {
        "INSERT INTO artist (name) VALUES (@name)"
    }

    fn parameters(&self) -> Option<ParamSet> {
        Some(params! { name: self.name.clone() })
    }
}

impl Command for ArtistCreateCommand {
    type Output = u64;

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<u64> {
        execute_statement(session, self, cancel).await
    }
}

struct ArtistPurgeCommand;

impl Statement for ArtistPurgeCommand {
    fn sql_statement(&self) -> &str {
        "DELETE FROM artist"
    }
}

struct MisspelledQuery;

impl Statement for MisspelledQuery {
    fn sql_statement(&self) -> &str {
        "SELECT Nme FROM artist"
    }
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_query_reaches_session() {
    let session = ScriptedSession::with_replies([Reply::Rows(vec![row(
        json!({"id": 1, "name": "Queen"}),
    )])]);
    let mut ctx = CommandQueryContext::new(session);

    let artist = ctx.query(&ArtistByIdQuery { id: 1 }).await.unwrap();
    assert_eq!(
        artist,
        Some(Artist {
            id: 1,
            name: "Queen".into()
        })
    );

    let call = &ctx.session().calls[0];
    assert_eq!(call.sql, "SELECT id, name FROM artist WHERE id = @id");
    assert_eq!(call.params, Some(params! { id: 1i64 }));
    assert!(!call.cancellable);
}

#[tokio::test]
async fn test_query_with_cancellation_passes_token() {
    let session = ScriptedSession::with_replies([Reply::Rows(vec![])]);
    let mut ctx = CommandQueryContext::new(session);
    let token = CancellationToken::new();

    let artists = ctx
        .query_with_cancellation(&ArtistsQuery, &token)
        .await
        .unwrap();
    assert!(artists.is_empty());
    assert!(ctx.session().calls[0].cancellable);
}

#[tokio::test]
async fn test_command_and_transaction_passthrough() {
    let session = ScriptedSession::with_replies([Reply::Affected(1), Reply::Affected(0)]);
    let mut ctx = CommandQueryContext::new(session);
    let command = ArtistUpdateCommand::new(Some(Artist {
        id: 7,
        name: "Muse".into(),
    }))
    .unwrap();

    assert_eq!(ctx.execute(&command).await.unwrap(), 1);
    ctx.commit_transaction().await.unwrap();
    let token = CancellationToken::new();
    assert_eq!(ctx.execute_with_cancellation(&command, &token).await.unwrap(), 0);
    ctx.rollback_transaction().await.unwrap();

    assert_eq!(ctx.execution_time(), Duration::from_millis(5));
    let session = ctx.into_session();
    assert_eq!(session.commits, 1);
    assert_eq!(session.rollbacks, 1);
    assert_eq!(
        session.calls[0].params,
        Some(params! { id: 7i64, name: "Muse".to_string() })
    );
}

#[tokio::test]
async fn test_session_errors_pass_through() {
    let session = ScriptedSession::with_replies([Reply::Fail(DbError::database(
        "Invalid object name 'artist'.",
        Some("42S02".into()),
        "Check the SQL syntax and referenced objects",
    ))]);
    let mut ctx = CommandQueryContext::new(session);

    let err = ctx.query(&ArtistsQuery).await.unwrap_err();
    assert!(matches!(err, DbError::Database { ref sql_state, .. } if sql_state.as_deref() == Some("42S02")));
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_validate_ok() {
    let mut session = ScriptedSession::with_replies([validator_says("OK")]);

    validate(&mut session, &ArtistByIdQuery { id: 1 }).await.unwrap();

    let call = &session.calls[0];
    assert_eq!(call.sql, "SELECT dbo.CheckSql(@tsql, @parameterTypes)");
    let params = call.params.as_ref().unwrap();
    assert_eq!(
        params.get("tsql").and_then(|p| p.value.clone()),
        Some(ParamValue::Text(
            "SELECT id, name FROM artist WHERE id = @id".into()
        ))
    );
    assert_eq!(
        params.get("parameterTypes").and_then(|p| p.value.clone()),
        Some(ParamValue::Text("@id BIGINT".into()))
    );
}

#[tokio::test]
async fn test_validate_without_parameters_sends_null_signature() {
    let mut session = ScriptedSession::with_replies([validator_says("OK")]);

    validate(&mut session, &ArtistsQuery).await.unwrap();

    let params = session.calls[0].params.as_ref().unwrap();
    let signature = params.get("parameterTypes").unwrap();
    assert!(signature.nullable);
    assert_eq!(signature.value, None);
}

#[tokio::test]
async fn test_validate_reports_syntax_error_with_sql() {
    let mut session =
        ScriptedSession::with_replies([validator_says("Invalid column name 'Nme'.")]);

    let err = validate(&mut session, &MisspelledQuery).await.unwrap_err();

    assert!(matches!(err, DbError::Syntax { .. }));
    assert!(err.to_string().contains("Invalid column name 'Nme'."));
    assert_eq!(err.sql(), Some("SELECT Nme FROM artist"));
}

#[tokio::test]
async fn test_validate_without_answer_is_syntax_error() {
    let mut session = ScriptedSession::with_replies([Reply::Rows(vec![])]);

    let err = validate(&mut session, &ArtistsQuery).await.unwrap_err();
    assert!(matches!(err, DbError::Syntax { .. }));
}

// =============================================================================
// Scenarios
// =============================================================================

struct UpdateField;

impl Statement for UpdateField {
    fn sql_statement(&self) -> &str {
        "UPDATE Table SET Fld = @val"
    }

    fn parameters(&self) -> Option<ParamSet> {
        Some(params! { val: 12 })
    }
}

#[test]
fn test_statement_renderings_for_debugging() {
    let statement = UpdateField;
    assert_eq!(statement.sql_statement(), "UPDATE Table SET Fld = @val");
    assert_eq!(statement.parameters(), Some(params! { val: 12 }));
    assert_eq!(
        statement.real_sql_statement().replace(['\r', '\n'], ""),
        "DECLARE @val INT = 12;UPDATE Table SET Fld = @val"
    );
    assert_eq!(
        StatementDisplay(&statement).to_string(),
        "UPDATE Table SET Fld = @val"
    );
}

#[test]
fn test_missing_required_argument_fails_in_constructor() {
    let err = ArtistUpdateCommand::new(None).err().unwrap();
    assert!(matches!(err, DbError::InvalidArgument { .. }));
    assert!(err.to_string().contains("artist cannot be null"));
}

#[tokio::test]
async fn test_statement_check_flags_unbounded_mutation() {
    let mut session = ScriptedSession::with_replies([
        validator_says("OK"),
        validator_says("Invalid column name 'Nme'."),
        Reply::Fail(DbError::database(
            "Cannot find either column \"dbo\" or the user-defined function \"dbo.CheckSql\".",
            None,
            "Install the validator function",
        )),
    ]);
    let by_id = ArtistByIdQuery { id: 1 };
    let statements = [
        NamedStatement::new("ArtistByIdQuery", &by_id),
        NamedStatement::new("ArtistPurgeCommand", &ArtistPurgeCommand),
        NamedStatement::new("MisspelledQuery", &MisspelledQuery),
        NamedStatement::new("ArtistsQuery", &ArtistsQuery),
    ];

    let report = check_statements(&mut session, &statements).await;

    let outcomes: Vec<&CheckOutcome> = report.checks.iter().map(|c| &c.outcome).collect();
    assert_eq!(outcomes[0], &CheckOutcome::Ok);
    assert!(matches!(outcomes[1], CheckOutcome::UnboundedMutation(_)));
    assert_eq!(
        outcomes[2],
        &CheckOutcome::Syntax("Invalid column name 'Nme'.".into())
    );
    assert!(matches!(outcomes[3], CheckOutcome::Failed(_)));
    assert!(!report.is_ok());
    assert_eq!(report.failures().count(), 3);

    // The unbounded DELETE never reached the validator
    assert_eq!(session.calls.len(), 3);
}

// =============================================================================
// SQLite end to end
// =============================================================================

fn sqlite_config(dir: &TempDir) -> ContextConfig {
    let path = dir.path().join("chinook.db");
    ContextConfig::new(format!("sqlite:{}?mode=rwc", path.display())).unwrap()
}

struct CreateArtistTable;

impl Statement for CreateArtistTable {
    fn sql_statement(&self) -> &str {
        "CREATE TABLE artist (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"
    }
}

impl Command for CreateArtistTable {
    type Output = ();

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<()> {
        execute_statement(session, self, cancel).await.map(|_| ())
    }
}

#[tokio::test]
async fn test_sqlite_dispatcher_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut ctx = CommandQueryContext::connect(sqlite_config(&dir)).await.unwrap();
    assert!(ctx.context().is_open());

    ctx.execute(&CreateArtistTable).await.unwrap();
    for name in ["Queen", "Muse"] {
        let created = ctx
            .execute(&ArtistCreateCommand { name: name.into() })
            .await
            .unwrap();
        assert_eq!(created, 1);
    }
    ctx.commit_transaction().await.unwrap();

    let updated = ctx
        .execute(
            &ArtistUpdateCommand::new(Some(Artist {
                id: 2,
                name: "Placebo".into(),
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);
    ctx.rollback_transaction().await.unwrap();

    let artists = ctx.query(&ArtistsQuery).await.unwrap();
    assert_eq!(
        artists.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        vec!["Queen", "Muse"]
    );
    assert_eq!(
        ctx.query(&ArtistByIdQuery { id: 2 }).await.unwrap().map(|a| a.name),
        Some("Muse".to_string())
    );
    assert!(ctx.execution_time() > Duration::ZERO);

    ctx.release_connection().await.unwrap();
    assert!(!ctx.context().is_open());
}

#[test]
fn test_blocking_dispatcher_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut ctx = BlockingCommandQueryContext::new(sqlite_config(&dir)).unwrap();

    ctx.execute(&CreateArtistTable).unwrap();
    ctx.execute(&ArtistCreateCommand {
        name: "Queen".into(),
    })
    .unwrap();
    ctx.commit_transaction().unwrap();

    let artist = ctx.query(&ArtistByIdQuery { id: 1 }).unwrap();
    assert_eq!(artist.map(|a| a.name), Some("Queen".to_string()));
    ctx.release_connection().unwrap();
}
