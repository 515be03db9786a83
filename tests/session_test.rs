//! Integration tests for the SQL-backed session.
//!
//! Tests verify that:
//! - Every result shape (all rows, first row, untyped rows, affected count, scalar) works
//! - Decode errors surface without rolling back the transaction
//! - Introspection statements and contract comparison work on SQLite

use serde::Deserialize;
use sqlx_cqrs::cqrs::{DatabaseSession, Query, SqlDatabaseSession};
use sqlx_cqrs::db::{ColumnsMetadataQuery, FunctionExistsQuery, TableOrViewExistsQuery};
use sqlx_cqrs::error::DbError;
use sqlx_cqrs::models::DatabaseType;
use sqlx_cqrs::tools::contract::{ContractField, compare_database_with_contract};
use sqlx_cqrs::{ContextConfig, params};
use std::collections::HashSet;
use tempfile::TempDir;

#[derive(Debug, Deserialize, PartialEq)]
struct Artist {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Invoice {
    total: f64,
}

/// Create a SQLite database file with two artists.
async fn setup_session() -> (TempDir, SqlDatabaseSession) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chinook.db");
    let config = ContextConfig::new(format!("sqlite:{}?mode=rwc", path.display()))
        .unwrap()
        .with_validator_function("qa.CheckSql");

    let mut session = SqlDatabaseSession::from_config(config).unwrap();
    session
        .execute(
            "CREATE TABLE artist (id INTEGER PRIMARY KEY, name TEXT NOT NULL, country TEXT DEFAULT 'UK')",
            None,
            None,
        )
        .await
        .unwrap();
    for name in ["Queen", "Muse"] {
        let params = params! { name: name };
        session
            .execute("INSERT INTO artist (name) VALUES (@name)", Some(&params), None)
            .await
            .unwrap();
    }
    session.commit_transaction().await.unwrap();

    (dir, session)
}

// =============================================================================
// Result shapes
// =============================================================================

#[tokio::test]
async fn test_query_all_rows() {
    let (_dir, mut session) = setup_session().await;

    let artists: Vec<Artist> = session
        .query("SELECT id, name FROM artist ORDER BY id", None, None)
        .await
        .unwrap();

    assert_eq!(
        artists,
        vec![
            Artist { id: 1, name: "Queen".into() },
            Artist { id: 2, name: "Muse".into() },
        ]
    );
    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_query_first_with_and_without_match() {
    let (_dir, mut session) = setup_session().await;

    let params = params! { id: 2i64 };
    let artist: Option<Artist> = session
        .query_first("SELECT id, name FROM artist WHERE id = @id", Some(&params), None)
        .await
        .unwrap();
    assert_eq!(artist.map(|a| a.name), Some("Muse".to_string()));

    let params = params! { id: 99i64 };
    let artist: Option<Artist> = session
        .query_first("SELECT id, name FROM artist WHERE id = @id", Some(&params), None)
        .await
        .unwrap();
    assert_eq!(artist, None);

    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_query_dynamic_keeps_column_order() {
    let (_dir, mut session) = setup_session().await;

    let rows = session
        .query_dynamic("SELECT name, id, country FROM artist ORDER BY id", None, None)
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    let columns: Vec<&str> = rows[0].keys().map(String::as_str).collect();
    assert_eq!(columns, vec!["name", "id", "country"]);
    assert_eq!(rows[0]["name"], "Queen");
    assert_eq!(rows[0]["country"], "UK");

    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_execute_returns_affected_rows() {
    let (_dir, mut session) = setup_session().await;

    let params = params! { country: "GB" };
    let affected = session
        .execute(
            "UPDATE artist SET country = @country WHERE country = 'UK'",
            Some(&params),
            None,
        )
        .await
        .unwrap();
    assert_eq!(affected, 2);

    session.rollback_transaction().await.unwrap();
    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_execute_scalar() {
    let (_dir, mut session) = setup_session().await;

    let count: i64 = session
        .execute_scalar("SELECT COUNT(*) FROM artist", None, None)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let name: Option<String> = session
        .execute_scalar("SELECT name FROM artist WHERE id = 42", None, None)
        .await
        .unwrap();
    assert_eq!(name, None);

    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_repeated_parameter() {
    let (_dir, mut session) = setup_session().await;

    let params = params! { name: "Queen" };
    let ids: Vec<i64> = session
        .query(
            "SELECT id FROM artist WHERE name = @name OR 'x' || name = 'x' || @name",
            Some(&params),
            None,
        )
        .await
        .unwrap();
    assert_eq!(ids, vec![1]);

    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_dynamic_parameters() {
    let (_dir, mut session) = setup_session().await;

    let mut dynamic = session.create_dynamic_parameters();
    dynamic.add("@name", "Muse").unwrap();
    let id: Option<i64> = session
        .execute_scalar(
            "SELECT id FROM artist WHERE name = @name",
            Some(dynamic.as_param_set()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(id, Some(2));

    session.release_connection().await.unwrap();
}

// =============================================================================
// Error handling
// =============================================================================

#[tokio::test]
async fn test_decode_error_keeps_transaction() {
    let (_dir, mut session) = setup_session().await;

    let params = params! { name: "Placebo" };
    session
        .execute("INSERT INTO artist (name) VALUES (@name)", Some(&params), None)
        .await
        .unwrap();
    let transaction = session.context().transaction_id().unwrap().to_string();

    let err = session
        .query::<Invoice>("SELECT name FROM artist", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Decode { .. }));

    assert_eq!(session.context().transaction_id(), Some(transaction.as_str()));
    let count: i64 = session
        .execute_scalar("SELECT COUNT(*) FROM artist", None, None)
        .await
        .unwrap();
    assert_eq!(count, 3);

    session.rollback_transaction().await.unwrap();
    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_database_error_rolls_back() {
    let (_dir, mut session) = setup_session().await;

    let params = params! { name: "Placebo" };
    session
        .execute("INSERT INTO artist (name) VALUES (@name)", Some(&params), None)
        .await
        .unwrap();

    let err = session
        .execute("INSERT INTO artist (id, name) VALUES (1, 'Duplicate')", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));

    let count: i64 = session
        .execute_scalar("SELECT COUNT(*) FROM artist", None, None)
        .await
        .unwrap();
    assert_eq!(count, 2);

    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_validator_function_from_config() {
    let (_dir, mut session) = setup_session().await;
    assert_eq!(session.validator_function(), "qa.CheckSql");
    session.release_connection().await.unwrap();
}

// =============================================================================
// Introspection
// =============================================================================

#[tokio::test]
async fn test_existence_queries() {
    let (_dir, mut session) = setup_session().await;

    let exists = TableOrViewExistsQuery::new("artist", DatabaseType::SQLite)
        .execute(&mut session, None)
        .await
        .unwrap();
    assert!(exists);

    let exists = TableOrViewExistsQuery::new("album", DatabaseType::SQLite)
        .execute(&mut session, None)
        .await
        .unwrap();
    assert!(!exists);

    let exists = FunctionExistsQuery::new("CheckSql", DatabaseType::SQLite)
        .execute(&mut session, None)
        .await
        .unwrap();
    assert!(!exists);

    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_columns_metadata() {
    let (_dir, mut session) = setup_session().await;

    let columns = ColumnsMetadataQuery::new("artist", DatabaseType::SQLite)
        .execute(&mut session, None)
        .await
        .unwrap();

    let names: Vec<&str> = columns.iter().map(|c| c.column_name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "country"]);
    assert_eq!(columns[1].data_type, "TEXT");
    assert!(!columns[1].is_nullable);
    assert!(columns[2].is_nullable);
    assert!(columns[2].has_default_value);

    session.release_connection().await.unwrap();
}

#[tokio::test]
async fn test_compare_database_with_contract() {
    let (_dir, mut session) = setup_session().await;
    let fields = vec![
        ContractField::of::<i64>("Id"),
        ContractField::of::<String>("Name"),
        ContractField::of::<Option<String>>("Country"),
    ];

    let results = compare_database_with_contract(
        &mut session,
        DatabaseType::SQLite,
        "artist",
        &fields,
        &HashSet::new(),
        &HashSet::new(),
    )
    .await
    .unwrap();
    assert!(results.is_empty(), "{:?}", results);

    let results = compare_database_with_contract(
        &mut session,
        DatabaseType::SQLite,
        "artist",
        &fields[..2],
        &HashSet::new(),
        &HashSet::new(),
    )
    .await
    .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].contains("\"country\" was not found"));

    session.release_connection().await.unwrap();
}
