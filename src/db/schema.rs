//! Schema introspection statements.
//!
//! Ready-made queries for checking that database objects exist and for
//! reading column metadata, plus the command that installs the statement
//! validator routine.
//!
//! # Architecture
//!
//! SQL texts are organized in the `queries` submodule with one submodule per
//! database type. Each statement picks its text from the [`DatabaseType`]
//! given at construction.

use crate::config::DEFAULT_VALIDATOR_FUNCTION;
use crate::cqrs::session::DatabaseSession;
use crate::cqrs::statement::{self, Command, Query, Statement};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ParamSet};
use crate::params;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Existence checks
// =============================================================================

macro_rules! existence_query {
    ($(#[$meta:meta])* $name:ident, $sql:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            object_name: String,
            db_type: DatabaseType,
        }

        impl $name {
            pub fn new(object_name: impl Into<String>, db_type: DatabaseType) -> Self {
                Self {
                    object_name: object_name.into(),
                    db_type,
                }
            }
        }

        impl Statement for $name {
            fn sql_statement(&self) -> &str {
                match self.db_type {
                    DatabaseType::MySQL => queries::mysql::$sql,
                    DatabaseType::PostgreSQL => queries::postgres::$sql,
                    DatabaseType::SQLite => queries::sqlite::$sql,
                }
            }

            fn parameters(&self) -> Option<ParamSet> {
                Some(params! { ObjectName: self.object_name.clone() })
            }
        }

        impl Query for $name {
            type Output = bool;

            async fn execute<S: DatabaseSession>(
                &self,
                session: &mut S,
                cancel: Option<&CancellationToken>,
            ) -> DbResult<bool> {
                let count: Option<i64> = statement::fetch_first(session, self, cancel).await?;
                Ok(count.unwrap_or(0) > 0)
            }
        }
    };
}

existence_query!(
    /// Whether a table or view with the given name exists.
    TableOrViewExistsQuery,
    TABLE_OR_VIEW_EXISTS
);

existence_query!(
    /// Whether a stored procedure with the given name exists.
    ///
    /// Always false on SQLite.
    StoredProcedureExistsQuery,
    PROCEDURE_EXISTS
);

existence_query!(
    /// Whether a function with the given name exists.
    ///
    /// Always false on SQLite.
    FunctionExistsQuery,
    FUNCTION_EXISTS
);

// =============================================================================
// Column metadata
// =============================================================================

/// Columns of a table or view.
#[derive(Debug, Clone)]
pub struct ColumnsMetadataQuery {
    object_name: String,
    db_type: DatabaseType,
}

impl ColumnsMetadataQuery {
    pub fn new(object_name: impl Into<String>, db_type: DatabaseType) -> Self {
        Self {
            object_name: object_name.into(),
            db_type,
        }
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }
}

impl Statement for ColumnsMetadataQuery {
    fn sql_statement(&self) -> &str {
        match self.db_type {
            DatabaseType::MySQL => queries::mysql::COLUMNS_METADATA,
            DatabaseType::PostgreSQL => queries::postgres::COLUMNS_METADATA,
            DatabaseType::SQLite => queries::sqlite::COLUMNS_METADATA,
        }
    }

    fn parameters(&self) -> Option<ParamSet> {
        Some(params! { ObjectName: self.object_name.clone() })
    }
}

impl Query for ColumnsMetadataQuery {
    type Output = Vec<ColumnMetadata>;

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Self::Output> {
        statement::fetch_all(session, self, cancel).await
    }
}

/// One column as reported by the database catalog.
///
/// `data_type` is upper-cased. Lengths and precisions are absent when the
/// type has none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColumnMetadata {
    #[serde(alias = "columnname")]
    pub column_name: String,
    #[serde(alias = "datatype")]
    pub data_type: String,
    #[serde(alias = "isnullable", deserialize_with = "flag")]
    pub is_nullable: bool,
    #[serde(default, alias = "charlength", deserialize_with = "optional_number")]
    pub char_length: Option<i64>,
    #[serde(default, alias = "numericprecision", deserialize_with = "optional_number")]
    pub numeric_precision: Option<i64>,
    #[serde(default, alias = "numericscale", deserialize_with = "optional_number")]
    pub numeric_scale: Option<i64>,
    #[serde(default, rename = "DateTimePrecision", alias = "datetimeprecision", deserialize_with = "optional_number")]
    pub datetime_precision: Option<i64>,
    #[serde(alias = "hasdefaultvalue", deserialize_with = "flag")]
    pub has_default_value: bool,
}

impl fmt::Display for ColumnMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.column_name, self.data_type)?;
        let size = |n: Option<i64>| match n {
            Some(-1) => "MAX".to_string(),
            Some(n) => n.to_string(),
            None => "?".to_string(),
        };
        if self.data_type.contains("CHAR") || self.data_type.contains("BINARY") {
            if self.char_length.is_some() {
                write!(f, "({})", size(self.char_length))?;
            }
        } else if ["DECIMAL", "NUMERIC", "FLOAT", "REAL"]
            .iter()
            .any(|t| self.data_type.contains(t))
        {
            if self.numeric_precision.is_some() {
                write!(
                    f,
                    "({}, {})",
                    size(self.numeric_precision),
                    self.numeric_scale.unwrap_or(0)
                )?;
            }
        } else if self.data_type.contains("DATETIME2") {
            write!(f, "({})", size(self.datetime_precision))?;
        }
        f.write_str(if self.is_nullable { "  NULL" } else { "  NOT NULL" })?;
        if self.has_default_value {
            f.write_str(" (+DEFAULT)")?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Accept `true`/`false`, `1`/`0` or `"YES"`/`"NO"`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
        Flag::Text(s) => matches!(s.to_ascii_uppercase().as_str(), "YES" | "TRUE" | "1"),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Int(i64),
    Text(String),
}

/// Accept a number, a numeric string (unsigned catalog columns) or null.
fn optional_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Number>::deserialize(deserializer)? {
        Some(Number::Int(n)) => Some(n),
        Some(Number::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

// =============================================================================
// Validator routine
// =============================================================================

/// Creates the scalar function used by [`validate`](crate::cqrs::validate).
///
/// SQL Server only: the function asks `sys.dm_exec_describe_first_result_set`
/// to compile the statement and returns its first error message, or `OK`.
#[derive(Debug, Clone)]
pub struct ValidatorFunctionCreateCommand {
    ddl: String,
}

impl ValidatorFunctionCreateCommand {
    /// DDL for a function with the given (optionally schema-qualified) name.
    pub fn new(function_name: &str) -> Self {
        Self {
            ddl: queries::VALIDATOR_FUNCTION_DDL.replace("{function}", function_name),
        }
    }

    /// DDL for `db_type`, refused up front where the function cannot be created.
    ///
    /// The function body is T-SQL; none of the backends a context can connect
    /// to runs it.
    pub fn for_database(function_name: &str, db_type: DatabaseType) -> DbResult<Self> {
        match db_type {
            DatabaseType::MySQL | DatabaseType::PostgreSQL | DatabaseType::SQLite => {
                Err(DbError::not_implemented(format!(
                    "The validator function {} needs SQL Server and cannot be installed on {}",
                    function_name, db_type
                )))
            }
        }
    }
}

impl Default for ValidatorFunctionCreateCommand {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATOR_FUNCTION)
    }
}

impl Statement for ValidatorFunctionCreateCommand {
    fn sql_statement(&self) -> &str {
        &self.ddl
    }
}

impl Command for ValidatorFunctionCreateCommand {
    type Output = ();

    async fn execute<S: DatabaseSession>(
        &self,
        session: &mut S,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<()> {
        statement::execute_statement(session, self, cancel).await?;
        Ok(())
    }
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub const VALIDATOR_FUNCTION_DDL: &str = r#"
CREATE FUNCTION {function}
(
    @tsql VARCHAR(4000),
    @parameterInfo VARCHAR(4000) NULL
)
RETURNS VARCHAR(1000)
AS
BEGIN
  DECLARE @Result VARCHAR (1000)

  IF EXISTS (
      SELECT 1
        FROM [sys].[dm_exec_describe_first_result_set] (@tsql, @parameterInfo, 0)
       WHERE [error_message] IS NOT NULL
         AND [error_number] IS NOT NULL
         AND [error_severity] IS NOT NULL
         AND [error_state] IS NOT NULL
         AND [error_type] IS NOT NULL
         AND [error_type_desc] IS NOT NULL
      )
    BEGIN
      SELECT @Result = [error_message]
        FROM [sys].[dm_exec_describe_first_result_set] (@tsql, @parameterInfo, 0)
       WHERE column_ordinal = 0
    END
  ELSE BEGIN
    SET @Result = 'OK'
  END

  RETURN (@Result)
END
"#;

    pub mod mysql {
        pub const TABLE_OR_VIEW_EXISTS: &str = r#"
SELECT COUNT(*)
  FROM INFORMATION_SCHEMA.TABLES
 WHERE TABLE_SCHEMA = DATABASE()
       AND TABLE_NAME = @ObjectName
"#;

        pub const PROCEDURE_EXISTS: &str = r#"
SELECT COUNT(*)
  FROM INFORMATION_SCHEMA.ROUTINES
 WHERE ROUTINE_SCHEMA = DATABASE()
       AND ROUTINE_NAME = @ObjectName
       AND ROUTINE_TYPE = 'PROCEDURE'
"#;

        pub const FUNCTION_EXISTS: &str = r#"
SELECT COUNT(*)
  FROM INFORMATION_SCHEMA.ROUTINES
 WHERE ROUTINE_SCHEMA = DATABASE()
       AND ROUTINE_NAME = @ObjectName
       AND ROUTINE_TYPE = 'FUNCTION'
"#;

        pub const COLUMNS_METADATA: &str = r#"
SELECT COLUMN_NAME AS ColumnName,
       UPPER(DATA_TYPE) AS DataType,
       CASE IS_NULLABLE WHEN 'YES' THEN 1 ELSE 0 END AS IsNullable,
       CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS CharLength,
       CAST(NUMERIC_PRECISION AS SIGNED) AS NumericPrecision,
       CAST(NUMERIC_SCALE AS SIGNED) AS NumericScale,
       CAST(DATETIME_PRECISION AS SIGNED) AS DateTimePrecision,
       CASE WHEN COLUMN_DEFAULT IS NULL THEN 0 ELSE 1 END AS HasDefaultValue
  FROM INFORMATION_SCHEMA.COLUMNS
 WHERE TABLE_SCHEMA = DATABASE()
       AND TABLE_NAME = @ObjectName
 ORDER BY ORDINAL_POSITION
"#;
    }

    pub mod postgres {
        pub const TABLE_OR_VIEW_EXISTS: &str = r#"
SELECT COUNT(*)
  FROM information_schema.tables
 WHERE table_schema = current_schema()
       AND table_name::text = @ObjectName
"#;

        pub const PROCEDURE_EXISTS: &str = r#"
SELECT COUNT(*)
  FROM information_schema.routines
 WHERE routine_schema = current_schema()
       AND routine_name::text = @ObjectName
       AND routine_type = 'PROCEDURE'
"#;

        pub const FUNCTION_EXISTS: &str = r#"
SELECT COUNT(*)
  FROM information_schema.routines
 WHERE routine_schema = current_schema()
       AND routine_name::text = @ObjectName
       AND routine_type = 'FUNCTION'
"#;

        pub const COLUMNS_METADATA: &str = r#"
SELECT column_name::text AS "ColumnName",
       UPPER(data_type::text) AS "DataType",
       (is_nullable::text = 'YES') AS "IsNullable",
       character_maximum_length::bigint AS "CharLength",
       numeric_precision::bigint AS "NumericPrecision",
       numeric_scale::bigint AS "NumericScale",
       datetime_precision::bigint AS "DateTimePrecision",
       (column_default IS NOT NULL) AS "HasDefaultValue"
  FROM information_schema.columns
 WHERE table_schema = current_schema()
       AND table_name::text = @ObjectName
 ORDER BY ordinal_position
"#;
    }

    pub mod sqlite {
        pub const TABLE_OR_VIEW_EXISTS: &str = r#"
SELECT COUNT(*)
  FROM sqlite_master
 WHERE type IN ('table', 'view')
       AND name = @ObjectName
"#;

        // SQLite has no stored routines.
        pub const PROCEDURE_EXISTS: &str = "SELECT 0";
        pub const FUNCTION_EXISTS: &str = "SELECT 0";

        pub const COLUMNS_METADATA: &str = r#"
SELECT name AS ColumnName,
       UPPER(type) AS DataType,
       CASE "notnull" WHEN 0 THEN 1 ELSE 0 END AS IsNullable,
       NULL AS CharLength,
       NULL AS NumericPrecision,
       NULL AS NumericScale,
       NULL AS DateTimePrecision,
       CASE WHEN dflt_value IS NULL THEN 0 ELSE 1 END AS HasDefaultValue
  FROM pragma_table_info(@ObjectName)
 ORDER BY cid
"#;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_existence_query_parameters() {
        let query = TableOrViewExistsQuery::new("Artist", DatabaseType::SQLite);
        assert!(query.sql_statement().contains("sqlite_master"));
        assert_eq!(query.parameters(), Some(params! { ObjectName: "Artist".to_string() }));

        let query = FunctionExistsQuery::new("CheckSql", DatabaseType::MySQL);
        assert!(query.sql_statement().contains("'FUNCTION'"));
        let query = StoredProcedureExistsQuery::new("Refresh", DatabaseType::PostgreSQL);
        assert!(query.sql_statement().contains("'PROCEDURE'"));
    }

    #[test]
    fn test_column_metadata_from_pascal_case_row() {
        let column: ColumnMetadata = serde_json::from_value(json!({
            "ColumnName": "Name",
            "DataType": "NVARCHAR",
            "IsNullable": 1,
            "CharLength": 120,
            "NumericPrecision": null,
            "NumericScale": null,
            "DateTimePrecision": null,
            "HasDefaultValue": false
        }))
        .unwrap();
        assert_eq!(column.column_name, "Name");
        assert!(column.is_nullable);
        assert_eq!(column.char_length, Some(120));
        assert!(!column.has_default_value);
        assert_eq!(column.to_string(), "Name NVARCHAR(120)  NULL");
    }

    #[test]
    fn test_column_metadata_from_lowercase_row() {
        let column: ColumnMetadata = serde_json::from_value(json!({
            "columnname": "Total",
            "datatype": "NUMERIC",
            "isnullable": "NO",
            "numericprecision": "10",
            "numericscale": 2,
            "hasdefaultvalue": 1
        }))
        .unwrap();
        assert!(!column.is_nullable);
        assert_eq!(column.numeric_precision, Some(10));
        assert_eq!(column.to_string(), "Total NUMERIC(10, 2)  NOT NULL (+DEFAULT)");
    }

    #[test]
    fn test_validator_ddl() {
        let command = ValidatorFunctionCreateCommand::default();
        let sql = command.sql_statement();
        assert!(sql.contains("CREATE FUNCTION dbo.CheckSql\n("));
        assert!(sql.contains("dm_exec_describe_first_result_set"));
        assert!(command.parameters().is_none());

        let command = ValidatorFunctionCreateCommand::new("qa.ValidateSql");
        assert!(command.sql_statement().contains("CREATE FUNCTION qa.ValidateSql"));
    }

    #[test]
    fn test_validator_refused_on_connectable_backends() {
        for db_type in [DatabaseType::MySQL, DatabaseType::PostgreSQL, DatabaseType::SQLite] {
            let err = ValidatorFunctionCreateCommand::for_database("dbo.CheckSql", db_type)
                .unwrap_err();
            assert!(matches!(err, DbError::NotImplemented { .. }), "{:?}", err);
            assert!(err.to_string().contains("dbo.CheckSql"));
        }
    }
}
