//! Parameter binding utilities for database queries.
//!
//! Statements name their parameters `@name`. Before execution the names are
//! rewritten to the placeholder syntax of the backend, and the described
//! values are bound to the database-specific query objects in the order the
//! rewritten statement expects them.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ParamSet, ParamValue, ParameterDescriptor, ValueKind};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};
use uuid::Uuid;

/// A statement rewritten for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSql {
    pub sql: String,
    /// Index into the parameter set for every value to bind, in bind order.
    pub bindings: Vec<usize>,
}

// =============================================================================
// Placeholder Rewriting
// =============================================================================

/// Rewrite `@name` references into the placeholders of `db_type`.
///
/// - PostgreSQL: `$1, $2, ...`, one number per distinct parameter
/// - SQLite: `?1, ?2, ...`, one number per distinct parameter
/// - MySQL: `?` per occurrence, so a repeated name is bound repeatedly
///
/// Quoted strings and identifiers, comments, `@@` system variables and names
/// that are not in `params` are copied unchanged.
pub fn rewrite_placeholders(sql: &str, params: &ParamSet, db_type: DatabaseType) -> PreparedSql {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut bindings: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' if db_type == DatabaseType::MySQL => {
                let end = closing_with_escapes(&chars, i + 1, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '\'' | '"' | '`' => {
                let end = closing(&chars, i + 1, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' if db_type == DatabaseType::SQLite => {
                let end = closing(&chars, i + 1, ']');
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map(|pos| i + pos)
                    .unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = block_comment_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            '@' if chars.get(i + 1) == Some(&'@') => {
                let end = identifier_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            '@' if chars.get(i + 1).is_some_and(|ch| is_identifier_start(*ch)) => {
                let end = identifier_end(&chars, i + 1);
                let name: String = chars[i + 1..end].iter().collect();
                match params.index_of(&name) {
                    Some(index) => push_placeholder(&mut out, &mut bindings, index, db_type),
                    None => out.extend(&chars[i..end]),
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    PreparedSql { sql: out, bindings }
}

fn push_placeholder(
    out: &mut String,
    bindings: &mut Vec<usize>,
    index: usize,
    db_type: DatabaseType,
) {
    match db_type {
        DatabaseType::MySQL => {
            bindings.push(index);
            out.push('?');
        }
        DatabaseType::PostgreSQL | DatabaseType::SQLite => {
            let position = match bindings.iter().position(|&bound| bound == index) {
                Some(pos) => pos + 1,
                None => {
                    bindings.push(index);
                    bindings.len()
                }
            };
            out.push(if db_type == DatabaseType::PostgreSQL { '$' } else { '?' });
            out.push_str(&position.to_string());
        }
    }
}

/// Index just past the closing delimiter, or the end of input if unterminated.
fn closing(chars: &[char], from: usize, delimiter: char) -> usize {
    chars[from.min(chars.len())..]
        .iter()
        .position(|&ch| ch == delimiter)
        .map(|pos| from + pos + 1)
        .unwrap_or(chars.len())
}

/// Like [`closing`], but a backslash escapes the character after it (MySQL strings).
fn closing_with_escapes(chars: &[char], from: usize, delimiter: char) -> usize {
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ch if ch == delimiter => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

fn block_comment_end(chars: &[char], from: usize) -> usize {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn identifier_end(chars: &[char], from: usize) -> usize {
    chars[from..]
        .iter()
        .position(|&ch| !(ch.is_alphanumeric() || ch == '_'))
        .map(|pos| from + pos)
        .unwrap_or(chars.len())
}

// =============================================================================
// Value Conversion
// =============================================================================

fn text_of(value: &ParamValue) -> Option<String> {
    match value {
        ParamValue::Text(s) => Some(s.clone()),
        ParamValue::Char(c) => Some(c.to_string()),
        ParamValue::CharArray(chars) => Some(chars.iter().collect()),
        ParamValue::Decimal(d) => Some(d.to_string()),
        ParamValue::Uuid(u) => Some(u.hyphenated().to_string()),
        ParamValue::Other { display, .. } => Some(display.clone()),
        _ => None,
    }
}

fn narrow_u64(name: &str, value: u64) -> DbResult<i64> {
    i64::try_from(value).map_err(|_| {
        DbError::invalid_argument(format!(
            "Parameter @{} value {} does not fit a signed 64-bit column",
            name, value
        ))
    })
}

fn utc(value: &DateTime<chrono::FixedOffset>) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

// =============================================================================
// Binding
// =============================================================================

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;
type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: MySqlQuery<'q>,
    param: &ParameterDescriptor,
) -> DbResult<MySqlQuery<'q>> {
    let Some(value) = &param.value else {
        return Ok(match param.kind {
            ValueKind::Bool => query.bind(None::<bool>),
            ValueKind::U8 | ValueKind::I8 | ValueKind::I16 | ValueKind::I32 | ValueKind::I64 => {
                query.bind(None::<i64>)
            }
            ValueKind::U16 | ValueKind::U32 | ValueKind::U64 => query.bind(None::<u64>),
            ValueKind::Float | ValueKind::Double => query.bind(None::<f64>),
            ValueKind::DateTime => query.bind(None::<NaiveDateTime>),
            ValueKind::DateTimeOffset => query.bind(None::<DateTime<Utc>>),
            ValueKind::Duration => query.bind(None::<i64>),
            ValueKind::Binary => query.bind(None::<Vec<u8>>),
            _ => query.bind(None::<String>),
        });
    };

    Ok(match value {
        ParamValue::Bool(v) => query.bind(*v),
        ParamValue::U8(v) => query.bind(*v),
        ParamValue::I8(v) => query.bind(*v),
        ParamValue::I16(v) => query.bind(*v),
        ParamValue::I32(v) => query.bind(*v),
        ParamValue::I64(v) => query.bind(*v),
        ParamValue::U16(v) => query.bind(*v),
        ParamValue::U32(v) => query.bind(*v),
        ParamValue::U64(v) => query.bind(*v),
        ParamValue::Float(v) => query.bind(*v),
        ParamValue::Double(v) => query.bind(*v),
        ParamValue::DateTime(v) => query.bind(*v),
        ParamValue::DateTimeOffset(v) => query.bind(utc(v)),
        ParamValue::Duration(d) => query.bind(ParamValue::duration_ticks(d)),
        ParamValue::Binary(bytes) => query.bind(bytes.clone()),
        other => query.bind(text_of(other).unwrap_or_default()),
    })
}

/// Bind a parameter to a PostgreSQL query.
///
/// PostgreSQL has no unsigned or single-byte integers, so those are widened
/// to the next signed type. Decimals are sent as `float8`.
pub(crate) fn bind_postgres_param<'q>(
    query: PgQuery<'q>,
    param: &ParameterDescriptor,
) -> DbResult<PgQuery<'q>> {
    let Some(value) = &param.value else {
        return Ok(match param.kind {
            ValueKind::Bool => query.bind(None::<bool>),
            ValueKind::U8 | ValueKind::I8 | ValueKind::I16 => query.bind(None::<i16>),
            ValueKind::I32 | ValueKind::U16 => query.bind(None::<i32>),
            ValueKind::I64 | ValueKind::U32 | ValueKind::U64 | ValueKind::Duration => {
                query.bind(None::<i64>)
            }
            ValueKind::Float => query.bind(None::<f32>),
            ValueKind::Double | ValueKind::Decimal => query.bind(None::<f64>),
            ValueKind::DateTime => query.bind(None::<NaiveDateTime>),
            ValueKind::DateTimeOffset => query.bind(None::<DateTime<Utc>>),
            ValueKind::Uuid => query.bind(None::<Uuid>),
            ValueKind::Binary => query.bind(None::<Vec<u8>>),
            _ => query.bind(None::<String>),
        });
    };

    Ok(match value {
        ParamValue::Bool(v) => query.bind(*v),
        ParamValue::U8(v) => query.bind(i16::from(*v)),
        ParamValue::I8(v) => query.bind(i16::from(*v)),
        ParamValue::I16(v) => query.bind(*v),
        ParamValue::I32(v) => query.bind(*v),
        ParamValue::I64(v) => query.bind(*v),
        ParamValue::U16(v) => query.bind(i32::from(*v)),
        ParamValue::U32(v) => query.bind(i64::from(*v)),
        ParamValue::U64(v) => query.bind(narrow_u64(&param.name, *v)?),
        ParamValue::Float(v) => query.bind(*v),
        ParamValue::Double(v) => query.bind(*v),
        ParamValue::Decimal(d) => {
            let number: f64 = d.as_str().parse().map_err(|_| {
                DbError::invalid_argument(format!(
                    "Parameter @{} value {} is not a number",
                    param.name, d
                ))
            })?;
            query.bind(number)
        }
        ParamValue::DateTime(v) => query.bind(*v),
        ParamValue::DateTimeOffset(v) => query.bind(utc(v)),
        ParamValue::Duration(d) => query.bind(ParamValue::duration_ticks(d)),
        ParamValue::Uuid(u) => query.bind(*u),
        ParamValue::Binary(bytes) => query.bind(bytes.clone()),
        other => query.bind(text_of(other).unwrap_or_default()),
    })
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: SqliteQuery<'q>,
    param: &ParameterDescriptor,
) -> DbResult<SqliteQuery<'q>> {
    let Some(value) = &param.value else {
        return Ok(match param.kind {
            ValueKind::Bool => query.bind(None::<bool>),
            ValueKind::Float | ValueKind::Double => query.bind(None::<f64>),
            ValueKind::Binary => query.bind(None::<Vec<u8>>),
            kind if is_integer_kind(kind) => query.bind(None::<i64>),
            _ => query.bind(None::<String>),
        });
    };

    Ok(match value {
        ParamValue::Bool(v) => query.bind(*v),
        ParamValue::U8(v) => query.bind(i64::from(*v)),
        ParamValue::I8(v) => query.bind(i64::from(*v)),
        ParamValue::I16(v) => query.bind(i64::from(*v)),
        ParamValue::I32(v) => query.bind(i64::from(*v)),
        ParamValue::I64(v) => query.bind(*v),
        ParamValue::U16(v) => query.bind(i64::from(*v)),
        ParamValue::U32(v) => query.bind(i64::from(*v)),
        ParamValue::U64(v) => query.bind(narrow_u64(&param.name, *v)?),
        ParamValue::Float(v) => query.bind(f64::from(*v)),
        ParamValue::Double(v) => query.bind(*v),
        ParamValue::DateTime(v) => query.bind(*v),
        ParamValue::DateTimeOffset(v) => query.bind(utc(v)),
        ParamValue::Duration(d) => query.bind(ParamValue::duration_ticks(d)),
        ParamValue::Binary(bytes) => query.bind(bytes.clone()),
        other => query.bind(text_of(other).unwrap_or_default()),
    })
}

fn is_integer_kind(kind: ValueKind) -> bool {
    matches!(
        kind,
        ValueKind::U8
            | ValueKind::I8
            | ValueKind::I16
            | ValueKind::I32
            | ValueKind::I64
            | ValueKind::U16
            | ValueKind::U32
            | ValueKind::U64
            | ValueKind::Duration
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn test_rewrite_postgres_numbers_distinct_names() {
        let params = params! { id: 1, name: "x" };
        let prepared = rewrite_placeholders(
            "SELECT * FROM t WHERE id = @id OR parent = @id AND name = @Name",
            &params,
            DatabaseType::PostgreSQL,
        );
        assert_eq!(
            prepared.sql,
            "SELECT * FROM t WHERE id = $1 OR parent = $1 AND name = $2"
        );
        assert_eq!(prepared.bindings, vec![0, 1]);
    }

    #[test]
    fn test_rewrite_sqlite_uses_numbered_question_marks() {
        let params = params! { b: 2, a: 1 };
        let prepared =
            rewrite_placeholders("SELECT @a + @b + @a", &params, DatabaseType::SQLite);
        assert_eq!(prepared.sql, "SELECT ?1 + ?2 + ?1");
        assert_eq!(prepared.bindings, vec![1, 0]);
    }

    #[test]
    fn test_rewrite_mysql_repeats_bindings() {
        let params = params! { id: 1 };
        let prepared = rewrite_placeholders(
            "UPDATE t SET a = @id WHERE b = @id",
            &params,
            DatabaseType::MySQL,
        );
        assert_eq!(prepared.sql, "UPDATE t SET a = ? WHERE b = ?");
        assert_eq!(prepared.bindings, vec![0, 0]);
    }

    #[test]
    fn test_rewrite_mysql_backslash_escaped_quote() {
        let params = params! { id: 1 };
        let prepared = rewrite_placeholders(
            "SELECT 'O\\'Brien @id', \"say \\\"@id\\\"\" AS n FROM t WHERE x = @id",
            &params,
            DatabaseType::MySQL,
        );
        assert_eq!(
            prepared.sql,
            "SELECT 'O\\'Brien @id', \"say \\\"@id\\\"\" AS n FROM t WHERE x = ?"
        );
        assert_eq!(prepared.bindings, vec![0]);
    }

    #[test]
    fn test_rewrite_postgres_backslash_is_literal() {
        let params = params! { dir: "x" };
        let prepared = rewrite_placeholders(
            "SELECT 'C:\\' || @dir",
            &params,
            DatabaseType::PostgreSQL,
        );
        assert_eq!(prepared.sql, "SELECT 'C:\\' || $1");
        assert_eq!(prepared.bindings, vec![0]);
    }

    #[test]
    fn test_rewrite_skips_literals_and_comments() {
        let params = params! { id: 1 };
        let sql = "SELECT '@id', \"@id\" -- @id\n/* @id */ FROM t WHERE x = @id";
        let prepared = rewrite_placeholders(sql, &params, DatabaseType::PostgreSQL);
        assert_eq!(
            prepared.sql,
            "SELECT '@id', \"@id\" -- @id\n/* @id */ FROM t WHERE x = $1"
        );
        assert_eq!(prepared.bindings, vec![0]);
    }

    #[test]
    fn test_rewrite_leaves_system_and_unknown_variables() {
        let params = params! { id: 1 };
        let prepared = rewrite_placeholders(
            "SELECT @@version, @other, @id",
            &params,
            DatabaseType::MySQL,
        );
        assert_eq!(prepared.sql, "SELECT @@version, @other, ?");
        assert_eq!(prepared.bindings, vec![0]);
    }

    #[test]
    fn test_rewrite_sqlite_bracket_identifiers() {
        let params = params! { id: 1 };
        let prepared =
            rewrite_placeholders("SELECT [@id] FROM t WHERE a = @id", &params, DatabaseType::SQLite);
        assert_eq!(prepared.sql, "SELECT [@id] FROM t WHERE a = ?1");
    }

    #[test]
    fn test_rewrite_without_references() {
        let prepared = rewrite_placeholders("SELECT 1", &ParamSet::new(), DatabaseType::SQLite);
        assert_eq!(prepared.sql, "SELECT 1");
        assert!(prepared.bindings.is_empty());
    }

    #[test]
    fn test_unterminated_quote_is_copied() {
        let params = params! { id: 1 };
        let prepared = rewrite_placeholders("SELECT 'abc @id", &params, DatabaseType::SQLite);
        assert_eq!(prepared.sql, "SELECT 'abc @id");
        assert!(prepared.bindings.is_empty());
    }

    #[test]
    fn test_narrow_u64_overflow() {
        assert_eq!(narrow_u64("n", 42).unwrap(), 42);
        let err = narrow_u64("n", u64::MAX).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[test]
    fn test_postgres_rejects_oversized_u64() {
        let params = params! { big: u64::MAX };
        let param = params.get("big").unwrap();
        let result = bind_postgres_param(sqlx::query("SELECT $1"), param);
        assert!(result.is_err());
    }
}
