//! Unbounded mutation guard.
//!
//! Detects UPDATE and DELETE statements without a WHERE clause, which would
//! touch every row of their table. Uses sqlparser for AST-based detection so
//! formatting tricks or comments do not hide the statement. Text the T-SQL
//! dialect cannot parse falls back to a token scan.

use crate::error::{DbError, DbResult};
use sqlparser::ast::Statement;
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;
use tracing::trace;

/// Data-changing statement kinds the guard looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Update,
    Delete,
}

impl MutationKind {
    /// Get the operation name for error messages.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Result of inspecting SQL for unbounded mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardResult {
    /// No UPDATE or DELETE without WHERE found
    Bounded,
    /// The first statement that lacks a WHERE clause
    Unbounded(MutationKind),
}

/// Inspect SQL for UPDATE or DELETE statements without a WHERE clause.
///
/// Every statement of a batch is checked; the first unbounded one is reported.
///
/// # Examples
///
/// ```
/// use sqlx_cqrs::tools::guard::{inspect_mutations, GuardResult, MutationKind};
///
/// assert_eq!(
///     inspect_mutations("DELETE FROM Artist"),
///     GuardResult::Unbounded(MutationKind::Delete)
/// );
/// assert_eq!(
///     inspect_mutations("DELETE FROM Artist WHERE ArtistId = @id"),
///     GuardResult::Bounded
/// );
/// ```
pub fn inspect_mutations(sql: &str) -> GuardResult {
    match Parser::parse_sql(&MsSqlDialect {}, sql) {
        Ok(statements) => statements
            .iter()
            .find_map(unbounded_statement)
            .map_or(GuardResult::Bounded, GuardResult::Unbounded),
        Err(e) => {
            trace!(error = %e, "SQL not parsed, scanning tokens");
            scan_tokens(sql)
        }
    }
}

/// Fail with [`DbError::UnboundedMutation`] when the SQL would change every
/// row of a table.
pub fn check_unbounded_mutation(sql: &str) -> DbResult<()> {
    match inspect_mutations(sql) {
        GuardResult::Bounded => Ok(()),
        GuardResult::Unbounded(kind) => Err(DbError::unbounded_mutation(kind.operation_name(), sql)),
    }
}

fn unbounded_statement(stmt: &Statement) -> Option<MutationKind> {
    match stmt {
        Statement::Delete(delete) if delete.selection.is_none() => Some(MutationKind::Delete),
        Statement::Update(update) if update.selection.is_none() => Some(MutationKind::Update),
        _ => None,
    }
}

// =============================================================================
// Token scan fallback
// =============================================================================

/// Split SQL into upper-cased words and single-character punctuation,
/// skipping comments and quoted text.
fn tokenize(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '\'' | '"' | '[' | '`' => {
                let close = if c == '[' { ']' } else { c };
                i += 1;
                while i < chars.len() {
                    if chars[i] == close {
                        // doubled quote is an escaped quote
                        if chars.get(i + 1) == Some(&close) && close != ']' {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
                tokens.push("?".to_string());
            }
            c if c.is_alphanumeric() || c == '_' || c == '@' || c == '#' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '@' | '#' | '$'))
                {
                    i += 1;
                }
                tokens.push(chars[start..i].iter().collect::<String>().to_uppercase());
            }
            '(' | ')' | ';' => {
                tokens.push(c.to_string());
                i += 1;
            }
            _ => i += 1,
        }
    }

    tokens
}

fn scan_tokens(sql: &str) -> GuardResult {
    let tokens = tokenize(sql);
    for statement in tokens.split(|t| t == ";") {
        let Some(first) = statement.first() else {
            continue;
        };
        let kind = match first.as_str() {
            "UPDATE" => MutationKind::Update,
            "DELETE" => MutationKind::Delete,
            _ => continue,
        };

        let mut depth = 0i32;
        let mut has_where = false;
        for token in statement {
            match token.as_str() {
                "(" => depth += 1,
                ")" => depth -= 1,
                "WHERE" if depth == 0 => {
                    has_where = true;
                    break;
                }
                _ => {}
            }
        }
        if !has_where {
            return GuardResult::Unbounded(kind);
        }
    }
    GuardResult::Bounded
}
