//! Data contract comparison.
//!
//! Checks that a Rust data contract (the struct a query deserializes into)
//! and a database table agree on column names, text-ness and nullability.
//! Every mismatch becomes one human-readable line; an empty list means the
//! two match.

use crate::cqrs::session::DatabaseSession;
use crate::cqrs::statement::Query;
use crate::db::schema::{ColumnMetadata, ColumnsMetadataQuery};
use crate::error::DbResult;
use crate::models::{DatabaseType, ToParam, ValueKind};
use std::collections::HashSet;
use tracing::debug;

/// One field of a data contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractField {
    pub name: String,
    pub kind: ValueKind,
    pub nullable: bool,
}

impl ContractField {
    pub fn new(name: impl Into<String>, kind: ValueKind, nullable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable,
        }
    }

    /// Describe a field by its Rust type; `Option<_>` marks it nullable.
    ///
    /// ```
    /// use sqlx_cqrs::tools::contract::ContractField;
    ///
    /// let field = ContractField::of::<Option<i32>>("AlbumId");
    /// assert!(field.nullable);
    /// ```
    pub fn of<T: ToParam>(name: impl Into<String>) -> Self {
        Self::new(name, T::KIND, T::NULLABLE)
    }

    fn type_display(&self) -> String {
        format!(
            "{}{}",
            self.kind.type_name(),
            if self.nullable { "?" } else { "" }
        )
    }

    fn is_text(&self) -> bool {
        self.kind == ValueKind::Text
    }

    /// Text and binary fields carry nullability in their value, not their type.
    fn nullability_exempt(&self) -> bool {
        matches!(self.kind, ValueKind::Text | ValueKind::Binary)
    }
}

fn is_text_column(data_type: &str) -> bool {
    data_type.contains("CHAR") || data_type.contains("TEXT") || data_type.contains("XML")
}

fn null_text(nullable: bool) -> &'static str {
    if nullable { "NULL" } else { "NOT NULL" }
}

fn nullability_differs(field: &ContractField, column: &ColumnMetadata) -> bool {
    !field.nullability_exempt()
        && field.nullable != column.is_nullable
        && field.nullable
        && !column.has_default_value
}

/// Compare contract fields with table columns.
///
/// Names match case-insensitively. `except_fields` lists contract fields that
/// are not loaded from the table; `except_columns` lists columns the contract
/// does not carry.
pub fn compare_with_contract(
    fields: &[ContractField],
    columns: &[ColumnMetadata],
    except_fields: &HashSet<String>,
    except_columns: &HashSet<String>,
) -> Vec<String> {
    let mut results = Vec::new();

    for field in fields {
        if except_fields.contains(&field.name) {
            continue;
        }

        let Some(column) = columns
            .iter()
            .find(|c| c.column_name.eq_ignore_ascii_case(&field.name))
        else {
            results.push(format!(
                "DB column with name \"{}\" was not found (but property exists). If property is extra (non-database loadable), then use \"except_fields\" to exclude it from the comparison.",
                field.name
            ));
            continue;
        };

        if field.is_text() && !is_text_column(&column.data_type) {
            results.push(format!(
                "Data contract property \"{}\" (STRING) has non-matching type \"{}\" in database column.",
                field.name, column.data_type
            ));
            continue;
        }

        if nullability_differs(field, column) {
            results.push(format!(
                "Data contract property \"{}\" ({}) has non-matching NULL-ability in database field \"{} {}\".",
                field.name,
                field.type_display(),
                column.data_type,
                null_text(column.is_nullable)
            ));
        }
    }

    for column in columns {
        if except_columns.contains(&column.column_name) {
            continue;
        }

        let Some(field) = fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(&column.column_name))
        else {
            results.push(format!(
                "Data contract property with name \"{}\" was not found (but DB column exists). If DB field is not loadable, then use \"except_columns\" to exclude it from the comparison.",
                column.column_name
            ));
            continue;
        };

        if column.data_type.contains("CHAR") && !field.is_text() {
            results.push(format!(
                "Database column \"{}\" ({}) has non-matching type \"{}\" in data contract property.",
                column.column_name,
                column.data_type,
                field.kind.type_name()
            ));
            continue;
        }

        if !column.data_type.contains("XML") && nullability_differs(field, column) {
            results.push(format!(
                "Database column \"{}\" ({} {}) has non-matching NULL-ability in data contract property ({}).",
                column.column_name,
                column.data_type,
                null_text(column.is_nullable),
                field.type_display()
            ));
        }
    }

    results
}

/// Read the columns of `table_name` and compare them with the contract.
pub async fn compare_database_with_contract<S: DatabaseSession>(
    session: &mut S,
    db_type: DatabaseType,
    table_name: &str,
    fields: &[ContractField],
    except_fields: &HashSet<String>,
    except_columns: &HashSet<String>,
) -> DbResult<Vec<String>> {
    let columns = ColumnsMetadataQuery::new(table_name, db_type)
        .execute(session, None)
        .await?;
    debug!(table = table_name, columns = columns.len(), "Comparing data contract");
    Ok(compare_with_contract(fields, &columns, except_fields, except_columns))
}
