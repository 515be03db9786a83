//! Row decoding.
//!
//! Rows come back as JSON objects (column name to value, in column order) so
//! the session can deserialize them into any `serde` type without this layer
//! knowing the target.
//!
//! Every column is first classified by its declared type name into a
//! [`ColumnClass`]; the backend decoder then decides which Rust type to read
//! the value as. Values that cannot be read become JSON `null`.

use crate::models::DatabaseType;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo};
use tracing::warn;

/// One decoded row, keyed by column name in column order.
pub type JsonRow = serde_json::Map<String, JsonValue>;

// =============================================================================
// Classification
// =============================================================================

/// What a column holds, independent of the backend's spelling of the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnClass {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
    Unknown,
}

impl ColumnClass {
    /// Classify a declared column type name.
    pub fn of(type_name: &str, db: DatabaseType) -> Self {
        let name = type_name.to_ascii_lowercase();
        match name.as_str() {
            // SQLite NUMERIC affinity stores plain floats
            "numeric" if db == DatabaseType::SQLite => Self::Float,
            n if n.contains("decimal") || n.contains("numeric") => Self::Decimal,
            "datetime" | "date" | "time" | "timetz" => Self::Temporal,
            n if n.starts_with("timestamp") => Self::Temporal,
            "interval" => Self::Unknown,
            n if n.contains("int") || n.contains("serial") => Self::Integer,
            "bool" | "boolean" => Self::Boolean,
            "real" => Self::Float,
            n if n.contains("float") || n.contains("double") => Self::Float,
            "json" | "jsonb" => Self::Json,
            "uuid" => Self::Uuid,
            "bytea" => Self::Binary,
            n if n.contains("blob") || n.contains("binary") => Self::Binary,
            "name" | "xml" => Self::Text,
            n if n.contains("char") || n.contains("text") => Self::Text,
            _ => Self::Unknown,
        }
    }
}

// =============================================================================
// Exact decimals
// =============================================================================

/// DECIMAL/NUMERIC value kept in its exact textual form.
#[derive(Debug)]
pub struct DecimalText(pub String);

impl Type<sqlx::MySql> for DecimalText {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        ColumnClass::of(ty.name(), DatabaseType::MySQL) == ColumnClass::Decimal
    }
}

impl<'r> Decode<'r, sqlx::MySql> for DecimalText {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <&str as Decode<sqlx::MySql>>::decode(value).map(|text| Self(text.to_string()))
    }
}

impl Type<sqlx::Postgres> for DecimalText {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("numeric")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ColumnClass::of(ty.name(), DatabaseType::PostgreSQL) == ColumnClass::Decimal
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for DecimalText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let text = match value.format() {
            PgValueFormat::Text => value.as_str()?.to_string(),
            PgValueFormat::Binary => pg_numeric_to_string(value.as_bytes()?)?,
        };
        Ok(Self(text))
    }
}

/// Render the binary wire form of a PostgreSQL NUMERIC.
///
/// Layout: digit count, weight, sign and display scale (16 bits each),
/// followed by base-10000 digits, most significant first.
fn pg_numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;

    if bytes.len() < 8 {
        return Err("NUMERIC value is truncated".into());
    }
    let word = |at: usize| [bytes[at], bytes[at + 1]];
    let ndigits = usize::try_from(i16::from_be_bytes(word(0)))?;
    let weight = i32::from(i16::from_be_bytes(word(2)));
    let sign = u16::from_be_bytes(word(4));
    let dscale = usize::from(u16::from_be_bytes(word(6)));

    if sign == NAN {
        return Ok("NaN".to_string());
    }
    if bytes.len() < 8 + ndigits * 2 {
        return Err("NUMERIC value is truncated".into());
    }
    let digits: Vec<i16> = (0..ndigits)
        .map(|i| i16::from_be_bytes(word(8 + i * 2)))
        .collect();
    let digit = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NEGATIVE {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", digit(i)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Read a nullable column as `T`; NULL and type mismatches both give `None`.
fn read<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

/// [`read`] for columns whose type was matched on purpose; failures are logged.
fn read_logged<'r, R, T>(row: &'r R, idx: usize, type_name: &str) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(value) => value,
        Err(e) => {
            warn!(column = idx, type_name, error = %e, "Column value could not be decoded");
            None
        }
    }
}

/// Binary columns are returned base64 encoded.
fn binary(bytes: Vec<u8>) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(value.to_string()))
}

/// The type's own `serde` form, so it deserializes back unchanged.
fn serialized<T: Serialize>(value: T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

type ColumnDecoder<R> = fn(&R, usize, &str, ColumnClass) -> Option<JsonValue>;

fn collect_row<R>(row: &R, db: DatabaseType, decode: ColumnDecoder<R>) -> JsonRow
where
    R: Row,
    usize: ColumnIndex<R>,
{
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let type_name = column.type_info().name();
            let class = ColumnClass::of(type_name, db);
            let value = decode(row, idx, type_name, class).unwrap_or(JsonValue::Null);
            (column.name().to_string(), value)
        })
        .collect()
}

// =============================================================================
// Row to JSON
// =============================================================================

/// Conversion of a driver row into a [`JsonRow`].
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        collect_row(self, DatabaseType::MySQL, mysql::decode)
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        collect_row(self, DatabaseType::PostgreSQL, postgres::decode)
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        collect_row(self, DatabaseType::SQLite, sqlite::decode)
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        class: ColumnClass,
    ) -> Option<JsonValue> {
        match class {
            ColumnClass::Decimal => {
                read_logged::<_, DecimalText>(row, idx, type_name).map(|d| JsonValue::String(d.0))
            }
            // Signed first; BIGINT UNSIGNED does not fit an i64
            ColumnClass::Integer => read::<_, i64>(row, idx)
                .map(JsonValue::from)
                .or_else(|| read::<_, u64>(row, idx).map(JsonValue::from)),
            ColumnClass::Boolean => read::<_, bool>(row, idx).map(JsonValue::Bool),
            ColumnClass::Float => read::<_, f64>(row, idx)
                .or_else(|| read::<_, f32>(row, idx).map(f64::from))
                .map(float),
            ColumnClass::Binary => read::<_, Vec<u8>>(row, idx).map(binary),
            ColumnClass::Json => read::<_, JsonValue>(row, idx),
            ColumnClass::Temporal => temporal(row, idx, type_name),
            _ => read::<_, String>(row, idx).map(JsonValue::String),
        }
    }

    fn temporal(row: &MySqlRow, idx: usize, type_name: &str) -> Option<JsonValue> {
        match type_name.to_ascii_uppercase().as_str() {
            "TIMESTAMP" => read_logged::<_, DateTime<Utc>>(row, idx, type_name).map(serialized),
            "DATE" => read_logged::<_, NaiveDate>(row, idx, type_name).map(serialized),
            "TIME" => read_logged::<_, NaiveTime>(row, idx, type_name).map(serialized),
            _ => read_logged::<_, NaiveDateTime>(row, idx, type_name).map(serialized),
        }
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        class: ColumnClass,
    ) -> Option<JsonValue> {
        match class {
            ColumnClass::Decimal => {
                read_logged::<_, DecimalText>(row, idx, type_name).map(|d| JsonValue::String(d.0))
            }
            // Integer widths are strict here: INT2, INT4 and INT8 each need their own type
            ColumnClass::Integer => read::<_, i64>(row, idx)
                .or_else(|| read::<_, i32>(row, idx).map(i64::from))
                .or_else(|| read::<_, i16>(row, idx).map(i64::from))
                .map(JsonValue::from),
            ColumnClass::Boolean => read::<_, bool>(row, idx).map(JsonValue::Bool),
            ColumnClass::Float => read::<_, f64>(row, idx)
                .or_else(|| read::<_, f32>(row, idx).map(f64::from))
                .map(float),
            ColumnClass::Binary => read::<_, Vec<u8>>(row, idx).map(binary),
            ColumnClass::Json => read::<_, JsonValue>(row, idx),
            ColumnClass::Uuid => read::<_, uuid::Uuid>(row, idx)
                .map(|id| JsonValue::String(id.hyphenated().to_string())),
            ColumnClass::Temporal => temporal(row, idx, type_name),
            _ => read::<_, String>(row, idx).map(JsonValue::String),
        }
    }

    fn temporal(row: &PgRow, idx: usize, type_name: &str) -> Option<JsonValue> {
        match type_name.to_ascii_lowercase().as_str() {
            "timestamptz" => read_logged::<_, DateTime<Utc>>(row, idx, type_name).map(serialized),
            "timestamp" => read_logged::<_, NaiveDateTime>(row, idx, type_name).map(serialized),
            "date" => read_logged::<_, NaiveDate>(row, idx, type_name).map(serialized),
            "time" => read_logged::<_, NaiveTime>(row, idx, type_name).map(serialized),
            _ => read::<_, String>(row, idx).map(JsonValue::String),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::ValueRef;

    pub fn decode(
        row: &SqliteRow,
        idx: usize,
        _type_name: &str,
        class: ColumnClass,
    ) -> Option<JsonValue> {
        match class {
            ColumnClass::Integer => read::<_, i64>(row, idx)
                .map(JsonValue::from)
                .or_else(|| by_storage_class(row, idx)),
            ColumnClass::Boolean => read::<_, bool>(row, idx).map(JsonValue::Bool),
            ColumnClass::Float | ColumnClass::Decimal => read::<_, f64>(row, idx)
                .map(float)
                .or_else(|| by_storage_class(row, idx)),
            ColumnClass::Binary => read::<_, Vec<u8>>(row, idx).map(binary),
            ColumnClass::Json => text(row, idx, true),
            ColumnClass::Text | ColumnClass::Temporal => text(row, idx, false),
            ColumnClass::Uuid | ColumnClass::Unknown => by_storage_class(row, idx),
        }
    }

    /// Decode by what the value actually is.
    ///
    /// Expression columns (`SELECT 1 + 1`, `COUNT(*)`) carry no declared type,
    /// and SQLite lets any column hold any storage class.
    fn by_storage_class(row: &SqliteRow, idx: usize) -> Option<JsonValue> {
        let value = row.try_get_raw(idx).ok()?;
        if value.is_null() {
            return None;
        }
        let storage_class = value.type_info().name().to_string();
        match ColumnClass::of(&storage_class, DatabaseType::SQLite) {
            ColumnClass::Integer => read::<_, i64>(row, idx).map(JsonValue::from),
            ColumnClass::Float => read::<_, f64>(row, idx).map(float),
            ColumnClass::Binary => read::<_, Vec<u8>>(row, idx).map(binary),
            _ => text(row, idx, false),
        }
    }

    fn text(row: &SqliteRow, idx: usize, parse_json: bool) -> Option<JsonValue> {
        match read::<_, String>(row, idx) {
            Some(text) if parse_json => match serde_json::from_str::<JsonValue>(&text) {
                Ok(json) => Some(json),
                Err(_) => Some(JsonValue::String(text)),
            },
            Some(text) => Some(JsonValue::String(text)),
            None => read::<_, Vec<u8>>(row, idx).map(binary),
        }
    }
}
