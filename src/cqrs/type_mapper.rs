//! Parameter type mapping.
//!
//! Turns a [`ParamSet`] into the two artifacts the validation and debugging
//! paths need: a type signature (`@name TYPE,@other TYPE`) handed to the
//! schema validator, and a `DECLARE` block that, prepended to the statement,
//! reproduces the exact call as a script.

use crate::models::{ParamSet, ParamValue, ParameterDescriptor, ValueKind};
use std::fmt::Write as _;

/// Strings longer than this are shortened in the `DECLARE` block.
pub const LITERAL_MAX_LENGTH: usize = 75;
const LITERAL_KEPT_LENGTH: usize = 72;

/// Canonical database type used in the validator signature.
///
/// `None` means the kind has no mapping and is left out of the signature.
pub fn signature_type(kind: ValueKind) -> Option<&'static str> {
    let sql_type = match kind {
        ValueKind::Text | ValueKind::CharArray => "NVARCHAR(4000)",
        ValueKind::Char => "NCHAR(1)",
        ValueKind::DateTime | ValueKind::DateTimeOffset => "DATETIME",
        ValueKind::Duration => "BIGINT",
        ValueKind::Uuid => "UNIQUEIDENTIFIER",
        ValueKind::U8 => "TINYINT",
        ValueKind::I8 | ValueKind::I16 => "SMALLINT",
        ValueKind::I32 | ValueKind::U16 => "INT",
        ValueKind::I64 | ValueKind::U32 => "BIGINT",
        ValueKind::U64 => "DECIMAL(20)",
        ValueKind::Bool => "BIT",
        ValueKind::Decimal => "DECIMAL(29,4)",
        ValueKind::Double => "FLOAT",
        ValueKind::Float => "REAL",
        ValueKind::Binary => "VARBINARY(MAX)",
        ValueKind::Other(_) => return None,
    };
    Some(sql_type)
}

/// Database type used for a variable in the `DECLARE` block.
///
/// Text variables get a narrower bound here; they only need to hold the
/// (possibly shortened) literal.
pub fn declaration_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Text => "NVARCHAR(100)",
        ValueKind::CharArray => "NVARCHAR(1000)",
        ValueKind::Other(name) => name,
        other => signature_type(other).unwrap_or_else(|| other.type_name()),
    }
}

/// Type signature for the schema validator, e.g. `@id INT,@name NVARCHAR(4000)`.
///
/// Returns `None` when there are no parameters or none of them has a mapping.
pub fn parameter_types(params: Option<&ParamSet>) -> Option<String> {
    let signature = params?
        .iter()
        .filter_map(|p| signature_type(p.kind).map(|sql_type| format!("@{} {}", p.name, sql_type)))
        .collect::<Vec<_>>()
        .join(",");

    if signature.is_empty() {
        None
    } else {
        Some(signature)
    }
}

/// One `DECLARE @name TYPE = literal;` line per parameter.
pub fn parameter_declarations(params: &ParamSet) -> String {
    params
        .iter()
        .map(declaration_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// The statement preceded by its `DECLARE` block, or the statement alone
/// when it has no parameters.
pub fn real_sql_statement(sql: &str, params: Option<&ParamSet>) -> String {
    match params.filter(|p| !p.is_empty()) {
        Some(params) => format!("{}\n{}", parameter_declarations(params), sql),
        None => sql.to_string(),
    }
}

fn declaration_line(param: &ParameterDescriptor) -> String {
    let literal = match &param.value {
        Some(value) => literal(value),
        None => "NULL".to_string(),
    };
    format!(
        "DECLARE @{} {} = {};",
        param.name,
        declaration_type(param.kind),
        literal
    )
}

/// Invariant-culture literal for a value.
fn literal(value: &ParamValue) -> String {
    match value {
        ParamValue::Text(s) => quoted(&shorten(s)),
        ParamValue::CharArray(chars) => quoted(&shorten(&chars.iter().collect::<String>())),
        ParamValue::Char(c) => quoted(&c.to_string()),
        ParamValue::Bool(b) => u8::from(*b).to_string(),
        ParamValue::U8(v) => v.to_string(),
        ParamValue::I8(v) => v.to_string(),
        ParamValue::I16(v) => v.to_string(),
        ParamValue::I32(v) => v.to_string(),
        ParamValue::I64(v) => v.to_string(),
        ParamValue::U16(v) => v.to_string(),
        ParamValue::U32(v) => v.to_string(),
        ParamValue::U64(v) => v.to_string(),
        ParamValue::Decimal(d) => d.to_string(),
        ParamValue::Float(v) => v.to_string(),
        ParamValue::Double(v) => v.to_string(),
        ParamValue::DateTime(dt) => quoted(&dt.format("%Y-%m-%d %H:%M:%SZ").to_string()),
        ParamValue::DateTimeOffset(dt) => quoted(
            &dt.naive_utc()
                .format("%Y-%m-%d %H:%M:%SZ")
                .to_string(),
        ),
        ParamValue::Duration(d) => ParamValue::duration_ticks(d).to_string(),
        ParamValue::Uuid(u) => quoted(&u.hyphenated().to_string()),
        ParamValue::Binary(bytes) => {
            let mut hex = String::with_capacity(2 + bytes.len() * 2);
            hex.push_str("0x");
            for byte in bytes {
                let _ = write!(hex, "{:02X}", byte);
            }
            hex
        }
        ParamValue::Other { display, .. } => quoted(display),
    }
}

fn shorten(s: &str) -> String {
    if s.chars().count() > LITERAL_MAX_LENGTH {
        let mut kept: String = s.chars().take(LITERAL_KEPT_LENGTH).collect();
        kept.push_str("...");
        kept
    } else {
        s.to_string()
    }
}

fn quoted(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
