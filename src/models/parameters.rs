//! Statement parameter models.
//!
//! Parameters are described by a closed set of value kinds instead of being
//! discovered at runtime. Every supported Rust type implements [`ToParam`],
//! which fixes its kind (and whether it is nullable) at compile time, and a
//! [`ParamSet`] keeps the described parameters in declaration order.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Semantic kind of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Char,
    CharArray,
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    U16,
    U32,
    U64,
    Decimal,
    Float,
    Double,
    DateTime,
    DateTimeOffset,
    /// Elapsed time, rendered as 100 ns ticks.
    Duration,
    Uuid,
    Binary,
    /// A type with no database mapping; carries its display name.
    Other(&'static str),
}

impl ValueKind {
    /// Type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text => "String",
            Self::Char => "Char",
            Self::CharArray => "Char[]",
            Self::Bool => "Boolean",
            Self::U8 => "Byte",
            Self::I8 => "SByte",
            Self::I16 => "Int16",
            Self::I32 => "Int32",
            Self::I64 => "Int64",
            Self::U16 => "UInt16",
            Self::U32 => "UInt32",
            Self::U64 => "UInt64",
            Self::Decimal => "Decimal",
            Self::Float => "Single",
            Self::Double => "Double",
            Self::DateTime => "DateTime",
            Self::DateTimeOffset => "DateTimeOffset",
            Self::Duration => "TimeSpan",
            Self::Uuid => "Guid",
            Self::Binary => "Byte[]",
            Self::Other(name) => *name,
        }
    }
}

/// Exact decimal number kept in its textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlDecimal(String);

impl SqlDecimal {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SqlDecimal {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix(['-', '+']).unwrap_or(trimmed);
        let mut parts = digits.splitn(2, '.');
        let whole = parts.next().unwrap_or_default();
        let fraction = parts.next().unwrap_or_default();

        let valid = !(whole.is_empty() && fraction.is_empty())
            && whole.chars().all(|c| c.is_ascii_digit())
            && fraction.chars().all(|c| c.is_ascii_digit());
        if !valid {
            return Err(DbError::invalid_argument(format!(
                "'{}' is not a decimal number",
                s
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl std::fmt::Display for SqlDecimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Char(char),
    CharArray(Vec<char>),
    Bool(bool),
    U8(u8),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U16(u16),
    U32(u32),
    U64(u64),
    Decimal(SqlDecimal),
    Float(f32),
    Double(f64),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Duration(Duration),
    Uuid(Uuid),
    Binary(Vec<u8>),
    Other {
        type_name: &'static str,
        display: String,
    },
}

impl ParamValue {
    /// Get the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Char(_) => ValueKind::Char,
            Self::CharArray(_) => ValueKind::CharArray,
            Self::Bool(_) => ValueKind::Bool,
            Self::U8(_) => ValueKind::U8,
            Self::I8(_) => ValueKind::I8,
            Self::I16(_) => ValueKind::I16,
            Self::I32(_) => ValueKind::I32,
            Self::I64(_) => ValueKind::I64,
            Self::U16(_) => ValueKind::U16,
            Self::U32(_) => ValueKind::U32,
            Self::U64(_) => ValueKind::U64,
            Self::Decimal(_) => ValueKind::Decimal,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::DateTime(_) => ValueKind::DateTime,
            Self::DateTimeOffset(_) => ValueKind::DateTimeOffset,
            Self::Duration(_) => ValueKind::Duration,
            Self::Uuid(_) => ValueKind::Uuid,
            Self::Binary(_) => ValueKind::Binary,
            Self::Other { type_name, .. } => ValueKind::Other(*type_name),
        }
    }

    /// Duration expressed in 100 ns ticks, saturating at `i64::MAX`.
    pub fn duration_ticks(duration: &Duration) -> i64 {
        i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
    }
}

/// One described parameter of a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ValueKind,
    pub nullable: bool,
    /// `None` renders as SQL NULL.
    pub value: Option<ParamValue>,
}

// =============================================================================
// ToParam
// =============================================================================

/// A Rust type usable as a statement parameter.
pub trait ToParam {
    const KIND: ValueKind;
    const NULLABLE: bool = false;

    fn into_param(self) -> Option<ParamValue>;
}

macro_rules! impl_to_param {
    ($($ty:ty => $kind:ident),+ $(,)?) => {
        $(
            impl ToParam for $ty {
                const KIND: ValueKind = ValueKind::$kind;

                fn into_param(self) -> Option<ParamValue> {
                    Some(ParamValue::$kind(self))
                }
            }
        )+
    };
}

impl_to_param!(
    String => Text,
    char => Char,
    Vec<char> => CharArray,
    bool => Bool,
    u8 => U8,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    SqlDecimal => Decimal,
    f32 => Float,
    f64 => Double,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
    Duration => Duration,
    Uuid => Uuid,
    Vec<u8> => Binary,
);

impl ToParam for &str {
    const KIND: ValueKind = ValueKind::Text;

    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Text(self.to_string()))
    }
}

impl ToParam for &String {
    const KIND: ValueKind = ValueKind::Text;

    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Text(self.clone()))
    }
}

impl ToParam for &[u8] {
    const KIND: ValueKind = ValueKind::Binary;

    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Binary(self.to_vec()))
    }
}

impl ToParam for DateTime<Utc> {
    const KIND: ValueKind = ValueKind::DateTimeOffset;

    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::DateTimeOffset(self.fixed_offset()))
    }
}

impl<T: ToParam> ToParam for Option<T> {
    const KIND: ValueKind = T::KIND;
    const NULLABLE: bool = true;

    fn into_param(self) -> Option<ParamValue> {
        self.and_then(ToParam::into_param)
    }
}

// =============================================================================
// ParamSet
// =============================================================================

/// Ordered, name-unique set of statement parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    entries: Vec<ParameterDescriptor>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, replacing (in place) any parameter of the same name.
    ///
    /// A leading `@` is stripped. Empty names are rejected.
    pub fn insert<T: ToParam>(&mut self, name: &str, value: T) -> DbResult<()> {
        let name = normalize_name(name)?;
        self.upsert(ParameterDescriptor {
            name,
            kind: T::KIND,
            nullable: T::NULLABLE,
            value: value.into_param(),
        });
        Ok(())
    }

    /// Builder form of [`ParamSet::insert`].
    pub fn with<T: ToParam>(mut self, name: &str, value: T) -> DbResult<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Used by the `params!` macro, whose names are identifiers and never empty.
    #[doc(hidden)]
    pub fn push_named<T: ToParam>(&mut self, name: &'static str, value: T) {
        self.upsert(ParameterDescriptor {
            name: name.trim_start_matches("r#").to_string(),
            kind: T::KIND,
            nullable: T::NULLABLE,
            value: value.into_param(),
        });
    }

    /// Insert an already described parameter.
    pub fn push(&mut self, descriptor: ParameterDescriptor) -> DbResult<()> {
        let name = normalize_name(&descriptor.name)?;
        self.upsert(ParameterDescriptor { name, ..descriptor });
        Ok(())
    }

    fn upsert(&mut self, descriptor: ParameterDescriptor) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.name.eq_ignore_ascii_case(&descriptor.name))
        {
            Some(existing) => *existing = descriptor,
            None => self.entries.push(descriptor),
        }
    }

    /// Look up a parameter by name, ignoring ASCII case and a leading `@`.
    pub fn get(&self, name: &str) -> Option<&ParameterDescriptor> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.entries
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Position of a parameter in declaration order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.entries
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn as_slice(&self) -> &[ParameterDescriptor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParameterDescriptor> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a ParamSet {
    type Item = &'a ParameterDescriptor;
    type IntoIter = std::slice::Iter<'a, ParameterDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn normalize_name(name: &str) -> DbResult<String> {
    let trimmed = name.trim();
    let stripped = trimmed.strip_prefix('@').unwrap_or(trimmed);
    if stripped.is_empty() {
        return Err(DbError::invalid_argument(
            "Cannot create Dynamic parameter with empty name.",
        ));
    }
    Ok(stripped.to_string())
}

/// Build a [`ParamSet`] from `name: value` pairs.
///
/// ```
/// use sqlx_cqrs::params;
///
/// let params = params! { val: 12, name: "Rust" };
/// assert_eq!(params.len(), 2);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::models::ParamSet::new()
    };
    ($($name:ident : $value:expr),+ $(,)?) => {{
        let mut set = $crate::models::ParamSet::new();
        $(
            set.push_named(stringify!($name), $value);
        )+
        set
    }};
}

// =============================================================================
// DynamicParameters
// =============================================================================

/// Parameter holder assembled at runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicParameters {
    params: ParamSet,
}

impl DynamicParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter.
    pub fn add<T: ToParam>(&mut self, name: &str, value: T) -> DbResult<&mut Self> {
        self.params.insert(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.params.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn as_param_set(&self) -> &ParamSet {
        &self.params
    }
}

impl From<DynamicParameters> for ParamSet {
    fn from(value: DynamicParameters) -> Self {
        value.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_macro_keeps_declaration_order() {
        let set = crate::params! { id: 7i64, name: "Queen", rating: Some(4.5f64) };
        let names: Vec<_> = set.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "rating"]);

        let rating = set.get("rating").unwrap();
        assert_eq!(rating.kind, ValueKind::Double);
        assert!(rating.nullable);
    }

    #[test]
    fn test_option_none_is_null_but_keeps_kind() {
        let set = crate::params! { deleted_at: None::<NaiveDateTime> };
        let param = set.get("@deleted_at").unwrap();
        assert_eq!(param.kind, ValueKind::DateTime);
        assert!(param.nullable);
        assert_eq!(param.value, None);
    }

    #[test]
    fn test_param_sets_compare_by_value() {
        assert_eq!(crate::params! { val: 12 }, crate::params! { val: 12 });
        assert_ne!(crate::params! { val: 12 }, crate::params! { val: 13 });
        assert_ne!(crate::params! { val: 12 }, crate::params! { val: 12i64 });
    }

    #[test]
    fn test_insert_replaces_existing_name() {
        let mut set = ParamSet::new();
        set.insert("a", 1).unwrap();
        set.insert("b", 2).unwrap();
        set.insert("@A", "text").unwrap();

        assert_eq!(set.len(), 2);
        let first = set.iter().next().unwrap();
        assert_eq!(first.name, "A");
        assert_eq!(first.value, Some(ParamValue::Text("text".into())));
    }

    #[test]
    fn test_dynamic_parameters_reject_empty_name() {
        let mut params = DynamicParameters::new();
        for name in ["", "   ", "@"] {
            let err = params.add(name, 1).unwrap_err();
            assert!(matches!(err, DbError::InvalidArgument { .. }));
            assert!(err.to_string().contains("empty name"));
        }
        assert!(params.is_empty());
    }

    #[test]
    fn test_dynamic_parameters_strip_at_sign() {
        let mut params = DynamicParameters::new();
        params.add("@ArtistId", 3).unwrap().add("Name", "AC/DC").unwrap();

        assert_eq!(params.names().collect::<Vec<_>>(), vec!["ArtistId", "Name"]);
        assert_eq!(params.get("artistid").unwrap().kind, ValueKind::I32);

        let set: ParamSet = params.into();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_sql_decimal_parsing() {
        assert_eq!("12.50".parse::<SqlDecimal>().unwrap().as_str(), "12.50");
        assert_eq!("-3".parse::<SqlDecimal>().unwrap().as_str(), "-3");
        assert!(".".parse::<SqlDecimal>().is_err());
        assert!("1e5".parse::<SqlDecimal>().is_err());
        assert!("12.5.1".parse::<SqlDecimal>().is_err());
    }

    #[test]
    fn test_duration_ticks() {
        assert_eq!(
            ParamValue::duration_ticks(&Duration::from_millis(1)),
            10_000
        );
    }
}
