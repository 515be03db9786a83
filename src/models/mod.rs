//! Data models shared across the crate.

pub mod connection;
pub mod parameters;

pub use connection::{DatabaseType, IsolationLevel, TransactionHandle};
pub use parameters::{
    DynamicParameters, ParamSet, ParamValue, ParameterDescriptor, SqlDecimal,
    ToParam, ValueKind,
};
