//! Tooling around statements.
//!
//! - `format`: shortened SQL and human readable durations for log lines
//! - `guard`: unbounded UPDATE/DELETE detection
//! - `statement_check`: batch validation of statement objects
//! - `contract`: data contract versus table column comparison

pub mod contract;
pub mod format;
pub mod guard;
pub mod statement_check;

pub use contract::{ContractField, compare_database_with_contract, compare_with_contract};
pub use format::{human_duration, short_sql};
pub use guard::{GuardResult, MutationKind, check_unbounded_mutation, inspect_mutations};
pub use statement_check::{
    CheckOutcome, NamedStatement, StatementCheck, StatementReport, check_statements,
    validate_strict,
};
