//! Error types for the data access layer.
//!
//! Variants are grouped by who has to react: configuration errors are fatal,
//! statement errors are fixed by the author of the statement, and execution
//! errors have already been recovered from by the context when they surface.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("SQL statement is invalid: {message}")]
    Syntax { message: String, sql: String },

    #[error("Unbounded mutation: {operation} affects every row of the target table")]
    UnboundedMutation { operation: String, sql: String },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Not implemented: {message}")]
    NotImplemented { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a syntax error carrying the validator message and the offending SQL.
    pub fn syntax(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            sql: sql.into(),
        }
    }

    pub fn unbounded_mutation(operation: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::UnboundedMutation {
            operation: operation.into(),
            sql: sql.into(),
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Bad input detected before anything reached the database.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// What the caller can do about it, for errors that come with a hint.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// The SQL text attached to statement-level errors.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Syntax { sql, .. } | Self::UnboundedMutation { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Whether running the same unit of work again may succeed.
    ///
    /// Deadlock and serialization victims (SQLSTATE class 40) count.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Database { sql_state, .. } => {
                sql_state.as_deref().is_some_and(|s| s.starts_with("40"))
            }
            _ => false,
        }
    }

    /// Whether the statement was given up on while it may still be running.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }

    /// Whether the context must discard the current transaction after this error.
    ///
    /// Only failures raised while a statement was running on the server qualify.
    /// Errors produced before the statement was sent, or while decoding rows
    /// afterwards, leave the transaction untouched.
    pub fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Timeout { .. } | Self::Cancelled { .. }
        )
    }
}

/// Hint for an engine error, picked by the SQLSTATE class.
fn state_suggestion(sql_state: Option<&str>) -> &'static str {
    match sql_state.map(|s| s.get(..2).unwrap_or(s)) {
        Some("23") => "The statement violates a constraint; check keys and NOT NULL columns",
        Some("40") => "The transaction was chosen as a deadlock or serialization victim; run the unit of work again",
        Some("42") => "Check the SQL syntax and the referenced tables and columns",
        Some("22") => "A parameter value does not fit the column type",
        _ => "Check the SQL statement and its parameters",
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => Self::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = state_suggestion(code.as_deref());
                Self::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => Self::database(
                "Statement returned no rows",
                None,
                "Use an optional result when the row may be missing",
            ),
            sqlx::Error::Io(io_err) => Self::connection(
                format!("I/O error: {}", io_err),
                "Check that the database server is reachable",
            ),
            sqlx::Error::Tls(tls_err) => Self::connection(
                format!("TLS error: {}", tls_err),
                "Build with the tls-native or tls-rustls feature and check certificates",
            ),
            sqlx::Error::Protocol(msg) => Self::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => {
                Self::connection("Database worker crashed", "Release the context and retry")
            }
            sqlx::Error::TypeNotFound { type_name } => {
                Self::schema(format!("Type not found: {}", type_name), type_name)
            }
            sqlx::Error::ColumnNotFound(column) => {
                Self::decode(format!("Column not found in result: {}", column))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => Self::decode(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::decode(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => Self::decode(source.to_string()),
            other => Self::internal(format!("Unexpected driver error: {}", other)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
