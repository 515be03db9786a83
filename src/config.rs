//! Configuration handling.
//!
//! `ContextConfig` describes one unit-of-work context: where to connect, which
//! isolation level transactions use, how long a statement may run, and which
//! database routine validates statements. It can be built in code, deserialized,
//! read from the environment, or assembled from the CLI arguments in [`Config`].

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_VALIDATOR_FUNCTION: &str = "dbo.CheckSql";

pub const ENV_CONNECTION_STRING: &str = "SQLX_CQRS_CONNECTION_STRING";
pub const ENV_ISOLATION_LEVEL: &str = "SQLX_CQRS_ISOLATION_LEVEL";
pub const ENV_COMMAND_TIMEOUT_SECS: &str = "SQLX_CQRS_COMMAND_TIMEOUT_SECS";
pub const ENV_VALIDATOR_FUNCTION: &str = "SQLX_CQRS_VALIDATOR_FUNCTION";

const MISSING_CONNECTION_STRING: &str =
    "SQL Database Context object did not receive SQL Connection string during its construction.";

/// Settings of a single database context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// `0` disables the timeout.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_validator_function")]
    pub validator_function: String,
}

fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_validator_function() -> String {
    DEFAULT_VALIDATOR_FUNCTION.to_string()
}

impl ContextConfig {
    /// Option keys recognised in the connection string query and removed
    /// before it is handed to the driver.
    const CONTEXT_OPTION_KEYS: &'static [&'static str] =
        &["isolation_level", "command_timeout", "validator_function"];

    /// Create a configuration from a connection string.
    ///
    /// `isolation_level`, `command_timeout` and `validator_function` may be
    /// given as query parameters of the connection string.
    pub fn new(connection_string: impl Into<String>) -> DbResult<Self> {
        let mut config = Self {
            connection_string: connection_string.into(),
            isolation_level: IsolationLevel::default(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            validator_function: default_validator_function(),
        };
        config.database_type()?;
        config.apply_connection_string_options()?;
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration from `SQLX_CQRS_*` environment variables.
    pub fn from_env() -> DbResult<Self> {
        let connection_string = std::env::var(ENV_CONNECTION_STRING).unwrap_or_default();
        let mut config = Self::new(connection_string)?;

        if let Ok(level) = std::env::var(ENV_ISOLATION_LEVEL) {
            config.isolation_level = level.parse().map_err(DbError::configuration)?;
        }
        if let Ok(timeout) = std::env::var(ENV_COMMAND_TIMEOUT_SECS) {
            config.command_timeout_secs = timeout.trim().parse().map_err(|_| {
                DbError::configuration(format!(
                    "{} must be a number of seconds, got '{}'",
                    ENV_COMMAND_TIMEOUT_SECS, timeout
                ))
            })?;
        }
        if let Ok(function) = std::env::var(ENV_VALIDATOR_FUNCTION) {
            config.validator_function = function.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_command_timeout(mut self, timeout_secs: u64) -> Self {
        self.command_timeout_secs = timeout_secs;
        self
    }

    pub fn with_validator_function(mut self, function: impl Into<String>) -> Self {
        self.validator_function = function.into();
        self
    }

    /// Detect the backend from the connection string scheme.
    pub fn database_type(&self) -> DbResult<DatabaseType> {
        if self.connection_string.trim().is_empty() {
            return Err(DbError::configuration(MISSING_CONNECTION_STRING));
        }
        DatabaseType::from_connection_string(&self.connection_string).ok_or_else(|| {
            DbError::configuration(format!(
                "Unknown database type in connection string: {}",
                self.masked_connection_string()
            ))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> DbResult<()> {
        self.database_type()?;

        if self.command_timeout_secs > MAX_COMMAND_TIMEOUT_SECS {
            return Err(DbError::configuration(format!(
                "command timeout ({}s) cannot exceed {}s",
                self.command_timeout_secs, MAX_COMMAND_TIMEOUT_SECS
            )));
        }

        let valid_function = !self.validator_function.is_empty()
            && self.validator_function.split('.').all(|part| {
                !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !valid_function {
            return Err(DbError::configuration(format!(
                "'{}' is not a valid validator function name",
                self.validator_function
            )));
        }
        Ok(())
    }

    /// Command timeout, or `None` when disabled.
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        let cs = &self.connection_string;
        let credentials_start = cs.find("://").map(|pos| pos + 3).unwrap_or(0);
        if let Some(at_pos) = cs.rfind('@').filter(|&pos| pos > credentials_start) {
            if let Some(colon_pos) = cs[credentials_start..at_pos].rfind(':') {
                let prefix = &cs[..credentials_start + colon_pos + 1];
                let suffix = &cs[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
        cs.clone()
    }

    /// `host:port/database` (or the SQLite file) for log lines.
    pub fn data_source(&self) -> String {
        let Ok(url) = Url::parse(&self.connection_string) else {
            return self.masked_connection_string();
        };

        if url.scheme().eq_ignore_ascii_case("sqlite") {
            let path = self
                .connection_string
                .split_once(':')
                .map(|(_, rest)| rest.trim_start_matches("//"))
                .unwrap_or_default();
            return path.split('?').next().unwrap_or_default().to_string();
        }

        let host = url.host_str().unwrap_or("localhost");
        let port = url
            .port()
            .or_else(|| self.database_type().ok().and_then(|t| t.default_port()));
        let database = url.path().trim_start_matches('/');
        match port {
            Some(port) => format!("{}:{}/{}", host, port, database),
            None => format!("{}/{}", host, database),
        }
    }

    fn apply_connection_string_options(&mut self) -> DbResult<()> {
        let Ok(mut url) = Url::parse(&self.connection_string) else {
            return Ok(());
        };
        let mut opts = extract_options(&mut url, Self::CONTEXT_OPTION_KEYS);
        if opts.is_empty() {
            return Ok(());
        }

        if let Some(level) = opts.remove("isolation_level") {
            self.isolation_level = level.parse().map_err(DbError::configuration)?;
        }
        if let Some(timeout) = opts.remove("command_timeout") {
            self.command_timeout_secs = timeout.parse().map_err(|_| {
                DbError::configuration(format!(
                    "command_timeout must be a number of seconds, got '{}'",
                    timeout
                ))
            })?;
        }
        if let Some(function) = opts.remove("validator_function") {
            self.validator_function = function;
        }

        self.connection_string = url.to_string();
        Ok(())
    }
}

/// Extract context options from URL query params, keeping others for the driver.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if opts.is_empty() {
        return opts;
    }
    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

// =============================================================================
// CLI
// =============================================================================

/// Command line of the `sqlx-cqrs` tool.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sqlx-cqrs",
    about = "Validate SQL statements against a live database schema",
    version
)]
pub struct Config {
    /// Database connection string
    #[arg(
        short = 'd',
        long = "database",
        value_name = "URL",
        env = ENV_CONNECTION_STRING,
        global = true
    )]
    pub database: Option<String>,

    /// Function used to validate statements
    #[arg(
        long,
        default_value = DEFAULT_VALIDATOR_FUNCTION,
        env = ENV_VALIDATOR_FUNCTION,
        global = true
    )]
    pub validator_function: String,

    /// Statement timeout in seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT_SECS, global = true)]
    pub command_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SQLX_CQRS_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SQLX_CQRS_JSON_LOGS", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check a statement for unbounded mutations and validate it against the database
    Check {
        /// SQL text to check
        #[arg(conflicts_with = "file")]
        sql: Option<String>,

        /// Read the SQL text from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Parameter type signature, e.g. "@id INT,@name NVARCHAR(4000)"
        #[arg(short, long)]
        parameter_types: Option<String>,
    },
    /// Print the shortened single-line rendering of a statement
    Shorten {
        /// SQL text to shorten
        sql: String,
    },
    /// Create the validator function in the target database
    InstallValidator {
        /// Print the DDL instead of running it (for SQL Server tooling)
        #[arg(long)]
        print: bool,
    },
}

impl Config {
    /// Build the context configuration for the selected database.
    pub fn context_config(&self) -> DbResult<ContextConfig> {
        let connection_string = self.database.clone().unwrap_or_default();
        let config = ContextConfig::new(connection_string)?
            .with_validator_function(self.validator_function.clone())
            .with_command_timeout(self.command_timeout);
        config.validate()?;
        Ok(config)
    }
}
