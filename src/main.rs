//! sqlx-cqrs - command line entry point.
//!
//! Checks single statements against a live database, prints shortened SQL,
//! and installs the validator function.

use clap::Parser;
use sqlx_cqrs::config::{Command, Config};
use sqlx_cqrs::cqrs::{CommandQueryContext, SqlDatabaseSession, Statement, validate_sql};
use sqlx_cqrs::db::ValidatorFunctionCreateCommand;
use sqlx_cqrs::tools::{check_unbounded_mutation, short_sql};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    match &config.command {
        Command::Shorten { sql } => {
            println!("{}", short_sql(sql));
        }
        Command::Check {
            sql,
            file,
            parameter_types,
        } => {
            let sql = match (sql, file) {
                (Some(sql), _) => sql.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)?,
                (None, None) => {
                    eprintln!("Error: give the SQL text as an argument or with --file.");
                    eprintln!();
                    eprintln!("Examples:");
                    eprintln!("  sqlx-cqrs check \"SELECT Name FROM Artist WHERE ArtistId = @id\" -p \"@id INT\"");
                    eprintln!("  sqlx-cqrs check --file query.sql");
                    std::process::exit(2);
                }
            };

            if let Err(e) = check_unbounded_mutation(&sql) {
                error!(sql = %short_sql(&sql), "Unbounded mutation");
                return Err(e.into());
            }

            let mut session = SqlDatabaseSession::from_config(config.context_config()?)?;
            let outcome = validate_sql(&mut session, &sql, parameter_types.clone()).await;
            // nothing of the check may persist
            session.context_mut().rollback_transaction(true).await?;
            session.release_connection().await?;

            match outcome {
                Ok(()) => println!("OK"),
                Err(e) => {
                    error!(sql = %short_sql(&sql), error = %e, "Statement is invalid");
                    return Err(e.into());
                }
            }
        }
        Command::InstallValidator { print } => {
            let function = config.validator_function.clone();
            if *print {
                println!("{}", ValidatorFunctionCreateCommand::new(&function).sql_statement());
                return Ok(());
            }

            let context_config = config.context_config()?;

            let command =
                ValidatorFunctionCreateCommand::for_database(&function, context_config.database_type()?)?;
            info!(
                target_db = %context_config.data_source(),
                function = %function,
                "Installing validator function"
            );
            let mut ctx = CommandQueryContext::connect(context_config).await?;
            ctx.execute(&command).await?;
            ctx.release_connection().await?;
            info!("Validator function installed");
        }
    }

    Ok(())
}
