//! txsql - Main entry point.
//!
//! Runs one query or statement against PostgreSQL or SQLite and prints the result as
//! JSON lines on stdout. Logs go to stderr.

use clap::Parser;
use futures_util::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use txsql::DbResult;
use txsql::config::{Command, Config};
use txsql::db::{
    Database, Provider, RequestTransactionScope, ResultStream, Row, Transaction, TransactionExt,
    wait_for_accept_connections,
};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
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

async fn print_rows(mut rows: ResultStream<Row>) -> DbResult<u64> {
    let mut printed = 0;
    while let Some(row) = rows.try_next().await? {
        println!("{}", row.to_json());
        printed += 1;
    }
    Ok(printed)
}

async fn run(db: &Database, command: Command) -> DbResult<()> {
    match command {
        Command::Query { sql } => {
            let printed = print_rows(db.query(sql).run()).await?;
            info!(rows = printed, "Query finished");
        }
        Command::Select {
            table,
            filters,
            order,
            desc,
            limit,
        } => {
            let mut select = db.select(&table).filter(filters);
            if let Some(column) = &order {
                select = select.order(column, !desc);
            }
            if let Some(limit) = limit {
                select = select.limit(limit);
            }
            let printed = print_rows(select.run()).await?;
            info!(rows = printed, table = %table, "Select finished");
        }
        Command::Exec { sql, dry_run } => {
            let affected = if dry_run {
                let transaction = Transaction::open(Arc::clone(db.provider()));
                let result = db.exec(&sql, &[]).in_transaction(&transaction).await;
                transaction.close(false).await;
                result?
            } else {
                RequestTransactionScope::new(Arc::clone(db.provider()))
                    .run(db.exec(&sql, &[]))
                    .await?
            };
            println!("{}", json!({ "affected": affected, "committed": !dry_run }));
        }
        Command::Count { table, filters } => {
            let count = db.count(&table, filters).await?;
            println!("{}", json!({ "count": count }));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    let source = config.data_source()?;
    info!(
        dialect = %source.dialect,
        "Starting txsql v{}",
        env!("CARGO_PKG_VERSION")
    );

    let sqlx_provider =
        Arc::new(wait_for_accept_connections(&source, config.wait_tries, config.wait_delay()).await?);
    let provider: Provider = sqlx_provider.clone();
    let db = Database::new(provider);

    let result = run(&db, config.command).await;
    sqlx_provider.close().await;

    if let Err(e) = result {
        error!(error = %e, suggestion = ?e.suggestion(), "Command failed");
        return Err(e.into());
    }
    Ok(())
}
