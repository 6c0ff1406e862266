//! oxide-db CLI
//!
//! Command-line tool for synchronizing schemas and inspecting databases.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_db::prelude::*;
use oxide_db::sync::synchronize;

/// Schema synchronization for SQLite and PostgreSQL.
#[derive(Parser)]
#[command(name = "oxide-db")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (`sqlite:<path>` or `postgres://...`).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize the database with a JSON schema description.
    Sync {
        /// Schema description file.
        #[arg(short, long)]
        schema: PathBuf,

        /// Drop tables no collection declares.
        #[arg(long)]
        drop_tables: bool,

        /// Drop columns no field declares.
        #[arg(long)]
        drop_columns: bool,
    },

    /// Print the persisted schema map.
    ShowSchema,

    /// List held advisory locks.
    Locks,

    /// Release advisory locks.
    Unlock {
        /// Lock to release.
        name: Option<String>,

        /// Release every lock.
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },

    /// Execute a statement and print its result as JSON.
    Exec {
        /// SQL with named `$name` parameters.
        sql: String,

        /// Parameter as `name=json`; plain text is bound as a string.
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map(Value::from)
        .unwrap_or_else(|_| Value::Text(value.to_string()));
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ConnectionConfig::from(cli.database.as_str());
    if config.dialect_kind()? == DialectKind::D1 {
        bail!("D1 bindings are only reachable from their host runtime");
    }
    let backend = config.open(1, &Default::default()).await?;
    let locks = oxide_db::lock::LockManager::new();
    oxide_db::options::ensure_table(backend.executor()).await?;

    match cli.command {
        Commands::Sync {
            schema,
            drop_tables,
            drop_columns,
        } => {
            let json = std::fs::read_to_string(&schema)
                .with_context(|| format!("reading {}", schema.display()))?;
            let resolved = resolve(&Schema::from_json(&json)?)?;
            let options = SyncOptions::new()
                .with_drop_tables(drop_tables)
                .with_drop_columns(drop_columns);
            match synchronize(backend.as_ref(), &locks, &resolved, &options).await? {
                SyncOutcome::Unchanged => info!("Schema already up to date."),
                SyncOutcome::Synchronized => info!("Schema synchronized."),
            }
        }

        Commands::ShowSchema => match oxide_db::sync::persisted_map(backend.executor()).await? {
            Some(map) => println!("{}", serde_json::to_string_pretty(&map)?),
            None => info!("No schema has been synchronized yet."),
        },

        Commands::Locks => {
            let held = locks.list(backend.executor()).await?;
            if held.is_empty() {
                info!("No locks are held.");
            } else {
                println!("\nHeld locks:");
                println!("{:-<60}", "");
                for lock in &held {
                    match lock.acquired_at {
                        Some(at) => println!(" {} (since {})", lock.name, at.format("%Y-%m-%d %H:%M:%S")),
                        None => println!(" {}", lock.name),
                    }
                }
                println!();
            }
        }

        Commands::Unlock { name, all } => {
            if all {
                let released = locks.unlock_all(backend.executor()).await?;
                info!("Released {released} lock(s).");
            } else if let Some(name) = name {
                if locks.unlock(backend.executor(), &name).await? {
                    info!("Released lock {name}.");
                } else {
                    info!("Lock {name} was not held.");
                }
            } else {
                bail!("pass a lock name or --all");
            }
        }

        Commands::Exec { sql, params } => {
            let params: Params = params.into_iter().collect();
            let timed = backend.exec_with_duration(&sql, &params, false).await?;
            match timed.result {
                QueryResult::Rows(rows) => println!("{}", serde_json::to_string_pretty(&rows)?),
                QueryResult::Count(count) => println!("{count} row(s) affected"),
            }
            info!("Took {:.2} ms", timed.duration_ms);
        }
    }

    backend.close().await;
    Ok(())
}
