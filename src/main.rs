use std::process;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use handreceipt_lib::db::{Database, OpenOptions, SchemaCoordinator, TxMode};
use handreceipt_lib::migrate::{LATEST_VERSION, MIGRATIONS};
use handreceipt_lib::outbox::{HttpRemote, ShutdownSignal};
use handreceipt_lib::{seed, AppConfig, AppState, Table};

#[derive(Debug, Parser)]
#[command(name = "handreceipt", about = "Hand receipt local store and sync tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schema inspection and migration.
    #[command(subcommand)]
    Db(DbCommand),
    /// Load the demo dataset into empty tables.
    Seed,
    /// Print the maintenance stats snapshot.
    Stats,
    /// Print every stored row of a table as JSON.
    List {
        /// Table name, e.g. `maintenance-items` or `consumables`.
        table: String,
    },
    /// Inspect and resolve queued remote mutations.
    #[command(subcommand)]
    Outbox(OutboxCommand),
    /// Replay queued mutations against the remote API.
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Open the database at the latest version and report row counts.
    Status,
    /// Apply migrations up to a version (default: latest).
    Migrate {
        #[arg(long)]
        to: Option<i64>,
    },
}

#[derive(Debug, Subcommand)]
enum OutboxCommand {
    /// List queued entries in replay order.
    List {
        /// Only entries that need manual resolution.
        #[arg(long)]
        failed: bool,
    },
    /// Requeue a failed entry.
    Retry { id: String },
    /// Drop an entry without sending it.
    Discard { id: String },
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    /// Run one drain and print the report.
    Drain,
}

#[tokio::main]
async fn main() {
    handreceipt_lib::init_logging();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{serialized}");
    Ok(())
}

async fn open_state(config: &AppConfig) -> Result<AppState> {
    let mut config = config.clone();
    config.seed_demo = false;
    let (state, _) = AppState::init(&config)
        .await
        .with_context(|| format!("open database at {}", config.db_path().display()))?;
    Ok(state)
}

async fn run(command: Commands) -> Result<i32> {
    let config = AppConfig::from_env().context("load configuration")?;
    match command {
        Commands::Db(DbCommand::Migrate { to }) => {
            let target = to.unwrap_or(LATEST_VERSION);
            let options = OpenOptions::file(config.db_path()).with_open_timeout(config.open_timeout);
            let db = Database::open(&SchemaCoordinator::default(), &options, target, MIGRATIONS)
                .await
                .with_context(|| format!("migrate {} to version {target}", options.name))?;
            print_json(&json!({ "db": db.name(), "version": db.version() }))?;
            db.close().await;
            Ok(0)
        }
        Commands::Db(DbCommand::Status) => {
            let state = open_state(&config).await?;
            let mut tx = state.db.begin(&Table::ALL, TxMode::ReadOnly).await?;
            let mut tables = serde_json::Map::new();
            for table in Table::ALL {
                let count = tx.count(table).await?;
                tables.insert(table.name().to_string(), json!(count));
            }
            tx.commit().await?;
            print_json(&json!({
                "db": state.db.name(),
                "version": state.db.version(),
                "latest": LATEST_VERSION,
                "tables": tables,
                "outbox": state.outbox.status(),
            }))?;
            state.shutdown().await;
            Ok(0)
        }
        Commands::Seed => {
            let state = open_state(&config).await?;
            let report = seed::seed_demo(&state.store).await.context("seed demo data")?;
            print_json(&report)?;
            state.shutdown().await;
            Ok(0)
        }
        Commands::Stats => {
            let state = open_state(&config).await?;
            let snapshot = state.store.stats_snapshot().await?;
            print_json(&snapshot)?;
            state.shutdown().await;
            Ok(0)
        }
        Commands::List { table } => {
            let table = Table::parse(&table).ok_or_else(|| anyhow!("unknown table: {table}"))?;
            let state = open_state(&config).await?;
            let rows = state.db.get_all_raw(table).await?;
            print_json(&rows)?;
            state.shutdown().await;
            Ok(0)
        }
        Commands::Outbox(command) => {
            let state = open_state(&config).await?;
            match command {
                OutboxCommand::List { failed } => {
                    let entries = if failed {
                        state.outbox.failed_entries().await?
                    } else {
                        state.outbox.entries().await?
                    };
                    print_json(&entries)?;
                }
                OutboxCommand::Retry { id } => {
                    let entry = state.outbox.retry(&id).await?;
                    print_json(&entry)?;
                }
                OutboxCommand::Discard { id } => {
                    state.outbox.discard(&id).await?;
                    print_json(&json!({ "discarded": id }))?;
                }
            }
            state.shutdown().await;
            Ok(0)
        }
        Commands::Sync(SyncCommand::Drain) => {
            let url = config
                .api_url
                .clone()
                .ok_or_else(|| anyhow!("HANDRECEIPT_API_URL is not set"))?;
            let remote = HttpRemote::new(url, config.api_token.clone())
                .map_err(|e| anyhow!("build remote client: {e}"))?;
            let state = open_state(&config).await?;
            let report = state.outbox.drain(&remote, &ShutdownSignal::never()).await?;
            print_json(&report)?;
            state.shutdown().await;
            Ok(if report.auth_required { 2 } else { 0 })
        }
    }
}
