use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rowbridge_core::{port, Engine, EngineSettings, MappingExecutor};
use rowbridge_repository::PostgresMappingStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::db::DbCommand;
use commands::mapping::MappingCommand;

#[derive(Parser, Debug)]
#[command(author, version, about = "Rowbridge database-to-database mapping runner", long_about = None)]
struct Cli {
    /// TOML file with engine timeouts and preview defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine the mapping source connections point at
    #[arg(long, global = true, default_value = "sqlserver")]
    source_engine: Engine,

    /// Engine the mapping target connections point at
    #[arg(long, global = true, default_value = "postgres")]
    target_engine: Engine,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply mapping store migrations
    Migrate,
    /// Run one mapping definition
    Execute {
        mapping_id: uuid::Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Check a mapping definition without moving any rows
    Validate {
        mapping_id: uuid::Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Manage stored mapping definitions
    Mapping {
        #[command(subcommand)]
        command: MappingCommand,
    },
    /// Browse source or target databases
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let settings = EngineSettings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Migrate => {
            let store = connect_store().await?;
            store.run_migrations().await?;
            info!("Mapping store migrations applied");
            Ok(())
        }
        Command::Execute { mapping_id, json } => {
            let store = connect_store().await?;
            let executor = executor(store.clone(), cli.source_engine, cli.target_engine, &settings);
            commands::run::execute(&store, &executor, mapping_id, json).await
        }
        Command::Validate { mapping_id, json } => {
            let store = connect_store().await?;
            let executor = executor(store, cli.source_engine, cli.target_engine, &settings);
            commands::run::validate(&executor, mapping_id, json).await
        }
        Command::Mapping { command } => {
            let store = connect_store().await?;
            commands::mapping::handle(command, &store).await
        }
        Command::Db { command } => commands::db::handle(command, &settings).await,
    }
}

fn executor(
    store: PostgresMappingStore,
    source_engine: Engine,
    target_engine: Engine,
    settings: &EngineSettings,
) -> MappingExecutor {
    MappingExecutor::new(
        Arc::new(store),
        port::open(source_engine, settings),
        port::open(target_engine, settings),
    )
}

async fn connect_store() -> Result<PostgresMappingStore> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .or_else(|_| std::env::var("ROWBRIDGE_DATABASE_URL"))
        .context("DATABASE_URL (or ROWBRIDGE_DATABASE_URL) must be set")?;
    PostgresMappingStore::connect(&database_url, 5)
        .await
        .context("failed to connect to the mapping store")
}
