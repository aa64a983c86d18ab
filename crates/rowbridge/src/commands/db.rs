use anyhow::{bail, Result};
use clap::Args;
use rowbridge_core::{port, Engine, EngineSettings, RelationalPort};

use crate::output;

#[derive(Args, Debug)]
pub struct DbTarget {
    /// postgres or sqlserver
    #[arg(long)]
    engine: Engine,
    /// Connection string in the engine's native format
    #[arg(long)]
    connection: String,
    /// Write CSV instead of a table
    #[arg(long)]
    csv: bool,
}

#[derive(clap::Subcommand, Debug)]
pub enum DbCommand {
    /// List user databases on the server
    Databases(DbTarget),
    /// List tables in the connected database
    Tables(DbTarget),
    /// List the columns of a table in ordinal order
    Columns {
        #[command(flatten)]
        target: DbTarget,
        table: String,
    },
    /// Show the first rows of a table
    Preview {
        #[command(flatten)]
        target: DbTarget,
        table: String,
        /// Defaults to the configured preview row count
        #[arg(long)]
        rows: Option<usize>,
    },
}

pub async fn handle(command: DbCommand, settings: &EngineSettings) -> Result<()> {
    match command {
        DbCommand::Databases(target) => {
            let names = connect(&target, settings).await?.list_databases(&target.connection).await?;
            output::print_names("database", names, target.csv)
        }
        DbCommand::Tables(target) => {
            let names = connect(&target, settings).await?.list_tables(&target.connection).await?;
            output::print_names("table", names, target.csv)
        }
        DbCommand::Columns { target, table } => {
            let columns = connect(&target, settings)
                .await?
                .describe_columns(&target.connection, &table)
                .await?;
            let rows = columns
                .into_iter()
                .map(|column| {
                    vec![
                        column.name,
                        column.logical_type.to_string(),
                        column.native_type.unwrap_or_default(),
                    ]
                })
                .collect();
            let header = vec!["column".into(), "type".into(), "native type".into()];
            output::print_rows(header, rows, target.csv)
        }
        DbCommand::Preview {
            target,
            table,
            rows,
        } => {
            let limit = rows.unwrap_or(settings.preview_rows);
            let data = connect(&target, settings)
                .await?
                .preview(&target.connection, &table, limit)
                .await?;
            output::print_tabular(&data, target.csv)
        }
    }
}

async fn connect(target: &DbTarget, settings: &EngineSettings) -> Result<std::sync::Arc<dyn RelationalPort>> {
    let port = port::open(target.engine, settings);
    if !port.test_connection(&target.connection).await {
        bail!("cannot connect to {} database with the provided connection string", target.engine);
    }
    Ok(port)
}
