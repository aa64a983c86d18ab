//! The relational data port: one capability surface, several engines.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PortError;
use crate::table::{Column, TabularResult};

pub mod memory;
#[cfg(feature = "runtime")]
pub mod postgres;
#[cfg(feature = "runtime")]
pub mod sqlserver;

pub use memory::MemoryPort;
#[cfg(feature = "runtime")]
pub use postgres::PostgresPort;
#[cfg(feature = "runtime")]
pub use sqlserver::SqlServerPort;

/// What a failed `bulk_load` leaves behind in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadAtomicity {
    /// Truncate and inserts commit or roll back together.
    Atomic,
    /// Truncation is committed on its own; a failed insert leaves the table cleared.
    TruncateNotTransactional,
}

/// One bulk write request.
#[derive(Debug, Clone, Copy)]
pub struct BulkLoad<'a> {
    pub table: &'a str,
    pub data: &'a TabularResult,
    pub truncate_first: bool,
    pub batch_size: usize,
}

#[async_trait]
pub trait RelationalPort: Send + Sync {
    fn engine(&self) -> Engine;

    fn load_atomicity(&self) -> LoadAtomicity;

    /// Never fails: an unreachable or rejected connection is `false`.
    async fn test_connection(&self, connection: &str) -> bool;

    async fn list_databases(&self, connection: &str) -> Result<Vec<String>, PortError>;

    async fn list_tables(&self, connection: &str) -> Result<Vec<String>, PortError>;

    /// Columns of `table` in ordinal order, with logical and native types.
    async fn describe_columns(&self, connection: &str, table: &str)
        -> Result<Vec<Column>, PortError>;

    async fn list_columns(&self, connection: &str, table: &str) -> Result<Vec<String>, PortError> {
        let columns = self.describe_columns(connection, table).await?;
        Ok(columns.into_iter().map(|column| column.name).collect())
    }

    async fn run_query(&self, connection: &str, sql: &str) -> Result<TabularResult, PortError>;

    /// Writes every row of `load.data` and returns the number of rows written.
    async fn bulk_load(&self, connection: &str, load: BulkLoad<'_>) -> Result<u64, PortError>;

    async fn preview(
        &self,
        connection: &str,
        table: &str,
        max_rows: usize,
    ) -> Result<TabularResult, PortError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Postgres,
    SqlServer,
    Memory,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::SqlServer => "sqlserver",
            Engine::Memory => "memory",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Engine::Postgres),
            "sqlserver" | "mssql" => Ok(Engine::SqlServer),
            "memory" => Ok(Engine::Memory),
            other => Err(format!(
                "unknown engine '{other}' (expected postgres, sqlserver or memory)"
            )),
        }
    }
}

/// Builds the port for `engine`. The memory engine starts empty.
#[cfg(feature = "runtime")]
pub fn open(
    engine: Engine,
    settings: &crate::config::EngineSettings,
) -> std::sync::Arc<dyn RelationalPort> {
    match engine {
        Engine::Postgres => std::sync::Arc::new(PostgresPort::new(settings.clone())),
        Engine::SqlServer => std::sync::Arc::new(SqlServerPort::new(settings.clone())),
        Engine::Memory => std::sync::Arc::new(MemoryPort::new()),
    }
}

/// Fails with [`PortError::Timeout`] when `future` outlives `limit`.
#[cfg(feature = "runtime")]
pub(crate) async fn bounded<T, F>(
    limit: std::time::Duration,
    operation: &'static str,
    future: F,
) -> Result<T, PortError>
where
    F: std::future::Future<Output = Result<T, PortError>>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| PortError::Timeout {
            operation,
            seconds: limit.as_secs(),
        })?
}

/// Strips one enclosing `open`/`close` pair from a trimmed identifier part.
#[cfg_attr(not(feature = "runtime"), allow(dead_code))]
pub(crate) fn unquote(part: &str, open: char, close: char) -> &str {
    let part = part.trim();
    part.strip_prefix(open)
        .and_then(|inner| inner.strip_suffix(close))
        .unwrap_or(part)
}

/// Splits `schema.table` and quotes each part with `open`/`close`, doubling
/// any embedded closing character. Parts that arrive already quoted are
/// unquoted first.
#[cfg_attr(not(feature = "runtime"), allow(dead_code))]
pub(crate) fn quote_qualified(name: &str, open: char, close: char) -> String {
    let doubled = format!("{close}{close}");
    name.split('.')
        .map(|part| {
            let trimmed = part.trim();
            let bare = match unquote(trimmed, open, close) {
                inner if inner.len() != trimmed.len() => inner.replace(&doubled, &close.to_string()),
                inner => inner.to_string(),
            };
            quote_identifier(&bare, open, close)
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Quotes one bare identifier, such as a column name read from the catalog.
#[cfg_attr(not(feature = "runtime"), allow(dead_code))]
pub(crate) fn quote_identifier(name: &str, open: char, close: char) -> String {
    format!("{open}{}{close}", name.replace(close, &format!("{close}{close}")))
}

/// Chunk size for multi-row inserts, bounded by both the requested batch size
/// and the engine's parameter limit.
#[cfg_attr(not(feature = "runtime"), allow(dead_code))]
pub(crate) fn rows_per_statement(
    batch_size: usize,
    column_count: usize,
    max_params: usize,
    max_rows: usize,
) -> usize {
    let by_params = max_params / column_count.max(1);
    batch_size.max(1).min(by_params.max(1)).min(max_rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_names_parse_loosely() {
        assert_eq!("PostgreSQL".parse::<Engine>(), Ok(Engine::Postgres));
        assert_eq!("mssql".parse::<Engine>(), Ok(Engine::SqlServer));
        assert!("oracle".parse::<Engine>().is_err());
    }

    #[test]
    fn qualified_names_are_quoted_per_part() {
        assert_eq!(quote_qualified("public.res_partner", '"', '"'), "\"public\".\"res_partner\"");
        assert_eq!(quote_qualified("odd\"name", '"', '"'), "\"odd\"\"name\"");
        assert_eq!(quote_qualified("dbo.Orders", '[', ']'), "[dbo].[Orders]");
    }

    #[test]
    fn already_quoted_parts_are_not_quoted_twice() {
        assert_eq!(quote_qualified("[dbo].[Orders]", '[', ']'), "[dbo].[Orders]");
        assert_eq!(quote_qualified(" [dbo] . Orders", '[', ']'), "[dbo].[Orders]");
        assert_eq!(quote_qualified("[odd]]name]", '[', ']'), "[odd]]name]");
        assert_eq!(quote_qualified("\"public\".\"res_partner\"", '"', '"'), "\"public\".\"res_partner\"");
        assert_eq!(unquote(" [Orders] ", '[', ']'), "Orders");
        assert_eq!(unquote("Orders]", '[', ']'), "Orders]");
        assert_eq!(quote_identifier("unit.price", '"', '"'), "\"unit.price\"");
    }

    #[test]
    fn statement_size_respects_parameter_limit() {
        assert_eq!(rows_per_statement(100, 5, 2000, 1000), 100);
        assert_eq!(rows_per_statement(5000, 5, 2000, 1000), 400);
        assert_eq!(rows_per_statement(5000, 1, 2000, 1000), 1000);
        assert_eq!(rows_per_statement(0, 3, 65535, usize::MAX), 1);
    }

    #[cfg(feature = "runtime")]
    #[tokio::test]
    async fn stalled_statement_becomes_a_timeout() {
        let stalled = std::future::pending::<Result<(), PortError>>();
        let err = bounded(std::time::Duration::from_millis(20), "commit transaction", stalled)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PortError::Timeout { operation: "commit transaction", seconds: 0 }
        ));

        let ready = async { Ok::<_, PortError>(5) };
        let value = bounded(std::time::Duration::from_secs(1), "begin transaction", ready).await;
        assert_eq!(value.ok(), Some(5));
    }
}
