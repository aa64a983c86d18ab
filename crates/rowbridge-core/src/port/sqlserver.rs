use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::{Client, ColumnData, ColumnType, Config, FromSql, Query, Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{bounded, quote_identifier, quote_qualified, unquote, rows_per_statement, BulkLoad, Engine, LoadAtomicity, RelationalPort};
use crate::coercion::{conform, LogicalType};
use crate::config::EngineSettings;
use crate::error::PortError;
use crate::table::{names_match, Column, TabularResult, Value};

/// Server-side ceiling is 2100 parameters; stay under it.
const MAX_PARAMS: usize = 2_000;
/// A table value constructor accepts at most 1000 rows.
const MAX_ROWS: usize = 1_000;

type SqlClient = Client<Compat<TcpStream>>;

/// SQL Server engine addressed with ADO.NET style connection strings.
#[derive(Debug, Clone, Default)]
pub struct SqlServerPort {
    settings: EngineSettings,
}

impl SqlServerPort {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    async fn connect(&self, connection: &str) -> Result<SqlClient, PortError> {
        let config = Config::from_ado_string(connection)
            .map_err(|err| PortError::Connection(err.to_string()))?;

        bounded(self.settings.connect_timeout(), "connect", async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|err| PortError::Connection(err.to_string()))?;
            tcp.set_nodelay(true)?;
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|err| PortError::Connection(err.to_string()))
        })
        .await
    }

    async fn names(client: &mut SqlClient, sql: &str) -> Result<Vec<String>, PortError> {
        let rows = client.simple_query(sql).await?.into_first_result().await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<&str, _>(0)?.unwrap_or_default().to_string()))
            .collect()
    }

    async fn target_columns(client: &mut SqlClient, table: &str) -> Result<Vec<Column>, PortError> {
        let (schema, name) = split_table(table);
        let rows = client
            .query(
                "SELECT COLUMN_NAME, DATA_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_NAME = @P1 AND TABLE_SCHEMA = COALESCE(NULLIF(@P2, ''), SCHEMA_NAME()) \
                 ORDER BY ORDINAL_POSITION",
                &[&name, &schema.unwrap_or_default()],
            )
            .await?
            .into_first_result()
            .await?;

        rows.iter()
            .map(|row| {
                let name = row.try_get::<&str, _>(0)?.unwrap_or_default();
                let data_type = row.try_get::<&str, _>(1)?.unwrap_or_default();
                Ok(Column::new(name, logical_type_for_data_type(data_type)).with_native_type(data_type))
            })
            .collect()
    }

    async fn fetch(client: &mut SqlClient, sql: &str) -> Result<TabularResult, PortError> {
        let mut stream = client.simple_query(sql).await?;
        let columns: Vec<Column> = stream
            .columns()
            .await?
            .map(|columns| columns.iter().map(describe_column).collect())
            .unwrap_or_default();
        let rows = stream.into_first_result().await?;

        let mut result = TabularResult::new(columns);
        result.rows.reserve(rows.len());
        for row in rows {
            let values = decode_row(row, &result.columns)?;
            result.push_row(values);
        }
        Ok(result)
    }

    async fn load_in(client: &mut SqlClient, load: &BulkLoad<'_>) -> Result<u64, PortError> {
        let load_error = |message: String| PortError::Load {
            table: load.table.to_string(),
            message,
        };

        let target = Self::target_columns(client, load.table).await?;
        if target.is_empty() {
            return Err(load_error("table does not exist or has no columns".to_string()));
        }

        let mapped = load
            .data
            .columns
            .iter()
            .map(|column| {
                target
                    .iter()
                    .find(|candidate| names_match(&candidate.name, &column.name))
                    .ok_or_else(|| load_error(format!("column '{}' does not exist", column.name)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if mapped.is_empty() && !load.data.is_empty() {
            return Err(load_error("no columns to insert".to_string()));
        }

        let quoted_table = quote_qualified(load.table, '[', ']');
        let column_list = mapped
            .iter()
            .map(|column| quote_identifier(&column.name, '[', ']'))
            .collect::<Vec<_>>()
            .join(", ");

        if load.truncate_first {
            client
                .execute(format!("TRUNCATE TABLE {quoted_table}"), &[])
                .await?;
        }

        let chunk_rows = rows_per_statement(load.batch_size, mapped.len(), MAX_PARAMS, MAX_ROWS);
        let mut written = 0u64;

        for chunk in load.data.rows.chunks(chunk_rows) {
            let mut query = Query::new(insert_statement(&quoted_table, &column_list, mapped.len(), chunk.len()));
            for row in chunk {
                for (value, column) in row.iter().zip(&mapped) {
                    let conformed = conform(value.clone(), column.logical_type).map_err(|source| {
                        PortError::Conform {
                            column: column.name.clone(),
                            source,
                        }
                    })?;
                    bind_value(&mut query, conformed, column.logical_type);
                }
            }
            written += query.execute(client).await?.total();
        }

        Ok(written)
    }
}

async fn close(client: SqlClient) {
    if let Err(err) = client.close().await {
        debug!("sql server connection did not close cleanly: {err}");
    }
}

async fn run_statement(client: &mut SqlClient, sql: &str) -> Result<(), PortError> {
    client.execute(sql, &[]).await?;
    Ok(())
}

fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.rsplit_once('.') {
        Some((schema, name)) => (Some(unquote(schema, '[', ']')), unquote(name, '[', ']')),
        None => (None, unquote(table, '[', ']')),
    }
}

fn insert_statement(quoted_table: &str, column_list: &str, column_count: usize, row_count: usize) -> String {
    let mut sql = format!("INSERT INTO {quoted_table} ({column_list}) VALUES ");
    let mut param = 0usize;
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for index in 0..column_count {
            if index > 0 {
                sql.push_str(", ");
            }
            param += 1;
            sql.push_str(&format!("@P{param}"));
        }
        sql.push(')');
    }
    sql
}

fn bind_value(query: &mut Query<'_>, value: Value, logical_type: LogicalType) {
    match value {
        Value::Null => match logical_type {
            LogicalType::Text => query.bind(None::<String>),
            LogicalType::Integer => query.bind(None::<i32>),
            LogicalType::Long => query.bind(None::<i64>),
            LogicalType::Decimal => query.bind(None::<Numeric>),
            LogicalType::Float => query.bind(None::<f32>),
            LogicalType::Double => query.bind(None::<f64>),
            LogicalType::Boolean => query.bind(None::<bool>),
            LogicalType::Timestamp => query.bind(None::<NaiveDateTime>),
            LogicalType::UniqueId => query.bind(None::<Uuid>),
        },
        Value::Text(v) => query.bind(v),
        Value::Integer(v) => query.bind(v),
        Value::Long(v) => query.bind(v),
        // tiberius implements only `ToSql` (not `IntoSql`) for `Decimal`;
        // its conversion always yields `ColumnData::Numeric`.
        Value::Decimal(v) => match v.to_sql() {
            ColumnData::Numeric(n) => query.bind(n),
            _ => unreachable!("Decimal::to_sql yields ColumnData::Numeric"),
        },
        Value::Float(v) => query.bind(v),
        Value::Double(v) => query.bind(v),
        Value::Boolean(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
        Value::UniqueId(v) => query.bind(v),
    }
}

fn logical_type_for_data_type(data_type: &str) -> LogicalType {
    match data_type.to_ascii_lowercase().as_str() {
        "tinyint" | "smallint" | "int" => LogicalType::Integer,
        "bigint" => LogicalType::Long,
        "decimal" | "numeric" | "money" | "smallmoney" => LogicalType::Decimal,
        "real" => LogicalType::Float,
        "float" => LogicalType::Double,
        "bit" => LogicalType::Boolean,
        "date" | "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => {
            LogicalType::Timestamp
        }
        "uniqueidentifier" => LogicalType::UniqueId,
        _ => LogicalType::Text,
    }
}

fn logical_type_for_column_type(column_type: ColumnType) -> LogicalType {
    match column_type {
        ColumnType::Int1 | ColumnType::Int2 | ColumnType::Int4 | ColumnType::Intn => {
            LogicalType::Integer
        }
        ColumnType::Int8 => LogicalType::Long,
        ColumnType::Decimaln | ColumnType::Numericn => LogicalType::Decimal,
        ColumnType::Float4 => LogicalType::Float,
        ColumnType::Float8 | ColumnType::Floatn | ColumnType::Money | ColumnType::Money4 => {
            LogicalType::Double
        }
        ColumnType::Bit | ColumnType::Bitn => LogicalType::Boolean,
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2
        | ColumnType::Daten
        | ColumnType::DatetimeOffsetn => LogicalType::Timestamp,
        ColumnType::Guid => LogicalType::UniqueId,
        _ => LogicalType::Text,
    }
}

fn describe_column(column: &tiberius::Column) -> Column {
    let column_type = column.column_type();
    Column::new(column.name(), logical_type_for_column_type(column_type))
        .with_native_type(format!("{column_type:?}"))
}

fn decode_row(row: Row, columns: &[Column]) -> Result<Vec<Value>, PortError> {
    row.into_iter()
        .zip(columns)
        .map(|(data, column)| decode_cell(&data, column))
        .collect()
}

fn decode_cell(data: &ColumnData<'static>, column: &Column) -> Result<Value, PortError> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| Value::Integer(i32::from(v))),
        ColumnData::I16(v) => v.map(|v| Value::Integer(i32::from(v))),
        ColumnData::I32(v) => v.map(Value::Integer),
        ColumnData::I64(v) => v.map(Value::Long),
        ColumnData::F32(v) => v.map(Value::Float),
        ColumnData::F64(v) => v.map(Value::Double),
        ColumnData::Bit(v) => v.map(Value::Boolean),
        ColumnData::Guid(v) => v.map(Value::UniqueId),
        ColumnData::String(v) => v.as_ref().map(|text| Value::Text(text.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|bytes| Value::Text(hex::encode(bytes))),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|xml| Value::Text(xml.clone().into_owned().into_string())),
        ColumnData::Numeric(_) => Decimal::from_sql(data)?.map(Value::Decimal),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(Value::Timestamp)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?
            .map(|date| Value::Timestamp(date.and_time(NaiveTime::MIN))),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(|time| Value::Text(time.to_string())),
        ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(data)?
            .map(|moment| Value::Timestamp(moment.naive_utc())),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(PortError::UnsupportedValue {
                column: column.name.clone(),
                native_type: column.native_type.clone().unwrap_or_default(),
            })
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl RelationalPort for SqlServerPort {
    fn engine(&self) -> Engine {
        Engine::SqlServer
    }

    fn load_atomicity(&self) -> LoadAtomicity {
        LoadAtomicity::Atomic
    }

    async fn test_connection(&self, connection: &str) -> bool {
        let mut client = match self.connect(connection).await {
            Ok(client) => client,
            Err(err) => {
                debug!("sql server connection test failed: {err}");
                return false;
            }
        };
        let select_one = async {
            client.simple_query("SELECT 1").await?.into_results().await?;
            Ok::<(), PortError>(())
        };
        let ok = match bounded(self.settings.query_timeout(), "connection test", select_one).await {
            Ok(()) => true,
            Err(err) => {
                debug!("sql server connection test failed: {err}");
                false
            }
        };
        close(client).await;
        ok
    }

    async fn list_databases(&self, connection: &str) -> Result<Vec<String>, PortError> {
        let mut client = self.connect(connection).await?;
        let result = bounded(
            self.settings.query_timeout(),
            "list databases",
            Self::names(
                &mut client,
                "SELECT name FROM sys.databases WHERE database_id > 4 ORDER BY name",
            ),
        )
        .await;
        close(client).await;
        result
    }

    async fn list_tables(&self, connection: &str) -> Result<Vec<String>, PortError> {
        let mut client = self.connect(connection).await?;
        let result = bounded(
            self.settings.query_timeout(),
            "list tables",
            Self::names(
                &mut client,
                "SELECT CASE WHEN TABLE_SCHEMA = 'dbo' THEN TABLE_NAME \
                 ELSE TABLE_SCHEMA + '.' + TABLE_NAME END \
                 FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME",
            ),
        )
        .await;
        close(client).await;
        result
    }

    async fn describe_columns(
        &self,
        connection: &str,
        table: &str,
    ) -> Result<Vec<Column>, PortError> {
        let mut client = self.connect(connection).await?;
        let result = bounded(
            self.settings.query_timeout(),
            "list columns",
            Self::target_columns(&mut client, table),
        )
        .await;
        close(client).await;
        result
    }

    async fn run_query(&self, connection: &str, sql: &str) -> Result<TabularResult, PortError> {
        let mut client = self.connect(connection).await?;
        let result = bounded(self.settings.query_timeout(), "query", Self::fetch(&mut client, sql)).await;
        close(client).await;
        result
    }

    async fn bulk_load(&self, connection: &str, load: BulkLoad<'_>) -> Result<u64, PortError> {
        let statement_limit = self.settings.query_timeout();
        let mut client = self.connect(connection).await?;
        if let Err(err) = bounded(statement_limit, "begin transaction", run_statement(&mut client, "BEGIN TRANSACTION")).await {
            close(client).await;
            return Err(err);
        }

        let result = bounded(self.settings.load_timeout(), "bulk load", Self::load_in(&mut client, &load)).await;

        let result = match result {
            Ok(written) => {
                bounded(statement_limit, "commit transaction", run_statement(&mut client, "COMMIT TRANSACTION"))
                    .await
                    .map(|()| {
                        debug!(table = load.table, written, "sql server bulk load committed");
                        written
                    })
            }
            Err(err) => {
                let rollback = run_statement(&mut client, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION");
                if let Err(rollback) = bounded(statement_limit, "rollback transaction", rollback).await {
                    warn!(table = load.table, "sql server rollback failed: {rollback}");
                }
                warn!(table = load.table, "sql server bulk load rolled back: {err}");
                Err(err)
            }
        };

        close(client).await;
        result
    }

    async fn preview(
        &self,
        connection: &str,
        table: &str,
        max_rows: usize,
    ) -> Result<TabularResult, PortError> {
        let sql = format!(
            "SELECT TOP ({max_rows}) * FROM {}",
            quote_qualified(table, '[', ']')
        );
        self.run_query(connection, &sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_statement_uses_positional_parameters() {
        assert_eq!(
            insert_statement("[dbo].[t]", "[a], [b]", 2, 2),
            "INSERT INTO [dbo].[t] ([a], [b]) VALUES (@P1, @P2), (@P3, @P4)"
        );
    }

    #[test]
    fn bracketed_names_split_cleanly() {
        assert_eq!(split_table("[dbo].[Orders]"), (Some("dbo"), "Orders"));
        assert_eq!(split_table("Orders"), (None, "Orders"));
    }

    #[test]
    fn bracketed_table_quotes_to_the_table_its_columns_came_from() {
        let table = "[dbo].[Orders]";
        let (schema, name) = split_table(table);
        let quoted = quote_qualified(table, '[', ']');
        assert_eq!(quoted, format!("[{}].[{name}]", schema.unwrap_or_default()));
        assert_eq!(
            insert_statement(&quoted, "[id]", 1, 1),
            "INSERT INTO [dbo].[Orders] ([id]) VALUES (@P1)"
        );
    }

    #[test]
    fn information_schema_types_map_to_logical_types() {
        assert_eq!(logical_type_for_data_type("INT"), LogicalType::Integer);
        assert_eq!(logical_type_for_data_type("float"), LogicalType::Double);
        assert_eq!(logical_type_for_data_type("datetime2"), LogicalType::Timestamp);
        assert_eq!(logical_type_for_data_type("nvarchar"), LogicalType::Text);
        assert_eq!(logical_type_for_column_type(ColumnType::Guid), LogicalType::UniqueId);
    }
}
