use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column as _, Connection, Executor, Postgres, Row, TypeInfo};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{bounded, quote_identifier, quote_qualified, unquote, rows_per_statement, BulkLoad, Engine, LoadAtomicity, RelationalPort};
use crate::coercion::{conform, LogicalType};
use crate::config::EngineSettings;
use crate::error::PortError;
use crate::table::{names_match, Column, TabularResult, Value};

/// Protocol limit on bind parameters in one statement.
const MAX_PARAMS: usize = 65_535;
const MAINTENANCE_DATABASE: &str = "postgres";

/// PostgreSQL engine. Every operation opens its own connection and closes it
/// before returning.
#[derive(Debug, Clone, Default)]
pub struct PostgresPort {
    settings: EngineSettings,
}

/// A target column with what is needed to bind values into it.
#[derive(Debug, Clone)]
struct TargetColumn {
    column: Column,
    cast: String,
}

impl PostgresPort {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    async fn connect_with(&self, options: &PgConnectOptions) -> Result<PgConnection, PortError> {
        bounded(self.settings.connect_timeout(), "connect", async {
            PgConnection::connect_with(options)
                .await
                .map_err(|err| PortError::Connection(err.to_string()))
        })
        .await
    }

    async fn connect(&self, connection: &str) -> Result<PgConnection, PortError> {
        let options = PgConnectOptions::from_str(connection)
            .map_err(|err| PortError::Connection(err.to_string()))?;
        self.connect_with(&options).await
    }

    async fn target_columns(
        conn: &mut PgConnection,
        table: &str,
    ) -> Result<Vec<TargetColumn>, PortError> {
        let (schema, name) = split_table(table);
        let rows = sqlx::query(
            r#"
            SELECT column_name, data_type, udt_schema, udt_name
            FROM information_schema.columns
            WHERE table_name = $1
              AND table_schema = COALESCE($2, current_schema())
            ORDER BY ordinal_position
            "#,
        )
        .bind(name)
        .bind(schema)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("column_name")?;
                let data_type: String = row.try_get("data_type")?;
                let udt_schema: String = row.try_get("udt_schema")?;
                let udt_name: String = row.try_get("udt_name")?;
                Ok(TargetColumn {
                    column: Column::new(name, logical_type_for_data_type(&data_type))
                        .with_native_type(data_type),
                    cast: format!(
                        "{}.{}",
                        quote_identifier(&udt_schema, '"', '"'),
                        quote_identifier(&udt_name, '"', '"')
                    ),
                })
            })
            .collect()
    }

    async fn fetch(conn: &mut PgConnection, sql: &str) -> Result<TabularResult, PortError> {
        let columns: Vec<Column> = conn
            .describe(sql)
            .await?
            .columns()
            .iter()
            .map(describe_column)
            .collect();

        let rows: Vec<PgRow> = match text_projection(sql, &columns) {
            Some(projected) => {
                debug!("reading columns without a native decoder as text");
                sqlx::query(&projected).fetch_all(&mut *conn).await?
            }
            None => sqlx::query(sql).fetch_all(&mut *conn).await?,
        };

        let mut result = TabularResult::new(columns);
        result.rows.reserve(rows.len());
        for row in &rows {
            let values = result
                .columns
                .iter()
                .enumerate()
                .map(|(index, column)| decode_cell(row, index, column))
                .collect::<Result<Vec<_>, _>>()?;
            result.push_row(values);
        }
        Ok(result)
    }

    async fn load_in(conn: &mut PgConnection, load: &BulkLoad<'_>) -> Result<u64, PortError> {
        let load_error = |message: String| PortError::Load {
            table: load.table.to_string(),
            message,
        };

        let target = Self::target_columns(conn, load.table).await?;
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
                    .find(|candidate| names_match(&candidate.column.name, &column.name))
                    .ok_or_else(|| load_error(format!("column '{}' does not exist", column.name)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if mapped.is_empty() && !load.data.is_empty() {
            return Err(load_error("no columns to insert".to_string()));
        }

        let quoted_table = quote_qualified(load.table, '"', '"');
        let column_list = mapped
            .iter()
            .map(|target| quote_identifier(&target.column.name, '"', '"'))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = conn.begin().await?;

        if load.truncate_first {
            sqlx::query(&format!("TRUNCATE TABLE {quoted_table} RESTART IDENTITY CASCADE"))
                .execute(&mut *tx)
                .await?;
        }

        let chunk_rows = rows_per_statement(load.batch_size, mapped.len(), MAX_PARAMS, usize::MAX);
        let mut written = 0u64;

        for chunk in load.data.rows.chunks(chunk_rows) {
            let sql = insert_statement(&quoted_table, &column_list, &mapped, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for (value, target) in row.iter().zip(&mapped) {
                    let conformed = conform(value.clone(), target.column.logical_type).map_err(
                        |source| PortError::Conform {
                            column: target.column.name.clone(),
                            source,
                        },
                    )?;
                    query = bind_value(query, conformed, target.column.logical_type);
                }
            }
            let outcome = query.execute(&mut *tx).await?;
            written += outcome.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }
}

async fn close(conn: PgConnection) {
    if let Err(err) = conn.close().await {
        debug!("postgres connection did not close cleanly: {err}");
    }
}

/// Postgres type names with a native decoder in [`decode_cell`].
const NATIVE_TYPES: &[&str] = &[
    "INT2", "INT4", "INT8", "NUMERIC", "FLOAT4", "FLOAT8", "BOOL", "UUID", "TIMESTAMP",
    "TIMESTAMPTZ", "DATE", "TIME", "TEXT", "VARCHAR", "BPCHAR", "NAME", "\"CHAR\"", "JSON",
    "JSONB", "BYTEA",
];

fn decodes_natively(column: &Column) -> bool {
    NATIVE_TYPES.contains(&column.native_type.as_deref().unwrap_or_default())
}

/// Wraps `sql` so that every column without a native decoder is cast to text
/// server side. Columns are renamed positionally, so duplicate names survive.
/// `None` when every column already decodes natively.
fn text_projection(sql: &str, columns: &[Column]) -> Option<String> {
    if columns.iter().all(decodes_natively) {
        return None;
    }

    let aliases: Vec<String> = (1..=columns.len()).map(|index| format!("c{index}")).collect();
    let select = columns
        .iter()
        .zip(&aliases)
        .map(|(column, alias)| {
            let name = quote_identifier(&column.name, '"', '"');
            if decodes_natively(column) {
                format!("{alias} AS {name}")
            } else {
                format!("{alias}::text AS {name}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    Some(format!(
        "SELECT {select} FROM ({}) AS source_rows({})",
        sql.trim().trim_end_matches(';'),
        aliases.join(", ")
    ))
}

fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.rsplit_once('.') {
        Some((schema, name)) => (Some(unquote(schema, '"', '"')), unquote(name, '"', '"')),
        None => (None, unquote(table, '"', '"')),
    }
}

fn insert_statement(
    quoted_table: &str,
    column_list: &str,
    columns: &[&TargetColumn],
    row_count: usize,
) -> String {
    let mut sql = format!("INSERT INTO {quoted_table} ({column_list}) VALUES ");
    let mut param = 0usize;
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (index, column) in columns.iter().enumerate() {
            if index > 0 {
                sql.push_str(", ");
            }
            param += 1;
            sql.push_str(&format!("${param}::{}", column.cast));
        }
        sql.push(')');
    }
    sql
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: Value,
    logical_type: LogicalType,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => match logical_type {
            LogicalType::Text => query.bind(None::<String>),
            LogicalType::Integer => query.bind(None::<i32>),
            LogicalType::Long => query.bind(None::<i64>),
            LogicalType::Decimal => query.bind(None::<Decimal>),
            LogicalType::Float => query.bind(None::<f32>),
            LogicalType::Double => query.bind(None::<f64>),
            LogicalType::Boolean => query.bind(None::<bool>),
            LogicalType::Timestamp => query.bind(None::<NaiveDateTime>),
            LogicalType::UniqueId => query.bind(None::<Uuid>),
        },
        Value::Text(v) => query.bind(v),
        Value::Integer(v) => query.bind(v),
        Value::Long(v) => query.bind(v),
        Value::Decimal(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::Double(v) => query.bind(v),
        Value::Boolean(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
        Value::UniqueId(v) => query.bind(v),
    }
}

fn logical_type_for_data_type(data_type: &str) -> LogicalType {
    match data_type {
        "smallint" | "integer" => LogicalType::Integer,
        "bigint" => LogicalType::Long,
        "numeric" => LogicalType::Decimal,
        "real" => LogicalType::Float,
        "double precision" => LogicalType::Double,
        "boolean" => LogicalType::Boolean,
        "date" | "timestamp without time zone" | "timestamp with time zone" => {
            LogicalType::Timestamp
        }
        "uuid" => LogicalType::UniqueId,
        _ => LogicalType::Text,
    }
}

fn logical_type_for_type_name(type_name: &str) -> LogicalType {
    match type_name {
        "INT2" | "INT4" => LogicalType::Integer,
        "INT8" => LogicalType::Long,
        "NUMERIC" => LogicalType::Decimal,
        "FLOAT4" => LogicalType::Float,
        "FLOAT8" => LogicalType::Double,
        "BOOL" => LogicalType::Boolean,
        "TIMESTAMP" | "TIMESTAMPTZ" | "DATE" => LogicalType::Timestamp,
        "UUID" => LogicalType::UniqueId,
        _ => LogicalType::Text,
    }
}

fn describe_column(column: &sqlx::postgres::PgColumn) -> Column {
    let type_name = column.type_info().name();
    Column::new(column.name(), logical_type_for_type_name(type_name)).with_native_type(type_name)
}

/// Decodes by the type the row actually carries, which is `TEXT` for columns
/// routed through [`text_projection`].
fn decode_cell(row: &PgRow, index: usize, column: &Column) -> Result<Value, PortError> {
    let type_name = row.try_column(index)?.type_info().name();
    let value = match type_name {
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(|v| Value::Integer(i32::from(v))),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Value::Integer),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::Long),
        "NUMERIC" => row.try_get::<Option<Decimal>, _>(index)?.map(Value::Decimal),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(Value::Float),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::Double),
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Boolean),
        "UUID" => row.try_get::<Option<Uuid>, _>(index)?.map(Value::UniqueId),
        "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(index)?.map(Value::Timestamp),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| Value::Timestamp(v.naive_utc())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(|v| Value::Timestamp(v.and_time(NaiveTime::MIN))),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)?
            .map(|v| Value::Text(v.to_string())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "\"CHAR\"" => {
            row.try_get::<Option<String>, _>(index)?.map(Value::Text)
        }
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(|v| Value::Text(v.to_string())),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)?
            .map(|v| Value::Text(hex::encode(v))),
        other => {
            return Err(PortError::UnsupportedValue {
                column: column.name.clone(),
                native_type: other.to_string(),
            })
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl RelationalPort for PostgresPort {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn load_atomicity(&self) -> LoadAtomicity {
        LoadAtomicity::Atomic
    }

    async fn test_connection(&self, connection: &str) -> bool {
        let mut conn = match self.connect(connection).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!("postgres connection test failed: {err}");
                return false;
            }
        };
        let ping = async { conn.ping().await.map_err(PortError::from) };
        let ok = match bounded(self.settings.query_timeout(), "connection test", ping).await {
            Ok(()) => true,
            Err(err) => {
                debug!("postgres connection test failed: {err}");
                false
            }
        };
        close(conn).await;
        ok
    }

    async fn list_databases(&self, connection: &str) -> Result<Vec<String>, PortError> {
        let options = PgConnectOptions::from_str(connection)
            .map_err(|err| PortError::Connection(err.to_string()))?
            .database(MAINTENANCE_DATABASE);
        let mut conn = self.connect_with(&options).await?;
        let result = bounded(self.settings.query_timeout(), "list databases", async {
            let names: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT datname
                FROM pg_database
                WHERE datistemplate = false AND datname <> $1
                ORDER BY datname
                "#,
            )
            .bind(MAINTENANCE_DATABASE)
            .fetch_all(&mut conn)
            .await?;
            Ok(names)
        })
        .await;
        close(conn).await;
        result
    }

    async fn list_tables(&self, connection: &str) -> Result<Vec<String>, PortError> {
        let mut conn = self.connect(connection).await?;
        let result = bounded(self.settings.query_timeout(), "list tables", async {
            let names: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT table_name
                FROM information_schema.tables
                WHERE table_schema = 'public'
                  AND table_type = 'BASE TABLE'
                  AND table_name NOT LIKE 'pg\_%'
                  AND table_name NOT LIKE 'sql\_%'
                ORDER BY table_name
                "#,
            )
            .fetch_all(&mut conn)
            .await?;
            Ok(names)
        })
        .await;
        close(conn).await;
        result
    }

    async fn describe_columns(
        &self,
        connection: &str,
        table: &str,
    ) -> Result<Vec<Column>, PortError> {
        let mut conn = self.connect(connection).await?;
        let result = bounded(
            self.settings.query_timeout(),
            "list columns",
            Self::target_columns(&mut conn, table),
        )
        .await
        .map(|columns| columns.into_iter().map(|target| target.column).collect());
        close(conn).await;
        result
    }

    async fn run_query(&self, connection: &str, sql: &str) -> Result<TabularResult, PortError> {
        let mut conn = self.connect(connection).await?;
        let result = bounded(self.settings.query_timeout(), "query", Self::fetch(&mut conn, sql)).await;
        close(conn).await;
        result
    }

    async fn bulk_load(&self, connection: &str, load: BulkLoad<'_>) -> Result<u64, PortError> {
        let mut conn = self.connect(connection).await?;
        let result = bounded(self.settings.load_timeout(), "bulk load", Self::load_in(&mut conn, &load)).await;
        match &result {
            Ok(written) => debug!(table = load.table, written, "postgres bulk load committed"),
            Err(err) => warn!(table = load.table, "postgres bulk load rolled back: {err}"),
        }
        close(conn).await;
        result
    }

    async fn preview(
        &self,
        connection: &str,
        table: &str,
        max_rows: usize,
    ) -> Result<TabularResult, PortError> {
        let sql = format!(
            "SELECT * FROM {} LIMIT {max_rows}",
            quote_qualified(table, '"', '"')
        );
        self.run_query(connection, &sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, cast: &str) -> TargetColumn {
        TargetColumn {
            column: Column::new(name, LogicalType::Text),
            cast: cast.to_string(),
        }
    }

    #[test]
    fn insert_statement_numbers_parameters_across_rows() {
        let a = target("a", "\"pg_catalog\".\"int4\"");
        let b = target("b", "\"public\".\"mood\"");
        let sql = insert_statement("\"t\"", "\"a\", \"b\"", &[&a, &b], 2);
        assert_eq!(
            sql,
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES \
             ($1::\"pg_catalog\".\"int4\", $2::\"public\".\"mood\"), \
             ($3::\"pg_catalog\".\"int4\", $4::\"public\".\"mood\")"
        );
    }

    #[test]
    fn information_schema_types_map_to_logical_types() {
        assert_eq!(logical_type_for_data_type("smallint"), LogicalType::Integer);
        assert_eq!(logical_type_for_data_type("timestamp with time zone"), LogicalType::Timestamp);
        assert_eq!(logical_type_for_data_type("jsonb"), LogicalType::Text);
        assert_eq!(logical_type_for_type_name("FLOAT8"), LogicalType::Double);
    }

    fn typed(name: &str, native_type: &str) -> Column {
        Column::new(name, logical_type_for_type_name(native_type)).with_native_type(native_type)
    }

    #[test]
    fn natively_decoded_columns_need_no_projection() {
        let columns = [typed("id", "INT4"), typed("payload", "JSONB"), typed("seen", "TIMESTAMPTZ")];
        assert_eq!(text_projection("SELECT id, payload, seen FROM t", &columns), None);
    }

    #[test]
    fn other_types_are_cast_to_text_server_side() {
        let columns = [
            typed("id", "INT4"),
            typed("age", "INTERVAL"),
            typed("mood", "mood"),
            typed("id", "INET"),
        ];
        let projected = text_projection("SELECT id, now() - created AS age, mood, addr AS id FROM t;", &columns)
            .expect("projection");
        assert_eq!(
            projected,
            "SELECT c1 AS \"id\", c2::text AS \"age\", c3::text AS \"mood\", c4::text AS \"id\" \
             FROM (SELECT id, now() - created AS age, mood, addr AS id FROM t) AS source_rows(c1, c2, c3, c4)"
        );
        assert_eq!(columns[1].logical_type, LogicalType::Text);
    }

    #[test]
    fn table_names_split_on_last_dot() {
        assert_eq!(split_table("public.res_partner"), (Some("public"), "res_partner"));
        assert_eq!(split_table("res_partner"), (None, "res_partner"));
        assert_eq!(split_table("\"public\".\"Res Partner\""), (Some("public"), "Res Partner"));
    }
}
