//! In-process engine holding named databases of tables and canned query results.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{BulkLoad, Engine, LoadAtomicity, RelationalPort};
use crate::coercion::conform;
use crate::error::PortError;
use crate::table::{Column, TabularResult, Value};

#[derive(Debug, Default)]
struct Database {
    /// Keyed by lower-cased table name.
    tables: BTreeMap<String, TabularResult>,
    table_names: HashMap<String, String>,
    queries: HashMap<String, TabularResult>,
    load_failure: Option<String>,
}

impl Database {
    fn table(&self, name: &str) -> Result<&TabularResult, PortError> {
        self.tables
            .get(&name.to_lowercase())
            .ok_or_else(|| PortError::Query(format!("table '{name}' does not exist")))
    }
}

/// Cloning shares the underlying databases.
#[derive(Debug, Clone)]
pub struct MemoryPort {
    databases: Arc<Mutex<BTreeMap<String, Database>>>,
    atomicity: LoadAtomicity,
}

impl Default for MemoryPort {
    fn default() -> Self {
        Self {
            databases: Arc::default(),
            atomicity: LoadAtomicity::Atomic,
        }
    }
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// With [`LoadAtomicity::TruncateNotTransactional`], a failed load that
    /// asked for truncation leaves the table empty.
    pub fn with_load_atomicity(mut self, atomicity: LoadAtomicity) -> Self {
        self.atomicity = atomicity;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Database>> {
        self.databases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_database<R>(
        &self,
        connection: &str,
        f: impl FnOnce(&mut Database) -> Result<R, PortError>,
    ) -> Result<R, PortError> {
        let mut databases = self.lock();
        let database = databases.get_mut(connection).ok_or_else(|| {
            PortError::Connection(format!("no database is reachable at '{connection}'"))
        })?;
        f(database)
    }

    /// Makes `connection` reachable. Existing contents are kept.
    pub fn add_database(&self, connection: &str) {
        self.lock().entry(connection.to_string()).or_default();
    }

    pub fn remove_database(&self, connection: &str) {
        self.lock().remove(connection);
    }

    /// Creates or replaces `table`, registering the database when needed.
    pub fn create_table(&self, connection: &str, table: &str, columns: Vec<Column>) {
        let mut databases = self.lock();
        let database = databases.entry(connection.to_string()).or_default();
        let key = table.to_lowercase();
        database.table_names.insert(key.clone(), table.to_string());
        database.tables.insert(key, TabularResult::new(columns));
    }

    pub fn insert_rows(
        &self,
        connection: &str,
        table: &str,
        rows: Vec<Vec<Value>>,
    ) -> Result<(), PortError> {
        self.with_database(connection, |database| {
            let target = database
                .tables
                .get_mut(&table.to_lowercase())
                .ok_or_else(|| PortError::Query(format!("table '{table}' does not exist")))?;
            for row in rows {
                target.push_row(row);
            }
            Ok(())
        })
    }

    /// Answers `sql` (matched after trimming) with `result`.
    pub fn register_query(&self, connection: &str, sql: &str, result: TabularResult) {
        let mut databases = self.lock();
        let database = databases.entry(connection.to_string()).or_default();
        database.queries.insert(sql.trim().to_string(), result);
    }

    /// Every later bulk load on `connection` fails with `message`.
    pub fn fail_loads(&self, connection: &str, message: &str) {
        let mut databases = self.lock();
        let database = databases.entry(connection.to_string()).or_default();
        database.load_failure = Some(message.to_string());
    }

    /// Snapshot of a table's current contents.
    pub fn table(&self, connection: &str, table: &str) -> Option<TabularResult> {
        let databases = self.lock();
        databases
            .get(connection)?
            .tables
            .get(&table.to_lowercase())
            .cloned()
    }
}

fn scanned_table(sql: &str) -> Option<&str> {
    let mut words = sql.split_whitespace();
    let select = words.next()?;
    let star = words.next()?;
    let from = words.next()?;
    let table = words.next()?;
    if words.next().is_some()
        || !select.eq_ignore_ascii_case("select")
        || star != "*"
        || !from.eq_ignore_ascii_case("from")
    {
        return None;
    }
    Some(table.trim_end_matches(';'))
}

fn stage_rows(
    target: &TabularResult,
    load: &BulkLoad<'_>,
) -> Result<Vec<Vec<Value>>, PortError> {
    let positions = load
        .data
        .columns
        .iter()
        .map(|column| {
            target.column_index(&column.name).ok_or_else(|| PortError::Load {
                table: load.table.to_string(),
                message: format!("column '{}' does not exist", column.name),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut staged = if load.truncate_first {
        Vec::new()
    } else {
        target.rows.clone()
    };

    for row in &load.data.rows {
        let mut stored = vec![Value::Null; target.columns.len()];
        for (value, &position) in row.iter().zip(&positions) {
            let column = &target.columns[position];
            stored[position] =
                conform(value.clone(), column.logical_type).map_err(|source| PortError::Conform {
                    column: column.name.clone(),
                    source,
                })?;
        }
        staged.push(stored);
    }

    Ok(staged)
}

#[async_trait]
impl RelationalPort for MemoryPort {
    fn engine(&self) -> Engine {
        Engine::Memory
    }

    fn load_atomicity(&self) -> LoadAtomicity {
        self.atomicity
    }

    async fn test_connection(&self, connection: &str) -> bool {
        self.lock().contains_key(connection)
    }

    async fn list_databases(&self, connection: &str) -> Result<Vec<String>, PortError> {
        self.with_database(connection, |_| Ok(()))?;
        Ok(self.lock().keys().cloned().collect())
    }

    async fn list_tables(&self, connection: &str) -> Result<Vec<String>, PortError> {
        self.with_database(connection, |database| {
            Ok(database
                .tables
                .keys()
                .map(|key| database.table_names.get(key).unwrap_or(key).clone())
                .collect())
        })
    }

    async fn describe_columns(
        &self,
        connection: &str,
        table: &str,
    ) -> Result<Vec<Column>, PortError> {
        self.with_database(connection, |database| Ok(database.table(table)?.columns.clone()))
    }

    async fn run_query(&self, connection: &str, sql: &str) -> Result<TabularResult, PortError> {
        self.with_database(connection, |database| {
            if let Some(result) = database.queries.get(sql.trim()) {
                return Ok(result.clone());
            }
            match scanned_table(sql) {
                Some(table) => database.table(table).cloned(),
                None => Err(PortError::Query(format!("unsupported statement: {sql}"))),
            }
        })
    }

    async fn bulk_load(&self, connection: &str, load: BulkLoad<'_>) -> Result<u64, PortError> {
        let truncate_survives_failure =
            load.truncate_first && self.atomicity == LoadAtomicity::TruncateNotTransactional;

        self.with_database(connection, |database| {
            let failure = database.load_failure.clone();
            let key = load.table.to_lowercase();
            let target = database.tables.get_mut(&key).ok_or_else(|| PortError::Load {
                table: load.table.to_string(),
                message: "table does not exist".to_string(),
            })?;

            let staged = match failure {
                Some(message) => Err(PortError::Load {
                    table: load.table.to_string(),
                    message,
                }),
                None => stage_rows(target, &load),
            };

            match staged {
                Ok(rows) => {
                    target.rows = rows;
                    Ok(load.data.row_count() as u64)
                }
                Err(err) => {
                    if truncate_survives_failure {
                        target.rows.clear();
                    }
                    Err(err)
                }
            }
        })
    }

    async fn preview(
        &self,
        connection: &str,
        table: &str,
        max_rows: usize,
    ) -> Result<TabularResult, PortError> {
        self.with_database(connection, |database| {
            let source = database.table(table)?;
            Ok(TabularResult::with_rows(
                source.columns.clone(),
                source.rows.iter().take(max_rows).cloned().collect(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coercion::LogicalType;

    const TARGET: &str = "memory://target";

    fn port_with_people() -> MemoryPort {
        let port = MemoryPort::new();
        port.create_table(
            TARGET,
            "People",
            vec![
                Column::new("id", LogicalType::Integer),
                Column::new("name", LogicalType::Text),
            ],
        );
        port.insert_rows(TARGET, "people", vec![vec![Value::Integer(1), Value::from("Ada")]])
            .expect("seed");
        port
    }

    fn incoming() -> TabularResult {
        TabularResult::with_rows(
            vec![Column::new("NAME", LogicalType::Text), Column::new("id", LogicalType::Text)],
            vec![
                vec![Value::from("Grace"), Value::from("2")],
                vec![Value::from("Linus"), Value::Null],
            ],
        )
    }

    #[tokio::test]
    async fn unknown_connection_is_unreachable() {
        let port = MemoryPort::new();
        assert!(!port.test_connection("memory://nowhere").await);
        assert!(matches!(
            port.list_tables("memory://nowhere").await,
            Err(PortError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn bulk_load_appends_and_conforms() {
        let port = port_with_people();
        let data = incoming();
        let written = port
            .bulk_load(
                TARGET,
                BulkLoad { table: "people", data: &data, truncate_first: false, batch_size: 1 },
            )
            .await
            .expect("load");
        assert_eq!(written, 2);

        let table = port.table(TARGET, "people").expect("table");
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.rows[1], vec![Value::Integer(2), Value::from("Grace")]);
        assert_eq!(table.rows[2], vec![Value::Null, Value::from("Linus")]);
    }

    #[tokio::test]
    async fn truncate_replaces_contents() {
        let port = port_with_people();
        let data = incoming();
        port.bulk_load(
            TARGET,
            BulkLoad { table: "people", data: &data, truncate_first: true, batch_size: 100 },
        )
        .await
        .expect("load");
        assert_eq!(port.table(TARGET, "people").expect("table").row_count(), 2);
    }

    #[tokio::test]
    async fn failed_load_leaves_table_untouched() {
        let port = port_with_people();
        let bad = TabularResult::with_rows(
            vec![Column::new("id", LogicalType::Text)],
            vec![vec![Value::from("7")], vec![Value::from("seven")]],
        );
        let err = port
            .bulk_load(
                TARGET,
                BulkLoad { table: "people", data: &bad, truncate_first: true, batch_size: 100 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Conform { ref column, .. } if column == "id"));
        assert_eq!(port.table(TARGET, "people").expect("table").row_count(), 1);

        port.fail_loads(TARGET, "disk full");
        let err = port
            .bulk_load(
                TARGET,
                BulkLoad { table: "people", data: &incoming(), truncate_first: true, batch_size: 100 },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(port.table(TARGET, "people").expect("table").row_count(), 1);
    }

    #[tokio::test]
    async fn non_transactional_truncate_survives_a_failed_load() {
        let port = port_with_people().with_load_atomicity(LoadAtomicity::TruncateNotTransactional);
        assert_eq!(port.load_atomicity(), LoadAtomicity::TruncateNotTransactional);
        port.fail_loads(TARGET, "disk full");

        let appended = port
            .bulk_load(
                TARGET,
                BulkLoad { table: "people", data: &incoming(), truncate_first: false, batch_size: 100 },
            )
            .await;
        assert!(appended.is_err());
        assert_eq!(port.table(TARGET, "people").expect("table").row_count(), 1);

        let replaced = port
            .bulk_load(
                TARGET,
                BulkLoad { table: "people", data: &incoming(), truncate_first: true, batch_size: 100 },
            )
            .await;
        assert!(replaced.is_err());
        assert_eq!(port.table(TARGET, "people").expect("table").row_count(), 0);
    }

    #[tokio::test]
    async fn queries_and_introspection() {
        let port = port_with_people();
        port.register_query(TARGET, "SELECT 1", TabularResult::default());

        assert_eq!(port.list_tables(TARGET).await.expect("tables"), vec!["People"]);
        assert_eq!(
            port.list_columns(TARGET, "PEOPLE").await.expect("columns"),
            vec!["id", "name"]
        );
        assert_eq!(port.run_query(TARGET, " SELECT 1 ").await.expect("canned").row_count(), 0);
        assert_eq!(
            port.run_query(TARGET, "select * from people;").await.expect("scan").row_count(),
            1
        );
        assert!(port.run_query(TARGET, "DELETE FROM people").await.is_err());
        assert_eq!(port.preview(TARGET, "people", 0).await.expect("preview").row_count(), 0);
    }
}
