use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rowbridge_core::port::Engine;
use rowbridge_core::{
    BulkLoad, Column, FieldMapping, LoadAtomicity, LogicalType, MappingDefinition,
    MappingValidator, MemoryPort, PortError, RelationalPort, TabularResult,
};

const SOURCE: &str = "memory://crm";
const TARGET: &str = "memory://odoo";

/// Wraps a port and counts connection tests.
struct CountingPort {
    inner: MemoryPort,
    connection_tests: AtomicUsize,
}

impl CountingPort {
    fn new(inner: MemoryPort) -> Self {
        Self {
            inner,
            connection_tests: AtomicUsize::new(0),
        }
    }

    fn tests(&self) -> usize {
        self.connection_tests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelationalPort for CountingPort {
    fn engine(&self) -> Engine {
        self.inner.engine()
    }

    fn load_atomicity(&self) -> LoadAtomicity {
        self.inner.load_atomicity()
    }

    async fn test_connection(&self, connection: &str) -> bool {
        self.connection_tests.fetch_add(1, Ordering::SeqCst);
        self.inner.test_connection(connection).await
    }

    async fn list_databases(&self, connection: &str) -> Result<Vec<String>, PortError> {
        self.inner.list_databases(connection).await
    }

    async fn list_tables(&self, connection: &str) -> Result<Vec<String>, PortError> {
        self.inner.list_tables(connection).await
    }

    async fn describe_columns(
        &self,
        connection: &str,
        table: &str,
    ) -> Result<Vec<Column>, PortError> {
        self.inner.describe_columns(connection, table).await
    }

    async fn run_query(&self, connection: &str, sql: &str) -> Result<TabularResult, PortError> {
        self.inner.run_query(connection, sql).await
    }

    async fn bulk_load(&self, connection: &str, load: BulkLoad<'_>) -> Result<u64, PortError> {
        self.inner.bulk_load(connection, load).await
    }

    async fn preview(
        &self,
        connection: &str,
        table: &str,
        max_rows: usize,
    ) -> Result<TabularResult, PortError> {
        self.inner.preview(connection, table, max_rows).await
    }
}

fn engine() -> MemoryPort {
    let port = MemoryPort::new();
    port.add_database(SOURCE);
    port.create_table(
        TARGET,
        "res_partner",
        vec![
            Column::new("id", LogicalType::Integer),
            Column::new("Name", LogicalType::Text),
            Column::new("email", LogicalType::Text),
        ],
    );
    port
}

fn definition() -> MappingDefinition {
    let mut definition = MappingDefinition::new("partners");
    definition.source_connection = SOURCE.into();
    definition.source_query = "SELECT * FROM customers".into();
    definition.target_connection = TARGET.into();
    definition.target_table = "res_partner".into();
    definition.field_mappings = vec![
        FieldMapping::direct("customer_name", "name"),
        FieldMapping::direct("mail", "EMAIL"),
    ];
    definition
}

fn validator(port: Arc<CountingPort>) -> MappingValidator {
    MappingValidator::new(port.clone(), port)
}

#[tokio::test]
async fn complete_definition_is_valid() {
    let port = Arc::new(CountingPort::new(engine()));
    let verdict = validator(port.clone()).validate(&definition()).await;
    assert!(verdict.valid, "unexpected reasons: {:?}", verdict.reasons);
    assert!(verdict.reasons.is_empty());
    assert_eq!(port.tests(), 2);
}

#[tokio::test]
async fn zero_field_mappings_is_invalid() {
    let port = Arc::new(CountingPort::new(engine()));
    let mut definition = definition();
    definition.field_mappings.clear();

    let verdict = validator(port.clone()).validate(&definition).await;
    assert!(!verdict.valid);
    assert!(verdict
        .reasons
        .iter()
        .any(|reason| reason.to_lowercase().contains("at least one field mapping")));
    assert_eq!(port.tests(), 0);
}

#[tokio::test]
async fn structural_failures_skip_connection_tests() {
    let port = Arc::new(CountingPort::new(engine()));
    let blank_fields: [fn(&mut MappingDefinition); 5] = [
        |d| d.name = String::new(),
        |d| d.source_connection = " ".into(),
        |d| d.source_query = String::new(),
        |d| d.target_connection = String::new(),
        |d| d.target_table = "\t".into(),
    ];

    for blank in blank_fields {
        let mut definition = definition();
        blank(&mut definition);
        let verdict = validator(port.clone()).validate(&definition).await;
        assert!(!verdict.valid);
        assert_eq!(verdict.reasons.len(), 1, "reasons: {:?}", verdict.reasons);
    }

    assert_eq!(port.tests(), 0);
}

#[tokio::test]
async fn unreachable_databases_are_reported_and_columns_skipped() {
    let port = Arc::new(CountingPort::new(engine()));
    let mut definition = definition();
    definition.source_connection = "memory://missing-source".into();
    definition.target_connection = "memory://missing-target".into();
    definition.field_mappings.push(FieldMapping::direct("x", "not_a_column"));

    let verdict = validator(port.clone()).validate(&definition).await;
    assert_eq!(
        verdict.reasons,
        vec![
            "Cannot connect to source database with the provided connection string.",
            "Cannot connect to target database with the provided connection string.",
        ]
    );
    assert_eq!(port.tests(), 2);
}

#[tokio::test]
async fn each_missing_target_column_is_named() {
    let port = Arc::new(CountingPort::new(engine()));
    let mut definition = definition();
    definition.field_mappings.push(FieldMapping::direct("phone", "phone"));
    definition.field_mappings.push(FieldMapping::direct("city", "city"));

    let verdict = validator(port).validate(&definition).await;
    assert_eq!(
        verdict.reasons,
        vec![
            "Target column 'phone' does not exist in table 'res_partner'.",
            "Target column 'city' does not exist in table 'res_partner'.",
        ]
    );
}

#[tokio::test]
async fn column_lookup_failure_is_a_single_reason() {
    let port = Arc::new(CountingPort::new(engine()));
    let mut definition = definition();
    definition.target_table = "no_such_table".into();

    let verdict = validator(port).validate(&definition).await;
    assert_eq!(verdict.reasons.len(), 1);
    assert!(verdict.reasons[0].starts_with("Error validating target table columns:"));
    assert!(verdict.reasons[0].contains("no_such_table"));
}
