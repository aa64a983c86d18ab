//! PostgreSQL persistence for mapping definitions and their field mappings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rowbridge_core::{ExecutionRecord, FieldMapping, MappingDefinition, MappingStore, StoreError};
use sqlx::migrate::MigrateError;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

mod lock;

pub use lock::MappingLock;

const DEFINITION_COLUMNS: &str = r#"
    mapping_id,
    name,
    description,
    is_active,
    created_at,
    source_connection,
    source_query,
    target_connection,
    target_table,
    truncate_before_load,
    batch_size,
    last_executed_at,
    last_execution_successful,
    last_record_count,
    last_execution_log
"#;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("invalid stored value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("mapping with ID {0} not found")]
    NotFound(Uuid),
}

impl From<RepositoryError> for StoreError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => StoreError::NotFound(id),
            RepositoryError::InvalidValue { field, message } => {
                StoreError::InvalidValue { field, message }
            }
            other => StoreError::Backend(Box::new(other)),
        }
    }
}

#[derive(Clone)]
pub struct PostgresMappingStore {
    pool: PgPool,
}

impl PostgresMappingStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_definition(&self, mapping_id: Uuid) -> Result<MappingDefinition, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM mapping_definitions WHERE mapping_id = $1"
        ))
        .bind(mapping_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => definition_from_row(&row),
            None => Err(RepositoryError::NotFound(mapping_id)),
        }
    }

    async fn fetch_field_mappings(&self, mapping_id: Uuid) -> Result<Vec<FieldMapping>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT
                source_field,
                source_field_type,
                target_field,
                target_field_type,
                requires_transformation,
                transformation_expression,
                default_value
            FROM field_mappings
            WHERE mapping_id = $1
            ORDER BY position
            "#,
        )
        .bind(mapping_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(FieldMapping {
                    source_field: row.try_get("source_field")?,
                    source_field_type: row.try_get("source_field_type")?,
                    target_field: row.try_get("target_field")?,
                    target_field_type: row.try_get("target_field_type")?,
                    requires_transformation: row.try_get("requires_transformation")?,
                    transformation_expression: row.try_get("transformation_expression")?,
                    default_value: row.try_get("default_value")?,
                })
            })
            .collect()
    }

    async fn fetch_listing(&self, only_active: bool) -> Result<Vec<MappingDefinition>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM mapping_definitions \
             WHERE is_active OR NOT $1 \
             ORDER BY name, mapping_id"
        ))
        .bind(only_active)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(definition_from_row).collect()
    }
}

fn definition_from_row(row: &PgRow) -> Result<MappingDefinition, RepositoryError> {
    let batch_size: i32 = row.try_get("batch_size")?;
    let batch_size = u32::try_from(batch_size).map_err(|_| RepositoryError::InvalidValue {
        field: "batch_size",
        message: format!("negative batch size {batch_size}"),
    })?;

    let executed_at: Option<DateTime<Utc>> = row.try_get("last_executed_at")?;
    let last_execution = match executed_at {
        Some(executed_at) => {
            let record_count: Option<i64> = row.try_get("last_record_count")?;
            let record_count = u64::try_from(record_count.unwrap_or_default()).map_err(|_| {
                RepositoryError::InvalidValue {
                    field: "last_record_count",
                    message: "negative record count".to_string(),
                }
            })?;
            let successful: Option<bool> = row.try_get("last_execution_successful")?;
            let log: Option<String> = row.try_get("last_execution_log")?;
            Some(ExecutionRecord {
                executed_at,
                successful: successful.unwrap_or(false),
                record_count,
                log: log.unwrap_or_default(),
            })
        }
        None => None,
    };

    Ok(MappingDefinition {
        mapping_id: row.try_get("mapping_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        source_connection: row.try_get("source_connection")?,
        source_query: row.try_get("source_query")?,
        target_connection: row.try_get("target_connection")?,
        target_table: row.try_get("target_table")?,
        truncate_before_load: row.try_get("truncate_before_load")?,
        batch_size,
        field_mappings: Vec::new(),
        last_execution,
    })
}

fn stored_batch_size(definition: &MappingDefinition) -> Result<i32, RepositoryError> {
    i32::try_from(definition.batch_size).map_err(|_| RepositoryError::InvalidValue {
        field: "batch_size",
        message: format!("batch size {} is too large", definition.batch_size),
    })
}

fn stored_record_count(record: &ExecutionRecord) -> Result<i64, RepositoryError> {
    i64::try_from(record.record_count).map_err(|_| RepositoryError::InvalidValue {
        field: "last_record_count",
        message: format!("record count {} is too large", record.record_count),
    })
}

async fn insert_field_mappings(
    tx: &mut Transaction<'_, Postgres>,
    mapping_id: Uuid,
    field_mappings: &[FieldMapping],
) -> Result<(), RepositoryError> {
    for (position, field) in field_mappings.iter().enumerate() {
        let position = i32::try_from(position).map_err(|_| RepositoryError::InvalidValue {
            field: "field_mappings",
            message: "too many field mappings".to_string(),
        })?;
        sqlx::query(
            r#"
            INSERT INTO field_mappings (
                mapping_id,
                position,
                source_field,
                source_field_type,
                target_field,
                target_field_type,
                requires_transformation,
                transformation_expression,
                default_value
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(mapping_id)
        .bind(position)
        .bind(&field.source_field)
        .bind(&field.source_field_type)
        .bind(&field.target_field)
        .bind(&field.target_field_type)
        .bind(field.requires_transformation)
        .bind(&field.transformation_expression)
        .bind(&field.default_value)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

impl PostgresMappingStore {
    async fn insert(&self, definition: &MappingDefinition) -> Result<MappingDefinition, RepositoryError> {
        let mut stored = definition.clone();
        stored.created_at = Utc::now();
        let last = stored.last_execution.as_ref();
        let record_count = last.map(stored_record_count).transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO mapping_definitions (
                mapping_id,
                name,
                description,
                is_active,
                created_at,
                source_connection,
                source_query,
                target_connection,
                target_table,
                truncate_before_load,
                batch_size,
                last_executed_at,
                last_execution_successful,
                last_record_count,
                last_execution_log
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(stored.mapping_id)
        .bind(&stored.name)
        .bind(&stored.description)
        .bind(stored.is_active)
        .bind(stored.created_at)
        .bind(&stored.source_connection)
        .bind(&stored.source_query)
        .bind(&stored.target_connection)
        .bind(&stored.target_table)
        .bind(stored.truncate_before_load)
        .bind(stored_batch_size(&stored)?)
        .bind(last.map(|record| record.executed_at))
        .bind(last.map(|record| record.successful))
        .bind(record_count)
        .bind(last.map(|record| record.log.clone()))
        .execute(&mut *tx)
        .await?;

        insert_field_mappings(&mut tx, stored.mapping_id, &stored.field_mappings).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn replace(&self, definition: &MappingDefinition) -> Result<(), RepositoryError> {
        let last = definition.last_execution.as_ref();
        let record_count = last.map(stored_record_count).transpose()?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE mapping_definitions
            SET name = $2,
                description = $3,
                is_active = $4,
                source_connection = $5,
                source_query = $6,
                target_connection = $7,
                target_table = $8,
                truncate_before_load = $9,
                batch_size = $10,
                last_executed_at = $11,
                last_execution_successful = $12,
                last_record_count = $13,
                last_execution_log = $14
            WHERE mapping_id = $1
            "#,
        )
        .bind(definition.mapping_id)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.is_active)
        .bind(&definition.source_connection)
        .bind(&definition.source_query)
        .bind(&definition.target_connection)
        .bind(&definition.target_table)
        .bind(definition.truncate_before_load)
        .bind(stored_batch_size(definition)?)
        .bind(last.map(|record| record.executed_at))
        .bind(last.map(|record| record.successful))
        .bind(record_count)
        .bind(last.map(|record| record.log.clone()))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(definition.mapping_id));
        }

        sqlx::query("DELETE FROM field_mappings WHERE mapping_id = $1")
            .bind(definition.mapping_id)
            .execute(&mut *tx)
            .await?;
        insert_field_mappings(&mut tx, definition.mapping_id, &definition.field_mappings).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn write_execution(&self, mapping_id: Uuid, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE mapping_definitions
            SET last_executed_at = $2,
                last_execution_successful = $3,
                last_record_count = $4,
                last_execution_log = $5
            WHERE mapping_id = $1
            "#,
        )
        .bind(mapping_id)
        .bind(record.executed_at)
        .bind(record.successful)
        .bind(stored_record_count(record)?)
        .bind(&record.log)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(mapping_id));
        }
        Ok(())
    }
}

#[async_trait]
impl MappingStore for PostgresMappingStore {
    async fn get(&self, mapping_id: Uuid) -> Result<MappingDefinition, StoreError> {
        Ok(self.fetch_definition(mapping_id).await?)
    }

    async fn get_with_fields(&self, mapping_id: Uuid) -> Result<MappingDefinition, StoreError> {
        let mut definition = self.fetch_definition(mapping_id).await?;
        definition.field_mappings = self.fetch_field_mappings(mapping_id).await?;
        Ok(definition)
    }

    async fn get_all(&self) -> Result<Vec<MappingDefinition>, StoreError> {
        Ok(self.fetch_listing(false).await?)
    }

    async fn get_active(&self) -> Result<Vec<MappingDefinition>, StoreError> {
        Ok(self.fetch_listing(true).await?)
    }

    async fn add(&self, definition: &MappingDefinition) -> Result<MappingDefinition, StoreError> {
        Ok(self.insert(definition).await?)
    }

    async fn update(&self, definition: &MappingDefinition) -> Result<(), StoreError> {
        Ok(self.replace(definition).await?)
    }

    async fn record_execution(&self, mapping_id: Uuid, record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(self.write_execution(mapping_id, record).await?)
    }

    async fn delete(&self, mapping_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM mapping_definitions WHERE mapping_id = $1")
            .bind(mapping_id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() > 0)
    }
}
