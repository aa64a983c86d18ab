use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, StoreError};
use crate::model::{MappingDefinition, MappingResult, ValidationResult};
use crate::port::{BulkLoad, LoadAtomicity, RelationalPort};
use crate::store::MappingStore;
use crate::transform::transform_table;
use crate::validation::MappingValidator;

/// Runs mappings end to end: validate, extract, transform, load, record.
///
/// None of the entry points return an error. Every failure ends up in the
/// returned [`MappingResult`] or [`ValidationResult`].
#[derive(Clone)]
pub struct MappingExecutor {
    store: Arc<dyn MappingStore>,
    source: Arc<dyn RelationalPort>,
    target: Arc<dyn RelationalPort>,
    validator: MappingValidator,
}

impl MappingExecutor {
    pub fn new(
        store: Arc<dyn MappingStore>,
        source: Arc<dyn RelationalPort>,
        target: Arc<dyn RelationalPort>,
    ) -> Self {
        let validator = MappingValidator::new(Arc::clone(&source), Arc::clone(&target));
        Self {
            store,
            source,
            target,
            validator,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn execute_mapping(&self, mapping_id: Uuid) -> MappingResult {
        match self.store.get_with_fields(mapping_id).await {
            Ok(definition) => self.execute_definition(definition).await,
            Err(StoreError::NotFound(id)) => MappingResult::not_found(id),
            Err(err) => {
                warn!(error = %err, "mapping definition could not be read");
                MappingResult::store_unavailable(format!("Failed to load mapping: {err}"))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn validate_mapping(&self, mapping_id: Uuid) -> ValidationResult {
        match self.store.get_with_fields(mapping_id).await {
            Ok(definition) => self.validate_definition(&definition).await,
            Err(StoreError::NotFound(id)) => {
                ValidationResult::from_reasons(vec![format!("Mapping with ID {id} not found.")])
            }
            Err(err) => ValidationResult::from_reasons(vec![format!("Failed to load mapping: {err}")]),
        }
    }

    pub async fn validate_definition(&self, definition: &MappingDefinition) -> ValidationResult {
        self.validator.validate(definition).await
    }

    /// Runs an already-loaded definition and persists its bookkeeping when it ran.
    #[tracing::instrument(
        skip(self, definition),
        fields(mapping_id = %definition.mapping_id, name = %definition.name)
    )]
    pub async fn execute_definition(&self, mut definition: MappingDefinition) -> MappingResult {
        let validation = self.validate_definition(&definition).await;
        if !validation.valid {
            warn!(reasons = validation.reasons.len(), "mapping rejected by validation");
            return MappingResult::rejected(validation);
        }

        let started = Instant::now();
        let outcome = self.run(&definition).await;
        let elapsed_seconds = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(records) => {
                info!(records, elapsed_seconds, "mapping executed");
                definition.record_success(records, elapsed_seconds);
                MappingResult::succeeded(records, elapsed_seconds)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, elapsed_seconds, "mapping execution failed");
                definition.record_failure(&message);
                MappingResult::failed(message, elapsed_seconds)
            }
        };

        if let Some(record) = &definition.last_execution {
            if let Err(err) = self.store.record_execution(definition.mapping_id, record).await {
                warn!(error = %err, "failed to persist execution bookkeeping");
            }
        }

        result
    }

    async fn run(&self, definition: &MappingDefinition) -> Result<u64, ExecutionError> {
        let source = self
            .source
            .run_query(&definition.source_connection, &definition.source_query)
            .await
            .map_err(ExecutionError::Extract)?;
        info!(rows = source.row_count(), "source rows extracted");

        let transformed = transform_table(&source, &definition.field_mappings)?;
        drop(source);

        let truncate_survives_failure = definition.truncate_before_load
            && self.target.load_atomicity() == LoadAtomicity::TruncateNotTransactional;
        if truncate_survives_failure {
            warn!(
                table = %definition.target_table,
                "target truncation is not transactional; a failed load leaves the table empty"
            );
        }

        let load = BulkLoad {
            table: &definition.target_table,
            data: &transformed,
            truncate_first: definition.truncate_before_load,
            batch_size: definition.effective_batch_size(),
        };
        self.target
            .bulk_load(&definition.target_connection, load)
            .await
            .map_err(|err| {
                if truncate_survives_failure {
                    ExecutionError::LoadAfterTruncate(err)
                } else {
                    ExecutionError::Load(err)
                }
            })
    }
}
