use anyhow::{bail, Result};
use rowbridge_core::MappingExecutor;
use rowbridge_repository::{MappingLock, PostgresMappingStore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::output;

/// Runs one mapping while holding its advisory lock on the store database.
pub async fn execute(
    store: &PostgresMappingStore,
    executor: &MappingExecutor,
    mapping_id: Uuid,
    json: bool,
) -> Result<()> {
    let Some(lock) = MappingLock::try_acquire(store.pool(), mapping_id).await? else {
        bail!("mapping {mapping_id} is already being executed by another session");
    };

    let result = executor.execute_mapping(mapping_id).await;

    if let Err(err) = lock.release().await {
        warn!(%mapping_id, "failed to release mapping lock: {err}");
    }

    if json {
        output::print_json(&result)?;
    } else {
        output::print_result(&result);
    }

    if !result.success {
        bail!("mapping {mapping_id} did not complete");
    }
    info!(%mapping_id, records = result.records_processed, "mapping run finished");
    Ok(())
}

pub async fn validate(executor: &MappingExecutor, mapping_id: Uuid, json: bool) -> Result<()> {
    let verdict = executor.validate_mapping(mapping_id).await;
    if json {
        output::print_json(&verdict)?;
    } else {
        output::print_validation(&verdict);
    }
    if !verdict.valid {
        bail!("mapping {mapping_id} is invalid");
    }
    Ok(())
}
