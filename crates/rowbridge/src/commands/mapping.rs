use std::path::PathBuf;

use anyhow::{Context, Result};
use rowbridge_core::{parse_manifest, MappingDefinition, MappingStore, StoreError};
use rowbridge_repository::PostgresMappingStore;
use tracing::info;
use uuid::Uuid;

use crate::output;

#[derive(clap::Subcommand, Debug)]
pub enum MappingCommand {
    /// List stored definitions ordered by name
    List {
        /// Only definitions marked active
        #[arg(long)]
        active: bool,
        #[arg(long)]
        csv: bool,
    },
    /// Show one definition with its field mappings
    Show {
        mapping_id: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Import a `[mapping]` or `[template]` TOML manifest
    Import { path: PathBuf },
    /// Delete a definition and its field mappings
    Delete { mapping_id: Uuid },
}

pub async fn handle(command: MappingCommand, store: &PostgresMappingStore) -> Result<()> {
    match command {
        MappingCommand::List { active, csv } => {
            let definitions = if active {
                store.get_active().await?
            } else {
                store.get_all().await?
            };
            output::print_rows(listing_header(), definitions.iter().map(listing_row).collect(), csv)
        }
        MappingCommand::Show { mapping_id, json } => {
            let definition = store.get_with_fields(mapping_id).await?;
            if json {
                return output::print_json(&definition);
            }
            print_definition(&definition)
        }
        MappingCommand::Import { path } => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read mapping manifest '{}'", path.display()))?;
            let definition = parse_manifest(&contents)
                .and_then(|manifest| manifest.into_definition())
                .with_context(|| format!("Invalid mapping manifest '{}'", path.display()))?;
            let mapping_id = import(store, definition).await?;
            println!("{mapping_id}");
            Ok(())
        }
        MappingCommand::Delete { mapping_id } => {
            if store.delete(mapping_id).await? {
                info!(%mapping_id, "mapping deleted");
                println!("Deleted mapping {mapping_id}");
            } else {
                println!("Mapping {mapping_id} not found");
            }
            Ok(())
        }
    }
}

/// Adds the definition, or replaces it when the id is already stored.
///
/// Replacing keeps the stored creation time and last-run bookkeeping.
pub async fn import<S: MappingStore + ?Sized>(store: &S, mut definition: MappingDefinition) -> Result<Uuid> {
    let mapping_id = definition.mapping_id;
    match store.get(mapping_id).await {
        Ok(existing) => {
            definition.last_execution = existing.last_execution;
            store.update(&definition).await?;
            info!(%mapping_id, "mapping updated from manifest");
        }
        Err(StoreError::NotFound(_)) => {
            store.add(&definition).await?;
            info!(%mapping_id, "mapping added from manifest");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(mapping_id)
}

fn listing_header() -> Vec<String> {
    ["id", "name", "active", "target", "last run", "records"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn listing_row(definition: &MappingDefinition) -> Vec<String> {
    let (last_run, records) = match &definition.last_execution {
        Some(record) => (
            format!(
                "{} {}",
                record.executed_at.format("%Y-%m-%d %H:%M:%S"),
                if record.successful { "ok" } else { "failed" }
            ),
            record.record_count.to_string(),
        ),
        None => ("never".to_string(), String::new()),
    };
    vec![
        definition.mapping_id.to_string(),
        definition.name.clone(),
        definition.is_active.to_string(),
        definition.target_table.clone(),
        last_run,
        records,
    ]
}

fn print_definition(definition: &MappingDefinition) -> Result<()> {
    println!("{} ({})", definition.name, definition.mapping_id);
    if let Some(description) = &definition.description {
        println!("  {description}");
    }
    println!("  Active: {}", definition.is_active);
    println!("  Source query: {}", definition.source_query);
    println!("  Target table: {}", definition.target_table);
    println!(
        "  Truncate before load: {}, batch size: {}",
        definition.truncate_before_load, definition.batch_size
    );
    if let Some(record) = &definition.last_execution {
        println!("  Last run: {} ({})", record.executed_at, record.log);
    }

    let header = ["source", "target", "target type", "transformation", "default"]
        .into_iter()
        .map(String::from)
        .collect();
    let rows = definition
        .field_mappings
        .iter()
        .map(|field| {
            vec![
                field.source_field.clone(),
                field.target_field.clone(),
                field.target_field_type.clone().unwrap_or_default(),
                field.active_expression().unwrap_or_default().to_string(),
                field.default_value.clone().unwrap_or_default(),
            ]
        })
        .collect();
    output::print_rows(header, rows, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowbridge_core::{FieldMapping, MemoryMappingStore};

    fn manifest_definition() -> MappingDefinition {
        let manifest = parse_manifest(
            r#"
            [mapping]
            mapping_id = "6f1c2a3e-0000-4000-8000-00000000002a"
            name = "partners"
            source_connection = "Server=crm;Database=sales;"
            source_query = "SELECT name FROM customers"
            target_connection = "postgres://odoo/odoo"
            target_table = "res_partner"

            [[mapping.field_mappings]]
            source_field = "name"
            target_field = "name"
            "#,
        )
        .expect("manifest");
        manifest.into_definition().expect("definition")
    }

    #[tokio::test]
    async fn import_adds_then_updates_keeping_bookkeeping() {
        let store = MemoryMappingStore::new();
        let definition = manifest_definition();
        let mapping_id = import(&store, definition.clone()).await.expect("add");

        let mut stored = store.get(mapping_id).await.expect("stored");
        stored.record_success(7, 0.5);
        store.update(&stored).await.expect("bookkeeping");

        let mut revised = definition;
        revised.field_mappings.push(FieldMapping::direct("email", "email"));
        import(&store, revised).await.expect("update");

        let reloaded = store.get_with_fields(mapping_id).await.expect("reload");
        assert_eq!(reloaded.field_mappings.len(), 2);
        assert_eq!(reloaded.last_execution.expect("kept").record_count, 7);
    }

    #[test]
    fn listing_row_reports_never_run_definitions() {
        let row = listing_row(&manifest_definition());
        assert_eq!(row[1], "partners");
        assert_eq!(row[4], "never");
        assert!(row[5].is_empty());
    }
}
