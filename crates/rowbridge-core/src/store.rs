use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ExecutionRecord, MappingDefinition};

/// Durable home of mapping definitions and their bookkeeping.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// The definition without its field mappings.
    async fn get(&self, mapping_id: Uuid) -> Result<MappingDefinition, StoreError>;

    /// The definition with its field mappings, in stored order.
    async fn get_with_fields(&self, mapping_id: Uuid) -> Result<MappingDefinition, StoreError>;

    /// Every definition ordered by name, without field mappings.
    async fn get_all(&self) -> Result<Vec<MappingDefinition>, StoreError>;

    async fn get_active(&self) -> Result<Vec<MappingDefinition>, StoreError>;

    /// Stores a new definition, stamping its creation time.
    async fn add(&self, definition: &MappingDefinition) -> Result<MappingDefinition, StoreError>;

    /// Replaces scalar fields, bookkeeping and field mappings together.
    async fn update(&self, definition: &MappingDefinition) -> Result<(), StoreError>;

    /// Overwrites only the last-run bookkeeping, leaving every other field as stored.
    async fn record_execution(&self, mapping_id: Uuid, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Returns whether a definition was removed.
    async fn delete(&self, mapping_id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    definitions: Mutex<HashMap<Uuid, MappingDefinition>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_definitions<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, MappingDefinition>) -> R) -> R {
        let mut guard = self.definitions.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn listing(mut definitions: Vec<MappingDefinition>) -> Vec<MappingDefinition> {
        for definition in &mut definitions {
            definition.field_mappings.clear();
        }
        definitions.sort_by(|a, b| a.name.cmp(&b.name).then(a.mapping_id.cmp(&b.mapping_id)));
        definitions
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get(&self, mapping_id: Uuid) -> Result<MappingDefinition, StoreError> {
        let mut definition = self.get_with_fields(mapping_id).await?;
        definition.field_mappings.clear();
        Ok(definition)
    }

    async fn get_with_fields(&self, mapping_id: Uuid) -> Result<MappingDefinition, StoreError> {
        self.with_definitions(|definitions| definitions.get(&mapping_id).cloned())
            .ok_or(StoreError::NotFound(mapping_id))
    }

    async fn get_all(&self) -> Result<Vec<MappingDefinition>, StoreError> {
        let all = self.with_definitions(|definitions| definitions.values().cloned().collect());
        Ok(Self::listing(all))
    }

    async fn get_active(&self) -> Result<Vec<MappingDefinition>, StoreError> {
        let active = self.with_definitions(|definitions| {
            definitions
                .values()
                .filter(|definition| definition.is_active)
                .cloned()
                .collect()
        });
        Ok(Self::listing(active))
    }

    async fn add(&self, definition: &MappingDefinition) -> Result<MappingDefinition, StoreError> {
        let mut stored = definition.clone();
        stored.created_at = Utc::now();
        self.with_definitions(|definitions| {
            if definitions.contains_key(&stored.mapping_id) {
                return Err(StoreError::InvalidValue {
                    field: "mapping_id",
                    message: format!("mapping {} already exists", stored.mapping_id),
                });
            }
            definitions.insert(stored.mapping_id, stored.clone());
            Ok(())
        })?;
        Ok(stored)
    }

    async fn update(&self, definition: &MappingDefinition) -> Result<(), StoreError> {
        self.with_definitions(|definitions| match definitions.get_mut(&definition.mapping_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = definition.clone();
                existing.created_at = created_at;
                Ok(())
            }
            None => Err(StoreError::NotFound(definition.mapping_id)),
        })
    }

    async fn record_execution(&self, mapping_id: Uuid, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.with_definitions(|definitions| match definitions.get_mut(&mapping_id) {
            Some(existing) => {
                existing.last_execution = Some(record.clone());
                Ok(())
            }
            None => Err(StoreError::NotFound(mapping_id)),
        })
    }

    async fn delete(&self, mapping_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.with_definitions(|definitions| definitions.remove(&mapping_id).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldMapping;

    fn definition(name: &str) -> MappingDefinition {
        let mut definition = MappingDefinition::new(name);
        definition.field_mappings = vec![
            FieldMapping::direct("a", "x"),
            FieldMapping::direct("b", "y"),
        ];
        definition
    }

    #[tokio::test]
    async fn get_omits_fields_and_get_with_fields_keeps_order() {
        let store = MemoryMappingStore::new();
        let stored = store.add(&definition("orders")).await.expect("add");

        let bare = store.get(stored.mapping_id).await.expect("get");
        assert!(bare.field_mappings.is_empty());

        let full = store.get_with_fields(stored.mapping_id).await.expect("get");
        let targets: Vec<_> = full.field_mappings.iter().map(|f| f.target_field.as_str()).collect();
        assert_eq!(targets, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn active_listing_skips_inactive_definitions() {
        let store = MemoryMappingStore::new();
        store.add(&definition("b-active")).await.expect("add");
        let mut inactive = definition("a-inactive");
        inactive.is_active = false;
        store.add(&inactive).await.expect("add");

        assert_eq!(store.get_all().await.expect("all").len(), 2);
        let active = store.get_active().await.expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b-active");
        assert!(active[0].field_mappings.is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_report_misses() {
        let store = MemoryMappingStore::new();
        let missing = definition("ghost");
        assert!(matches!(
            store.update(&missing).await,
            Err(StoreError::NotFound(id)) if id == missing.mapping_id
        ));
        assert!(!store.delete(missing.mapping_id).await.expect("delete"));

        let stored = store.add(&missing).await.expect("add");
        assert!(store.delete(stored.mapping_id).await.expect("delete"));
        assert!(store.get(stored.mapping_id).await.is_err());
    }

    #[tokio::test]
    async fn recording_an_execution_keeps_edited_fields() {
        let store = MemoryMappingStore::new();
        let stored = store.add(&definition("orders")).await.expect("add");

        let mut edited = stored.clone();
        edited.name = "orders-v2".to_string();
        edited.field_mappings.pop();
        store.update(&edited).await.expect("edit");

        let mut ran = stored.clone();
        ran.record_success(12, 0.25);
        let record = ran.last_execution.expect("record");
        store.record_execution(stored.mapping_id, &record).await.expect("record");

        let reloaded = store.get_with_fields(stored.mapping_id).await.expect("reload");
        assert_eq!(reloaded.name, "orders-v2");
        assert_eq!(reloaded.field_mappings.len(), 1);
        assert_eq!(reloaded.last_execution, Some(record.clone()));

        let ghost = Uuid::new_v4();
        assert!(matches!(
            store.record_execution(ghost, &record).await,
            Err(StoreError::NotFound(id)) if id == ghost
        ));
    }
}
