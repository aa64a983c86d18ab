use std::sync::Arc;

use tracing::debug;

use crate::model::{MappingDefinition, ValidationResult};
use crate::port::RelationalPort;
use crate::table::names_match;

/// Checks that a definition is complete, both databases answer and every
/// target field exists in the target table.
#[derive(Clone)]
pub struct MappingValidator {
    source: Arc<dyn RelationalPort>,
    target: Arc<dyn RelationalPort>,
}

impl MappingValidator {
    pub fn new(source: Arc<dyn RelationalPort>, target: Arc<dyn RelationalPort>) -> Self {
        Self { source, target }
    }

    pub async fn validate(&self, definition: &MappingDefinition) -> ValidationResult {
        let mut reasons = structural_reasons(definition);

        if reasons.is_empty() {
            reasons.extend(self.live_reasons(definition).await);
        }

        debug!(
            mapping_id = %definition.mapping_id,
            reasons = reasons.len(),
            "mapping validated"
        );
        ValidationResult::from_reasons(reasons)
    }

    async fn live_reasons(&self, definition: &MappingDefinition) -> Vec<String> {
        let mut reasons = Vec::new();

        let source_ok = self.source.test_connection(&definition.source_connection).await;
        if !source_ok {
            reasons.push(
                "Cannot connect to source database with the provided connection string."
                    .to_string(),
            );
        }

        let target_ok = self.target.test_connection(&definition.target_connection).await;
        if !target_ok {
            reasons.push(
                "Cannot connect to target database with the provided connection string."
                    .to_string(),
            );
        }

        if source_ok && target_ok {
            reasons.extend(self.column_reasons(definition).await);
        }

        reasons
    }

    async fn column_reasons(&self, definition: &MappingDefinition) -> Vec<String> {
        let columns = match self
            .target
            .list_columns(&definition.target_connection, &definition.target_table)
            .await
        {
            Ok(columns) => columns,
            Err(err) => return vec![format!("Error validating target table columns: {err}")],
        };

        definition
            .field_mappings
            .iter()
            .filter(|mapping| {
                !columns
                    .iter()
                    .any(|column| names_match(column, &mapping.target_field))
            })
            .map(|mapping| {
                format!(
                    "Target column '{}' does not exist in table '{}'.",
                    mapping.target_field, definition.target_table
                )
            })
            .collect()
    }
}

/// Checks that need no I/O, accumulated in a fixed order.
pub fn structural_reasons(definition: &MappingDefinition) -> Vec<String> {
    let required = [
        (&definition.name, "Mapping name is required."),
        (&definition.source_connection, "Source connection string is required."),
        (&definition.source_query, "Source query is required."),
        (&definition.target_connection, "Target connection string is required."),
        (&definition.target_table, "Target table is required."),
    ];

    let mut reasons: Vec<String> = required
        .iter()
        .filter(|(value, _)| value.trim().is_empty())
        .map(|(_, reason)| reason.to_string())
        .collect();

    if definition.field_mappings.is_empty() {
        reasons.push("Mapping requires at least one field mapping.".to_string());
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_reasons_accumulate_in_order() {
        let mut definition = MappingDefinition::new("  ");
        definition.source_query = "SELECT 1".into();
        let reasons = structural_reasons(&definition);
        assert_eq!(
            reasons,
            vec![
                "Mapping name is required.",
                "Source connection string is required.",
                "Target connection string is required.",
                "Target table is required.",
                "Mapping requires at least one field mapping.",
            ]
        );
    }
}
