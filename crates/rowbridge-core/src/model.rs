use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coercion::LogicalType;

pub const DEFAULT_BATCH_SIZE: u32 = 100;

fn default_true() -> bool {
    true
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

/// Declarative description of one source-to-target data movement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub mapping_id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub source_connection: String,
    #[serde(default)]
    pub source_query: String,
    #[serde(default)]
    pub target_connection: String,
    #[serde(default)]
    pub target_table: String,
    #[serde(default)]
    pub truncate_before_load: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<ExecutionRecord>,
}

impl MappingDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            mapping_id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            is_active: true,
            created_at: Utc::now(),
            source_connection: String::new(),
            source_query: String::new(),
            target_connection: String::new(),
            target_table: String::new(),
            truncate_before_load: false,
            batch_size: DEFAULT_BATCH_SIZE,
            field_mappings: Vec::new(),
            last_execution: None,
        }
    }

    /// Batch size used for chunked inserts; zero is treated as the default.
    pub fn effective_batch_size(&self) -> usize {
        match self.batch_size {
            0 => DEFAULT_BATCH_SIZE as usize,
            size => size as usize,
        }
    }

    pub fn record_success(&mut self, record_count: u64, elapsed_seconds: f64) {
        self.last_execution = Some(ExecutionRecord {
            executed_at: Utc::now(),
            successful: true,
            record_count,
            log: format!(
                "Successfully processed {record_count} records in {elapsed_seconds:.2} seconds."
            ),
        });
    }

    pub fn record_failure(&mut self, message: &str) {
        self.last_execution = Some(ExecutionRecord {
            executed_at: Utc::now(),
            successful: false,
            record_count: 0,
            log: format!("Error: {message}"),
        });
    }
}

/// One source-field-to-target-field rule inside a [`MappingDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FieldMapping {
    #[serde(default)]
    pub source_field: String,
    #[serde(default)]
    pub source_field_type: Option<String>,
    pub target_field: String,
    #[serde(default)]
    pub target_field_type: Option<String>,
    #[serde(default)]
    pub requires_transformation: bool,
    #[serde(default)]
    pub transformation_expression: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl FieldMapping {
    pub fn direct(source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_field: source_field.into(),
            target_field: target_field.into(),
            ..Self::default()
        }
    }

    pub fn with_target_type(mut self, type_name: impl Into<String>) -> Self {
        self.target_field_type = Some(type_name.into());
        self
    }

    pub fn with_transformation(mut self, expression: impl Into<String>) -> Self {
        self.requires_transformation = true;
        self.transformation_expression = Some(expression.into());
        self
    }

    pub fn with_default(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }

    pub fn target_logical_type(&self) -> LogicalType {
        LogicalType::from_name(self.target_field_type.as_deref().unwrap_or_default())
    }

    /// The expression to evaluate, when the rule asks for one and it is non-blank.
    pub fn active_expression(&self) -> Option<&str> {
        if !self.requires_transformation {
            return None;
        }
        self.transformation_expression
            .as_deref()
            .filter(|expr| !expr.trim().is_empty())
    }

    pub fn default_text(&self) -> Option<&str> {
        self.default_value
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }
}

/// Durable echo of the latest run, stored on the definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub executed_at: DateTime<Utc>,
    pub successful: bool,
    pub record_count: u64,
    pub log: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub reasons: Vec<String>,
}

impl ValidationResult {
    pub fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            valid: reasons.is_empty(),
            reasons,
        }
    }
}

/// Distinguishes runs that never started from runs that started and failed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MappingOutcome {
    Succeeded,
    Failed,
    NotFound,
    Rejected,
    /// The definition could not be read from the store.
    StoreUnavailable,
}

impl MappingOutcome {
    pub fn ran(&self) -> bool {
        matches!(self, MappingOutcome::Succeeded | MappingOutcome::Failed)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MappingResult {
    pub success: bool,
    pub outcome: MappingOutcome,
    pub records_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    pub elapsed_seconds: f64,
}

impl MappingResult {
    pub fn succeeded(records_processed: u64, elapsed_seconds: f64) -> Self {
        Self {
            success: true,
            outcome: MappingOutcome::Succeeded,
            records_processed,
            error_message: None,
            validation_errors: Vec::new(),
            elapsed_seconds,
        }
    }

    pub fn failed(message: impl Into<String>, elapsed_seconds: f64) -> Self {
        Self {
            success: false,
            outcome: MappingOutcome::Failed,
            records_processed: 0,
            error_message: Some(message.into()),
            validation_errors: Vec::new(),
            elapsed_seconds,
        }
    }

    pub fn not_found(mapping_id: Uuid) -> Self {
        Self {
            success: false,
            outcome: MappingOutcome::NotFound,
            records_processed: 0,
            error_message: Some(format!("Mapping with ID {mapping_id} not found.")),
            validation_errors: Vec::new(),
            elapsed_seconds: 0.0,
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome: MappingOutcome::StoreUnavailable,
            records_processed: 0,
            error_message: Some(message.into()),
            validation_errors: Vec::new(),
            elapsed_seconds: 0.0,
        }
    }

    pub fn rejected(validation: ValidationResult) -> Self {
        Self {
            success: false,
            outcome: MappingOutcome::Rejected,
            records_processed: 0,
            error_message: Some(format!(
                "Mapping validation failed: {}",
                validation.reasons.join(", ")
            )),
            validation_errors: validation.reasons,
            elapsed_seconds: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_expression_is_not_actionable() {
        let mapping = FieldMapping::direct("a", "b").with_transformation("   ");
        assert!(mapping.active_expression().is_none());

        let mut flagged_off = FieldMapping::direct("a", "b").with_transformation("uppercase");
        flagged_off.requires_transformation = false;
        assert!(flagged_off.active_expression().is_none());
    }

    #[test]
    fn manifest_fields_default_sensibly() {
        let definition: MappingDefinition = toml::from_str(
            r#"
            name = "partners"
            source_connection = "Server=src;Database=crm"
            source_query = "SELECT * FROM customers"
            target_connection = "postgres://odoo@localhost/odoo"
            target_table = "res_partner"

            [[field_mappings]]
            source_field = "name"
            target_field = "name"
            "#,
        )
        .expect("parse definition");

        assert!(definition.is_active);
        assert_eq!(definition.batch_size, DEFAULT_BATCH_SIZE);
        assert!(!definition.truncate_before_load);
        assert_eq!(definition.field_mappings.len(), 1);
        assert_eq!(definition.field_mappings[0].target_logical_type(), LogicalType::Text);
        assert!(definition.last_execution.is_none());
    }

    #[test]
    fn rejected_result_joins_reasons() {
        let result = MappingResult::rejected(ValidationResult::from_reasons(vec![
            "a".into(),
            "b".into(),
        ]));
        assert!(!result.success);
        assert!(!result.outcome.ran());
        assert_eq!(result.error_message.as_deref(), Some("Mapping validation failed: a, b"));
    }
}
