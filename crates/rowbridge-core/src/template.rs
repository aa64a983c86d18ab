//! Reusable mapping templates and the TOML manifests definitions are imported from.

use anyhow::{bail, ensure, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{FieldMapping, MappingDefinition, DEFAULT_BATCH_SIZE};

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source_connection: String,
    #[serde(default)]
    pub source_table: String,
    #[serde(default)]
    pub source_columns: Vec<String>,
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
}

impl MappingTemplate {
    pub fn source_query(&self) -> String {
        let columns: Vec<&str> = self
            .source_columns
            .iter()
            .map(|column| column.trim())
            .filter(|column| !column.is_empty())
            .collect();
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(", ")
        };
        format!("SELECT {projection} FROM {}", self.source_table.trim())
    }

    /// A fresh definition with its own identifier and no execution history.
    pub fn create_definition(&self) -> MappingDefinition {
        MappingDefinition {
            mapping_id: Uuid::new_v4(),
            name: self.name.clone(),
            description: self.description.clone(),
            is_active: true,
            created_at: Utc::now(),
            source_connection: self.source_connection.clone(),
            source_query: self.source_query(),
            target_connection: self.target_connection.clone(),
            target_table: self.target_table.clone(),
            truncate_before_load: self.truncate_before_load,
            batch_size: self.batch_size,
            field_mappings: self.field_mappings.clone(),
            last_execution: None,
        }
    }
}

/// A TOML file holding either a `[mapping]` or a `[template]` table.
#[derive(Debug, Deserialize, Default)]
pub struct MappingManifest {
    #[serde(default)]
    pub mapping: Option<MappingDefinition>,
    #[serde(default)]
    pub template: Option<MappingTemplate>,
}

impl MappingManifest {
    pub fn into_definition(self) -> Result<MappingDefinition> {
        match (self.mapping, self.template) {
            (Some(_), Some(_)) => bail!("manifest must contain [mapping] or [template], not both"),
            (Some(mut mapping), None) => {
                mapping.last_execution = None;
                Ok(mapping)
            }
            (None, Some(template)) => {
                ensure!(!template.source_table.trim().is_empty(), "template source_table cannot be empty");
                Ok(template.create_definition())
            }
            (None, None) => bail!("manifest contains neither [mapping] nor [template]"),
        }
    }
}

pub fn parse_manifest(toml_str: &str) -> Result<MappingManifest> {
    toml::from_str::<MappingManifest>(toml_str).context("failed to parse mapping manifest TOML")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_builds_projection_query() {
        let manifest = parse_manifest(
            r#"
            [template]
            name = "customers"
            category = "crm"
            source_connection = "Server=src;Database=crm"
            source_table = "dbo.Customers"
            source_columns = ["Id", " Name ", ""]
            target_connection = "postgres://odoo@localhost/odoo"
            target_table = "res_partner"
            batch_size = 500

            [[template.field_mappings]]
            source_field = "Name"
            target_field = "name"
            "#,
        )
        .expect("parse");

        let definition = manifest.into_definition().expect("definition");
        assert_eq!(definition.source_query, "SELECT Id, Name FROM dbo.Customers");
        assert_eq!(definition.batch_size, 500);
        assert!(definition.is_active);
        assert_eq!(definition.field_mappings.len(), 1);
    }

    #[test]
    fn template_without_columns_selects_everything() {
        let template = MappingTemplate {
            name: "all".into(),
            description: None,
            category: None,
            source_connection: String::new(),
            source_table: "orders".into(),
            source_columns: Vec::new(),
            target_connection: String::new(),
            target_table: "orders".into(),
            truncate_before_load: true,
            batch_size: DEFAULT_BATCH_SIZE,
            field_mappings: Vec::new(),
        };
        assert_eq!(template.source_query(), "SELECT * FROM orders");
        assert!(template.create_definition().truncate_before_load);
    }

    #[test]
    fn manifest_needs_exactly_one_section() {
        assert!(MappingManifest::default().into_definition().is_err());

        let both = parse_manifest(
            r#"
            [mapping]
            name = "a"
            [template]
            name = "b"
            source_table = "t"
            "#,
        )
        .expect("parse");
        assert!(both.into_definition().is_err());
    }

    #[test]
    fn mapping_section_keeps_explicit_identifier() {
        let manifest = parse_manifest(
            r#"
            [mapping]
            mapping_id = "6f1c2a52-5d7e-4c1e-9a55-0d0f7d8c1b2a"
            name = "partners"
            is_active = false
            "#,
        )
        .expect("parse");
        let definition = manifest.into_definition().expect("definition");
        assert_eq!(
            definition.mapping_id.to_string(),
            "6f1c2a52-5d7e-4c1e-9a55-0d0f7d8c1b2a"
        );
        assert!(!definition.is_active);
    }
}
