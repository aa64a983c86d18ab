//! Per-field transformation of source rows into target rows.
//!
//! The vocabulary is closed: `uppercase`, `lowercase` and `concat:<tokens>`.
//! Anything else counts as "no rule matched" and falls back to the field's
//! default value.

use crate::coercion::{coerce, LogicalType};
use crate::error::TransformError;
use crate::model::FieldMapping;
use crate::table::{Column, TabularResult, Value};

const CONCAT_PREFIX: &str = "concat:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformation {
    Uppercase,
    Lowercase,
    /// Trimmed tokens, with one pair of surrounding single quotes removed.
    Concat(Vec<String>),
    Unrecognized,
}

impl Transformation {
    pub fn parse(expression: &str) -> Self {
        let expression = expression.trim();
        let lowered = expression.to_lowercase();

        match lowered.as_str() {
            "uppercase" => Transformation::Uppercase,
            "lowercase" => Transformation::Lowercase,
            _ => match strip_concat_prefix(expression) {
                Some(rest) if !rest.is_empty() => {
                    Transformation::Concat(rest.split(',').map(concat_token).collect())
                }
                _ => Transformation::Unrecognized,
            },
        }
    }
}

fn strip_concat_prefix(expression: &str) -> Option<&str> {
    let prefix = expression.get(..CONCAT_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(CONCAT_PREFIX) {
        expression.get(CONCAT_PREFIX.len()..)
    } else {
        None
    }
}

fn concat_token(raw: &str) -> String {
    let token = raw.trim();
    token
        .strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
        .unwrap_or(token)
        .to_string()
}

#[derive(Debug)]
enum Piece {
    Column(usize),
    Literal(String),
}

#[derive(Debug)]
enum Rule {
    Direct,
    Uppercase,
    Lowercase,
    Concat(Vec<Piece>),
    Unrecognized,
}

/// A field mapping resolved against the source columns once per run.
#[derive(Debug)]
struct FieldPlan<'m> {
    mapping: &'m FieldMapping,
    target_type: LogicalType,
    source_index: Option<usize>,
    rule: Rule,
}

impl<'m> FieldPlan<'m> {
    fn compile(source: &TabularResult, mapping: &'m FieldMapping, target_type: LogicalType) -> Self {
        let rule = match mapping.active_expression().map(Transformation::parse) {
            None => Rule::Direct,
            Some(Transformation::Uppercase) => Rule::Uppercase,
            Some(Transformation::Lowercase) => Rule::Lowercase,
            Some(Transformation::Concat(tokens)) => Rule::Concat(
                tokens
                    .into_iter()
                    .map(|token| match source.column_index(&token) {
                        Some(index) => Piece::Column(index),
                        None => Piece::Literal(token),
                    })
                    .collect(),
            ),
            Some(Transformation::Unrecognized) => Rule::Unrecognized,
        };

        Self {
            mapping,
            target_type,
            source_index: source.column_index(&mapping.source_field),
            rule,
        }
    }

    fn evaluate(&self, row: &[Value]) -> Result<Value, TransformError> {
        let source_value = self.source_index.and_then(|index| row.get(index));

        let produced = match &self.rule {
            Rule::Direct => source_value.cloned(),
            Rule::Uppercase => source_value.map(|value| match value {
                Value::Text(text) => Value::Text(text.to_uppercase()),
                other => other.clone(),
            }),
            Rule::Lowercase => source_value.map(|value| match value {
                Value::Text(text) => Value::Text(text.to_lowercase()),
                other => other.clone(),
            }),
            Rule::Concat(pieces) => Some(Value::Text(
                pieces
                    .iter()
                    .map(|piece| match piece {
                        Piece::Column(index) => row.get(*index).map(Value::render).unwrap_or_default(),
                        Piece::Literal(text) => text.clone(),
                    })
                    .collect(),
            )),
            Rule::Unrecognized => None,
        };

        match produced {
            Some(value) => Ok(value),
            None => self.default_value(),
        }
    }

    fn default_value(&self) -> Result<Value, TransformError> {
        match self.mapping.default_text() {
            Some(text) => coerce(text, self.target_type).map_err(|source| TransformError::Default {
                field: self.mapping.target_field.clone(),
                source,
            }),
            None => Ok(Value::Null),
        }
    }
}

/// Produces the target value of one field for one source row.
pub fn transform_field(
    source: &TabularResult,
    row: &[Value],
    mapping: &FieldMapping,
    target_type: LogicalType,
) -> Result<Value, TransformError> {
    FieldPlan::compile(source, mapping, target_type).evaluate(row)
}

/// Builds the full target table: one column per field mapping, in mapping
/// order, and one output row per source row. Unmapped source columns are dropped.
pub fn transform_table(
    source: &TabularResult,
    mappings: &[FieldMapping],
) -> Result<TabularResult, TransformError> {
    let plans: Vec<FieldPlan<'_>> = mappings
        .iter()
        .map(|mapping| FieldPlan::compile(source, mapping, mapping.target_logical_type()))
        .collect();

    let columns = plans
        .iter()
        .map(|plan| Column::new(plan.mapping.target_field.clone(), plan.target_type))
        .collect();

    let mut output = TabularResult::new(columns);
    output.rows.reserve(source.row_count());

    for row in &source.rows {
        let values = plans
            .iter()
            .map(|plan| plan.evaluate(row))
            .collect::<Result<Vec<_>, _>>()?;
        output.push_row(values);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> TabularResult {
        TabularResult::with_rows(
            vec![
                Column::new("first_name", LogicalType::Text),
                Column::new("last_name", LogicalType::Text),
                Column::new("age", LogicalType::Integer),
                Column::new("nickname", LogicalType::Text),
            ],
            vec![vec![
                Value::from("Ada"),
                Value::from("Lovelace"),
                Value::Integer(36),
                Value::Null,
            ]],
        )
    }

    fn run(mapping: &FieldMapping) -> Result<Value, TransformError> {
        let table = source();
        transform_field(&table, &table.rows[0], mapping, mapping.target_logical_type())
    }

    #[test]
    fn parse_recognises_the_closed_vocabulary() {
        assert_eq!(Transformation::parse("UpperCase"), Transformation::Uppercase);
        assert_eq!(Transformation::parse("lowercase"), Transformation::Lowercase);
        assert_eq!(
            Transformation::parse("CONCAT:a, ' ' ,B"),
            Transformation::Concat(vec!["a".into(), " ".into(), "B".into()])
        );
        assert_eq!(Transformation::parse("concat:"), Transformation::Unrecognized);
        assert_eq!(Transformation::parse("reverse"), Transformation::Unrecognized);
    }

    #[test]
    fn uppercase_folds_strings_only() {
        let upper = FieldMapping::direct("first_name", "name").with_transformation("uppercase");
        assert_eq!(run(&upper), Ok(Value::from("ADA")));

        let numeric = FieldMapping::direct("age", "age").with_transformation("uppercase");
        assert_eq!(run(&numeric), Ok(Value::Integer(36)));

        let null = FieldMapping::direct("nickname", "nick").with_transformation("lowercase");
        assert_eq!(run(&null), Ok(Value::Null));
    }

    #[test]
    fn concat_mixes_columns_and_literals() {
        let mapping = FieldMapping::direct("", "display_name")
            .with_transformation("concat:first_name, ' ', last_name");
        assert_eq!(run(&mapping), Ok(Value::from("Ada Lovelace")));

        let with_null = FieldMapping::direct("", "label")
            .with_transformation("concat:nickname,-,Age");
        assert_eq!(run(&with_null), Ok(Value::from("-36")));
    }

    #[test]
    fn literal_colliding_with_a_column_reads_the_column() {
        let mapping = FieldMapping::direct("", "label").with_transformation("concat:'age'");
        assert_eq!(run(&mapping), Ok(Value::from("36")));
    }

    #[test]
    fn absent_source_field_uses_coerced_default() {
        let mapping = FieldMapping::direct("missing", "count")
            .with_target_type("integer")
            .with_default("0");
        assert_eq!(run(&mapping), Ok(Value::Integer(0)));

        let no_default = FieldMapping::direct("missing", "count");
        assert_eq!(run(&no_default), Ok(Value::Null));
    }

    #[test]
    fn unrecognised_expression_skips_the_source_value() {
        let mapping = FieldMapping::direct("first_name", "name")
            .with_transformation("reverse")
            .with_default("unknown");
        assert_eq!(run(&mapping), Ok(Value::from("unknown")));

        let uppercase_missing = FieldMapping::direct("missing", "name")
            .with_transformation("uppercase")
            .with_default("n/a");
        assert_eq!(run(&uppercase_missing), Ok(Value::from("n/a")));
    }

    #[test]
    fn direct_copy_is_not_coerced() {
        let mapping = FieldMapping::direct("AGE", "age_text").with_target_type("text");
        assert_eq!(run(&mapping), Ok(Value::Integer(36)));
    }

    #[test]
    fn bad_default_reports_the_target_field() {
        let mapping = FieldMapping::direct("missing", "quantity")
            .with_target_type("int")
            .with_default("lots");
        match run(&mapping) {
            Err(TransformError::Default { field, source }) => {
                assert_eq!(field, "quantity");
                assert_eq!(source.logical_type, LogicalType::Integer);
            }
            other => panic!("expected default error, got {other:?}"),
        }
    }

    #[test]
    fn transform_table_follows_mapping_order() {
        let mappings = vec![
            FieldMapping::direct("last_name", "surname"),
            FieldMapping::direct("first_name", "given").with_transformation("lowercase"),
        ];
        let output = transform_table(&source(), &mappings).expect("transform");
        assert_eq!(output.column_names(), vec!["surname", "given"]);
        assert_eq!(output.rows, vec![vec![Value::from("Lovelace"), Value::from("ada")]]);
    }
}
