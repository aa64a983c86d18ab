use std::io::{self, Write};

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use rowbridge_core::{MappingResult, TabularResult, ValidationResult};

fn new_table(header: Vec<String>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// Renders rows as a terminal table, or as CSV with a header record.
pub fn print_rows(header: Vec<String>, rows: Vec<Vec<String>>, csv: bool) -> Result<()> {
    if csv {
        let mut writer = csv::Writer::from_writer(io::stdout().lock());
        writer.write_record(&header)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
        return Ok(());
    }

    let mut table = new_table(header);
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
    Ok(())
}

pub fn print_names(heading: &str, names: Vec<String>, csv: bool) -> Result<()> {
    let rows = names.into_iter().map(|name| vec![name]).collect();
    print_rows(vec![heading.to_string()], rows, csv)
}

pub fn print_tabular(data: &TabularResult, csv: bool) -> Result<()> {
    let header = data.columns.iter().map(|column| column.name.clone()).collect();
    let rows = data
        .rows
        .iter()
        .map(|row| row.iter().map(|value| value.render()).collect())
        .collect();
    print_rows(header, rows, csv)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

pub fn print_result(result: &MappingResult) {
    let status = if result.success { "succeeded" } else { "failed" };
    println!("Mapping run {status} ({:?})", result.outcome);
    println!("  Records processed: {}", result.records_processed);
    println!("  Elapsed: {:.2} s", result.elapsed_seconds);
    if let Some(message) = &result.error_message {
        println!("  Error: {message}");
    }
    for reason in &result.validation_errors {
        println!("  - {reason}");
    }
}

pub fn print_validation(verdict: &ValidationResult) {
    if verdict.valid {
        println!("Mapping is valid");
        return;
    }
    println!("Mapping is invalid:");
    for reason in &verdict.reasons {
        println!("  - {reason}");
    }
}
