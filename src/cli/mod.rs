//! CLI module: subcommand dispatch and output formatting.
//!
//! parse args -> load description/config -> codegen or scan -> format -> exit.

pub mod args;
pub mod commands;

use std::sync::Arc;

use args::{CliArgs, Command, OutputFormat, RunArgs};
use commands::{CliError, RunOutcome, ScanDescription};

use crate::config::ScanConfig;
use crate::gpu::metrics::format_bytes;
use crate::storage::value::Value;

/// Run the parsed command line. Returns the process exit code.
pub fn run(args: &CliArgs) -> i32 {
    let result = match &args.command {
        Command::Codegen(codegen) => ScanDescription::from_file(&codegen.scan)
            .and_then(|desc| commands::codegen(&desc, codegen.estimate)),
        Command::Run(run) => run_command(run),
    };
    match result {
        Ok(out) => {
            println!("{}", out);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn run_command(args: &RunArgs) -> Result<String, CliError> {
    let config = match &args.config {
        Some(path) => ScanConfig::from_file(path)?,
        None => ScanConfig::default(),
    };
    let description = match &args.scan {
        Some(path) => ScanDescription::from_file(path)?,
        None => ScanDescription::demo(),
    };
    let device = Arc::new(commands::open_device(args.metal, &config)?);
    let outcome = commands::run_scan(
        &description,
        &config,
        device,
        args.rows,
        args.seed,
        args.null_fraction,
        args.limit,
    )?;

    let mut out = match args.format {
        OutputFormat::Table => format_table(&outcome),
        OutputFormat::Json => format_json(&outcome),
    };
    if args.metrics {
        out.push('\n');
        out.push_str(&serde_json::to_string_pretty(&outcome.metrics)?);
    }
    Ok(out)
}

/// Format as ASCII table, right-aligned, followed by the row count.
pub fn format_table(outcome: &RunOutcome) -> String {
    let cells: Vec<Vec<String>> = outcome
        .rows
        .iter()
        .map(|row| row.iter().map(|v| v.to_string()).collect())
        .collect();

    let mut widths: Vec<usize> = outcome.columns.iter().map(|c| c.len()).collect();
    for row in &cells {
        for (i, val) in row.iter().enumerate() {
            if i < widths.len() && val.len() > widths[i] {
                widths[i] = val.len();
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = outcome
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:>width$}", c, width = widths[i]))
        .collect();
    out.push_str(&header.join(" | "));
    out.push('\n');

    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&sep.join("-+-"));
    out.push('\n');

    for row in &cells {
        let formatted: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let w = if i < widths.len() { widths[i] } else { v.len() };
                format!("{:>width$}", v, width = w)
            })
            .collect();
        out.push_str(&formatted.join(" | "));
        out.push('\n');
    }

    if outcome.rows.len() < outcome.row_count {
        out.push_str("...\n");
    }
    out.push_str(&format!(
        "({} row{}, {:.1} ms, {} to device)",
        outcome.row_count,
        if outcome.row_count == 1 { "" } else { "s" },
        outcome.elapsed.as_secs_f64() * 1000.0,
        format_bytes(outcome.metrics.totals.htod_bytes)
    ));
    out
}

/// Format the printed rows as a JSON array of objects.
pub fn format_json(outcome: &RunOutcome) -> String {
    let rows: Vec<serde_json::Value> = outcome
        .rows
        .iter()
        .map(|row| {
            let object: serde_json::Map<String, serde_json::Value> = outcome
                .columns
                .iter()
                .cloned()
                .zip(row.iter().map(json_value))
                .collect();
            serde_json::Value::Object(object)
        })
        .collect();
    serde_json::Value::Array(rows).to_string()
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int2(v) => (*v).into(),
        Value::Int4(v) => (*v).into(),
        Value::Int8(v) => (*v).into(),
        Value::Float4(v) => serde_json::Number::from_f64(*v as f64)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Float8(v) => serde_json::Number::from_f64(*v)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        other => serde_json::Value::String(other.to_string()),
    }
}
