//! Command-line argument parsing via clap derive.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// GPU-accelerated table scans: kernel generation and a synthetic-table
/// scan driver.
#[derive(Parser, Debug)]
#[command(name = "gpu-scan", version, about)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the generated kernel source for a JSON scan description.
    Codegen(CodegenArgs),
    /// Scan a synthetic table and print the surviving rows.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct CodegenArgs {
    /// Scan description (columns, quals, target list, destination).
    #[arg(value_name = "FILE")]
    pub scan: PathBuf,

    /// Also print the destination buffer estimate.
    #[arg(long = "estimate")]
    pub estimate: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scan description; a built-in demo scan when omitted.
    #[arg(short = 's', long = "scan", value_name = "FILE")]
    pub scan: Option<PathBuf>,

    /// Scan configuration (JSON).
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of synthetic rows.
    #[arg(short = 'n', long = "rows", default_value_t = 100_000)]
    pub rows: usize,

    /// Seed of the synthetic data generator.
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,

    /// Fraction of NULLs in nullable columns.
    #[arg(long = "null-fraction", default_value_t = 0.0)]
    pub null_fraction: f64,

    /// Rows to print (0 prints only the row count).
    #[arg(long = "limit", default_value_t = 20)]
    pub limit: usize,

    /// Output format: table, json.
    #[arg(long = "format", value_name = "FORMAT", default_value = "table")]
    pub format: OutputFormat,

    /// Print scan metrics as JSON after the rows.
    #[arg(long = "metrics")]
    pub metrics: bool,

    /// Run on the Metal device instead of the emulated one.
    #[arg(long = "metal")]
    pub metal: bool,
}

/// Row output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Formatted ASCII table (default).
    Table,
    /// JSON array of objects.
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown format '{}'. Valid: table, json", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("TABLE".parse::<OutputFormat>().unwrap(), OutputFormat::Table);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("csv".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_run_defaults() {
        let args = CliArgs::parse_from(["gpu-scan", "run"]);
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.rows, 100_000);
        assert_eq!(run.seed, 42);
        assert_eq!(run.format, OutputFormat::Table);
        assert!(run.scan.is_none());
        assert!(!run.metal);
    }

    #[test]
    fn test_codegen_requires_file() {
        assert!(CliArgs::try_parse_from(["gpu-scan", "codegen"]).is_err());
        let args = CliArgs::try_parse_from(["gpu-scan", "codegen", "scan.json", "--estimate"]).unwrap();
        let Command::Codegen(codegen) = args.command else {
            panic!("expected codegen");
        };
        assert_eq!(codegen.scan, PathBuf::from("scan.json"));
        assert!(codegen.estimate);
    }
}
