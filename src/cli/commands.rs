//! Subcommand implementations: scan descriptions, synthetic tables, and the
//! scan driver behind `gpu-scan run`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codegen::expr::Expr;
use crate::codegen::projection::TargetEntry;
use crate::config::ScanConfig;
use crate::error::{ChunkError, CodegenError, ConfigError, ScanError};
use crate::gpu::device::Device;
use crate::gpu::metrics::ScanMetrics;
use crate::scan::executor::GpuScan;
use crate::scan::plan::{ScanPlan, ScanPlanBuilder};
use crate::storage::chunk::ChunkFormat;
use crate::storage::handle::ChunkAllocator;
use crate::storage::heap::{HeapScan, HeapTable};
use crate::storage::schema::{AttrDesc, TupleShape};
use crate::storage::types::DataType;
use crate::storage::value::{Numeric, Value};

/// Errors of the command-line driver.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid scan description: {0}")]
    Description(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

// ============================================================================
// Scan description
// ============================================================================

/// A scan in JSON: the relation's columns plus what to do with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDescription {
    #[serde(default = "default_relid")]
    pub relid: u32,
    pub columns: Vec<AttrDesc>,
    /// Implicitly AND-ed qualifiers.
    #[serde(default)]
    pub quals: Vec<Expr>,
    /// Output columns; every column when absent.
    #[serde(default)]
    pub target_list: Option<Vec<TargetEntry>>,
    #[serde(default = "default_destination")]
    pub destination: ChunkFormat,
}

fn default_relid() -> u32 {
    1
}

fn default_destination() -> ChunkFormat {
    ChunkFormat::Slot
}

impl ScanDescription {
    pub fn from_json_str(s: &str) -> Result<Self, CliError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// `id int4, v int4, price numeric, label text`, keeping `v > 50` and
    /// returning `id, v, v * 2 AS doubled`.
    pub fn demo() -> Self {
        let v = Expr::var(1, 2, DataType::Int4);
        Self {
            relid: 1,
            columns: vec![
                AttrDesc::new("id", DataType::Int4),
                AttrDesc::new("v", DataType::Int4),
                AttrDesc::new("price", DataType::Numeric),
                AttrDesc::new("label", DataType::Text),
            ],
            quals: vec![v.clone().gt(Expr::int4(50))],
            target_list: Some(vec![
                TargetEntry::new("id", Expr::var(1, 1, DataType::Int4)),
                TargetEntry::new("v", v.clone()),
                TargetEntry::new("doubled", v * Expr::int4(2)),
            ]),
            destination: ChunkFormat::Slot,
        }
    }

    pub fn shape(&self) -> Arc<TupleShape> {
        Arc::new(TupleShape::new(self.relid, self.columns.clone()))
    }

    /// Plan builder over `shape`, which must be this description's shape.
    pub fn plan_builder(&self, shape: Arc<TupleShape>) -> ScanPlanBuilder {
        let mut builder = ScanPlan::builder(shape)
            .relid(self.relid)
            .quals(self.quals.clone())
            .destination(self.destination);
        if let Some(tlist) = &self.target_list {
            builder = builder.target_list(tlist.clone());
        }
        builder
    }
}

// ============================================================================
// Synthetic data
// ============================================================================

const LABELS: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel",
];

/// One random value of `data_type`. Integers stay in `0..100` so that
/// comparisons against small constants split the table.
pub fn synthetic_value(rng: &mut ChaCha8Rng, data_type: DataType) -> Value {
    match data_type {
        DataType::Bool => Value::Bool(rng.gen()),
        DataType::Int2 => Value::Int2(rng.gen_range(0..100)),
        DataType::Int4 => Value::Int4(rng.gen_range(0..100)),
        DataType::Int8 => Value::Int8(rng.gen_range(0..100)),
        DataType::Float4 => Value::Float4(rng.gen_range(0.0..100.0)),
        DataType::Float8 => Value::Float8(rng.gen_range(0.0..100.0)),
        DataType::Date => Value::Date(rng.gen_range(0..20_000)),
        DataType::Timestamp => Value::Timestamp(rng.gen_range(0..1_700_000_000_000_000)),
        DataType::Numeric => Value::Numeric(Numeric::new(rng.gen_range(0..1_000_000), 2)),
        DataType::Uuid => Value::Uuid(rng.gen()),
        DataType::Text => Value::Text(LABELS[rng.gen_range(0..LABELS.len())].to_string()),
    }
}

/// `nrows` random rows over `shape`, deterministic in `seed`.
pub fn synthetic_rows(shape: &TupleShape, nrows: usize, seed: u64, null_fraction: f64) -> Vec<Vec<Value>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..nrows)
        .map(|_| {
            shape
                .attrs()
                .iter()
                .map(|attr| {
                    if attr.nullable && null_fraction > 0.0 && rng.gen_bool(null_fraction.min(1.0)) {
                        Value::Null
                    } else {
                        synthetic_value(&mut rng, attr.data_type)
                    }
                })
                .collect()
        })
        .collect()
}

// ============================================================================
// Commands
// ============================================================================

/// Kernel text of a scan, optionally followed by its buffer estimate.
pub fn codegen(description: &ScanDescription, with_estimate: bool) -> Result<String, CliError> {
    let plan = description.plan_builder(description.shape()).build()?;
    let kernel = plan.kernel();
    let mut out = kernel.text().to_string();
    if with_estimate {
        let estimate = serde_json::to_string_pretty(&kernel.estimate())?;
        out.push_str("\n// buffer estimate: ");
        out.push_str(&estimate.replace('\n', "\n// "));
        out.push('\n');
    }
    Ok(out)
}

/// Rows and counters of one `run`.
#[derive(Debug)]
pub struct RunOutcome {
    pub columns: Vec<String>,
    /// The first `limit` rows.
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub elapsed: Duration,
    pub metrics: ScanMetrics,
}

pub fn open_device(metal: bool, config: &ScanConfig) -> Result<Device, ScanError> {
    if metal {
        #[cfg(target_os = "macos")]
        return Device::metal(config);
        #[cfg(not(target_os = "macos"))]
        return Err(ScanError::DeviceUnavailable(
            "the Metal device requires macOS".into(),
        ));
    }
    Ok(Device::emulated(config))
}

/// Load a synthetic table and scan it on `device`.
pub fn run_scan(
    description: &ScanDescription,
    config: &ScanConfig,
    device: Arc<Device>,
    nrows: usize,
    seed: u64,
    null_fraction: f64,
    limit: usize,
) -> Result<RunOutcome, CliError> {
    config.validate()?;
    let shape = description.shape();
    let plan = description
        .plan_builder(Arc::clone(&shape))
        .threads_per_group(config.threads_per_group)
        .build()?;

    let table = HeapTable::from_rows(
        Arc::clone(&shape),
        synthetic_rows(&shape, nrows, seed, null_fraction),
    )?;
    info!(rows = nrows, pages = table.npages(), seed, "synthetic table loaded");

    let snapshot = table.snapshot();
    let format = if config.use_block_format {
        ChunkFormat::Block
    } else {
        ChunkFormat::Row
    };
    let source = HeapScan::new(
        Arc::new(table),
        snapshot,
        format,
        config.chunk_size,
        ChunkAllocator::new(),
    )?;

    let columns = plan.output_names();
    let start = Instant::now();
    let mut scan = GpuScan::new(Arc::new(plan), Box::new(source), device, config.clone())?;
    let mut rows = Vec::new();
    let mut row_count = 0;
    while let Some(tuple) = scan.next_tuple()? {
        if rows.len() < limit {
            rows.push(tuple.values);
        }
        row_count += 1;
    }
    Ok(RunOutcome {
        columns,
        rows,
        row_count,
        elapsed: start.elapsed(),
        metrics: scan.metrics().clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ScanConfig {
        ScanConfig {
            stream_threads: 1,
            ..ScanConfig::default()
        }
    }

    // ---------------------------------------------------------------
    // Descriptions
    // ---------------------------------------------------------------

    #[test]
    fn test_description_defaults() {
        let desc = ScanDescription::from_json_str(
            r#"{"columns": [{"name": "a", "data_type": "int4"}]}"#,
        )
        .unwrap();
        assert_eq!(desc.relid, 1);
        assert!(desc.quals.is_empty());
        assert!(desc.target_list.is_none());
        assert_eq!(desc.destination, ChunkFormat::Slot);
        assert!(desc.columns[0].nullable);
    }

    #[test]
    fn test_description_roundtrips_through_json() {
        let demo = ScanDescription::demo();
        let text = serde_json::to_string(&demo).unwrap();
        assert_eq!(ScanDescription::from_json_str(&text).unwrap(), demo);
    }

    #[test]
    fn test_description_from_missing_file() {
        let err = ScanDescription::from_file(Path::new("/nonexistent/scan.json")).unwrap_err();
        assert!(matches!(err, CliError::Io { .. }));
    }

    // ---------------------------------------------------------------
    // Synthetic data
    // ---------------------------------------------------------------

    #[test]
    fn test_synthetic_rows_deterministic() {
        let shape = ScanDescription::demo().shape();
        let a = synthetic_rows(&shape, 50, 7, 0.1);
        let b = synthetic_rows(&shape, 50, 7, 0.1);
        assert_eq!(a, b);
        assert_eq!(a.len(), 50);
        assert!(a.iter().all(|row| row.len() == 4));
        assert_ne!(a, synthetic_rows(&shape, 50, 8, 0.1));
    }

    #[test]
    fn test_synthetic_rows_without_nulls() {
        let shape = ScanDescription::demo().shape();
        let rows = synthetic_rows(&shape, 200, 1, 0.0);
        assert!(rows.iter().flatten().all(|v| !v.is_null()));
    }

    // ---------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------

    #[test]
    fn test_codegen_demo_has_kernels() {
        let text = codegen(&ScanDescription::demo(), true).unwrap();
        assert!(text.contains("kernel void"));
        assert!(text.contains("// buffer estimate"));
    }

    #[test]
    fn test_run_demo_matches_host_filter() {
        let desc = ScanDescription::demo();
        let config = small_config();
        let device = Arc::new(open_device(false, &config).unwrap());
        let outcome = run_scan(&desc, &config, device, 2_000, 3, 0.0, 5).unwrap();

        let expected = synthetic_rows(&desc.shape(), 2_000, 3, 0.0)
            .iter()
            .filter(|row| matches!(row[1], Value::Int4(v) if v > 50))
            .count();
        assert_eq!(outcome.row_count, expected);
        assert_eq!(outcome.columns, vec!["id", "v", "doubled"]);
        assert_eq!(outcome.rows.len(), 5.min(expected));
        for row in &outcome.rows {
            let (Value::Int4(v), Value::Int4(d)) = (&row[1], &row[2]) else {
                panic!("unexpected row {:?}", row);
            };
            assert!(*v > 50);
            assert_eq!(*d, v * 2);
        }
        assert!(outcome.metrics.tasks >= 1);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_metal_unavailable_off_macos() {
        let err = open_device(true, &small_config()).unwrap_err();
        assert!(matches!(err, ScanError::DeviceUnavailable(_)));
    }
}
