//! Scan throughput benchmarks: filter selectivity, projection, and chunk
//! format on 100K synthetic rows over the emulated device.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gpu_scan::cli::commands::synthetic_rows;
use gpu_scan::codegen::{Expr, KernelSource, TargetEntry};
use gpu_scan::config::ScanConfig;
use gpu_scan::gpu::Device;
use gpu_scan::scan::{GpuScan, ScanPlan};
use gpu_scan::storage::{AttrDesc, ChunkAllocator, ChunkFormat, DataType, HeapScan, HeapTable, TupleShape};

// ============================================================
// Data generation
// ============================================================

fn shape() -> Arc<TupleShape> {
    Arc::new(TupleShape::new(
        1,
        vec![
            AttrDesc::new("id", DataType::Int4),
            AttrDesc::new("amount", DataType::Int4),
            AttrDesc::new("quantity", DataType::Int8),
        ],
    ))
}

fn amount() -> Expr {
    Expr::var(1, 2, DataType::Int4)
}

fn table(n_rows: usize) -> Arc<HeapTable> {
    let shape = shape();
    let rows = synthetic_rows(&shape, n_rows, 42, 0.0);
    Arc::new(HeapTable::from_rows(shape, rows).expect("load table"))
}

/// Run `plan` over `table` and return the row count.
fn run_scan(table: &Arc<HeapTable>, plan: &Arc<ScanPlan>, device: &Arc<Device>, config: &ScanConfig) -> usize {
    let format = if config.use_block_format {
        ChunkFormat::Block
    } else {
        ChunkFormat::Row
    };
    let source = HeapScan::new(
        Arc::clone(table),
        table.snapshot(),
        format,
        config.chunk_size,
        ChunkAllocator::new(),
    )
    .expect("heap scan");
    let mut scan = GpuScan::new(Arc::clone(plan), Box::new(source), Arc::clone(device), config.clone())
        .expect("start scan");
    let mut n = 0;
    while scan.next_tuple().expect("scan").is_some() {
        n += 1;
    }
    n
}

// ============================================================
// Benchmarks
// ============================================================

/// Filter at ~10%, ~50%, ~90% selectivity (amount is uniform in 0..100).
fn bench_filter_selectivity(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_selectivity");
    group.sample_size(20);

    let n_rows = 100_000;
    let table = table(n_rows);
    let config = ScanConfig::default();
    let device = Arc::new(Device::emulated(&config));
    group.throughput(Throughput::Elements(n_rows as u64));

    for (label, threshold) in [("10pct", 89), ("50pct", 49), ("90pct", 9)] {
        let plan = Arc::new(
            ScanPlan::builder(shape())
                .filter(amount().gt(Expr::int4(threshold)))
                .build()
                .expect("plan"),
        );
        group.bench_with_input(BenchmarkId::new(label, n_rows), &plan, |b, plan| {
            b.iter(|| run_scan(&table, plan, &device, &config));
        });
    }

    group.finish();
}

/// Filter plus a computed Slot projection.
fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection");
    group.sample_size(20);

    let n_rows = 100_000;
    let table = table(n_rows);
    let config = ScanConfig::default();
    let device = Arc::new(Device::emulated(&config));
    group.throughput(Throughput::Elements(n_rows as u64));

    let plan = Arc::new(
        ScanPlan::builder(shape())
            .filter(amount().gt(Expr::int4(49)))
            .target_list(vec![
                TargetEntry::new("id", Expr::var(1, 1, DataType::Int4)),
                TargetEntry::new("total", amount() * Expr::var(1, 3, DataType::Int8)),
            ])
            .build()
            .expect("plan"),
    );
    group.bench_with_input(BenchmarkId::new("slot", n_rows), &plan, |b, plan| {
        b.iter(|| run_scan(&table, plan, &device, &config));
    });

    group.finish();
}

/// Row chunks (extracted tuples) against Block chunks (raw pages).
fn bench_chunk_format(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_format");
    group.sample_size(20);

    let n_rows = 100_000;
    let table = table(n_rows);
    group.throughput(Throughput::Elements(n_rows as u64));

    let plan = Arc::new(
        ScanPlan::builder(shape())
            .filter(amount().gt(Expr::int4(49)))
            .build()
            .expect("plan"),
    );
    for use_block_format in [false, true] {
        let config = ScanConfig {
            use_block_format,
            ..ScanConfig::default()
        };
        let device = Arc::new(Device::emulated(&config));
        let label = if use_block_format { "block" } else { "row" };
        group.bench_with_input(BenchmarkId::new(label, n_rows), &plan, |b, plan| {
            b.iter(|| run_scan(&table, plan, &device, &config));
        });
    }

    group.finish();
}

/// Kernel source generation for a compound qualifier and projection.
fn bench_codegen(c: &mut Criterion) {
    let shape = shape();
    let quals = vec![Expr::and(vec![
        amount().gt(Expr::int4(10)),
        amount().lt(Expr::int4(90)),
        Expr::var(1, 3, DataType::Int8).is_not_null(),
    ])];
    let tlist = vec![TargetEntry::new("total", amount() * Expr::int4(3))];
    c.bench_function("codegen_quals_projection", |b| {
        b.iter(|| {
            KernelSource::generate(&shape, &quals, Some(&tlist), ChunkFormat::Slot, 256).expect("generate")
        });
    });
}

criterion_group!(
    benches,
    bench_filter_selectivity,
    bench_projection,
    bench_chunk_format,
    bench_codegen
);
criterion_main!(benches);
