//! End-to-end tests of the scan pipeline on the emulated device.
//!
//! Build a plan -> load chunks (hand-built or from a heap table) -> run
//! GpuScan -> compare against direct host evaluation.

use std::sync::Arc;

use gpu_scan::codegen::{BufferEstimate, Evaluator, Expr, TargetEntry};
use gpu_scan::config::ScanConfig;
use gpu_scan::error::{EvalError, ScanError};
use gpu_scan::gpu::{Device, DeviceJob, EmulatedDevice, KernelStatus, TaskResults};
use gpu_scan::scan::{GpuScan, ScanPlan};
use gpu_scan::storage::tuple::{HeapTuple, ItemPointer};
use gpu_scan::storage::{
    AttrDesc, Capacity, Chunk, ChunkAllocator, ChunkFormat, ChunkList, ChunkRef, DataType, HeapScan,
    HeapTable, Numeric, TupleShape, Value,
};

// ============================================================
// Fixtures
// ============================================================

const ROWS: [(i32, i32); 5] = [(1, 10), (2, 5), (3, 20), (4, 1), (5, 30)];

fn shape() -> Arc<TupleShape> {
    Arc::new(TupleShape::new(
        1,
        vec![
            AttrDesc::new("id", DataType::Int4),
            AttrDesc::new("v", DataType::Int4),
        ],
    ))
}

fn v() -> Expr {
    Expr::var(1, 2, DataType::Int4)
}

fn row_chunk(shape: &Arc<TupleShape>, rows: &[(i32, i32)]) -> Chunk {
    let mut chunk = Chunk::create(ChunkFormat::Row, Arc::clone(shape), Capacity::Bytes(16 * 1024))
        .expect("create chunk");
    for (id, v) in rows {
        let tuple = HeapTuple::form(shape, &[Value::Int4(*id), Value::Int4(*v)], 1).expect("form");
        assert!(chunk.insert_tuple(&tuple).expect("insert"));
    }
    chunk
}

fn single_stream() -> ScanConfig {
    ScanConfig {
        stream_threads: 1,
        ..ScanConfig::default()
    }
}

fn run_plan(plan: ScanPlan, chunks: Vec<Chunk>, config: ScanConfig) -> (Vec<Vec<Value>>, GpuScan) {
    let shape = Arc::clone(plan.shape());
    let device = Arc::new(Device::emulated(&config));
    let mut scan = GpuScan::new(
        Arc::new(plan),
        Box::new(ChunkList::new(shape, chunks)),
        device,
        config,
    )
    .expect("start scan");
    let rows = scan
        .collect_all()
        .expect("scan")
        .into_iter()
        .map(|t| t.values)
        .collect();
    (rows, scan)
}

fn int(value: &Value) -> i64 {
    value.as_i64().expect("integer value")
}

// ============================================================
// Scenarios
// ============================================================

#[test]
fn test_filter_returns_passing_item_ids_in_order() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter(v().gt(Expr::int4(8)))
        .build()
        .unwrap();
    let device = EmulatedDevice::new(&single_stream());
    let (tx, rx) = crossbeam_channel::unbounded();
    device
        .submit(
            DeviceJob {
                task_id: 0,
                generation: 0,
                kernel: Arc::clone(plan.kernel()),
                source: ChunkRef::new(row_chunk(&shape, &ROWS)),
                dest: None,
                regions: Vec::new(),
            },
            tx,
        )
        .unwrap();
    let done = rx.recv().unwrap();
    assert_eq!(done.status, KernelStatus::Success);
    assert_eq!(done.results, TaskResults::Items(vec![0, 2, 4]));
    assert_eq!(done.timings.filter_kernels, 1);
}

#[test]
fn test_filter_only_scan_returns_source_tuples() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter(v().gt(Expr::int4(8)))
        .build()
        .unwrap();
    assert!(plan.kernel().program().projection.is_none());
    let (rows, scan) = run_plan(plan, vec![row_chunk(&shape, &ROWS)], single_stream());
    assert_eq!(
        rows,
        vec![
            vec![Value::Int4(1), Value::Int4(10)],
            vec![Value::Int4(3), Value::Int4(20)],
            vec![Value::Int4(5), Value::Int4(30)],
        ]
    );
    assert_eq!(scan.metrics().fallback_tasks, 0);
}

#[test]
fn test_slot_projection_computes_on_device() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter(v().gt(Expr::int4(8)))
        .target_list(vec![TargetEntry::new("w", v() * Expr::int4(2))])
        .destination(ChunkFormat::Slot)
        .build()
        .unwrap();
    assert_eq!(plan.output_names(), vec!["w"]);
    let (rows, scan) = run_plan(plan, vec![row_chunk(&shape, &ROWS)], single_stream());
    assert_eq!(
        rows,
        vec![vec![Value::Int4(20)], vec![Value::Int4(40)], vec![Value::Int4(60)]]
    );
    assert_eq!(scan.metrics().totals.projection_kernels, 1);
    assert_eq!(scan.metrics().fallback_tasks, 0);
}

#[test]
fn test_undersized_destination_falls_back_to_host() {
    let shape = shape();
    let tlist = vec![
        TargetEntry::new("id", Expr::var(1, 1, DataType::Int4)),
        TargetEntry::new("n", v().cast(DataType::Numeric)),
    ];
    let filter = v().gt(Expr::int4(8));
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter(filter.clone())
        .target_list(tlist.clone())
        .buffer_estimate(BufferEstimate::default())
        .build()
        .unwrap();
    let (rows, scan) = run_plan(plan, vec![row_chunk(&shape, &ROWS)], single_stream());

    let host = Evaluator::host();
    let expected: Vec<Vec<Value>> = ROWS
        .iter()
        .map(|(id, v)| vec![Value::Int4(*id), Value::Int4(*v)])
        .filter(|row| host.eval_quals(std::slice::from_ref(&filter), row).unwrap())
        .map(|row| tlist.iter().map(|e| host.eval(&e.expr, &row).unwrap()).collect())
        .collect();
    assert_eq!(rows, expected);
    assert_eq!(rows[2][1], Value::Numeric(Numeric::from_i64(30)));
    assert_eq!(scan.metrics().fallback_tasks, 1);
    assert_eq!(scan.metrics().totals.fallback_rows, 5);
}

#[test]
fn test_sized_destination_keeps_numeric_on_device() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .target_list(vec![TargetEntry::new("n", v().cast(DataType::Numeric))])
        .build()
        .unwrap();
    assert!(plan.kernel().estimate().slot_extra > 0);
    let (rows, scan) = run_plan(plan, vec![row_chunk(&shape, &ROWS)], single_stream());
    let ns: Vec<Value> = rows.into_iter().map(|mut r| r.remove(0)).collect();
    assert_eq!(
        ns,
        ROWS.iter()
            .map(|(_, v)| Value::Numeric(Numeric::from_i64(*v as i64)))
            .collect::<Vec<_>>()
    );
    assert_eq!(scan.metrics().fallback_tasks, 0);
}

// ============================================================
// Failure handling
// ============================================================

#[test]
fn test_overflow_rechecked_on_host_surfaces_error() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter((v() * Expr::int4(i32::MAX)).gt(Expr::int4(0)))
        .build()
        .unwrap();
    let device = Arc::new(Device::emulated(&single_stream()));
    let mut scan = GpuScan::new(
        Arc::new(plan),
        Box::new(ChunkList::new(Arc::clone(&shape), vec![row_chunk(&shape, &ROWS)])),
        device,
        single_stream(),
    )
    .unwrap();
    let err = scan.collect_all().unwrap_err();
    assert!(matches!(err, ScanError::Evaluation(EvalError::Overflow(DataType::Int4))));
    assert_eq!(scan.metrics().fallback_tasks, 1);
}

#[test]
fn test_injected_device_fault_is_fatal() {
    let shape = shape();
    let config = single_stream();
    let emulated = EmulatedDevice::new(&config);
    emulated.inject_fault(1);
    let device = Arc::new(Device::Emulated(emulated));
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter(v().gt(Expr::int4(0)))
        .build()
        .unwrap();
    let chunks = vec![
        row_chunk(&shape, &ROWS[..2]),
        row_chunk(&shape, &ROWS[2..4]),
        row_chunk(&shape, &ROWS[4..]),
    ];
    let mut scan = GpuScan::new(
        Arc::new(plan),
        Box::new(ChunkList::new(Arc::clone(&shape), chunks)),
        device,
        config,
    )
    .unwrap();
    let err = scan.collect_all().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ScanError::DeviceFault { task_id: 1, .. }));
}

#[test]
fn test_device_fault_ends_iteration() {
    let shape = shape();
    let config = ScanConfig {
        max_concurrent_tasks: 1,
        ..single_stream()
    };
    let emulated = EmulatedDevice::new(&config);
    emulated.inject_fault(1);
    let device = Arc::new(Device::Emulated(emulated));
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter(v().gt(Expr::int4(0)))
        .build()
        .unwrap();
    let chunks = vec![
        row_chunk(&shape, &ROWS[..2]),
        row_chunk(&shape, &ROWS[2..4]),
        row_chunk(&shape, &ROWS[4..]),
    ];
    let mut scan = GpuScan::new(
        Arc::new(plan),
        Box::new(ChunkList::new(Arc::clone(&shape), chunks)),
        device,
        config,
    )
    .unwrap();

    let items: Vec<Result<_, ScanError>> = scan.by_ref().collect();
    let first_err = items.iter().position(Result::is_err).expect("fault surfaces");
    assert_eq!(items.len(), first_err + 1, "no rows after the fault");
    assert!(matches!(items[first_err], Err(ScanError::DeviceFault { task_id: 1, .. })));
    let ids: Vec<i64> = items[..first_err]
        .iter()
        .map(|t| int(&t.as_ref().unwrap().values[0]))
        .collect();
    assert_eq!(ids, vec![1, 2]);

    assert!(scan.is_aborted());
    assert!(scan.next_tuple().unwrap().is_none());
    assert_eq!(scan.metrics().rows_returned, 2);
}

#[test]
fn test_evaluation_error_ends_scan() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter((v() * Expr::int4(i32::MAX)).gt(Expr::int4(0)))
        .build()
        .unwrap();
    let chunks = vec![
        row_chunk(&shape, &ROWS[..2]),
        row_chunk(&shape, &ROWS[2..4]),
        row_chunk(&shape, &ROWS[4..]),
    ];
    let device = Arc::new(Device::emulated(&single_stream()));
    let mut scan = GpuScan::new(
        Arc::new(plan),
        Box::new(ChunkList::new(Arc::clone(&shape), chunks)),
        device,
        single_stream(),
    )
    .unwrap();

    assert!(matches!(
        scan.next_tuple(),
        Err(ScanError::Evaluation(EvalError::Overflow(DataType::Int4)))
    ));
    for _ in 0..3 {
        assert!(scan.next_tuple().unwrap().is_none());
    }
    assert_eq!(scan.metrics().rows_returned, 0);

    scan.rewind();
    assert!(scan.next_tuple().is_err());
}

#[test]
fn test_device_memory_pressure_retries() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape))
        .filter(v().ge(Expr::int4(5)))
        .build()
        .unwrap();
    let rows: Vec<(i32, i32)> = (0..40).map(|i| (i, i % 10)).collect();
    let chunks: Vec<Chunk> = rows.chunks(4).map(|part| row_chunk(&shape, part)).collect();

    // Room for two tasks: kernel text, source chunk, result buffer each.
    let per_task = [
        plan.kernel().text().len(),
        chunks[0].length(),
        16 + 4 * 4,
    ]
    .iter()
    .map(|&s| gpu_scan::gpu::memory::page_align(s))
    .sum::<usize>();
    let config = ScanConfig {
        device_memory_limit: 2 * per_task + per_task / 2,
        max_concurrent_tasks: 4,
        ..single_stream()
    };
    let (out, scan) = run_plan(plan, chunks, config);

    let mut ids: Vec<i64> = out.iter().map(|r| int(&r[0])).collect();
    ids.sort_unstable();
    let expected: Vec<i64> = rows.iter().filter(|(_, v)| *v >= 5).map(|(id, _)| *id as i64).collect();
    assert_eq!(ids, expected);
    assert!(scan.metrics().oom_retries >= 1);
    assert_eq!(scan.metrics().tasks, 10);
}

#[test]
fn test_task_larger_than_device_memory_fails() {
    let shape = shape();
    let plan = ScanPlan::builder(Arc::clone(&shape)).build().unwrap();
    let config = ScanConfig {
        device_memory_limit: gpu_scan::gpu::memory::DEVICE_PAGE_SIZE,
        ..single_stream()
    };
    let device = Arc::new(Device::emulated(&config));
    let mut scan = GpuScan::new(
        Arc::new(plan),
        Box::new(ChunkList::new(Arc::clone(&shape), vec![row_chunk(&shape, &ROWS)])),
        device,
        config,
    )
    .unwrap();
    assert!(matches!(
        scan.next_tuple(),
        Err(ScanError::DeviceOutOfMemory { .. })
    ));
}

// ============================================================
// Heap scans
// ============================================================

fn heap_table(nrows: i32) -> HeapTable {
    HeapTable::from_rows(
        shape(),
        (0..nrows).map(|i| vec![Value::Int4(i), Value::Int4(i % 100)]),
    )
    .unwrap()
}

fn heap_scan(table: HeapTable, format: ChunkFormat, plan: ScanPlan) -> GpuScan {
    let config = ScanConfig {
        use_block_format: format == ChunkFormat::Block,
        ..ScanConfig::default()
    };
    let snapshot = table.snapshot();
    let source = HeapScan::new(
        Arc::new(table),
        snapshot,
        format,
        config.chunk_size,
        ChunkAllocator::new(),
    )
    .unwrap();
    let device = Arc::new(Device::emulated(&config));
    GpuScan::new(Arc::new(plan), Box::new(source), device, config).unwrap()
}

#[test]
fn test_heap_scan_row_and_block_agree() {
    let plan = || {
        ScanPlan::builder(shape())
            .filter(v().lt(Expr::int4(10)))
            .build()
            .unwrap()
    };
    let mut from_rows: Vec<i64> = heap_scan(heap_table(3_000), ChunkFormat::Row, plan())
        .collect_all()
        .unwrap()
        .iter()
        .map(|t| int(&t.values[0]))
        .collect();
    let mut from_blocks: Vec<i64> = heap_scan(heap_table(3_000), ChunkFormat::Block, plan())
        .collect_all()
        .unwrap()
        .iter()
        .map(|t| int(&t.values[0]))
        .collect();
    from_rows.sort_unstable();
    from_blocks.sort_unstable();
    assert_eq!(from_rows.len(), 300);
    assert_eq!(from_rows, from_blocks);
}

#[test]
fn test_heap_scan_reports_tuple_origin() {
    let table = heap_table(500);
    let mut scan = heap_scan(table, ChunkFormat::Row, ScanPlan::builder(shape()).build().unwrap());
    let tuples = scan.collect_all().unwrap();
    assert_eq!(tuples.len(), 500);
    let first = tuples
        .iter()
        .find(|t| t.values[0] == Value::Int4(0))
        .unwrap();
    assert_eq!(first.ctid, Some(ItemPointer { block: 0, offset: 1 }));
}

#[test]
fn test_deleted_tuples_are_invisible() {
    let mut table = heap_table(200);
    let xid = table.begin();
    assert!(table.delete(ItemPointer { block: 0, offset: 1 }, xid));
    assert!(table.delete(ItemPointer { block: 0, offset: 3 }, xid));
    for format in [ChunkFormat::Row, ChunkFormat::Block] {
        let snapshot = table.snapshot();
        let source = HeapScan::new(
            Arc::new(table.clone()),
            snapshot,
            format,
            ScanConfig::default().chunk_size,
            ChunkAllocator::new(),
        )
        .unwrap();
        let config = ScanConfig::default();
        let device = Arc::new(Device::emulated(&config));
        let plan = ScanPlan::builder(shape()).filter(v().lt(Expr::int4(5))).build().unwrap();
        let mut scan = GpuScan::new(Arc::new(plan), Box::new(source), device, config).unwrap();
        let mut ids: Vec<i64> = scan
            .collect_all()
            .unwrap()
            .iter()
            .map(|t| int(&t.values[0]))
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3, 4, 100, 101, 102, 103, 104], "{} chunks", format);
    }
}

#[test]
fn test_rescan_produces_the_same_rows() {
    let plan = ScanPlan::builder(shape())
        .filter(v().ge(Expr::int4(90)))
        .target_list(vec![TargetEntry::new("w", v() + Expr::int4(1))])
        .build()
        .unwrap();
    let mut scan = heap_scan(heap_table(1_000), ChunkFormat::Row, plan);
    let mut first: Vec<i64> = scan.collect_all().unwrap().iter().map(|t| int(&t.values[0])).collect();
    scan.rewind();
    for _ in 0..3 {
        assert!(scan.next_tuple().unwrap().is_some());
    }
    scan.rewind();
    let mut second: Vec<i64> = scan.collect_all().unwrap().iter().map(|t| int(&t.values[0])).collect();
    first.sort_unstable();
    second.sort_unstable();
    assert_eq!(first.len(), 100);
    assert_eq!(first, second);
}
