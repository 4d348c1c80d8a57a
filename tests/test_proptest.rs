//! Property-based tests: device execution against host evaluation, and
//! chunk capacity handling.
//!
//! Every scan runs a single chunk on a single device stream, so device
//! output order is the source order and can be compared row by row.

use std::sync::Arc;

use gpu_scan::codegen::{Evaluator, Expr, KernelSource, TargetEntry};
use gpu_scan::config::ScanConfig;
use gpu_scan::gpu::Device;
use gpu_scan::scan::{GpuScan, ScanPlan};
use gpu_scan::storage::tuple::HeapTuple;
use gpu_scan::storage::{AttrDesc, Capacity, Chunk, ChunkFormat, ChunkList, DataType, TupleShape, Value};

use proptest::prelude::*;

// ============================================================================
// Shared helpers
// ============================================================================

fn shape() -> Arc<TupleShape> {
    Arc::new(TupleShape::new(
        1,
        vec![
            AttrDesc::new("id", DataType::Int4),
            AttrDesc::new("v", DataType::Int4),
            AttrDesc::new("w", DataType::Int2),
        ],
    ))
}

fn v() -> Expr {
    Expr::var(1, 2, DataType::Int4)
}

fn w() -> Expr {
    Expr::var(1, 3, DataType::Int2)
}

fn rows_strategy() -> impl Strategy<Value = Vec<Vec<Value>>> {
    prop::collection::vec(
        (
            prop::option::weighted(0.9, -1000i32..1000),
            prop::option::weighted(0.9, -100i16..100),
        ),
        1..200,
    )
    .prop_map(|pairs| {
        pairs
            .into_iter()
            .enumerate()
            .map(|(i, (v, w))| {
                vec![
                    Value::Int4(i as i32),
                    v.map_or(Value::Null, Value::Int4),
                    w.map_or(Value::Null, Value::Int2),
                ]
            })
            .collect()
    })
}

/// `v <op> c` for one of the six comparison operators.
fn compare(op: u8, lhs: Expr, c: i32) -> Expr {
    let rhs = Expr::int4(c);
    match op % 6 {
        0 => lhs.lt(rhs),
        1 => lhs.le(rhs),
        2 => lhs.equal(rhs),
        3 => lhs.not_equal(rhs),
        4 => lhs.ge(rhs),
        _ => lhs.gt(rhs),
    }
}

fn run(plan: ScanPlan, rows: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let shape = Arc::clone(plan.shape());
    let mut chunk = Chunk::create(ChunkFormat::Row, Arc::clone(&shape), Capacity::Bytes(64 * 1024)).unwrap();
    for row in rows {
        let tuple = HeapTuple::form(&shape, row, 1).unwrap();
        assert!(chunk.insert_tuple(&tuple).unwrap());
    }
    let config = ScanConfig {
        stream_threads: 1,
        ..ScanConfig::default()
    };
    let device = Arc::new(Device::emulated(&config));
    let mut scan = GpuScan::new(
        Arc::new(plan),
        Box::new(ChunkList::new(shape, vec![chunk])),
        device,
        config,
    )
    .unwrap();
    scan.collect_all().unwrap().into_iter().map(|t| t.values).collect()
}

// ============================================================================
// Device vs host
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_device_filter_matches_host(
        rows in rows_strategy(),
        op in any::<u8>(),
        c in -1000i32..1000,
        require_w in any::<bool>(),
    ) {
        let mut quals = vec![compare(op, v(), c)];
        if require_w {
            quals.push(Expr::or(vec![w().is_not_null(), v().is_null()]));
        }
        let plan = ScanPlan::builder(shape()).quals(quals.clone()).build().unwrap();
        prop_assert!(plan.host_quals().is_empty());

        let host = Evaluator::host();
        let expected: Vec<Vec<Value>> = rows
            .iter()
            .filter(|row| host.eval_quals(&quals, *row).unwrap())
            .cloned()
            .collect();
        prop_assert_eq!(run(plan, &rows), expected);
    }

    #[test]
    fn prop_device_projection_matches_host(
        rows in rows_strategy(),
        c in -1000i32..1000,
        k in -50i32..50,
        op in any::<u8>(),
    ) {
        let filter = compare(op, v(), c);
        let tlist = vec![
            TargetEntry::new("id", Expr::var(1, 1, DataType::Int4)),
            TargetEntry::new("shifted", v() + Expr::int4(k)),
            TargetEntry::new("scaled", w() * Expr::int4(k)),
        ];
        let plan = ScanPlan::builder(shape())
            .filter(filter.clone())
            .target_list(tlist.clone())
            .destination(ChunkFormat::Slot)
            .build()
            .unwrap();
        prop_assert!(plan.tlist_dev().is_some());

        let host = Evaluator::host();
        let expected: Vec<Vec<Value>> = rows
            .iter()
            .filter(|row| host.eval_quals(std::slice::from_ref(&filter), *row).unwrap())
            .map(|row| tlist.iter().map(|e| host.eval(&e.expr, row).unwrap()).collect())
            .collect();
        prop_assert_eq!(run(plan, &rows), expected);
    }

    #[test]
    fn prop_kernel_generation_is_deterministic(op in any::<u8>(), c in -1000i32..1000) {
        let shape = shape();
        let quals = vec![compare(op, v(), c)];
        let a = KernelSource::generate(&shape, &quals, None, ChunkFormat::Slot, 256).unwrap();
        let b = KernelSource::generate(&shape, &quals, None, ChunkFormat::Slot, 256).unwrap();
        prop_assert_eq!(a.text(), b.text());
        prop_assert_eq!(a.structure_hash(), b.structure_hash());

        let other = vec![compare(op, v(), c.wrapping_add(1))];
        let d = KernelSource::generate(&shape, &other, None, ChunkFormat::Slot, 256).unwrap();
        prop_assert_ne!(a.structure_hash(), d.structure_hash());
    }
}

// ============================================================================
// Chunk capacity
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_row_chunk_keeps_every_accepted_row(
        rows in rows_strategy(),
        capacity in 512usize..8192,
    ) {
        let shape = shape();
        let mut chunk = Chunk::create(ChunkFormat::Row, Arc::clone(&shape), Capacity::Bytes(capacity)).unwrap();
        let mut accepted = 0;
        for row in &rows {
            let tuple = HeapTuple::form(&shape, row, 1).unwrap();
            if !chunk.insert_tuple(&tuple).unwrap() {
                break;
            }
            accepted += 1;
        }
        prop_assert_eq!(chunk.nitems(), accepted);
        prop_assert!(chunk.usage() <= chunk.length());

        let chunk = chunk.expand(capacity * 2).unwrap();
        for (i, row) in rows.iter().take(accepted).enumerate() {
            prop_assert_eq!(&chunk.values_at(i).unwrap().unwrap(), row);
        }
    }
}
