//! Scan executor.
//!
//! One driving thread (the caller of [`GpuScan::next_tuple`]) pulls source
//! chunks, stages them against the device memory budget and submits them.
//! The device posts completions to a channel owned by the scan; the scan
//! blocks on it only when it has nothing else to hand out.
//!
//! ```text
//! ChunkSource ─► stage (DeviceMemory) ─► Device::submit ─┐
//!                    ▲ back-pressure                     │ TaskCompletion
//!                    │                                   ▼
//! next_tuple ◄── host quals + outputs ◄── ready tasks ◄── classify status
//!                                                        (ok / fallback / fatal)
//! ```
//!
//! Concurrency counts tasks on the device plus completed tasks not yet
//! consumed, since both hold device regions. Device memory exhaustion lowers
//! it; each successful completion raises it again by one.
//!
//! Any error returned by [`GpuScan::next_tuple`] aborts the scan: outstanding
//! tasks are discarded and the scan yields nothing more until
//! [`GpuScan::rewind`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, warn};

use crate::codegen::eval::Evaluator;
use crate::config::ScanConfig;
use crate::error::{RecoveryAction, ScanError};
use crate::gpu::device::{Device, DeviceJob, TaskCompletion};
use crate::gpu::memory::DeviceRegion;
use crate::gpu::metrics::ScanMetrics;
use crate::scan::plan::{OutputColumn, ScanPlan};
use crate::scan::task::{Task, TaskOutput, TaskRow, TaskState};
use crate::storage::chunk::{Capacity, Chunk, ChunkFormat};
use crate::storage::handle::ChunkRef;
use crate::storage::heap::ChunkSource;
use crate::storage::tuple::ItemPointer;
use crate::storage::value::Value;

/// `kern_resultbuf` header bytes.
const RESULTBUF_HEADER: usize = 16;

/// One output tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanTuple {
    /// Origin of the tuple, when the producing chunk records it.
    pub ctid: Option<ItemPointer>,
    pub values: Vec<Value>,
}

pub struct GpuScan {
    plan: Arc<ScanPlan>,
    source: Box<dyn ChunkSource>,
    device: Arc<Device>,
    config: ScanConfig,
    done_tx: Sender<TaskCompletion>,
    done_rx: Receiver<TaskCompletion>,
    generation: u64,
    next_task_id: u64,
    /// Chunk pulled from the source that could not be staged yet.
    pending: Option<Chunk>,
    source_done: bool,
    running: HashMap<u64, Task>,
    /// Submissions of earlier generations still on the device.
    stale_in_flight: usize,
    ready: VecDeque<Task>,
    current: Option<Task>,
    concurrency: usize,
    metrics: ScanMetrics,
    summary_logged: bool,
    /// Set by the first error; cleared by `rewind`.
    aborted: bool,
}

impl GpuScan {
    /// Prepare the kernel on `device` and start a scan over `source`.
    pub fn new(
        plan: Arc<ScanPlan>,
        source: Box<dyn ChunkSource>,
        device: Arc<Device>,
        config: ScanConfig,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        device.prepare(plan.kernel())?;
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        debug!(
            device = device.name(),
            concurrency = config.max_concurrent_tasks,
            "starting scan"
        );
        Ok(Self {
            plan,
            source,
            device,
            concurrency: config.max_concurrent_tasks,
            config,
            done_tx,
            done_rx,
            generation: 0,
            next_task_id: 0,
            pending: None,
            source_done: false,
            running: HashMap::new(),
            stale_in_flight: 0,
            ready: VecDeque::new(),
            current: None,
            metrics: ScanMetrics::new(),
            summary_logged: false,
            aborted: false,
        })
    }

    pub fn plan(&self) -> &Arc<ScanPlan> {
        &self.plan
    }

    pub fn metrics(&self) -> &ScanMetrics {
        &self.metrics
    }

    /// Current limit on tasks holding device memory.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Next tuple, or `None` at the end of the scan.
    ///
    /// After an error the scan is aborted and returns `Ok(None)` until it is
    /// rewound, so no rows from later chunks follow the error.
    pub fn next_tuple(&mut self) -> Result<Option<ScanTuple>, ScanError> {
        if self.aborted {
            return Ok(None);
        }
        match self.advance() {
            Err(e) => {
                if e.should_log() {
                    error!(error = %e, "scan aborted");
                }
                self.abort();
                Err(e)
            }
            done => done,
        }
    }

    /// Whether an error has ended the scan.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn advance(&mut self) -> Result<Option<ScanTuple>, ScanError> {
        loop {
            if let Some(task) = self.current.as_mut() {
                match task.next_row(&self.plan) {
                    Ok(Some(row)) => {
                        if let Some(tuple) = self.finish_row(row)? {
                            self.metrics.rows_returned += 1;
                            return Ok(Some(tuple));
                        }
                        continue;
                    }
                    Ok(None) => {
                        task.release();
                        self.current = None;
                    }
                    Err(e) => return Err(e),
                }
            }

            self.launch()?;

            if let Some(task) = self.ready.pop_front() {
                self.current = Some(task);
                continue;
            }
            if self.running.is_empty() && self.pending.is_none() && self.source_done {
                self.finish();
                return Ok(None);
            }
            if self.running.is_empty() && self.stale_in_flight == 0 {
                // launch() stages whenever nothing holds device memory.
                return Err(ScanError::DeviceUnavailable("scan stalled with no tasks in flight".into()));
            }
            let completion = self
                .done_rx
                .recv()
                .map_err(|_| ScanError::DeviceUnavailable("completion channel closed".into()))?;
            self.complete(completion);
        }
    }

    /// Drain every remaining tuple.
    pub fn collect_all(&mut self) -> Result<Vec<ScanTuple>, ScanError> {
        let mut out = Vec::new();
        while let Some(t) = self.next_tuple()? {
            out.push(t);
        }
        Ok(out)
    }

    /// Restart from the first chunk. In-flight and unconsumed tasks are
    /// discarded; late completions are recognized by their generation.
    pub fn rewind(&mut self) {
        self.discard_tasks();
        self.source.rewind();
        self.source_done = false;
        self.aborted = false;
        self.concurrency = self.config.max_concurrent_tasks;
        self.summary_logged = false;
        debug!(generation = self.generation, "scan rewound");
    }

    /// Drop every task of the current generation. Submissions still on the
    /// device become stale and their completions are ignored.
    fn discard_tasks(&mut self) {
        self.generation += 1;
        self.stale_in_flight += self.running.len();
        self.running.clear();
        for mut task in self.ready.drain(..).chain(self.current.take()) {
            task.release();
        }
        self.pending = None;
    }

    fn abort(&mut self) {
        self.discard_tasks();
        // Return the regions of completions that already arrived.
        while let Ok(c) = self.done_rx.try_recv() {
            self.complete(c);
        }
        self.source_done = true;
        self.aborted = true;
        debug!(generation = self.generation, "outstanding tasks discarded");
    }

    // ------------------------------------------------------------------------
    // Launch
    // ------------------------------------------------------------------------

    fn in_flight(&self) -> usize {
        self.running.len() + self.ready.len()
    }

    fn launch(&mut self) -> Result<(), ScanError> {
        while self.in_flight() < self.concurrency {
            let chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None if self.source_done => break,
                None => match self.source.next_chunk()? {
                    Some(chunk) => chunk,
                    None => {
                        self.source_done = true;
                        break;
                    }
                },
            };
            if chunk.tuple_count() == 0 {
                continue;
            }

            let mut task = Task::new(self.next_task_id);
            let dest = self.make_dest(&chunk)?;
            let sizes = self.staging_sizes(&chunk, dest.as_ref());
            let regions = match self.device.memory().allocate_all(&sizes) {
                Ok(regions) => regions,
                Err(e @ ScanError::DeviceOutOfMemory { .. }) => {
                    self.pending = Some(chunk);
                    return self.back_off(e);
                }
                Err(e) => return Err(e),
            };
            self.next_task_id += 1;
            task.transition(TaskState::Staged);
            self.submit(task, chunk, dest, regions)?;
        }
        Ok(())
    }

    /// Device memory is exhausted: wait for running work, or consume what
    /// has completed, before retrying the pending chunk.
    fn back_off(&mut self, e: ScanError) -> Result<(), ScanError> {
        if !self.running.is_empty() || self.stale_in_flight > 0 {
            let lowered = self.running.len().max(1);
            self.metrics.oom_retries += 1;
            warn!(
                error = %e,
                running = self.running.len(),
                concurrency = lowered,
                "device memory exhausted, reducing concurrency"
            );
            self.concurrency = lowered;
            Ok(())
        } else if !self.ready.is_empty() {
            Ok(())
        } else {
            Err(e)
        }
    }

    /// Empty destination sized by the kernel's estimate.
    fn make_dest(&self, source: &Chunk) -> Result<Option<Chunk>, ScanError> {
        let Some(projection) = &self.plan.kernel().program().projection else {
            return Ok(None);
        };
        let estimate = self.plan.kernel().estimate();
        let ntuples = source.tuple_count();
        let shape = Arc::clone(projection.dest_shape());
        let chunk = match projection.dest_format() {
            ChunkFormat::Row => Chunk::create(
                ChunkFormat::Row,
                shape,
                Capacity::Bytes(source.length() + estimate.row_extra * ntuples),
            )?,
            _ => Chunk::create(
                ChunkFormat::Slot,
                shape,
                Capacity::Rooms {
                    nrooms: ntuples,
                    extra: estimate.slot_extra * ntuples,
                },
            )?,
        };
        Ok(Some(chunk))
    }

    fn staging_sizes(&self, source: &Chunk, dest: Option<&Chunk>) -> Vec<usize> {
        let mut sizes = vec![
            self.plan.kernel().text().len(),
            source.length(),
            RESULTBUF_HEADER + 4 * source.tuple_count(),
        ];
        if let Some(dest) = dest {
            sizes.push(dest.length());
        }
        sizes
    }

    fn submit(
        &mut self,
        mut task: Task,
        chunk: Chunk,
        dest: Option<Chunk>,
        regions: Vec<DeviceRegion>,
    ) -> Result<(), ScanError> {
        let job = DeviceJob {
            task_id: task.id,
            generation: self.generation,
            kernel: Arc::clone(self.plan.kernel()),
            source: ChunkRef::new(chunk),
            dest,
            regions,
        };
        self.device.submit(job, self.done_tx.clone())?;
        task.transition(TaskState::DeviceQueued);
        self.metrics.peak_device_bytes = self
            .metrics
            .peak_device_bytes
            .max(self.device.memory().used() as u64);
        self.running.insert(task.id, task);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    fn complete(&mut self, c: TaskCompletion) {
        if c.generation != self.generation {
            self.stale_in_flight = self.stale_in_flight.saturating_sub(1);
            debug!(task = c.task_id, generation = c.generation, "dropping stale completion");
            return;
        }
        let Some(mut task) = self.running.remove(&c.task_id) else {
            warn!(task = c.task_id, "completion for unknown task");
            return;
        };
        task.transition(TaskState::Completed);
        self.metrics.record_task(&c.timings);
        task.regions = c.regions;

        let output = match c.status.recovery_action() {
            RecoveryAction::Discard => match c.dest {
                Some(mut dest) => match self.finish_dest(&mut dest, c.source) {
                    Ok(()) => TaskOutput::Dest {
                        chunk: dest,
                        cursor: 0,
                    },
                    Err(e) => TaskOutput::Failed(Some(e)),
                },
                None => TaskOutput::Source {
                    items: c.results.resolve(&c.source),
                    source: c.source,
                    cursor: 0,
                },
            },
            RecoveryAction::FallbackToCpu if self.config.cpu_fallback_enabled => {
                debug!(
                    task = c.task_id,
                    status = %c.status,
                    message = c.message.as_deref().unwrap_or(""),
                    "re-evaluating chunk on the host"
                );
                task.transition(TaskState::HostReevaluated);
                self.metrics.record_fallback(c.source.tuple_count() as u64);
                TaskOutput::Fallback {
                    items: c.source.item_ids(),
                    source: c.source,
                    cursor: 0,
                }
            }
            RecoveryAction::FallbackToCpu => TaskOutput::Failed(Some(ScanError::FallbackDisabled {
                task_id: c.task_id,
                status: c.status.to_string(),
            })),
            RecoveryAction::Fatal | RecoveryAction::ReduceConcurrency => {
                TaskOutput::Failed(Some(ScanError::DeviceFault {
                    task_id: c.task_id,
                    message: c.message.unwrap_or_else(|| c.status.to_string()),
                }))
            }
        };
        task.output = Some(output);
        if task.is_failed() {
            self.ready.push_front(task);
        } else {
            if self.concurrency < self.config.max_concurrent_tasks {
                self.concurrency += 1;
                debug!(concurrency = self.concurrency, "raising concurrency");
            }
            self.ready.push_back(task);
        }
    }

    /// Compact a Row destination and keep the source alive for slot
    /// pointers into it.
    fn finish_dest(&self, dest: &mut Chunk, source: ChunkRef) -> Result<(), ScanError> {
        if dest.format() == ChunkFormat::Row {
            dest.shrink(self.config.shrink_threshold)?;
        }
        dest.attach_source(source);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Consumption
    // ------------------------------------------------------------------------

    fn finish_row(&self, (ctid, row): TaskRow) -> Result<Option<ScanTuple>, ScanError> {
        let host = Evaluator::host();
        let mapped = self.plan.mapped(&row);
        if !host.eval_quals(self.plan.host_quals(), &mapped)? {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.plan.outputs().len());
        for output in self.plan.outputs() {
            match output {
                OutputColumn::Position(i) => values.push(row.get(*i).cloned().unwrap_or(Value::Null)),
                OutputColumn::Host(expr) => values.push(host.eval(expr, &mapped)?),
                OutputColumn::WholeRow => values.extend(row.iter().cloned()),
            }
        }
        Ok(Some(ScanTuple { ctid, values }))
    }

    fn finish(&mut self) {
        if self.summary_logged {
            return;
        }
        self.summary_logged = true;
        self.metrics.peak_device_bytes = self
            .metrics
            .peak_device_bytes
            .max(self.device.memory().peak() as u64);
        self.metrics.log_summary();
    }
}

impl Iterator for GpuScan {
    type Item = Result<ScanTuple, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tuple().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::expr::Expr;
    use crate::storage::heap::ChunkList;
    use crate::storage::schema::{AttrDesc, TupleShape};
    use crate::storage::tuple::HeapTuple;
    use crate::storage::types::DataType;

    fn shape() -> Arc<TupleShape> {
        Arc::new(TupleShape::new(
            1,
            vec![
                AttrDesc::new("id", DataType::Int4),
                AttrDesc::new("v", DataType::Int4),
            ],
        ))
    }

    fn chunks(shape: &Arc<TupleShape>, rows: &[(i32, i32)], per_chunk: usize) -> Vec<Chunk> {
        rows.chunks(per_chunk)
            .map(|part| {
                let mut c = Chunk::create(ChunkFormat::Row, Arc::clone(shape), Capacity::Bytes(16 * 1024)).unwrap();
                for (id, v) in part {
                    let t = HeapTuple::form(shape, &[Value::Int4(*id), Value::Int4(*v)], 1).unwrap();
                    assert!(c.insert_tuple(&t).unwrap());
                }
                c
            })
            .collect()
    }

    fn scan(plan: ScanPlan, rows: &[(i32, i32)], config: ScanConfig) -> GpuScan {
        let shape = shape();
        let source = ChunkList::new(Arc::clone(&shape), chunks(&shape, rows, 2));
        let device = Arc::new(Device::emulated(&config));
        GpuScan::new(Arc::new(plan), Box::new(source), device, config).unwrap()
    }

    fn v() -> Expr {
        Expr::var(1, 2, DataType::Int4)
    }

    const ROWS: [(i32, i32); 5] = [(1, 10), (2, 5), (3, 20), (4, 1), (5, 30)];

    #[test]
    fn test_filter_across_chunks() {
        let plan = ScanPlan::builder(shape()).filter(v().gt(Expr::int4(8))).build().unwrap();
        let mut s = scan(plan, &ROWS, ScanConfig::default());
        let ids: Vec<Value> = s
            .collect_all()
            .unwrap()
            .into_iter()
            .map(|t| t.values[0].clone())
            .collect();
        // Chunks may complete in any order.
        let mut ids: Vec<i64> = ids.iter().filter_map(Value::as_i64).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(s.metrics().rows_returned, 3);
        assert_eq!(s.metrics().tasks, 3);
    }

    #[test]
    fn test_end_of_scan_is_sticky() {
        let plan = ScanPlan::builder(shape()).build().unwrap();
        let mut s = scan(plan, &ROWS, ScanConfig::default());
        assert_eq!(s.collect_all().unwrap().len(), 5);
        assert!(s.next_tuple().unwrap().is_none());
    }

    #[test]
    fn test_rewind_restarts() {
        let plan = ScanPlan::builder(shape()).filter(v().lt(Expr::int4(8))).build().unwrap();
        let mut s = scan(plan, &ROWS, ScanConfig::default());
        assert!(s.next_tuple().unwrap().is_some());
        s.rewind();
        assert_eq!(s.collect_all().unwrap().len(), 2);
    }

    #[test]
    fn test_fallback_disabled_is_fatal() {
        let plan = ScanPlan::builder(shape())
            .filter((v() * Expr::int4(i32::MAX)).gt(Expr::int4(0)))
            .build()
            .unwrap();
        let config = ScanConfig {
            cpu_fallback_enabled: false,
            ..ScanConfig::default()
        };
        let mut s = scan(plan, &ROWS, config);
        assert!(matches!(
            s.collect_all(),
            Err(ScanError::FallbackDisabled { .. })
        ));
    }

    #[test]
    fn test_error_aborts_until_rewind() {
        let plan = ScanPlan::builder(shape())
            .filter((v() * Expr::int4(i32::MAX)).gt(Expr::int4(0)))
            .build()
            .unwrap();
        let config = ScanConfig {
            cpu_fallback_enabled: false,
            ..ScanConfig::default()
        };
        let mut s = scan(plan, &ROWS, config);
        assert!(s.next_tuple().is_err());
        assert!(s.is_aborted());
        assert!(s.running.is_empty() && s.ready.is_empty() && s.current.is_none());
        assert!(s.next_tuple().unwrap().is_none());

        s.rewind();
        assert!(!s.is_aborted());
        assert!(matches!(s.next_tuple(), Err(ScanError::FallbackDisabled { .. })));
    }

    #[test]
    fn test_concurrency_recovers_after_back_off() {
        let plan = ScanPlan::builder(shape()).filter(v().gt(Expr::int4(8))).build().unwrap();
        let mut s = scan(plan, &ROWS, ScanConfig::default());
        s.concurrency = 1;
        assert_eq!(s.collect_all().unwrap().len(), 3);
        assert_eq!(s.concurrency(), ScanConfig::default().max_concurrent_tasks);
    }

    #[test]
    fn test_host_quals_and_host_outputs() {
        let plan = ScanPlan::builder(shape())
            .filter(v().cast(DataType::Float8).gt(Expr::constant(Value::Float8(8.0))))
            .target_list(vec![crate::codegen::projection::TargetEntry::new(
                "half",
                v().cast(DataType::Float8) / Expr::constant(Value::Float8(2.0)),
            )])
            .build()
            .unwrap();
        assert_eq!(plan.host_quals().len(), 1);
        let mut s = scan(plan, &ROWS, ScanConfig::default());
        let mut halves: Vec<f64> = s
            .collect_all()
            .unwrap()
            .into_iter()
            .filter_map(|t| t.values[0].as_f64())
            .collect();
        halves.sort_by(f64::total_cmp);
        assert_eq!(halves, vec![5.0, 10.0, 15.0]);
    }
}
