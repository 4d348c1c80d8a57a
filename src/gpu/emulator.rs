//! Emulated device.
//!
//! Runs the lowered kernel programs on host stream threads with the same
//! contract as the generated MSL: the source is staged as a device image,
//! threads are batched into groups of `threads_per_group`, each group
//! reserves destination space with one bump of `usage`, and every failure
//! becomes a status word instead of an error.
//!
//! ```text
//! submit(job) ──► [jobs channel] ──► stream thread N
//!                                      stage source image (HtoD)
//!                                      gpuscan_exec_quals_{row,block}
//!                                      gpuscan_projection_{row,slot}
//!                                      results (DtoH)
//!                                   ──► completion channel of the scan
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::codegen::emit::AttrLoad;
use crate::codegen::eval::Evaluator;
use crate::codegen::filter::FilterProgram;
use crate::codegen::kernel::KernelSource;
use crate::codegen::projection::{ProjectionOutput, ProjectionProgram};
use crate::config::ScanConfig;
use crate::error::{ChunkError, EvalError, ScanError};
use crate::gpu::device::{DeviceJob, KernelStatus, TaskCompletion, TaskResults};
use crate::gpu::memory::DeviceMemory;
use crate::gpu::metrics::{StageTimer, TaskTimings};
use crate::storage::chunk::{Chunk, ChunkFormat, FetchedTuple, SLOT_PTR_SOURCE};
use crate::storage::max_align;
use crate::storage::schema::TupleShape;
use crate::storage::tuple::{HeapTuple, ItemPointer, TupleView};
use crate::storage::value::Value;

/// Size of the result buffer header (`kern_resultbuf` without `results`).
const RESULTBUF_HEADER: usize = 16;

struct StreamWork {
    job: DeviceJob,
    inject_fault: bool,
    threads_per_group: usize,
    done: Sender<TaskCompletion>,
}

/// Host-thread device. Dropping it drains queued jobs and joins the streams.
pub struct EmulatedDevice {
    memory: DeviceMemory,
    threads_per_group: usize,
    jobs: Option<Sender<StreamWork>>,
    streams: Vec<JoinHandle<()>>,
    submitted: AtomicU64,
    faults: Mutex<HashSet<u64>>,
}

impl EmulatedDevice {
    pub fn new(config: &ScanConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<StreamWork>();
        let nstreams = config.stream_threads.max(1);
        let mut streams = Vec::with_capacity(nstreams);
        for i in 0..nstreams {
            let rx = rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("gpu-scan-stream-{}", i))
                .spawn(move || stream_main(rx));
            match spawned {
                Ok(handle) => streams.push(handle),
                Err(e) => warn!(stream = i, error = %e, "failed to spawn device stream"),
            }
        }
        Self {
            memory: DeviceMemory::new(config.device_memory_limit),
            threads_per_group: config.threads_per_group.max(1),
            jobs: Some(tx),
            streams,
            submitted: AtomicU64::new(0),
            faults: Mutex::new(HashSet::new()),
        }
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    /// Make the `nth` job submitted to this device (0-based) fail with
    /// [`KernelStatus::DeviceFault`].
    pub fn inject_fault(&self, nth: u64) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nth);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn submit(&self, job: DeviceJob, done: Sender<TaskCompletion>) -> Result<(), ScanError> {
        let seq = self.submitted.fetch_add(1, Ordering::Relaxed);
        let inject_fault = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&seq);
        let jobs = match (&self.jobs, self.streams.is_empty()) {
            (Some(jobs), false) => jobs,
            _ => return Err(ScanError::DeviceUnavailable("no device streams running".into())),
        };
        jobs.send(StreamWork {
            job,
            inject_fault,
            threads_per_group: self.threads_per_group,
            done,
        })
        .map_err(|_| ScanError::DeviceUnavailable("device streams have stopped".into()))
    }
}

impl Drop for EmulatedDevice {
    fn drop(&mut self) {
        self.jobs.take();
        for handle in self.streams.drain(..) {
            let _ = handle.join();
        }
    }
}

fn stream_main(rx: Receiver<StreamWork>) {
    for work in rx.iter() {
        let done = work.done.clone();
        let completion = run_job(work);
        if let Err(unsent) = done.send(completion) {
            debug!(task = unsent.0.task_id, "scan gone, dropping completion");
        }
    }
}

// ============================================================================
// Job execution
// ============================================================================

/// A status raised inside a kernel.
struct Abort {
    status: KernelStatus,
    message: Option<String>,
}

impl Abort {
    fn new(status: KernelStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

impl From<ChunkError> for Abort {
    fn from(e: ChunkError) -> Self {
        Abort::new(KernelStatus::DataStoreCorruption, e.to_string())
    }
}

impl From<EvalError> for Abort {
    fn from(e: EvalError) -> Self {
        Abort::new(KernelStatus::CpuReCheck, e.to_string())
    }
}

fn run_job(work: StreamWork) -> TaskCompletion {
    let StreamWork {
        job,
        inject_fault,
        threads_per_group,
        ..
    } = work;
    let DeviceJob {
        task_id,
        generation,
        kernel,
        source,
        mut dest,
        regions,
    } = job;

    let mut timings = TaskTimings::default();
    let outcome = if inject_fault {
        Err(Abort::new(KernelStatus::DeviceFault, "injected device fault"))
    } else {
        execute(&kernel, &source, dest.as_mut(), threads_per_group, &mut timings)
    };
    let (status, message, results) = match outcome {
        Ok(results) => (KernelStatus::Success, None, results),
        Err(abort) => (abort.status, abort.message, TaskResults::Items(Vec::new())),
    };
    debug!(task = task_id, %status, "device task finished");
    TaskCompletion {
        task_id,
        generation,
        status,
        message,
        results,
        source,
        dest,
        regions,
        timings,
    }
}

fn execute(
    kernel: &KernelSource,
    source: &Chunk,
    dest: Option<&mut Chunk>,
    threads_per_group: usize,
    timings: &mut TaskTimings,
) -> Result<TaskResults, Abort> {
    let program = kernel.program();
    if !matches!(source.format(), ChunkFormat::Row | ChunkFormat::Block) {
        return Err(Abort::new(
            KernelStatus::InvalidKernel,
            format!("no quals kernel for {} chunks", source.format()),
        ));
    }

    // HtoD: kernel parameters, then the source image.
    timings.record_htod(kernel.text().len());
    let image = source.to_device_image();
    timings.record_htod(image.len());
    let kds_src = Chunk::from_device_image(&image, Arc::clone(&program.shape))?;
    let cache = program.shape.cache_offsets(false);

    let results = if program.filter.is_empty() && kds_src.format() != ChunkFormat::Block {
        TaskResults::AllVisible
    } else {
        let timer = StageTimer::start();
        let ids = exec_quals(&program.filter, &kds_src, &cache, threads_per_group)?;
        timings.record_filter(timer.elapsed());
        TaskResults::Items(ids)
    };

    if let (Some(projection), Some(dest)) = (&program.projection, dest) {
        let items = results.resolve(&kds_src);
        let timer = StageTimer::start();
        let projector = Projector {
            kds_src: &kds_src,
            shape: &program.shape,
            cache: &cache,
            program: projection,
        };
        match projection.dest_format() {
            ChunkFormat::Row => projector.into_rows(&items, dest)?,
            _ => projector.into_slots(&items, dest, threads_per_group)?,
        }
        timings.record_projection(timer.elapsed());
        timings.record_dtoh(dest.length());
    }

    let nresults = match &results {
        TaskResults::AllVisible => 0,
        TaskResults::Items(ids) => ids.len(),
    };
    timings.record_dtoh(RESULTBUF_HEADER + 4 * nresults);
    Ok(results)
}

/// Attributes a kernel loads from one tuple; the rest stay NULL.
fn load_attrs(
    tuple: &TupleView<'_>,
    shape: &TupleShape,
    loads: &AttrLoad,
    cache: &[i32],
) -> Result<Vec<Value>, ChunkError> {
    let mut row = vec![Value::Null; shape.natts()];
    for attnum in loads.attnums() {
        row[attnum as usize - 1] = tuple.get_attr(shape, attnum, cache)?;
    }
    Ok(row)
}

/// `gpuscan_exec_quals_row` / `gpuscan_exec_quals_block`.
fn exec_quals(
    filter: &FilterProgram,
    kds_src: &Chunk,
    cache: &[i32],
    threads_per_group: usize,
) -> Result<Vec<u32>, Abort> {
    let shape = kds_src.shape();
    let ids = kds_src.item_ids();
    let mut results = Vec::with_capacity(ids.len());
    for group in ids.chunks(threads_per_group) {
        let mut passed = Vec::with_capacity(group.len());
        for &id in group {
            let Some(FetchedTuple::Heap { tuple, .. }) = kds_src.fetch_item(id)? else {
                continue;
            };
            let row = load_attrs(&tuple, shape, filter.loads(), cache)?;
            if filter.evaluate(&row)? {
                passed.push(id);
            }
        }
        // One reservation per group.
        results.extend_from_slice(&passed);
    }
    Ok(results)
}

/// `project()` plus the Row and Slot destination kernels.
struct Projector<'a> {
    kds_src: &'a Chunk,
    shape: &'a TupleShape,
    cache: &'a [i32],
    program: &'a ProjectionProgram,
}

/// One projected tuple before it is written out.
struct Projected {
    ctid: ItemPointer,
    xmin: u32,
    /// Absolute source offset of each copied attribute (`None` when NULL).
    copies: Vec<Option<usize>>,
    values: Vec<Value>,
}

impl Projector<'_> {
    fn project(&self, item_id: u32) -> Result<Option<Projected>, Abort> {
        let Some(FetchedTuple::Heap { ctid, pos, tuple }) = self.kds_src.fetch_item(item_id)? else {
            return Ok(None);
        };
        let row = load_attrs(&tuple, self.shape, self.program.loads(), self.cache)?;
        let device = Evaluator::device();
        let mut copies = Vec::with_capacity(self.program.outputs().len());
        let mut values = Vec::with_capacity(self.program.outputs().len());
        for output in self.program.outputs() {
            match output {
                ProjectionOutput::Copy { attnum, .. } => {
                    copies.push(tuple.attr_offset(self.shape, *attnum)?.map(|off| pos + off));
                    values.push(row[*attnum as usize - 1].clone());
                }
                ProjectionOutput::Compute { expr } => {
                    copies.push(None);
                    values.push(device.eval(expr, &row)?);
                }
            }
        }
        Ok(Some(Projected {
            ctid,
            xmin: tuple.xmin(),
            copies,
            values,
        }))
    }

    /// `gpuscan_projection_row`.
    fn into_rows(&self, items: &[u32], dest: &mut Chunk) -> Result<(), Abort> {
        let dest_shape = Arc::clone(self.program.dest_shape());
        for &id in items {
            let Some(p) = self.project(id)? else {
                continue;
            };
            let tuple = HeapTuple::form(&dest_shape, &p.values, p.xmin)?;
            if !dest.insert_row_item(tuple.as_bytes(), p.ctid, None) {
                return Err(Abort::new(
                    KernelStatus::DataStoreNoSpace,
                    format!("row destination full after {} items", dest.nitems()),
                ));
            }
        }
        Ok(())
    }

    /// `gpuscan_projection_slot`: by-value outputs go into the slot, copied
    /// by-reference outputs point back into the source, computed ones are
    /// bump-allocated from the tail of the extra region per group.
    fn into_slots(&self, items: &[u32], dest: &mut Chunk, threads_per_group: usize) -> Result<(), Abort> {
        if items.len() > dest.nrooms() {
            return Err(Abort::new(
                KernelStatus::DataStoreNoSpace,
                format!("{} items for {} slot rooms", items.len(), dest.nrooms()),
            ));
        }
        let slots_end = dest.slot_length(dest.nrooms());
        let mut usage = dest.usage();
        let mut row = 0;
        for group in items.chunks(threads_per_group) {
            let mut projected = Vec::with_capacity(group.len());
            for &id in group {
                if let Some(p) = self.project(id)? {
                    projected.push(p);
                }
            }
            let group_total: usize = projected
                .iter()
                .flat_map(|p| p.values.iter().zip(&p.copies))
                .filter(|(v, copy)| copy.is_none() && !v.is_null() && !is_by_value(v))
                .map(|(v, _)| max_align(v.stored_size()))
                .sum();
            if slots_end + usage + group_total > dest.length() {
                return Err(Abort::new(
                    KernelStatus::DataStoreNoSpace,
                    format!(
                        "slot extra region needs {} bytes, {} free",
                        usage + group_total,
                        dest.length() - slots_end
                    ),
                ));
            }

            for p in projected {
                let mut datums = Vec::with_capacity(p.values.len());
                let mut isnull = Vec::with_capacity(p.values.len());
                for (value, copy) in p.values.iter().zip(&p.copies) {
                    isnull.push(value.is_null());
                    let datum = match (value, copy) {
                        (Value::Null, _) => 0,
                        (v, _) if is_by_value(v) => v.to_datum(),
                        (_, Some(src_off)) => SLOT_PTR_SOURCE | *src_off as u64,
                        (v, None) => {
                            let size = max_align(v.stored_size());
                            usage += size;
                            let pos = dest.length() - usage;
                            let mut buf = Vec::with_capacity(size);
                            v.append_stored(&mut buf);
                            dest.write_bytes(pos, &buf);
                            pos as u64
                        }
                    };
                    datums.push(datum);
                }
                dest.slot_put_row(row, &datums, &isnull);
                row += 1;
            }
        }
        dest.set_nitems(row);
        dest.set_usage(usage);
        Ok(())
    }
}

fn is_by_value(v: &Value) -> bool {
    v.data_type().is_some_and(|t| t.typbyval())
}
