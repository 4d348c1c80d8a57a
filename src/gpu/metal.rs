//! Metal backend.
//!
//! Metal objects never leave the device thread: it owns the device, the
//! command queue and the pipeline cache, and serves compile and run requests
//! from a channel. Each task is staged into shared-storage buffers and runs
//! as two command buffers:
//!
//! ```text
//! [quals: exec_quals_row | exec_quals_block] -> wait -> sort results
//! [projection: projection_row | projection_slot]  -> wait -> read dest image
//! ```
//!
//! Results are sorted between the passes so the destination keeps source
//! order whatever order the thread groups reserved their ranges in.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{
    MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder, MTLCommandQueue,
    MTLComputeCommandEncoder, MTLComputePipelineState, MTLCreateSystemDefaultDevice, MTLDevice,
    MTLLibrary, MTLResourceOptions, MTLSize,
};
use tracing::{debug, info, warn};

use crate::codegen::kernel::{
    KernelSource, PROJECTION_ROW_KERNEL, PROJECTION_SLOT_KERNEL, QUALS_BLOCK_KERNEL,
    QUALS_ROW_KERNEL,
};
use crate::config::ScanConfig;
use crate::error::{CodegenError, RecoveryAction, ScanError};
use crate::gpu::device::{DeviceJob, KernelStatus, TaskCompletion, TaskResults};
use crate::gpu::memory::DeviceMemory;
use crate::gpu::metrics::{StageTimer, TaskTimings};
use crate::storage::chunk::{Chunk, ChunkFormat};

type Pso = Retained<ProtocolObject<dyn MTLComputePipelineState>>;
type Buffer = Retained<ProtocolObject<dyn MTLBuffer>>;
type BufferRef<'a> = &'a ProtocolObject<dyn MTLBuffer>;

/// `kern_resultbuf` header: status, nitems, nrooms, all_visible.
const RESULTBUF_HEADER: usize = 16;

enum Request {
    Compile {
        kernel: Arc<KernelSource>,
        reply: Sender<Result<(), String>>,
    },
    Run {
        job: DeviceJob,
        done: Sender<TaskCompletion>,
    },
}

/// Handle to the Metal device thread.
pub struct MetalDevice {
    memory: DeviceMemory,
    requests: Option<Sender<Request>>,
    thread: Option<JoinHandle<()>>,
}

impl MetalDevice {
    /// Open the system default device and start its thread.
    pub fn new(config: &ScanConfig) -> Result<Self, ScanError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Request>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<String, String>>(1);
        let thread = std::thread::Builder::new()
            .name("gpu-scan-metal".into())
            .spawn(move || {
                let Some(device) = MTLCreateSystemDefaultDevice() else {
                    let _ = ready_tx.send(Err("no Metal device".into()));
                    return;
                };
                let Some(queue) = device.newCommandQueue() else {
                    let _ = ready_tx.send(Err("failed to create command queue".into()));
                    return;
                };
                let _ = ready_tx.send(Ok(device.name().to_string()));
                MetalThread {
                    device,
                    queue,
                    pipelines: HashMap::new(),
                }
                .serve(rx);
            })
            .map_err(|e| ScanError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                info!(device = %name, "metal device ready");
                Ok(Self {
                    memory: DeviceMemory::new(config.device_memory_limit),
                    requests: Some(tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(ScanError::DeviceUnavailable(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(ScanError::DeviceUnavailable("metal thread exited".into()))
            }
        }
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    fn send(&self, request: Request) -> Result<(), ScanError> {
        self.requests
            .as_ref()
            .ok_or_else(|| ScanError::DeviceUnavailable("metal device shut down".into()))?
            .send(request)
            .map_err(|_| ScanError::DeviceUnavailable("metal thread exited".into()))
    }

    /// Compile `kernel` (cached by structure hash).
    pub fn prepare(&self, kernel: &Arc<KernelSource>) -> Result<(), ScanError> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.send(Request::Compile {
            kernel: Arc::clone(kernel),
            reply,
        })?;
        match rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(ScanError::Codegen(CodegenError::Malformed(message))),
            Err(_) => Err(ScanError::DeviceUnavailable("metal thread exited".into())),
        }
    }

    pub fn submit(&self, job: DeviceJob, done: Sender<TaskCompletion>) -> Result<(), ScanError> {
        self.send(Request::Run { job, done })
    }
}

impl Drop for MetalDevice {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// Device thread
// ============================================================================

struct Pipelines {
    quals_row: Pso,
    quals_block: Pso,
    projection: Option<Pso>,
}

struct MetalThread {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    pipelines: HashMap<u64, Pipelines>,
}

struct Abort {
    status: KernelStatus,
    message: String,
}

fn abort(status: KernelStatus, message: impl Into<String>) -> Abort {
    Abort {
        status,
        message: message.into(),
    }
}

impl MetalThread {
    fn serve(mut self, rx: Receiver<Request>) {
        for request in rx.iter() {
            match request {
                Request::Compile { kernel, reply } => {
                    let _ = reply.send(self.compile(&kernel));
                }
                Request::Run { job, done } => {
                    let completion = self.run(job);
                    if let Err(unsent) = done.send(completion) {
                        debug!(task = unsent.0.task_id, "scan gone, dropping completion");
                    }
                }
            }
        }
    }

    fn compile(&mut self, kernel: &KernelSource) -> Result<(), String> {
        let hash = kernel.structure_hash();
        if self.pipelines.contains_key(&hash) {
            return Ok(());
        }
        let timer = StageTimer::start();
        let ns_source = NSString::from_str(kernel.text());
        let library = self
            .device
            .newLibraryWithSource_options_error(&ns_source, None)
            .map_err(|e| format!("kernel compile failed: {}", e))?;
        let pso = |name: &str| -> Result<Pso, String> {
            let function = library
                .newFunctionWithName(&NSString::from_str(name))
                .ok_or_else(|| format!("function '{}' not found in kernel library", name))?;
            self.device
                .newComputePipelineStateWithFunction_error(&function)
                .map_err(|e| format!("pipeline creation for '{}' failed: {}", name, e))
        };
        let projection = match &kernel.program().projection {
            Some(p) if p.dest_format() == ChunkFormat::Row => Some(pso(PROJECTION_ROW_KERNEL)?),
            Some(_) => Some(pso(PROJECTION_SLOT_KERNEL)?),
            None => None,
        };
        let pipelines = Pipelines {
            quals_row: pso(QUALS_ROW_KERNEL)?,
            quals_block: pso(QUALS_BLOCK_KERNEL)?,
            projection,
        };
        debug!(
            hash = format_args!("{:016x}", hash),
            ms = timer.elapsed().as_secs_f64() * 1000.0,
            "compiled kernel"
        );
        self.pipelines.insert(hash, pipelines);
        Ok(())
    }

    fn run(&mut self, job: DeviceJob) -> TaskCompletion {
        let DeviceJob {
            task_id,
            generation,
            kernel,
            source,
            mut dest,
            regions,
        } = job;
        let mut timings = TaskTimings::default();
        let outcome = self.execute(&kernel, &source, &mut dest, &mut timings);
        let (status, message, results) = match outcome {
            Ok(results) => (KernelStatus::Success, None, results),
            Err(a) => {
                if a.status.recovery_action() != RecoveryAction::FallbackToCpu {
                    warn!(task = task_id, status = %a.status, message = %a.message, "metal task failed");
                }
                (a.status, Some(a.message), TaskResults::Items(Vec::new()))
            }
        };
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
        &mut self,
        kernel: &KernelSource,
        source: &Chunk,
        dest: &mut Option<Chunk>,
        timings: &mut TaskTimings,
    ) -> Result<TaskResults, Abort> {
        if !self.pipelines.contains_key(&kernel.structure_hash()) {
            self.compile(kernel)
                .map_err(|m| abort(KernelStatus::InvalidKernel, m))?;
        }
        let pipelines = self
            .pipelines
            .get(&kernel.structure_hash())
            .ok_or_else(|| abort(KernelStatus::InvalidKernel, "kernel not compiled"))?;
        let tpg = kernel.threads_per_group();

        let image = source.to_device_image();
        let kds_src = self.upload(&image)?;
        timings.record_htod(image.len());

        let is_block = source.format() == ChunkFormat::Block;
        let run_quals = !kernel.program().filter.is_empty() || is_block;
        let nrooms = source.tuple_count().max(1);
        let mut header = Vec::with_capacity(RESULTBUF_HEADER);
        for word in [0u32, 0, nrooms as u32, (!run_quals) as u32] {
            header.extend_from_slice(&word.to_le_bytes());
        }
        header.resize(RESULTBUF_HEADER + 4 * nrooms, 0);
        let kresults = self.upload(&header)?;
        timings.record_htod(header.len());

        if run_quals {
            let timer = StageTimer::start();
            if is_block {
                self.dispatch_groups(&pipelines.quals_block, &[&*kds_src, &*kresults], source.nitems(), tpg)?;
            } else {
                self.dispatch_threads(&pipelines.quals_row, &[&*kds_src, &*kresults], source.nitems(), tpg)?;
            }
            timings.record_filter(timer.elapsed());
            check_status(&kresults)?;
            sort_results(&kresults, nrooms);
        }

        if let (Some(pso), Some(chunk)) = (&pipelines.projection, dest.as_mut()) {
            let nvalid = if run_quals {
                read_u32(&kresults, 4) as usize
            } else {
                source.nitems()
            };
            let dest_image = chunk.to_device_image();
            let kds_dst = self.upload(&dest_image)?;
            timings.record_htod(dest_image.len());

            let timer = StageTimer::start();
            self.dispatch_threads(pso, &[&*kds_src, &*kresults, &*kds_dst], nvalid, tpg)?;
            timings.record_projection(timer.elapsed());
            check_status(&kresults)?;

            let bytes = download(&kds_dst, dest_image.len());
            timings.record_dtoh(bytes.len());
            let mut rebuilt = Chunk::from_device_image(&bytes, Arc::clone(chunk.shape()))
                .map_err(|e| abort(KernelStatus::DataStoreCorruption, e.to_string()))?;
            if let Some(charge) = chunk.take_charge() {
                rebuilt.set_charge(charge);
            }
            *chunk = rebuilt;
        }

        if !run_quals {
            timings.record_dtoh(RESULTBUF_HEADER);
            return Ok(TaskResults::AllVisible);
        }
        let nitems = (read_u32(&kresults, 4) as usize).min(nrooms);
        timings.record_dtoh(RESULTBUF_HEADER + 4 * nitems);
        Ok(TaskResults::Items(
            (0..nitems)
                .map(|i| read_u32(&kresults, RESULTBUF_HEADER + 4 * i))
                .collect(),
        ))
    }

    /// Shared-storage buffer holding a copy of `bytes`.
    fn upload(&self, bytes: &[u8]) -> Result<Buffer, Abort> {
        let buffer = self
            .device
            .newBufferWithLength_options(bytes.len().max(4), MTLResourceOptions::StorageModeShared)
            .ok_or_else(|| abort(KernelStatus::DeviceFault, "buffer allocation failed"))?;
        unsafe {
            let dst = buffer.contents().as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(buffer)
    }

    fn encode(
        &self,
        pso: &ProtocolObject<dyn MTLComputePipelineState>,
        buffers: &[BufferRef<'_>],
        grid: MTLSize,
        group: MTLSize,
        per_thread: bool,
    ) -> Result<(), Abort> {
        let cmd = self
            .queue
            .commandBuffer()
            .ok_or_else(|| abort(KernelStatus::DeviceFault, "failed to create command buffer"))?;
        let encoder = cmd
            .computeCommandEncoder()
            .ok_or_else(|| abort(KernelStatus::DeviceFault, "failed to create compute encoder"))?;
        encoder.setComputePipelineState(pso);
        unsafe {
            for (index, buffer) in buffers.iter().enumerate() {
                encoder.setBuffer_offset_atIndex(Some(*buffer), 0, index);
            }
        }
        if per_thread {
            encoder.dispatchThreads_threadsPerThreadgroup(grid, group);
        } else {
            encoder.dispatchThreadgroups_threadsPerThreadgroup(grid, group);
        }
        encoder.endEncoding();
        cmd.commit();
        cmd.waitUntilCompleted();
        if cmd.status() == MTLCommandBufferStatus::Error {
            let message = cmd
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "command buffer failed".into());
            return Err(abort(KernelStatus::DeviceFault, message));
        }
        Ok(())
    }

    /// One thread per item, `tpg` threads per group.
    fn dispatch_threads(&self, pso: &Pso, buffers: &[BufferRef<'_>], nthreads: usize, tpg: usize) -> Result<(), Abort> {
        let width = tpg.min(pso.maxTotalThreadsPerThreadgroup());
        self.encode(pso, buffers, size_1d(nthreads.max(1)), size_1d(width), true)
    }

    /// One thread group per block page.
    fn dispatch_groups(&self, pso: &Pso, buffers: &[BufferRef<'_>], ngroups: usize, tpg: usize) -> Result<(), Abort> {
        let width = tpg.min(pso.maxTotalThreadsPerThreadgroup());
        self.encode(pso, buffers, size_1d(ngroups.max(1)), size_1d(width), false)
    }
}

fn size_1d(width: usize) -> MTLSize {
    MTLSize {
        width,
        height: 1,
        depth: 1,
    }
}

fn read_u32(buffer: &Buffer, off: usize) -> u32 {
    unsafe {
        let base = buffer.contents().as_ptr() as *const u8;
        std::ptr::read_unaligned(base.add(off) as *const u32)
    }
}

fn download(buffer: &Buffer, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    unsafe {
        let base = buffer.contents().as_ptr() as *const u8;
        std::ptr::copy_nonoverlapping(base, out.as_mut_ptr(), len);
    }
    out
}

fn check_status(kresults: &Buffer) -> Result<(), Abort> {
    match KernelStatus::from_code(read_u32(kresults, 0)) {
        KernelStatus::Success => Ok(()),
        status => Err(abort(status, format!("kernel reported {}", status))),
    }
}

/// Sort the result ids in place so later passes see source order.
fn sort_results(kresults: &Buffer, nrooms: usize) {
    let nitems = (read_u32(kresults, 4) as usize).min(nrooms);
    unsafe {
        let base = kresults.contents().as_ptr() as *mut u8;
        let ids = std::slice::from_raw_parts_mut(base.add(RESULTBUF_HEADER) as *mut u32, nitems);
        ids.sort_unstable();
    }
}
