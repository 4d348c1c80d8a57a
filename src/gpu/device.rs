//! Device abstraction: status codes, jobs, completions.
//!
//! A scan hands the device one [`DeviceJob`] per task together with the
//! sender of its completion channel. The device runs the job on one of its
//! stream threads and posts a [`TaskCompletion`]. If the scan has gone away
//! the send fails and the job's resources are dropped on the stream thread.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::codegen::kernel::KernelSource;
use crate::config::ScanConfig;
use crate::error::{RecoveryAction, ScanError};
use crate::gpu::emulator::EmulatedDevice;
use crate::gpu::memory::{DeviceMemory, DeviceRegion};
use crate::gpu::metrics::TaskTimings;
use crate::storage::chunk::Chunk;
use crate::storage::handle::ChunkRef;

#[cfg(target_os = "macos")]
use crate::gpu::metal::MetalDevice;

// ============================================================================
// Kernel status
// ============================================================================

/// Task status as written by the kernels (`StromError_*`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelStatus {
    Success = 0,
    /// The device could not evaluate a row exactly; re-run on the host.
    CpuReCheck = 1,
    /// The destination chunk was too small.
    DataStoreNoSpace = 2,
    DataStoreCorruption = 3,
    InvalidKernel = 4,
    DeviceFault = 5,
}

impl KernelStatus {
    /// Decode a status word; unknown codes are device faults.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => KernelStatus::Success,
            1 => KernelStatus::CpuReCheck,
            2 => KernelStatus::DataStoreNoSpace,
            3 => KernelStatus::DataStoreCorruption,
            4 => KernelStatus::InvalidKernel,
            _ => KernelStatus::DeviceFault,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == KernelStatus::Success
    }

    /// How the scan reacts to a task finishing with this status.
    pub fn recovery_action(self) -> RecoveryAction {
        match self {
            KernelStatus::Success => RecoveryAction::Discard,
            KernelStatus::CpuReCheck | KernelStatus::DataStoreNoSpace => {
                RecoveryAction::FallbackToCpu
            }
            KernelStatus::DataStoreCorruption
            | KernelStatus::InvalidKernel
            | KernelStatus::DeviceFault => RecoveryAction::Fatal,
        }
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KernelStatus::Success => "success",
            KernelStatus::CpuReCheck => "cpu recheck",
            KernelStatus::DataStoreNoSpace => "data store no space",
            KernelStatus::DataStoreCorruption => "data store corruption",
            KernelStatus::InvalidKernel => "invalid kernel",
            KernelStatus::DeviceFault => "device fault",
        })
    }
}

// ============================================================================
// Jobs and completions
// ============================================================================

/// Rows that passed the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResults {
    /// No filter ran; every tuple of the source is visible.
    AllVisible,
    /// Passing item ids (see `Chunk::item_ids`), ascending.
    Items(Vec<u32>),
}

impl TaskResults {
    /// Item ids of the passing tuples of `source`.
    pub fn resolve(&self, source: &Chunk) -> Vec<u32> {
        match self {
            TaskResults::AllVisible => source.item_ids(),
            TaskResults::Items(ids) => ids.clone(),
        }
    }
}

/// Work for one task.
pub struct DeviceJob {
    pub task_id: u64,
    pub generation: u64,
    pub kernel: Arc<KernelSource>,
    pub source: ChunkRef,
    /// Empty destination sized by the kernel's estimate.
    pub dest: Option<Chunk>,
    /// Staged device memory, held until the completion is consumed.
    pub regions: Vec<DeviceRegion>,
}

/// Outcome of one job, posted back to the scan.
pub struct TaskCompletion {
    pub task_id: u64,
    pub generation: u64,
    pub status: KernelStatus,
    pub message: Option<String>,
    pub results: TaskResults,
    pub source: ChunkRef,
    pub dest: Option<Chunk>,
    pub regions: Vec<DeviceRegion>,
    pub timings: TaskTimings,
}

impl fmt::Debug for TaskCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompletion")
            .field("task_id", &self.task_id)
            .field("generation", &self.generation)
            .field("status", &self.status)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Device
// ============================================================================

/// Where kernels run.
pub enum Device {
    /// Host threads executing the lowered kernel programs.
    Emulated(EmulatedDevice),
    /// Metal compute via `newLibraryWithSource`.
    #[cfg(target_os = "macos")]
    Metal(MetalDevice),
}

impl Device {
    pub fn emulated(config: &ScanConfig) -> Self {
        Device::Emulated(EmulatedDevice::new(config))
    }

    /// The system default Metal device.
    #[cfg(target_os = "macos")]
    pub fn metal(config: &ScanConfig) -> Result<Self, ScanError> {
        MetalDevice::new(config).map(Device::Metal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Device::Emulated(_) => "emulated",
            #[cfg(target_os = "macos")]
            Device::Metal(_) => "metal",
        }
    }

    pub fn memory(&self) -> &DeviceMemory {
        match self {
            Device::Emulated(d) => d.memory(),
            #[cfg(target_os = "macos")]
            Device::Metal(d) => d.memory(),
        }
    }

    /// Make `kernel` launchable (compiles it on Metal).
    pub fn prepare(&self, kernel: &Arc<KernelSource>) -> Result<(), ScanError> {
        match self {
            Device::Emulated(_) => {
                // The emulator runs the lowered program carried by each job.
                let _ = kernel;
                Ok(())
            }
            #[cfg(target_os = "macos")]
            Device::Metal(d) => d.prepare(kernel),
        }
    }

    /// Queue `job`; its completion is posted to `done`.
    pub fn submit(&self, job: DeviceJob, done: Sender<TaskCompletion>) -> Result<(), ScanError> {
        match self {
            Device::Emulated(d) => d.submit(job, done),
            #[cfg(target_os = "macos")]
            Device::Metal(d) => d.submit(job, done),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("memory_limit", &self.memory().limit())
            .finish()
    }
}
