//! Device layer: memory budget, task execution backends, metrics.

pub mod device;
pub mod emulator;
pub mod memory;
#[cfg(target_os = "macos")]
pub mod metal;
pub mod metrics;

pub use device::{Device, DeviceJob, KernelStatus, TaskCompletion, TaskResults};
pub use emulator::EmulatedDevice;
pub use memory::{DeviceMemory, DeviceRegion};
pub use metrics::{ScanMetrics, TaskTimings};
