//! gpu-scan: GPU-accelerated relational table scans.
//!
//! Filters and projections over a base relation are compiled into Metal
//! kernels and run chunk by chunk, with exact host re-evaluation of any chunk
//! the device cannot finish.

pub mod cli;
pub mod codegen;
pub mod config;
pub mod error;
pub mod gpu;
pub mod scan;
pub mod storage;

pub use config::ScanConfig;
pub use error::{ChunkError, CodegenError, ConfigError, EvalError, ScanError};
pub use gpu::Device;
pub use scan::{GpuScan, ScanPlan, ScanTuple};
