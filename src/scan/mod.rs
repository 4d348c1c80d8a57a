//! Scan execution: plans, tasks, the executor, and host fallback.

pub mod executor;
mod fallback;
pub mod plan;
pub mod task;

pub use executor::{GpuScan, ScanTuple};
pub use plan::{OutputColumn, ScanPlan, ScanPlanBuilder};
pub use task::TaskState;
