//! Per-task timing counters and per-scan aggregates.
//!
//! Wall-clock timing (`std::time::Instant`) around each device stage. The
//! emulated device measures its own host work; the Metal backend measures
//! from commit to completion.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

/// Counters of one task, filled on the device side and sent back with the
/// completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskTimings {
    pub htod_count: u32,
    pub htod_bytes: u64,
    pub dtoh_count: u32,
    pub dtoh_bytes: u64,
    pub filter_kernels: u32,
    pub filter_time: Duration,
    pub projection_kernels: u32,
    pub projection_time: Duration,
    /// Source tuples evaluated on the host after a recoverable status.
    pub fallback_rows: u64,
}

impl TaskTimings {
    pub fn record_htod(&mut self, bytes: usize) {
        self.htod_count += 1;
        self.htod_bytes += bytes as u64;
    }

    pub fn record_dtoh(&mut self, bytes: usize) {
        self.dtoh_count += 1;
        self.dtoh_bytes += bytes as u64;
    }

    pub fn record_filter(&mut self, elapsed: Duration) {
        self.filter_kernels += 1;
        self.filter_time += elapsed;
    }

    pub fn record_projection(&mut self, elapsed: Duration) {
        self.projection_kernels += 1;
        self.projection_time += elapsed;
    }

    /// Add another task's counters into this one.
    pub fn merge(&mut self, other: &TaskTimings) {
        self.htod_count += other.htod_count;
        self.htod_bytes += other.htod_bytes;
        self.dtoh_count += other.dtoh_count;
        self.dtoh_bytes += other.dtoh_bytes;
        self.filter_kernels += other.filter_kernels;
        self.filter_time += other.filter_time;
        self.projection_kernels += other.projection_kernels;
        self.projection_time += other.projection_time;
        self.fallback_rows += other.fallback_rows;
    }
}

/// Aggregates over every task of a scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanMetrics {
    pub tasks: u64,
    pub fallback_tasks: u64,
    pub oom_retries: u64,
    pub rows_returned: u64,
    pub totals: TaskTimings,
    /// High-water mark of staged device memory.
    pub peak_device_bytes: u64,
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one completed task.
    pub fn record_task(&mut self, timings: &TaskTimings) {
        self.tasks += 1;
        self.totals.merge(timings);
    }

    pub fn record_fallback(&mut self, rows: u64) {
        self.fallback_tasks += 1;
        self.totals.fallback_rows += rows;
    }

    /// Kernel time across both kernels.
    pub fn kernel_time(&self) -> Duration {
        self.totals.filter_time + self.totals.projection_time
    }

    /// Host-to-device throughput in GB/s over kernel time; 0 when no kernel ran.
    pub fn throughput_gbps(&self) -> f64 {
        let secs = self.kernel_time().as_secs_f64();
        if secs > 0.0 {
            (self.totals.htod_bytes as f64 / 1_000_000_000.0) / secs
        } else {
            0.0
        }
    }

    /// Emit the summary as one structured `tracing` event.
    pub fn log_summary(&self) {
        info!(
            tasks = self.tasks,
            fallback_tasks = self.fallback_tasks,
            oom_retries = self.oom_retries,
            rows = self.rows_returned,
            htod = %format_bytes(self.totals.htod_bytes),
            dtoh = %format_bytes(self.totals.dtoh_bytes),
            filter_ms = self.totals.filter_time.as_secs_f64() * 1000.0,
            projection_ms = self.totals.projection_time.as_secs_f64() * 1000.0,
            peak_device = %format_bytes(self.peak_device_bytes),
            "scan finished"
        );
    }
}

/// Stopwatch for one device stage.
pub struct StageTimer {
    start: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Format bytes into a human-readable string (B, KB, MB, GB).
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
