//! Device memory budget.
//!
//! Every task stages its buffers against a fixed device budget. Regions are
//! rounded to 16KB pages and returned to the pool when dropped, which may
//! happen on a device stream thread if the owning scan has gone away.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ScanError;

/// Allocation granularity (Apple Silicon page size).
pub const DEVICE_PAGE_SIZE: usize = 16384;

/// Round up to the nearest device page.
pub fn page_align(size: usize) -> usize {
    size.div_ceil(DEVICE_PAGE_SIZE).max(1) * DEVICE_PAGE_SIZE
}

#[derive(Debug, Default)]
struct PoolState {
    used: usize,
    peak: usize,
    allocations: u64,
    failures: u64,
}

/// Fixed-size device memory pool. Cheap to clone; clones share the budget.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    limit: usize,
    state: Arc<Mutex<PoolState>>,
}

impl DeviceMemory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // The state is plain counters; a panicked holder cannot leave it torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `size` bytes (page aligned).
    pub fn allocate(&self, size: usize) -> Result<DeviceRegion, ScanError> {
        let aligned = page_align(size);
        let mut state = self.lock();
        if state.used + aligned > self.limit {
            state.failures += 1;
            return Err(ScanError::DeviceOutOfMemory {
                requested: aligned,
                available: self.limit - state.used,
            });
        }
        state.used += aligned;
        state.peak = state.peak.max(state.used);
        state.allocations += 1;
        Ok(DeviceRegion {
            size: aligned,
            state: Arc::clone(&self.state),
        })
    }

    /// Reserve several regions at once; nothing stays reserved on failure.
    pub fn allocate_all(&self, sizes: &[usize]) -> Result<Vec<DeviceRegion>, ScanError> {
        sizes.iter().map(|&s| self.allocate(s)).collect()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.lock().used
    }

    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    pub fn failures(&self) -> u64 {
        self.lock().failures
    }

    pub fn allocations(&self) -> u64 {
        self.lock().allocations
    }
}

/// Reserved device bytes, returned to the pool on drop.
#[derive(Debug)]
pub struct DeviceRegion {
    size: usize,
    state: Arc<Mutex<PoolState>>,
}

impl DeviceRegion {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for DeviceRegion {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.used -= self.size;
    }
}
