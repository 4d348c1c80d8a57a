//! Shared chunk handles and per-scan memory accounting.
//!
//! A chunk referenced by several parties (a source chunk and the slot chunk
//! pointing into it, or a chunk handed to a device stream) lives behind a
//! [`ChunkRef`]. Cloning retains, dropping releases, and the memory goes
//! back to the owning [`ChunkAllocator`] when the last reference is gone.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::ChunkError;
use crate::storage::chunk::{Capacity, Chunk, ChunkFormat};
use crate::storage::schema::TupleShape;

// ============================================================================
// ChunkAllocator
// ============================================================================

#[derive(Debug, Default)]
struct AllocStats {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl AllocStats {
    fn add(&self, bytes: usize) {
        let live = self.live_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
    }

    fn sub(&self, bytes: usize) {
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Memory accounting for the chunks of one execution context.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct ChunkAllocator {
    stats: Arc<AllocStats>,
}

impl ChunkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chunk whose bytes are charged to this allocator.
    pub fn create(
        &self,
        format: ChunkFormat,
        shape: Arc<TupleShape>,
        capacity: Capacity,
    ) -> Result<Chunk, ChunkError> {
        let mut chunk = Chunk::create(format, shape, capacity)?;
        chunk.set_charge(self.charge(chunk.length()));
        Ok(chunk)
    }

    pub(crate) fn charge(&self, bytes: usize) -> AllocCharge {
        self.stats.add(bytes);
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        AllocCharge {
            stats: Arc::clone(&self.stats),
            bytes,
        }
    }

    /// Bytes held by chunks that are still alive.
    pub fn live_bytes(&self) -> usize {
        self.stats.live_bytes.load(Ordering::Relaxed)
    }

    /// High-water mark of [`live_bytes`](Self::live_bytes).
    pub fn peak_bytes(&self) -> usize {
        self.stats.peak_bytes.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.stats.allocations.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.stats.releases.load(Ordering::Relaxed)
    }
}

/// Bytes one chunk holds against its allocator; returned on drop.
#[derive(Debug)]
pub struct AllocCharge {
    stats: Arc<AllocStats>,
    bytes: usize,
}

impl AllocCharge {
    /// Track a reallocation (expand or shrink).
    pub(crate) fn resize(&mut self, bytes: usize) {
        if bytes > self.bytes {
            self.stats.add(bytes - self.bytes);
        } else {
            self.stats.sub(self.bytes - bytes);
        }
        self.bytes = bytes;
    }
}

impl Drop for AllocCharge {
    fn drop(&mut self) {
        self.stats.sub(self.bytes);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// ChunkRef
// ============================================================================

/// Reference-counted, read-only handle on a chunk.
#[derive(Clone)]
pub struct ChunkRef(Arc<Chunk>);

impl ChunkRef {
    pub fn new(chunk: Chunk) -> Self {
        Self(Arc::new(chunk))
    }

    /// Another reference to the same chunk.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Give up this reference.
    pub fn release(self) {}

    /// Live references, this one included.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Take the chunk back if this is the only reference.
    pub fn try_into_inner(self) -> Result<Chunk, ChunkRef> {
        Arc::try_unwrap(self.0).map_err(ChunkRef)
    }

    /// Whether both handles name the same chunk.
    pub fn ptr_eq(&self, other: &ChunkRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for ChunkRef {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.0
    }
}

impl fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChunkRef")
            .field(&*self.0)
            .field(&self.refcount())
            .finish()
    }
}

impl From<Chunk> for ChunkRef {
    fn from(chunk: Chunk) -> Self {
        Self::new(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::AttrDesc;
    use crate::storage::types::DataType;

    fn shape() -> Arc<TupleShape> {
        Arc::new(TupleShape::new(1, vec![AttrDesc::new("v", DataType::Int8)]))
    }

    #[test]
    fn test_refcount_release_returns_memory() {
        let alloc = ChunkAllocator::new();
        let chunk = alloc
            .create(ChunkFormat::Row, shape(), Capacity::Bytes(64 * 1024))
            .unwrap();
        assert_eq!(alloc.live_bytes(), 64 * 1024);

        let first = ChunkRef::new(chunk);
        let second = first.retain();
        assert_eq!(first.refcount(), 2);
        assert!(first.ptr_eq(&second));

        first.release();
        assert_eq!(second.refcount(), 1);
        assert_eq!(alloc.live_bytes(), 64 * 1024, "still referenced");

        drop(second);
        assert_eq!(alloc.live_bytes(), 0);
        assert_eq!(alloc.peak_bytes(), 64 * 1024);
        assert_eq!(alloc.allocations(), 1);
        assert_eq!(alloc.releases(), 1);
    }

    #[test]
    fn test_try_into_inner_requires_sole_owner() {
        let handle = ChunkRef::new(
            Chunk::create(ChunkFormat::Row, shape(), Capacity::Bytes(4096)).unwrap(),
        );
        let other = handle.retain();
        let handle = handle.try_into_inner().unwrap_err();
        drop(other);
        let chunk = handle.try_into_inner().unwrap();
        assert_eq!(chunk.length(), 4096);
    }

    #[test]
    fn test_expand_and_shrink_adjust_accounting() {
        let alloc = ChunkAllocator::new();
        let chunk = alloc
            .create(ChunkFormat::Row, shape(), Capacity::Bytes(32 * 1024))
            .unwrap();
        let mut chunk = chunk.expand(96 * 1024).unwrap();
        assert_eq!(alloc.live_bytes(), 96 * 1024);
        assert_eq!(alloc.peak_bytes(), 96 * 1024);
        assert!(chunk.shrink(0).unwrap());
        assert_eq!(alloc.live_bytes(), chunk.length());
        drop(chunk);
        assert_eq!(alloc.live_bytes(), 0);
    }
}
