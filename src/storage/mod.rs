//! Storage subsystem: scalar types, tuple layout, pages, and chunk buffers.
//!
//! Everything in here is host memory. The byte layouts are the ones the
//! generated kernels read, so offsets and alignment rules are shared with
//! `crate::codegen`.

pub mod chunk;
pub mod handle;
pub mod heap;
pub mod page;
pub mod schema;
pub mod tuple;
pub mod types;
pub mod value;

pub use chunk::{Capacity, Chunk, ChunkFormat, FetchedTuple, PageLoad};
pub use handle::{ChunkAllocator, ChunkRef};
pub use heap::{ChunkList, ChunkSource, HeapScan, HeapTable};
pub use page::{Page, Snapshot};
pub use schema::{AttrDesc, TupleShape};
pub use types::DataType;
pub use value::{Numeric, Value};

/// Maximal alignment of any stored value (MAXALIGN).
pub const MAX_ALIGN: usize = 8;

/// Round `offset` up to a multiple of `align` (which must be a power of two).
#[inline]
pub const fn type_align(align: usize, offset: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Round up to [`MAX_ALIGN`].
#[inline]
pub const fn max_align(offset: usize) -> usize {
    type_align(MAX_ALIGN, offset)
}

/// Round down to [`MAX_ALIGN`].
#[inline]
pub const fn max_align_down(offset: usize) -> usize {
    offset & !(MAX_ALIGN - 1)
}
