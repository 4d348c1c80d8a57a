//! In-memory heap tables and the chunk sources that feed a scan.
//!
//! `HeapTable` is the minimal host storage engine: a list of pages with
//! transaction stamps. `HeapScan` walks those pages under one snapshot and
//! packs them into Row or Block chunks of at most `chunk_size` bytes. A page
//! that does not fit the current chunk is replayed into the next one.

use std::sync::Arc;

use tracing::debug;

use crate::error::ChunkError;
use crate::storage::chunk::{Capacity, Chunk, ChunkFormat, PageLoad};
use crate::storage::handle::ChunkAllocator;
use crate::storage::page::{Page, Snapshot};
use crate::storage::schema::TupleShape;
use crate::storage::tuple::{HeapTuple, ItemPointer};
use crate::storage::value::Value;

/// Something that produces source chunks for a scan, in order.
pub trait ChunkSource: Send {
    /// Shape of every tuple the source produces.
    fn shape(&self) -> &Arc<TupleShape>;

    /// Next filled chunk, or `None` at end of input.
    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError>;

    /// Restart from the first chunk.
    fn rewind(&mut self);
}

// ============================================================================
// HeapTable
// ============================================================================

/// Pages of one relation plus a transaction counter.
#[derive(Debug, Clone)]
pub struct HeapTable {
    shape: Arc<TupleShape>,
    pages: Vec<Page>,
    next_xid: u32,
}

impl HeapTable {
    pub fn new(shape: Arc<TupleShape>) -> Self {
        Self {
            shape,
            pages: Vec::new(),
            next_xid: 1,
        }
    }

    /// A table loaded by a single committed transaction, pages frozen
    /// all-visible.
    pub fn from_rows<I>(shape: Arc<TupleShape>, rows: I) -> Result<Self, ChunkError>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let mut table = Self::new(shape);
        let xid = table.begin();
        for row in rows {
            table.insert(&row, xid)?;
        }
        table.freeze();
        Ok(table)
    }

    pub fn shape(&self) -> &Arc<TupleShape> {
        &self.shape
    }

    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, block: u32) -> Option<&Page> {
        self.pages.get(block as usize)
    }

    /// Assign a new transaction id.
    pub fn begin(&mut self) -> u32 {
        let xid = self.next_xid;
        self.next_xid += 1;
        xid
    }

    /// Snapshot seeing every transaction begun so far.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::at(self.next_xid)
    }

    /// Insert one row on behalf of `xid`.
    pub fn insert(&mut self, values: &[Value], xid: u32) -> Result<ItemPointer, ChunkError> {
        let tuple = HeapTuple::form(&self.shape, values, xid)?;
        if let Some(page) = self.pages.last_mut() {
            if let Some(offset) = page.add_tuple(&tuple) {
                page.set_all_visible(false);
                return Ok(ItemPointer {
                    block: self.pages.len() as u32 - 1,
                    offset,
                });
            }
        }
        let mut page = Page::new();
        let offset = page.add_tuple(&tuple).ok_or_else(|| {
            ChunkError::Corrupt(format!("tuple of {} bytes exceeds a page", tuple.len()))
        })?;
        self.pages.push(page);
        Ok(ItemPointer {
            block: self.pages.len() as u32 - 1,
            offset,
        })
    }

    /// Delete the tuple at `ctid` on behalf of `xid`.
    pub fn delete(&mut self, ctid: ItemPointer, xid: u32) -> bool {
        self.pages
            .get_mut(ctid.block as usize)
            .is_some_and(|page| page.mark_deleted(ctid.offset, xid))
    }

    /// Mark every page all-visible.
    pub fn freeze(&mut self) {
        for page in &mut self.pages {
            page.set_all_visible(true);
        }
    }
}

// ============================================================================
// HeapScan
// ============================================================================

/// Loads a heap table into chunks, page by page.
pub struct HeapScan {
    table: Arc<HeapTable>,
    snapshot: Snapshot,
    format: ChunkFormat,
    chunk_size: usize,
    allocator: ChunkAllocator,
    next_block: u32,
}

impl HeapScan {
    /// `format` must be Row or Block.
    pub fn new(
        table: Arc<HeapTable>,
        snapshot: Snapshot,
        format: ChunkFormat,
        chunk_size: usize,
        allocator: ChunkAllocator,
    ) -> Result<Self, ChunkError> {
        if !matches!(format, ChunkFormat::Row | ChunkFormat::Block) {
            return Err(ChunkError::FormatMismatch {
                op: "heap scan",
                format,
            });
        }
        Ok(Self {
            table,
            snapshot,
            format,
            chunk_size,
            allocator,
            next_block: 0,
        })
    }

    pub fn table(&self) -> &Arc<HeapTable> {
        &self.table
    }
}

impl ChunkSource for HeapScan {
    fn shape(&self) -> &Arc<TupleShape> {
        self.table.shape()
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        let npages = self.table.npages() as u32;
        if self.next_block >= npages {
            return Ok(None);
        }
        let mut chunk = self.allocator.create(
            self.format,
            Arc::clone(self.table.shape()),
            Capacity::Bytes(self.chunk_size),
        )?;
        let first_block = self.next_block;
        let mut ntuples = 0;
        while self.next_block < npages {
            let Some(page) = self.table.page(self.next_block) else {
                break;
            };
            match chunk.insert_from_page(self.next_block, page.view(), &self.snapshot)? {
                PageLoad::Loaded(n) => {
                    ntuples += n;
                    self.next_block += 1;
                }
                PageLoad::NoSpace if self.next_block == first_block => {
                    return Err(ChunkError::TooSmall {
                        format: self.format,
                        length: chunk.length(),
                        required: chunk.length() + page.view().tuple_payload(),
                    });
                }
                PageLoad::NoSpace => break,
            }
        }
        debug!(
            blocks = ?(first_block..self.next_block),
            tuples = ntuples,
            usage = chunk.usage(),
            "loaded source chunk"
        );
        Ok(Some(chunk))
    }

    fn rewind(&mut self) {
        self.next_block = 0;
    }
}

// ============================================================================
// ChunkList
// ============================================================================

/// A fixed list of chunks, replayed on rewind.
pub struct ChunkList {
    shape: Arc<TupleShape>,
    images: Vec<Vec<u8>>,
    next: usize,
}

impl ChunkList {
    /// Every chunk must have been built for `shape`.
    pub fn new(shape: Arc<TupleShape>, chunks: Vec<Chunk>) -> Self {
        Self {
            shape,
            images: chunks.iter().map(Chunk::to_device_image).collect(),
            next: 0,
        }
    }
}

impl ChunkSource for ChunkList {
    fn shape(&self) -> &Arc<TupleShape> {
        &self.shape
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        let Some(image) = self.images.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        Chunk::from_device_image(image, Arc::clone(&self.shape)).map(Some)
    }

    fn rewind(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::AttrDesc;
    use crate::storage::types::DataType;

    fn shape() -> Arc<TupleShape> {
        Arc::new(TupleShape::new(
            9,
            vec![
                AttrDesc::new("id", DataType::Int8),
                AttrDesc::new("label", DataType::Text),
            ],
        ))
    }

    fn rows(n: i64) -> impl Iterator<Item = Vec<Value>> {
        (0..n).map(|i| vec![Value::Int8(i), Value::Text(format!("row {}", i))])
    }

    fn drain(scan: &mut dyn ChunkSource) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Some(chunk) = scan.next_chunk().unwrap() {
            for t in chunk.iter() {
                let values = t.unwrap().to_values(chunk.shape()).unwrap();
                ids.push(values[0].as_i64().unwrap());
            }
        }
        ids
    }

    #[test]
    fn test_table_insert_spills_pages() {
        let table = HeapTable::from_rows(shape(), rows(1000)).unwrap();
        assert!(table.npages() > 1);
        assert!(table.page(0).unwrap().view().is_all_visible());
    }

    #[test]
    fn test_heap_scan_row_chunks_replay_pages() {
        let table = Arc::new(HeapTable::from_rows(shape(), rows(2000)).unwrap());
        let mut scan = HeapScan::new(
            Arc::clone(&table),
            table.snapshot(),
            ChunkFormat::Row,
            32 * 1024,
            ChunkAllocator::new(),
        )
        .unwrap();
        let ids = drain(&mut scan);
        assert_eq!(ids, (0..2000).collect::<Vec<_>>());

        scan.rewind();
        assert_eq!(drain(&mut scan).len(), 2000);
    }

    #[test]
    fn test_heap_scan_block_chunks_respect_snapshot() {
        let mut table = HeapTable::from_rows(shape(), rows(500)).unwrap();
        let xid = table.begin();
        assert!(table.delete(ItemPointer { block: 0, offset: 1 }, xid));
        let late = table.begin();
        table.insert(&[Value::Int8(9999), Value::Null], late).unwrap();
        let snapshot = Snapshot::new(late, late, Vec::new());

        let table = Arc::new(table);
        let mut scan = HeapScan::new(
            table,
            snapshot,
            ChunkFormat::Block,
            64 * 1024,
            ChunkAllocator::new(),
        )
        .unwrap();
        let ids = drain(&mut scan);
        assert_eq!(ids, (1..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_heap_scan_rejects_slot_format() {
        let table = Arc::new(HeapTable::new(shape()));
        assert!(HeapScan::new(
            table,
            Snapshot::any(),
            ChunkFormat::Slot,
            4096,
            ChunkAllocator::new()
        )
        .is_err());
    }

    #[test]
    fn test_chunk_list_rewinds() {
        let mut chunk = Chunk::create(ChunkFormat::Row, shape(), Capacity::Bytes(8192)).unwrap();
        for row in rows(3) {
            chunk
                .insert_tuple(&HeapTuple::form(&shape(), &row, 1).unwrap())
                .unwrap();
        }
        let mut list = ChunkList::new(shape(), vec![chunk]);
        assert_eq!(drain(&mut list), vec![0, 1, 2]);
        assert!(list.next_chunk().unwrap().is_none());
        list.rewind();
        assert_eq!(drain(&mut list), vec![0, 1, 2]);
    }
}
