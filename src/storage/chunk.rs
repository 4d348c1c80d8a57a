//! Chunk: a fixed-capacity, length-prefixed batch of tuples.
//!
//! A chunk is a header, one `ColumnMeta` per attribute, and a body whose
//! layout depends on the format. All offsets stored inside a chunk are
//! relative to the chunk start (header included), which is also what the
//! generated kernels see after the chunk image is copied to the device.
//!
//! ```text
//! Row    [head][colmeta][row index u32 * nitems] ...free... [items, back to front]
//! Hash   [head][colmeta][row index][hash slots u32 * nslots] ...  [hash items]
//! Slot   [head][colmeta][values u64 * ncols | isnull u8 * ncols] * nrooms ... [extra]
//! Block  [head][colmeta][block numbers u32 * nrooms][PAGE_SIZE * nrooms]
//! ```
//!
//! Row item:  `[t_len u32][block u32][lineoff u16][pad u16][pad u32][tuple]`
//! Hash item: `[hash u32][next u32][rowid u32][pad u32][row item]`
//!
//! Offset 0 always belongs to the header, so a zero offset terminates hash
//! chains and marks empty buckets.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ChunkError;
use crate::storage::handle::{AllocCharge, ChunkRef};
use crate::storage::page::{LineState, Page, PageView, Snapshot, PAGE_SIZE};
use crate::storage::schema::TupleShape;
use crate::storage::tuple::{HeapTuple, ItemPointer, TupleView};
use crate::storage::types::DataType;
use crate::storage::value::Value;
use crate::storage::{max_align, max_align_down};

/// Size of [`ChunkHead`] in bytes.
pub const CHUNK_HEAD_SIZE: usize = 48;
/// Size of [`ColumnMeta`] in bytes.
pub const COLUMN_META_SIZE: usize = 24;
/// Size of the row item header that precedes each stored tuple.
pub const ROW_ITEM_HEADER: usize = 16;
/// Size of the hash item header that precedes a row item in Hash format.
pub const HASH_ITEM_HEADER: usize = 16;
/// Slot datum flag: the pointer addresses the attached source chunk.
pub const SLOT_PTR_SOURCE: u64 = 1 << 63;

const INDEX_ENTRY: usize = 4;
const UNBOUNDED_ROOMS: u32 = u32::MAX;

// ============================================================================
// Format and header types
// ============================================================================

/// Physical layout of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFormat {
    Row = 1,
    Slot = 2,
    Hash = 3,
    Block = 4,
}

impl ChunkFormat {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ChunkFormat::Row),
            2 => Some(ChunkFormat::Slot),
            3 => Some(ChunkFormat::Hash),
            4 => Some(ChunkFormat::Block),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkFormat::Row => "row",
            ChunkFormat::Slot => "slot",
            ChunkFormat::Hash => "hash",
            ChunkFormat::Block => "block",
        })
    }
}

/// Chunk header as laid out on the device (48 bytes).
///
/// - `[0..4]`   length: total bytes including header and column metadata
/// - `[4..8]`   usage: bytes consumed from the tail (items or extra region)
/// - `[8..12]`  ncols
/// - `[12..16]` nitems
/// - `[16..20]` nrooms
/// - `[20..24]` nslots: hash buckets, 0 until the index is built
/// - `[24..28]` format
/// - `[28..32]` table_id
/// - `[32..36]` nrows_per_block
/// - `[36]`     has_notbyval, `[37]` has_numeric
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkHead {
    pub length: u32,
    pub usage: u32,
    pub ncols: u32,
    pub nitems: u32,
    pub nrooms: u32,
    pub nslots: u32,
    pub format: u32,
    pub table_id: u32,
    pub nrows_per_block: u32,
    pub has_notbyval: u8,
    pub has_numeric: u8,
    pub _pad0: u16,
    pub _reserved: [u32; 2],
}

/// Per-column metadata (24 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnMeta {
    pub attbyval: u8,
    pub attalign: u8,
    pub attlen: i16,
    pub attnum: i16,
    pub _pad0: i16,
    pub attcacheoff: i32,
    pub type_id: u32,
    pub typmod: i32,
    pub _reserved: u32,
}

const _: () = assert!(std::mem::size_of::<ChunkHead>() == CHUNK_HEAD_SIZE);
const _: () = assert!(std::mem::size_of::<ColumnMeta>() == COLUMN_META_SIZE);

impl ColumnMeta {
    /// Column metadata for every attribute of `shape`.
    pub fn for_shape(shape: &TupleShape) -> Vec<ColumnMeta> {
        let offsets = shape.cache_offsets(false);
        shape
            .attrs()
            .iter()
            .zip(offsets)
            .enumerate()
            .map(|(i, (attr, cacheoff))| ColumnMeta {
                attbyval: attr.data_type.typbyval() as u8,
                attalign: attr.data_type.typalign() as u8,
                attlen: attr.data_type.typlen(),
                attnum: i as i16 + 1,
                attcacheoff: cacheoff,
                type_id: attr.data_type.type_id(),
                typmod: attr.typmod,
                ..Default::default()
            })
            .collect()
    }
}

/// Requested size of a new chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Total byte budget (Row, Hash, Block).
    Bytes(usize),
    /// Fixed room count plus extra-region bytes (Slot, Block).
    Rooms { nrooms: usize, extra: usize },
}

/// Outcome of loading one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoad {
    /// The page was consumed; this many tuples were loaded.
    Loaded(usize),
    /// The page does not fit; replay it into a fresh chunk.
    NoSpace,
}

/// A tuple returned by [`Chunk::fetch_tuple`].
#[derive(Debug, Clone)]
pub enum FetchedTuple<'a> {
    /// Stored heap tuple (Row, Hash, Block). `pos` is its chunk offset.
    Heap {
        ctid: ItemPointer,
        pos: usize,
        tuple: TupleView<'a>,
    },
    /// Deformed slot values.
    Slot(Vec<Value>),
}

impl FetchedTuple<'_> {
    /// Logical attribute values.
    pub fn to_values(&self, shape: &TupleShape) -> Result<Vec<Value>, ChunkError> {
        match self {
            FetchedTuple::Heap { tuple, .. } => tuple.deform(shape),
            FetchedTuple::Slot(values) => Ok(values.clone()),
        }
    }
}

/// Header plus column metadata length, MAXALIGNed.
pub fn head_length(ncols: usize) -> usize {
    max_align(CHUNK_HEAD_SIZE + COLUMN_META_SIZE * ncols)
}

/// Hash bucket count for `nitems` items (load factor at most 0.8).
pub fn hash_nslots(nitems: usize) -> usize {
    nitems + nitems / 4 + 1
}

/// Bytes of one slot-format row: values then null flags.
pub fn slot_row_size(ncols: usize) -> usize {
    max_align((8 + 1) * ncols)
}

// ============================================================================
// Chunk
// ============================================================================

/// A batch of tuples in one of the four physical formats.
pub struct Chunk {
    head: ChunkHead,
    format: ChunkFormat,
    /// Visible tuples per page of a Block chunk.
    block_visible: Vec<u32>,
    colmeta: Vec<ColumnMeta>,
    head_len: usize,
    body: Vec<u8>,
    shape: Arc<TupleShape>,
    source: Option<ChunkRef>,
    charge: Option<AllocCharge>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("format", &self.format())
            .field("length", &self.head.length)
            .field("usage", &self.head.usage)
            .field("nitems", &self.head.nitems)
            .field("nrooms", &self.head.nrooms)
            .field("nslots", &self.head.nslots)
            .finish()
    }
}

fn le_u32(b: &[u8], p: usize) -> u32 {
    u32::from_le_bytes([b[p], b[p + 1], b[p + 2], b[p + 3]])
}

fn le_u64(b: &[u8], p: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[p..p + 8]);
    u64::from_le_bytes(a)
}

impl Chunk {
    /// Allocate a zeroed chunk.
    ///
    /// Row and Hash take a byte budget and accept items until full. Slot
    /// takes a room count plus extra-region bytes. Block accepts either a
    /// byte budget (room count derived) or a room count.
    pub fn create(
        format: ChunkFormat,
        shape: Arc<TupleShape>,
        capacity: Capacity,
    ) -> Result<Chunk, ChunkError> {
        let head_len = head_length(shape.natts());
        let (length, nrooms) = match (format, capacity) {
            (ChunkFormat::Row | ChunkFormat::Hash, Capacity::Bytes(bytes)) => {
                let length = max_align_down(bytes);
                if length < head_len {
                    return Err(ChunkError::TooSmall {
                        format,
                        length,
                        required: head_len,
                    });
                }
                (length, UNBOUNDED_ROOMS)
            }
            (ChunkFormat::Slot, Capacity::Rooms { nrooms, extra }) => {
                let length = head_len + slot_row_size(shape.natts()) * nrooms + max_align(extra);
                (length, nrooms as u32)
            }
            (ChunkFormat::Block, Capacity::Bytes(bytes)) => {
                let mut nrooms = bytes.saturating_sub(head_len) / (INDEX_ENTRY + PAGE_SIZE);
                while nrooms > 0 && block_length(head_len, nrooms) > bytes {
                    nrooms -= 1;
                }
                if nrooms < 1 {
                    return Err(ChunkError::TooSmall {
                        format,
                        length: bytes,
                        required: block_length(head_len, 1),
                    });
                }
                (block_length(head_len, nrooms), nrooms as u32)
            }
            (ChunkFormat::Block, Capacity::Rooms { nrooms, .. }) => {
                (block_length(head_len, nrooms), nrooms as u32)
            }
            (format, _) => {
                return Err(ChunkError::FormatMismatch {
                    op: "create with this capacity",
                    format,
                })
            }
        };

        let head = ChunkHead {
            length: length as u32,
            ncols: shape.natts() as u32,
            nrooms,
            format: format as u32,
            table_id: shape.relid,
            has_notbyval: shape.has_notbyval() as u8,
            has_numeric: shape.has_numeric() as u8,
            ..Default::default()
        };
        Ok(Chunk {
            head,
            format,
            block_visible: Vec::new(),
            colmeta: ColumnMeta::for_shape(&shape),
            head_len,
            body: vec![0u8; length - head_len],
            shape,
            source: None,
            charge: None,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn format(&self) -> ChunkFormat {
        self.format
    }

    pub fn shape(&self) -> &Arc<TupleShape> {
        &self.shape
    }

    pub fn head(&self) -> &ChunkHead {
        &self.head
    }

    pub fn colmeta(&self) -> &[ColumnMeta] {
        &self.colmeta
    }

    pub fn length(&self) -> usize {
        self.head.length as usize
    }

    pub fn usage(&self) -> usize {
        self.head.usage as usize
    }

    pub fn nitems(&self) -> usize {
        self.head.nitems as usize
    }

    pub fn nrooms(&self) -> usize {
        self.head.nrooms as usize
    }

    pub fn nslots(&self) -> usize {
        self.head.nslots as usize
    }

    pub fn head_len(&self) -> usize {
        self.head_len
    }

    pub fn has_hash_index(&self) -> bool {
        self.head.nslots > 0
    }

    /// Chunk referenced by source-tagged slot pointers.
    pub fn source(&self) -> Option<&ChunkRef> {
        self.source.as_ref()
    }

    /// Keep `source` alive for as long as this chunk points into it.
    pub fn attach_source(&mut self, source: ChunkRef) {
        self.source = Some(source);
    }

    pub(crate) fn set_charge(&mut self, charge: AllocCharge) {
        self.charge = Some(charge);
    }

    /// Move the allocator charge to a chunk rebuilt from this one's image.
    pub(crate) fn take_charge(&mut self) -> Option<AllocCharge> {
        self.charge.take()
    }

    fn resize_charge(&mut self) {
        let length = self.length();
        if let Some(charge) = self.charge.as_mut() {
            charge.resize(length);
        }
    }

    // ------------------------------------------------------------------------
    // Raw access (absolute chunk offsets)
    // ------------------------------------------------------------------------

    /// Bytes from absolute offset `off` to the end of the chunk.
    pub fn bytes_from(&self, off: usize) -> Result<&[u8], ChunkError> {
        off.checked_sub(self.head_len)
            .and_then(|p| self.body.get(p..))
            .ok_or_else(|| ChunkError::Corrupt(format!("offset {} outside chunk body", off)))
    }

    fn read_u32(&self, off: usize) -> u32 {
        le_u32(&self.body, off - self.head_len)
    }

    fn write_u32(&mut self, off: usize, v: u32) {
        let p = off - self.head_len;
        self.body[p..p + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn write_bytes(&mut self, off: usize, bytes: &[u8]) {
        let p = off - self.head_len;
        self.body[p..p + bytes.len()].copy_from_slice(bytes);
    }

    fn row_index_pos(&self, i: usize) -> usize {
        self.head_len + INDEX_ENTRY * i
    }

    fn row_index(&self, i: usize) -> usize {
        self.read_u32(self.row_index_pos(i)) as usize
    }

    fn hash_slots_pos(&self) -> usize {
        self.head_len + max_align(INDEX_ENTRY * self.nitems())
    }

    /// Minimum length for `nitems` items and `usage` tail bytes.
    fn required_length(&self, nitems: usize, usage: usize) -> usize {
        let mut len = self.head_len + max_align(INDEX_ENTRY * nitems) + usage;
        if self.format() == ChunkFormat::Hash {
            len += max_align(INDEX_ENTRY * hash_nslots(nitems));
        }
        len
    }

    /// Length of the slot array for `nrooms` rows (Slot format).
    pub fn slot_length(&self, nrooms: usize) -> usize {
        self.head_len + slot_row_size(self.colmeta.len()) * nrooms
    }

    fn slot_row_pos(&self, row: usize) -> usize {
        self.head_len + slot_row_size(self.colmeta.len()) * row
    }

    fn block_index_pos(&self, i: usize) -> usize {
        self.head_len + INDEX_ENTRY * i
    }

    fn block_page_pos(&self, i: usize) -> usize {
        self.head_len + max_align(INDEX_ENTRY * self.nrooms()) + PAGE_SIZE * i
    }

    // ------------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------------

    /// Append one tuple. `Ok(false)` is the normal end-of-chunk signal.
    pub fn insert_tuple(&mut self, tuple: &HeapTuple) -> Result<bool, ChunkError> {
        match self.format() {
            ChunkFormat::Row => Ok(self.insert_row_item(tuple.as_bytes(), ItemPointer::default(), None)),
            ChunkFormat::Slot => {
                let values = tuple.view().deform(&self.shape)?;
                self.insert_values(&values)
            }
            format => Err(ChunkError::FormatMismatch {
                op: "insert_tuple",
                format,
            }),
        }
    }

    /// Append one tuple with a caller-computed hash value (Hash format).
    pub fn insert_hashed(&mut self, tuple: &HeapTuple, hash: u32) -> Result<bool, ChunkError> {
        if self.format() != ChunkFormat::Hash {
            return Err(ChunkError::FormatMismatch {
                op: "insert_hashed",
                format: self.format(),
            });
        }
        if self.has_hash_index() {
            return Err(ChunkError::HashIndexExists {
                nslots: self.head.nslots,
            });
        }
        Ok(self.insert_row_item(tuple.as_bytes(), ItemPointer::default(), Some(hash)))
    }

    /// Append raw tuple bytes as a row (or hash) item.
    pub(crate) fn insert_row_item(&mut self, tuple: &[u8], ctid: ItemPointer, hash: Option<u32>) -> bool {
        let nitems = self.nitems();
        if nitems >= self.nrooms() {
            return false;
        }
        let header = ROW_ITEM_HEADER + if hash.is_some() { HASH_ITEM_HEADER } else { 0 };
        let required = max_align(header + tuple.len());
        let usage = self.usage() + required;
        if self.required_length(nitems + 1, usage) > self.length() {
            return false;
        }

        let item_pos = self.length() - usage;
        let row_pos = match hash {
            Some(hash) => {
                self.write_u32(item_pos, hash);
                self.write_u32(item_pos + 4, 0);
                self.write_u32(item_pos + 8, nitems as u32);
                item_pos + HASH_ITEM_HEADER
            }
            None => item_pos,
        };
        self.write_u32(row_pos, tuple.len() as u32);
        self.write_u32(row_pos + 4, ctid.block);
        self.write_bytes(row_pos + 8, &(ctid.offset as u32).to_le_bytes());
        self.write_bytes(row_pos + ROW_ITEM_HEADER, tuple);
        self.write_u32(self.row_index_pos(nitems), row_pos as u32);
        self.head.nitems += 1;
        self.head.usage = usage as u32;
        true
    }

    /// Append deformed values (Slot format). By-reference values are copied
    /// into the extra region.
    pub fn insert_values(&mut self, values: &[Value]) -> Result<bool, ChunkError> {
        if self.format() != ChunkFormat::Slot {
            return Err(ChunkError::FormatMismatch {
                op: "insert_values",
                format: self.format(),
            });
        }
        if values.len() != self.colmeta.len() {
            return Err(ChunkError::ShapeMismatch {
                expected: self.colmeta.len(),
                got: values.len(),
            });
        }
        let mut extra = 0usize;
        for (i, (attr, value)) in self.shape.attrs().iter().zip(values).enumerate() {
            match value.data_type() {
                Some(t) if t != attr.data_type => {
                    return Err(ChunkError::TypeMismatch {
                        attnum: i + 1,
                        expected: attr.data_type,
                        got: t,
                    })
                }
                Some(t) if !t.typbyval() => extra += max_align(value.stored_size()),
                _ => {}
            }
        }
        if self.nitems() >= self.nrooms()
            || self.slot_length(self.nrooms()) + self.usage() + extra > self.length()
        {
            return Ok(false);
        }

        let mut datums = Vec::with_capacity(values.len());
        let mut isnull = Vec::with_capacity(values.len());
        for value in values {
            isnull.push(value.is_null());
            match value.data_type() {
                Some(t) if !t.typbyval() => {
                    let size = max_align(value.stored_size());
                    let usage = self.usage() + size;
                    let pos = self.length() - usage;
                    let mut buf = Vec::with_capacity(size);
                    value.append_stored(&mut buf);
                    self.write_bytes(pos, &buf);
                    self.head.usage = usage as u32;
                    datums.push(pos as u64);
                }
                _ => datums.push(value.to_datum()),
            }
        }
        let row = self.nitems();
        self.slot_put_row(row, &datums, &isnull);
        self.head.nitems += 1;
        Ok(true)
    }

    /// Load every tuple of `page` visible to `snapshot`.
    ///
    /// The fit check is conservative (every normal line pointer counts), so
    /// a page either loads completely or not at all.
    pub fn insert_from_page(
        &mut self,
        block: u32,
        page: PageView<'_>,
        snapshot: &Snapshot,
    ) -> Result<PageLoad, ChunkError> {
        match self.format() {
            ChunkFormat::Row => Ok(self.insert_page_rows(block, page, snapshot)),
            ChunkFormat::Block => self.insert_page_raw(block, page, snapshot),
            format => Err(ChunkError::FormatMismatch {
                op: "insert_from_page",
                format,
            }),
        }
    }

    fn insert_page_rows(&mut self, block: u32, page: PageView<'_>, snapshot: &Snapshot) -> PageLoad {
        let mut ntup = 0usize;
        let mut consume = 0usize;
        for lineoff in 1..=page.line_count() as u16 {
            if let Some(lp) = page.line_pointer(lineoff) {
                if lp.state == LineState::Normal {
                    ntup += 1;
                    consume += max_align(ROW_ITEM_HEADER + lp.len as usize);
                }
            }
        }
        if self.nitems() + ntup > self.nrooms()
            || self.required_length(self.nitems() + ntup, self.usage() + consume) > self.length()
        {
            return PageLoad::NoSpace;
        }
        let mut loaded = 0;
        for (lineoff, tuple) in page.visible_tuples(snapshot) {
            let ctid = ItemPointer {
                block,
                offset: lineoff,
            };
            if self.insert_row_item(tuple.bytes(), ctid, None) {
                loaded += 1;
            }
        }
        PageLoad::Loaded(loaded)
    }

    fn insert_page_raw(
        &mut self,
        block: u32,
        page: PageView<'_>,
        snapshot: &Snapshot,
    ) -> Result<PageLoad, ChunkError> {
        let index = self.nitems();
        if index >= self.nrooms() {
            return Ok(PageLoad::NoSpace);
        }
        let mut copy = Page::from_bytes(page.bytes())?;
        let mut visible = 0;
        if !page.is_all_visible() {
            for lineoff in 1..=page.line_count() as u16 {
                if let Some(tuple) = page.tuple(lineoff) {
                    if snapshot.tuple_visible(&tuple) {
                        visible += 1;
                    } else {
                        copy.set_line_state(lineoff, LineState::Dead);
                    }
                }
            }
        } else {
            visible = live_lines(page).count();
        }
        let pos = self.block_page_pos(index);
        self.write_bytes(pos, copy.as_bytes());
        self.write_u32(self.block_index_pos(index), block);
        self.head.nrows_per_block = self.head.nrows_per_block.max(page.line_count() as u32);
        self.head.nitems += 1;
        self.block_visible.push(visible as u32);
        Ok(PageLoad::Loaded(visible))
    }

    // ------------------------------------------------------------------------
    // Hash index
    // ------------------------------------------------------------------------

    /// Chain every item into bucket `hash % nslots`.
    pub fn build_hash_index(&mut self) -> Result<(), ChunkError> {
        if self.format() != ChunkFormat::Hash {
            return Err(ChunkError::FormatMismatch {
                op: "build_hash_index",
                format: self.format(),
            });
        }
        if self.has_hash_index() {
            return Err(ChunkError::HashIndexExists {
                nslots: self.head.nslots,
            });
        }
        let nitems = self.nitems();
        let nslots = hash_nslots(nitems);
        let slots_pos = self.hash_slots_pos();
        if slots_pos + max_align(INDEX_ENTRY * nslots) > self.length() - self.usage() {
            return Err(ChunkError::Corrupt("no room left for hash slots".into()));
        }
        for bucket in 0..nslots {
            self.write_u32(slots_pos + INDEX_ENTRY * bucket, 0);
        }
        for i in 0..nitems {
            let item_pos = self.row_index(i) - HASH_ITEM_HEADER;
            let hash = self.read_u32(item_pos) as usize;
            let slot_pos = slots_pos + INDEX_ENTRY * (hash % nslots);
            let head = self.read_u32(slot_pos);
            self.write_u32(item_pos + 4, head);
            self.write_u32(slot_pos, item_pos as u32);
        }
        self.head.nslots = nslots as u32;
        Ok(())
    }

    /// Item indexes chained into one bucket.
    pub fn bucket_items(&self, bucket: usize) -> Result<Vec<usize>, ChunkError> {
        if !self.has_hash_index() {
            return Err(ChunkError::FormatMismatch {
                op: "bucket_items without hash index",
                format: self.format(),
            });
        }
        if bucket >= self.nslots() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        let mut pos = self.read_u32(self.hash_slots_pos() + INDEX_ENTRY * bucket) as usize;
        while pos != 0 {
            if items.len() > self.nitems() {
                return Err(ChunkError::Corrupt(format!("hash chain cycle in bucket {}", bucket)));
            }
            items.push(self.read_u32(pos + 8) as usize);
            pos = self.read_u32(pos + 4) as usize;
        }
        Ok(items)
    }

    /// Item indexes whose stored hash equals `hash`.
    pub fn lookup_hash(&self, hash: u32) -> Result<Vec<usize>, ChunkError> {
        let bucket = hash as usize % self.nslots().max(1);
        Ok(self
            .bucket_items(bucket)?
            .into_iter()
            .filter(|&i| self.read_u32(self.row_index(i) - HASH_ITEM_HEADER) == hash)
            .collect())
    }

    // ------------------------------------------------------------------------
    // Expand / shrink
    // ------------------------------------------------------------------------

    /// End of the row index (and hash slots, built or reserved).
    fn front_end(&self) -> usize {
        self.required_length(self.nitems(), 0)
    }

    /// Add `delta` (possibly negative) to every stored item offset.
    fn relocate_offsets(&mut self, delta: isize) {
        let shift = |v: u32| (v as isize + delta) as u32;
        for i in 0..self.nitems() {
            let pos = self.row_index_pos(i);
            let v = self.read_u32(pos);
            self.write_u32(pos, shift(v));
        }
        if self.has_hash_index() {
            let slots_pos = self.hash_slots_pos();
            for bucket in 0..self.nslots() {
                let pos = slots_pos + INDEX_ENTRY * bucket;
                let v = self.read_u32(pos);
                if v != 0 {
                    self.write_u32(pos, shift(v));
                }
            }
            for i in 0..self.nitems() {
                let next_pos = self.row_index(i) - HASH_ITEM_HEADER + 4;
                let v = self.read_u32(next_pos);
                if v != 0 {
                    self.write_u32(next_pos, shift(v));
                }
            }
        }
    }

    /// Reallocate to `new_length`, moving the tail payload to the new end.
    pub fn expand(mut self, new_length: usize) -> Result<Chunk, ChunkError> {
        let new_length = max_align_down(new_length);
        let old_length = self.length();
        if new_length <= old_length {
            return Ok(self);
        }
        match self.format() {
            ChunkFormat::Row | ChunkFormat::Hash => {
                let shift = new_length - old_length;
                let tail = old_length - self.usage() - self.head_len;
                let front = self.front_end() - self.head_len;
                let mut body = vec![0u8; new_length - self.head_len];
                body[..front].copy_from_slice(&self.body[..front]);
                body[tail + shift..].copy_from_slice(&self.body[tail..]);
                self.body = body;
                self.head.length = new_length as u32;
                self.relocate_offsets(shift as isize);
            }
            ChunkFormat::Slot => {
                if self.usage() > 0 {
                    return Err(ChunkError::ExtraInUse {
                        format: ChunkFormat::Slot,
                        usage: self.head.usage,
                    });
                }
                self.body.resize(new_length - self.head_len, 0);
                self.head.length = new_length as u32;
            }
            ChunkFormat::Block => {
                return Err(ChunkError::FormatMismatch {
                    op: "expand",
                    format: ChunkFormat::Block,
                })
            }
        }
        self.resize_charge();
        Ok(self)
    }

    /// Compact in place. Returns `Ok(false)` when the savings are below
    /// `threshold` or below 8 bytes per item.
    pub fn shrink(&mut self, threshold: usize) -> Result<bool, ChunkError> {
        let (new_length, nrooms) = match self.format() {
            ChunkFormat::Row | ChunkFormat::Hash => {
                (max_align(self.front_end() + self.usage()), self.head.nrooms)
            }
            ChunkFormat::Slot => {
                if self.usage() > 0 {
                    return Err(ChunkError::ExtraInUse {
                        format: ChunkFormat::Slot,
                        usage: self.head.usage,
                    });
                }
                (self.slot_length(self.nitems()), self.head.nitems)
            }
            ChunkFormat::Block => {
                return Err(ChunkError::FormatMismatch {
                    op: "shrink",
                    format: ChunkFormat::Block,
                })
            }
        };
        let shift = self.length().saturating_sub(new_length);
        if shift == 0 || shift < threshold || shift < 8 * self.nitems() {
            return Ok(false);
        }
        if self.format() != ChunkFormat::Slot {
            let tail = self.length() - self.usage() - self.head_len;
            self.body.copy_within(tail.., tail - shift);
            self.relocate_offsets(-(shift as isize));
        }
        self.body.truncate(new_length - self.head_len);
        self.head.length = new_length as u32;
        self.head.nrooms = nrooms;
        self.resize_charge();
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------------

    /// Tuple by logical index; `Ok(None)` past the end.
    pub fn fetch_tuple(&self, index: usize) -> Result<Option<FetchedTuple<'_>>, ChunkError> {
        match self.format() {
            ChunkFormat::Row | ChunkFormat::Hash => {
                if index >= self.nitems() {
                    return Ok(None);
                }
                self.row_item(self.row_index(index)).map(Some)
            }
            ChunkFormat::Slot => {
                if index >= self.nitems() {
                    return Ok(None);
                }
                self.slot_values(index).map(|v| Some(FetchedTuple::Slot(v)))
            }
            ChunkFormat::Block => {
                let mut remaining = index;
                for (i, &count) in self.block_visible.iter().enumerate() {
                    if remaining >= count as usize {
                        remaining -= count as usize;
                        continue;
                    }
                    let page = self.block_page(i)?;
                    return match live_lines(page).nth(remaining) {
                        Some(lineoff) => self.fetch_item(((i as u32) << 16) | lineoff as u32),
                        None => Ok(None),
                    };
                }
                Ok(None)
            }
        }
    }

    /// Logical values by index; `Ok(None)` past the end.
    pub fn values_at(&self, index: usize) -> Result<Option<Vec<Value>>, ChunkError> {
        match self.fetch_tuple(index)? {
            Some(t) => t.to_values(&self.shape).map(Some),
            None => Ok(None),
        }
    }

    /// Number of addressable tuples (visible tuples across pages for Block).
    pub fn tuple_count(&self) -> usize {
        match self.format() {
            ChunkFormat::Block => self.block_visible.iter().map(|&n| n as usize).sum(),
            _ => self.nitems(),
        }
    }

    /// Iterate over all tuples in index order.
    pub fn iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            chunk: self,
            index: 0,
            page: 0,
            lineoff: 0,
        }
    }

    fn row_item(&self, row_pos: usize) -> Result<FetchedTuple<'_>, ChunkError> {
        let t_len = self.read_u32(row_pos) as usize;
        let ctid = ItemPointer {
            block: self.read_u32(row_pos + 4),
            offset: self.read_u32(row_pos + 8) as u16,
        };
        let pos = row_pos + ROW_ITEM_HEADER;
        let bytes = self
            .bytes_from(pos)?
            .get(..t_len)
            .ok_or_else(|| ChunkError::Corrupt(format!("row item at {} overruns chunk", row_pos)))?;
        Ok(FetchedTuple::Heap {
            ctid,
            pos,
            tuple: TupleView::new(bytes)?,
        })
    }

    /// Raw datums and null flags of one slot row.
    pub fn slot_row(&self, row: usize) -> (Vec<u64>, Vec<bool>) {
        let ncols = self.colmeta.len();
        let pos = self.slot_row_pos(row) - self.head_len;
        let datums = (0..ncols).map(|c| le_u64(&self.body, pos + 8 * c)).collect();
        let isnull = (0..ncols).map(|c| self.body[pos + 8 * ncols + c] != 0).collect();
        (datums, isnull)
    }

    pub(crate) fn slot_put_row(&mut self, row: usize, datums: &[u64], isnull: &[bool]) {
        let ncols = self.colmeta.len();
        let pos = self.slot_row_pos(row) - self.head_len;
        for (c, d) in datums.iter().enumerate() {
            self.body[pos + 8 * c..pos + 8 * c + 8].copy_from_slice(&d.to_le_bytes());
        }
        for (c, n) in isnull.iter().enumerate() {
            self.body[pos + 8 * ncols + c] = *n as u8;
        }
    }

    pub(crate) fn set_nitems(&mut self, nitems: usize) {
        self.head.nitems = nitems as u32;
    }

    pub(crate) fn set_usage(&mut self, usage: usize) {
        self.head.usage = usage as u32;
    }

    fn slot_values(&self, row: usize) -> Result<Vec<Value>, ChunkError> {
        let (datums, isnull) = self.slot_row(row);
        let mut values = Vec::with_capacity(datums.len());
        for ((attr, datum), null) in self.shape.attrs().iter().zip(datums).zip(isnull) {
            if null {
                values.push(Value::Null);
            } else if let Some(v) = Value::from_datum(attr.data_type, datum) {
                values.push(v);
            } else {
                values.push(Value::decode_stored(attr.data_type, self.resolve_slot_ptr(datum)?)?);
            }
        }
        Ok(values)
    }

    /// Bytes addressed by a by-reference slot datum.
    pub fn resolve_slot_ptr(&self, datum: u64) -> Result<&[u8], ChunkError> {
        if datum & SLOT_PTR_SOURCE != 0 {
            let source = self
                .source
                .as_ref()
                .ok_or_else(|| ChunkError::Corrupt("source pointer without source chunk".into()))?;
            source.bytes_from((datum & !SLOT_PTR_SOURCE) as usize)
        } else {
            self.bytes_from(datum as usize)
        }
    }

    /// Page `i` of a Block chunk.
    pub fn block_page(&self, i: usize) -> Result<PageView<'_>, ChunkError> {
        let pos = self.block_page_pos(i);
        let bytes = self
            .bytes_from(pos)?
            .get(..PAGE_SIZE)
            .ok_or_else(|| ChunkError::Corrupt(format!("block page {} truncated", i)))?;
        PageView::new(bytes)
    }

    /// Block number of page `i` of a Block chunk.
    pub fn block_number(&self, i: usize) -> u32 {
        self.read_u32(self.block_index_pos(i))
    }

    // ------------------------------------------------------------------------
    // Item ids
    // ------------------------------------------------------------------------

    /// Ids of every addressable tuple, in iteration order. A row index for
    /// Row, Hash, and Slot; `(page << 16) | lineoff` for Block, the encoding
    /// the quals kernels report.
    pub fn item_ids(&self) -> Vec<u32> {
        match self.format() {
            ChunkFormat::Block => {
                let mut ids = Vec::new();
                for i in 0..self.nitems() {
                    let Ok(page) = self.block_page(i) else {
                        continue;
                    };
                    for lineoff in 1..=page.line_count() as u16 {
                        if page.tuple(lineoff).is_some() {
                            ids.push(((i as u32) << 16) | lineoff as u32);
                        }
                    }
                }
                ids
            }
            _ => (0..self.nitems() as u32).collect(),
        }
    }

    /// Tuple by item id (see [`Chunk::item_ids`]).
    pub fn fetch_item(&self, item_id: u32) -> Result<Option<FetchedTuple<'_>>, ChunkError> {
        if self.format() != ChunkFormat::Block {
            return self.fetch_tuple(item_id as usize);
        }
        let (index, lineoff) = ((item_id >> 16) as usize, (item_id & 0xffff) as u16);
        if index >= self.nitems() {
            return Ok(None);
        }
        let page = self.block_page(index)?;
        let (Some(lp), Some(tuple)) = (page.line_pointer(lineoff), page.tuple(lineoff)) else {
            return Ok(None);
        };
        Ok(Some(FetchedTuple::Heap {
            ctid: ItemPointer {
                block: self.block_number(index),
                offset: lineoff,
            },
            pos: self.block_page_pos(index) + lp.offset as usize,
            tuple,
        }))
    }

    // ------------------------------------------------------------------------
    // Device image
    // ------------------------------------------------------------------------

    /// Serialize header, column metadata, and body into one buffer of
    /// `length` bytes, the layout the kernels address.
    pub fn to_device_image(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length());
        let h = &self.head;
        for v in [
            h.length,
            h.usage,
            h.ncols,
            h.nitems,
            h.nrooms,
            h.nslots,
            h.format,
            h.table_id,
            h.nrows_per_block,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&[h.has_notbyval, h.has_numeric, 0, 0]);
        out.extend_from_slice(&[0u8; 8]);
        for cm in &self.colmeta {
            out.push(cm.attbyval);
            out.push(cm.attalign);
            out.extend_from_slice(&cm.attlen.to_le_bytes());
            out.extend_from_slice(&cm.attnum.to_le_bytes());
            out.extend_from_slice(&0i16.to_le_bytes());
            out.extend_from_slice(&cm.attcacheoff.to_le_bytes());
            out.extend_from_slice(&cm.type_id.to_le_bytes());
            out.extend_from_slice(&cm.typmod.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        out.resize(self.head_len, 0);
        out.extend_from_slice(&self.body);
        out
    }

    /// Rebuild a chunk from a device image. `shape` supplies the logical
    /// attribute list the metadata was derived from.
    pub fn from_device_image(bytes: &[u8], shape: Arc<TupleShape>) -> Result<Chunk, ChunkError> {
        if bytes.len() < CHUNK_HEAD_SIZE {
            return Err(ChunkError::Corrupt(format!("image of {} bytes", bytes.len())));
        }
        let f = |i: usize| le_u32(bytes, 4 * i);
        let head = ChunkHead {
            length: f(0),
            usage: f(1),
            ncols: f(2),
            nitems: f(3),
            nrooms: f(4),
            nslots: f(5),
            format: f(6),
            table_id: f(7),
            nrows_per_block: f(8),
            has_notbyval: bytes[36],
            has_numeric: bytes[37],
            ..Default::default()
        };
        let ncols = head.ncols as usize;
        if ncols != shape.natts() {
            return Err(ChunkError::ShapeMismatch {
                expected: shape.natts(),
                got: ncols,
            });
        }
        let format = ChunkFormat::from_u32(head.format)
            .ok_or_else(|| ChunkError::Corrupt(format!("unknown format {}", head.format)))?;
        let head_len = head_length(ncols);
        let length = head.length as usize;
        if bytes.len() != length || length < head_len {
            return Err(ChunkError::Corrupt(format!(
                "image of {} bytes, header says {}",
                bytes.len(),
                length
            )));
        }
        let colmeta = (0..ncols)
            .map(|c| {
                let p = CHUNK_HEAD_SIZE + COLUMN_META_SIZE * c;
                let i16_at = |o: usize| i16::from_le_bytes([bytes[p + o], bytes[p + o + 1]]);
                ColumnMeta {
                    attbyval: bytes[p],
                    attalign: bytes[p + 1],
                    attlen: i16_at(2),
                    attnum: i16_at(4),
                    attcacheoff: le_u32(bytes, p + 8) as i32,
                    type_id: le_u32(bytes, p + 12),
                    typmod: le_u32(bytes, p + 16) as i32,
                    ..Default::default()
                }
            })
            .collect::<Vec<_>>();
        for (cm, attr) in colmeta.iter().zip(shape.attrs()) {
            if DataType::from_type_id(cm.type_id) != Some(attr.data_type) {
                return Err(ChunkError::Corrupt(format!(
                    "column {} type id {} does not match {}",
                    cm.attnum, cm.type_id, attr.data_type
                )));
            }
        }
        let mut chunk = Chunk {
            head,
            format,
            block_visible: Vec::new(),
            colmeta,
            head_len,
            body: bytes[head_len..].to_vec(),
            shape,
            source: None,
            charge: None,
        };
        if format == ChunkFormat::Block {
            chunk.block_visible = (0..chunk.nitems())
                .map(|i| chunk.block_page(i).map(|page| live_lines(page).count() as u32))
                .collect::<Result<_, _>>()?;
        }
        Ok(chunk)
    }
}

/// Line offsets of the tuples a Block page still carries.
fn live_lines<'a>(page: PageView<'a>) -> impl Iterator<Item = u16> + 'a {
    (1..=page.line_count() as u16).filter(move |&off| page.tuple(off).is_some())
}

fn block_length(head_len: usize, nrooms: usize) -> usize {
    head_len + max_align(INDEX_ENTRY * nrooms) + PAGE_SIZE * nrooms
}

/// Iterator over the tuples of a chunk, in index order.
pub struct ChunkIter<'a> {
    chunk: &'a Chunk,
    index: usize,
    page: usize,
    lineoff: u16,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<FetchedTuple<'a>, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunk;
        if chunk.format() != ChunkFormat::Block {
            let item = chunk.fetch_tuple(self.index).transpose();
            self.index += 1;
            return item;
        }
        while self.page < chunk.nitems() {
            let page = match chunk.block_page(self.page) {
                Ok(page) => page,
                Err(e) => {
                    self.page = chunk.nitems();
                    return Some(Err(e));
                }
            };
            while (self.lineoff as usize) < page.line_count() {
                self.lineoff += 1;
                let Some(lp) = page.line_pointer(self.lineoff) else {
                    continue;
                };
                if let Some(tuple) = page.tuple(self.lineoff) {
                    return Some(Ok(FetchedTuple::Heap {
                        ctid: ItemPointer {
                            block: chunk.block_number(self.page),
                            offset: self.lineoff,
                        },
                        pos: chunk.block_page_pos(self.page) + lp.offset as usize,
                        tuple,
                    }));
                }
            }
            self.page += 1;
            self.lineoff = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::AttrDesc;
    use crate::storage::value::Numeric;

    fn shape() -> Arc<TupleShape> {
        Arc::new(TupleShape::new(
            3,
            vec![
                AttrDesc::new("id", DataType::Int4),
                AttrDesc::new("name", DataType::Text),
                AttrDesc::new("price", DataType::Numeric),
            ],
        ))
    }

    fn row(i: i32) -> Vec<Value> {
        vec![
            Value::Int4(i),
            Value::Text(format!("item-{}", i)),
            Value::Numeric(Numeric::new(i as i128 * 125, 2)),
        ]
    }

    fn tuple(i: i32) -> HeapTuple {
        HeapTuple::form(&shape(), &row(i), 1).unwrap()
    }

    fn filled(format: ChunkFormat, n: i32) -> Chunk {
        let mut chunk = match format {
            ChunkFormat::Slot => Chunk::create(
                format,
                shape(),
                Capacity::Rooms {
                    nrooms: n as usize,
                    extra: 64 * n as usize,
                },
            ),
            _ => Chunk::create(format, shape(), Capacity::Bytes(64 * 1024)),
        }
        .unwrap();
        for i in 0..n {
            let ok = match format {
                ChunkFormat::Hash => chunk.insert_hashed(&tuple(i), i as u32 * 7).unwrap(),
                _ => chunk.insert_tuple(&tuple(i)).unwrap(),
            };
            assert!(ok, "insert {} failed", i);
        }
        chunk
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    #[test]
    fn test_create_lengths() {
        let row = Chunk::create(ChunkFormat::Row, shape(), Capacity::Bytes(1003)).unwrap();
        assert_eq!(row.length(), 1000);
        assert_eq!(row.head_len(), head_length(3));
        assert_eq!(row.head().has_notbyval, 1);
        assert_eq!(row.head().has_numeric, 1);

        let slot = Chunk::create(
            ChunkFormat::Slot,
            shape(),
            Capacity::Rooms {
                nrooms: 10,
                extra: 100,
            },
        )
        .unwrap();
        assert_eq!(slot.length(), head_length(3) + slot_row_size(3) * 10 + 104);
        assert_eq!(slot.nrooms(), 10);

        let block =
            Chunk::create(ChunkFormat::Block, shape(), Capacity::Bytes(3 * PAGE_SIZE + 500))
                .unwrap();
        assert_eq!(block.nrooms(), 3);
        assert!(block.length() <= 3 * PAGE_SIZE + 500);

        let err = Chunk::create(ChunkFormat::Hash, shape(), Capacity::Bytes(16)).unwrap_err();
        assert!(matches!(err, ChunkError::TooSmall { .. }));
        let err = Chunk::create(ChunkFormat::Block, shape(), Capacity::Bytes(PAGE_SIZE)).unwrap_err();
        assert!(matches!(err, ChunkError::TooSmall { .. }));
    }

    #[test]
    fn test_colmeta_matches_shape() {
        let chunk = Chunk::create(ChunkFormat::Row, shape(), Capacity::Bytes(4096)).unwrap();
        let meta = chunk.colmeta();
        assert_eq!(meta.len(), 3);
        assert_eq!(meta[0].attcacheoff, 16);
        assert_eq!(meta[1].attcacheoff, -1);
        assert_eq!(meta[1].attlen, -1);
        assert_eq!(meta[2].type_id, DataType::Numeric.type_id());
        assert_eq!(meta[2].attbyval, 0);
    }

    // -----------------------------------------------------------------------
    // Insert / fetch
    // -----------------------------------------------------------------------

    #[test]
    fn test_row_insert_fetch() {
        let chunk = filled(ChunkFormat::Row, 20);
        assert_eq!(chunk.nitems(), 20);
        for i in 0..20 {
            assert_eq!(chunk.values_at(i).unwrap().unwrap(), row(i as i32));
        }
        assert!(chunk.fetch_tuple(20).unwrap().is_none());
    }

    #[test]
    fn test_slot_insert_fetch() {
        let chunk = filled(ChunkFormat::Slot, 8);
        assert!(chunk.usage() > 0);
        for i in 0..8 {
            assert_eq!(chunk.values_at(i).unwrap().unwrap(), row(i as i32));
        }
    }

    #[test]
    fn test_slot_room_limit() {
        let mut chunk = filled(ChunkFormat::Slot, 4);
        assert!(!chunk.insert_tuple(&tuple(99)).unwrap());
        assert_eq!(chunk.nitems(), 4);
    }

    #[test]
    fn test_insert_wrong_format() {
        let mut hash = Chunk::create(ChunkFormat::Hash, shape(), Capacity::Bytes(4096)).unwrap();
        assert!(matches!(
            hash.insert_tuple(&tuple(1)),
            Err(ChunkError::FormatMismatch { .. })
        ));
        let mut row = Chunk::create(ChunkFormat::Row, shape(), Capacity::Bytes(4096)).unwrap();
        assert!(matches!(
            row.insert_hashed(&tuple(1), 1),
            Err(ChunkError::FormatMismatch { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Hash
    // -----------------------------------------------------------------------

    #[test]
    fn test_hash_build_and_lookup() {
        let mut chunk = filled(ChunkFormat::Hash, 30);
        chunk.build_hash_index().unwrap();
        assert_eq!(chunk.nslots(), hash_nslots(30));
        assert_eq!(chunk.lookup_hash(7 * 12).unwrap(), vec![12]);
        assert!(chunk.lookup_hash(5).unwrap().is_empty());
        assert!(matches!(
            chunk.build_hash_index(),
            Err(ChunkError::HashIndexExists { .. })
        ));
        assert!(matches!(
            chunk.insert_hashed(&tuple(1), 1),
            Err(ChunkError::HashIndexExists { .. })
        ));
    }

    #[test]
    fn test_build_hash_index_requires_hash_format() {
        let mut chunk = filled(ChunkFormat::Row, 3);
        assert!(matches!(
            chunk.build_hash_index(),
            Err(ChunkError::FormatMismatch { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Expand / shrink
    // -----------------------------------------------------------------------

    #[test]
    fn test_expand_preserves_items() {
        let chunk = filled(ChunkFormat::Row, 10);
        let old_len = chunk.length();
        let same = chunk.expand(old_len - 8).unwrap();
        assert_eq!(same.length(), old_len);
        let bigger = same.expand(old_len * 2).unwrap();
        assert_eq!(bigger.length(), old_len * 2);
        for i in 0..10 {
            assert_eq!(bigger.values_at(i).unwrap().unwrap(), row(i as i32));
        }
    }

    #[test]
    fn test_expand_slot_with_extra_fails() {
        let chunk = filled(ChunkFormat::Slot, 2);
        let len = chunk.length();
        assert!(matches!(
            chunk.expand(len * 2),
            Err(ChunkError::ExtraInUse { .. })
        ));
    }

    #[test]
    fn test_shrink_threshold_and_hash_rebuild() {
        let mut chunk = filled(ChunkFormat::Hash, 10);
        chunk.build_hash_index().unwrap();
        let before = chunk.length();
        assert!(!chunk.shrink(before).unwrap(), "savings below threshold");
        assert!(chunk.shrink(PAGE_SIZE).unwrap());
        assert!(chunk.length() < before);
        for i in 0..10 {
            assert_eq!(chunk.values_at(i).unwrap().unwrap(), row(i as i32));
            assert_eq!(chunk.lookup_hash(i as u32 * 7).unwrap(), vec![i]);
        }
    }

    #[test]
    fn test_shrink_slot() {
        let mut chunk = Chunk::create(
            ChunkFormat::Slot,
            Arc::new(TupleShape::new(1, vec![AttrDesc::new("v", DataType::Int8)])),
            Capacity::Rooms {
                nrooms: 2000,
                extra: 0,
            },
        )
        .unwrap();
        for v in 0..10 {
            assert!(chunk.insert_values(&[Value::Int8(v)]).unwrap());
        }
        assert!(chunk.shrink(PAGE_SIZE).unwrap());
        assert_eq!(chunk.nrooms(), 10);
        assert_eq!(chunk.values_at(9).unwrap().unwrap(), vec![Value::Int8(9)]);
    }

    // -----------------------------------------------------------------------
    // Pages
    // -----------------------------------------------------------------------

    fn page_of(ids: std::ops::Range<i32>, xmin: u32) -> Page {
        let mut page = Page::new();
        for i in ids {
            page.add_tuple(&HeapTuple::form(&shape(), &row(i), xmin).unwrap())
                .unwrap();
        }
        page
    }

    #[test]
    fn test_insert_from_page_filters_invisible() {
        let mut page = page_of(0..5, 2);
        page.mark_deleted(2, 3);
        let mut chunk = Chunk::create(ChunkFormat::Row, shape(), Capacity::Bytes(64 * 1024)).unwrap();
        let load = chunk.insert_from_page(4, page.view(), &Snapshot::at(10)).unwrap();
        assert_eq!(load, PageLoad::Loaded(4));
        let ids: Vec<Value> = (0..4)
            .map(|i| chunk.values_at(i).unwrap().unwrap()[0].clone())
            .collect();
        assert_eq!(ids, vec![Value::Int4(0), Value::Int4(2), Value::Int4(3), Value::Int4(4)]);
        match chunk.fetch_tuple(1).unwrap().unwrap() {
            FetchedTuple::Heap { ctid, .. } => assert_eq!(ctid, ItemPointer { block: 4, offset: 3 }),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insert_from_page_no_space() {
        let page = page_of(0..40, 1);
        let mut chunk = Chunk::create(ChunkFormat::Row, shape(), Capacity::Bytes(1024)).unwrap();
        let load = chunk.insert_from_page(0, page.view(), &Snapshot::at(5)).unwrap();
        assert_eq!(load, PageLoad::NoSpace);
        assert_eq!(chunk.nitems(), 0, "a page that does not fit loads nothing");
    }

    #[test]
    fn test_block_format_pages() {
        let mut chunk = Chunk::create(
            ChunkFormat::Block,
            shape(),
            Capacity::Rooms {
                nrooms: 2,
                extra: 0,
            },
        )
        .unwrap();
        let mut first = page_of(0..3, 1);
        first.mark_deleted(1, 2);
        let second = page_of(3..5, 9);
        let snap = Snapshot::at(5);
        assert_eq!(chunk.insert_from_page(0, first.view(), &snap).unwrap(), PageLoad::Loaded(2));
        assert_eq!(chunk.insert_from_page(1, second.view(), &snap).unwrap(), PageLoad::Loaded(0));
        assert_eq!(
            chunk.insert_from_page(2, first.view(), &snap).unwrap(),
            PageLoad::NoSpace
        );
        assert_eq!(chunk.tuple_count(), 2);
        assert_eq!(chunk.values_at(1).unwrap().unwrap(), row(2));
        assert!(chunk.values_at(2).unwrap().is_none());
    }

    #[test]
    fn test_block_fetch_by_index_spans_pages() {
        let mut chunk = Chunk::create(
            ChunkFormat::Block,
            shape(),
            Capacity::Rooms {
                nrooms: 3,
                extra: 0,
            },
        )
        .unwrap();
        let mut first = page_of(0..4, 1);
        first.mark_deleted(2, 2);
        let snap = Snapshot::at(5);
        for (block, page) in [first, page_of(4..6, 1), page_of(6..9, 1)].iter().enumerate() {
            assert!(matches!(
                chunk.insert_from_page(block as u32, page.view(), &snap).unwrap(),
                PageLoad::Loaded(_)
            ));
        }
        let expected: Vec<Vec<Value>> = [0, 2, 3, 4, 5, 6, 7, 8].into_iter().map(row).collect();
        assert_eq!(chunk.tuple_count(), expected.len());

        let image = Chunk::from_device_image(&chunk.to_device_image(), shape()).unwrap();
        for c in [&chunk, &image] {
            let by_index: Vec<Vec<Value>> = (0..c.tuple_count())
                .map(|i| c.values_at(i).unwrap().unwrap())
                .collect();
            assert_eq!(by_index, expected);
            assert!(c.values_at(expected.len()).unwrap().is_none());
        }
        match image.fetch_tuple(4).unwrap().unwrap() {
            FetchedTuple::Heap { ctid, .. } => assert_eq!(ctid, ItemPointer { block: 1, offset: 2 }),
            other => panic!("unexpected {:?}", other),
        }
    }

    // -----------------------------------------------------------------------
    // Device image
    // -----------------------------------------------------------------------

    #[test]
    fn test_device_image_roundtrip() {
        let mut chunk = filled(ChunkFormat::Hash, 5);
        chunk.build_hash_index().unwrap();
        let image = chunk.to_device_image();
        assert_eq!(image.len(), chunk.length());
        let back = Chunk::from_device_image(&image, shape()).unwrap();
        assert_eq!(back.head(), chunk.head());
        assert_eq!(back.colmeta(), chunk.colmeta());
        assert_eq!(back.lookup_hash(14).unwrap(), vec![2]);

        let other = Arc::new(TupleShape::new(3, vec![AttrDesc::new("x", DataType::Int4)]));
        assert!(Chunk::from_device_image(&image, other).is_err());
    }

    #[test]
    fn test_device_image_rejects_unknown_format() {
        let mut image = filled(ChunkFormat::Row, 3).to_device_image();
        image[24..28].copy_from_slice(&9u32.to_le_bytes());
        match Chunk::from_device_image(&image, shape()) {
            Err(ChunkError::Corrupt(msg)) => assert!(msg.contains("unknown format 9"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }
}
