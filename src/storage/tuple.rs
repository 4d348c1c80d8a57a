//! Heap tuple layout: form, inspect, and deform stored tuples.
//!
//! ```text
//! offset 0   t_xmin     u32   inserting transaction
//! offset 4   t_xmax     u32   deleting transaction (0 = live)
//! offset 8   t_natts    u16
//! offset 10  t_infomask u16   HEAP_HASNULL | HEAP_HASVARWIDTH
//! offset 12  t_hoff     u16   start of attribute data (MAXALIGNed)
//! offset 14  padding    u16
//! offset 16  null bitmap      only with HEAP_HASNULL; bit set = NULL
//! t_hoff     attributes       each aligned to its type relative to offset 0
//! ```
//!
//! NULL attributes occupy no data bytes.

use crate::error::ChunkError;
use crate::storage::schema::TupleShape;
use crate::storage::types::DataType;
use crate::storage::value::{stored_len, Value};
use crate::storage::{max_align, type_align};

/// Size of the fixed tuple header.
pub const HEAP_TUPLE_HEADER_SIZE: usize = 16;

/// Tuple carries a null bitmap.
pub const HEAP_HASNULL: u16 = 0x0001;
/// Tuple has at least one variable-length attribute.
pub const HEAP_HASVARWIDTH: u16 = 0x0002;

/// Physical location of a tuple: block number and 1-based line pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ItemPointer {
    pub block: u32,
    pub offset: u16,
}

/// An owned, formed heap tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapTuple {
    data: Vec<u8>,
}

impl HeapTuple {
    /// Form a tuple from values matching `shape`, inserted by `xmin`.
    pub fn form(shape: &TupleShape, values: &[Value], xmin: u32) -> Result<Self, ChunkError> {
        if values.len() != shape.natts() {
            return Err(ChunkError::ShapeMismatch {
                expected: shape.natts(),
                got: values.len(),
            });
        }
        let mut infomask = 0u16;
        for (i, (attr, value)) in shape.attrs().iter().zip(values).enumerate() {
            match value.data_type() {
                None => infomask |= HEAP_HASNULL,
                Some(t) if t != attr.data_type => {
                    return Err(ChunkError::TypeMismatch {
                        attnum: i + 1,
                        expected: attr.data_type,
                        got: t,
                    })
                }
                Some(t) if t.is_varlena() => infomask |= HEAP_HASVARWIDTH,
                Some(_) => {}
            }
        }

        let natts = values.len();
        let bitmap_len = if infomask & HEAP_HASNULL != 0 {
            natts.div_ceil(8)
        } else {
            0
        };
        let hoff = max_align(HEAP_TUPLE_HEADER_SIZE + bitmap_len);

        let mut data = vec![0u8; hoff];
        data[0..4].copy_from_slice(&xmin.to_le_bytes());
        data[8..10].copy_from_slice(&(natts as u16).to_le_bytes());
        data[10..12].copy_from_slice(&infomask.to_le_bytes());
        data[12..14].copy_from_slice(&(hoff as u16).to_le_bytes());

        for (i, (attr, value)) in shape.attrs().iter().zip(values).enumerate() {
            if value.is_null() {
                data[HEAP_TUPLE_HEADER_SIZE + i / 8] |= 1 << (i % 8);
                continue;
            }
            let aligned = type_align(attr.data_type.typalign(), data.len());
            data.resize(aligned, 0);
            value.append_stored(&mut data);
        }
        Ok(Self { data })
    }

    /// Wrap already formed tuple bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ChunkError> {
        TupleView::new(&data)?;
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> TupleView<'_> {
        TupleView { data: &self.data }
    }
}

/// Set `t_xmax` on stored tuple bytes.
pub fn set_tuple_xmax(data: &mut [u8], xmax: u32) {
    data[4..8].copy_from_slice(&xmax.to_le_bytes());
}

/// Borrowed view on stored tuple bytes.
#[derive(Debug, Clone, Copy)]
pub struct TupleView<'a> {
    data: &'a [u8],
}

impl<'a> TupleView<'a> {
    /// Validate the header and wrap the bytes.
    pub fn new(data: &'a [u8]) -> Result<Self, ChunkError> {
        if data.len() < HEAP_TUPLE_HEADER_SIZE {
            return Err(ChunkError::Corrupt(format!(
                "tuple of {} bytes is shorter than its header",
                data.len()
            )));
        }
        let view = Self { data };
        if view.hoff() > data.len() || view.hoff() < HEAP_TUPLE_HEADER_SIZE {
            return Err(ChunkError::Corrupt(format!(
                "tuple t_hoff {} outside {} bytes",
                view.hoff(),
                data.len()
            )));
        }
        Ok(view)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn xmin(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    pub fn xmax(&self) -> u32 {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn natts(&self) -> usize {
        u16::from_le_bytes([self.data[8], self.data[9]]) as usize
    }

    pub fn infomask(&self) -> u16 {
        u16::from_le_bytes([self.data[10], self.data[11]])
    }

    pub fn hoff(&self) -> usize {
        u16::from_le_bytes([self.data[12], self.data[13]]) as usize
    }

    pub fn has_nulls(&self) -> bool {
        self.infomask() & HEAP_HASNULL != 0
    }

    /// NULL test by 0-based attribute index. Attributes past `t_natts` are
    /// NULL (columns added after the tuple was formed).
    pub fn is_null(&self, index: usize) -> bool {
        if index >= self.natts() {
            return true;
        }
        self.has_nulls() && self.data[HEAP_TUPLE_HEADER_SIZE + index / 8] & (1 << (index % 8)) != 0
    }

    /// Read one attribute by 1-based number.
    ///
    /// Uses the cached offset when the tuple has no nulls and the offset is
    /// valid; otherwise walks the preceding attributes.
    pub fn get_attr(
        &self,
        shape: &TupleShape,
        attnum: i16,
        cache_offsets: &[i32],
    ) -> Result<Value, ChunkError> {
        let attr = shape.attr(attnum).ok_or_else(|| {
            ChunkError::Corrupt(format!("attribute {} outside tuple shape", attnum))
        })?;
        let index = attnum as usize - 1;
        if self.is_null(index) {
            return Ok(Value::Null);
        }
        let cached = cache_offsets.get(index).copied().unwrap_or(-1);
        let offset = if !self.has_nulls() && cached >= 0 {
            cached as usize
        } else {
            self.walk_to(shape, index)?
        };
        self.decode_at(attr.data_type, offset)
    }

    /// Deform every attribute of the tuple.
    pub fn deform(&self, shape: &TupleShape) -> Result<Vec<Value>, ChunkError> {
        let mut values = Vec::with_capacity(shape.natts());
        let mut off = self.hoff();
        for (index, attr) in shape.attrs().iter().enumerate() {
            if self.is_null(index) {
                values.push(Value::Null);
                continue;
            }
            off = type_align(attr.data_type.typalign(), off);
            let value = self.decode_at(attr.data_type, off)?;
            off += stored_len(attr.data_type, &self.data[off..])?;
            values.push(value);
        }
        Ok(values)
    }

    /// Offset of attribute `attnum` from the tuple start; `None` when NULL.
    pub fn attr_offset(&self, shape: &TupleShape, attnum: i16) -> Result<Option<usize>, ChunkError> {
        if attnum < 1 || attnum as usize > shape.natts() {
            return Err(ChunkError::Corrupt(format!("attribute {} outside tuple shape", attnum)));
        }
        let index = attnum as usize - 1;
        if self.is_null(index) {
            return Ok(None);
        }
        self.walk_to(shape, index).map(Some)
    }

    fn walk_to(&self, shape: &TupleShape, target: usize) -> Result<usize, ChunkError> {
        let mut off = self.hoff();
        for (index, attr) in shape.attrs().iter().enumerate().take(target + 1) {
            if self.is_null(index) {
                continue;
            }
            off = type_align(attr.data_type.typalign(), off);
            if index == target {
                return Ok(off);
            }
            let rest = self
                .data
                .get(off..)
                .ok_or_else(|| ChunkError::Corrupt("attribute walk past tuple end".into()))?;
            off += stored_len(attr.data_type, rest)?;
        }
        Err(ChunkError::Corrupt(format!("attribute {} not found", target + 1)))
    }

    fn decode_at(&self, ty: DataType, offset: usize) -> Result<Value, ChunkError> {
        let rest = self
            .data
            .get(offset..)
            .ok_or_else(|| ChunkError::Corrupt(format!("attribute offset {} past end", offset)))?;
        Value::decode_stored(ty, rest)
    }
}
