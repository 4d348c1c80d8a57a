//! Table storage pages and scan snapshots.
//!
//! Page layout (`PAGE_SIZE` bytes):
//!
//! ```text
//! offset 0   pd_lower  u16   end of the line pointer array
//! offset 2   pd_upper  u16   start of tuple space
//! offset 4   pd_flags  u16   PD_ALL_VISIBLE
//! offset 6   padding   u16
//! offset 8   line pointers, 4 bytes each: off:15 | state:2 | len:15
//! pd_upper   tuples, packed from the end, MAXALIGNed
//! ```

use crate::error::ChunkError;
use crate::storage::max_align_down;
use crate::storage::tuple::{set_tuple_xmax, HeapTuple, TupleView};

/// Size of one storage page.
pub const PAGE_SIZE: usize = 8192;
/// Size of the page header.
pub const PAGE_HEADER_SIZE: usize = 8;
/// Size of one line pointer.
pub const ITEM_ID_SIZE: usize = 4;
/// Every tuple on the page is visible to every snapshot.
pub const PD_ALL_VISIBLE: u16 = 0x0004;

/// Line pointer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Unused = 0,
    Normal = 1,
    Dead = 3,
}

impl LineState {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => LineState::Normal,
            3 => LineState::Dead,
            _ => LineState::Unused,
        }
    }
}

/// Decoded line pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePointer {
    pub offset: u16,
    pub len: u16,
    pub state: LineState,
}

impl LinePointer {
    fn decode(raw: u32) -> Self {
        Self {
            offset: (raw & 0x7fff) as u16,
            state: LineState::from_bits((raw >> 15) & 0x3),
            len: (raw >> 17) as u16,
        }
    }

    fn encode(&self) -> u32 {
        (self.offset as u32 & 0x7fff) | ((self.state as u32) << 15) | ((self.len as u32) << 17)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// The set of transactions whose effects a scan may observe.
///
/// Transaction ids below `xmin` are committed and visible, ids at or above
/// `xmax` are not, and ids in `in_progress` are not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub xmin: u32,
    pub xmax: u32,
    pub in_progress: Vec<u32>,
    see_all: bool,
}

impl Snapshot {
    pub fn new(xmin: u32, xmax: u32, in_progress: Vec<u32>) -> Self {
        Self {
            xmin,
            xmax,
            in_progress,
            see_all: false,
        }
    }

    /// Snapshot taken when `next_xid` is the next id to be assigned.
    pub fn at(next_xid: u32) -> Self {
        Self::new(next_xid, next_xid, Vec::new())
    }

    /// Sees every stored tuple, deleted or not.
    pub fn any() -> Self {
        Self {
            see_all: true,
            ..Self::new(0, u32::MAX, Vec::new())
        }
    }

    fn committed_before(&self, xid: u32) -> bool {
        if xid == 0 {
            return false;
        }
        if xid < self.xmin {
            return true;
        }
        xid < self.xmax && !self.in_progress.contains(&xid)
    }

    /// Inserted before the snapshot and not deleted before it.
    pub fn tuple_visible(&self, tuple: &TupleView<'_>) -> bool {
        if self.see_all {
            return true;
        }
        self.committed_before(tuple.xmin()) && !self.committed_before(tuple.xmax())
    }
}

// ============================================================================
// Page
// ============================================================================

/// Read-only view on page bytes (owned page or a page inside a chunk).
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, ChunkError> {
        if data.len() != PAGE_SIZE {
            return Err(ChunkError::Corrupt(format!("page of {} bytes", data.len())));
        }
        let view = Self { data };
        if view.lower() < PAGE_HEADER_SIZE || view.lower() > view.upper() || view.upper() > PAGE_SIZE
        {
            return Err(ChunkError::Corrupt(format!(
                "page bounds lower={} upper={}",
                view.lower(),
                view.upper()
            )));
        }
        Ok(view)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    fn u16_at(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    pub fn lower(&self) -> usize {
        self.u16_at(0) as usize
    }

    pub fn upper(&self) -> usize {
        self.u16_at(2) as usize
    }

    pub fn flags(&self) -> u16 {
        self.u16_at(4)
    }

    pub fn is_all_visible(&self) -> bool {
        self.flags() & PD_ALL_VISIBLE != 0
    }

    /// Number of line pointers.
    pub fn line_count(&self) -> usize {
        (self.lower() - PAGE_HEADER_SIZE) / ITEM_ID_SIZE
    }

    /// Bytes occupied by tuple data.
    pub fn tuple_payload(&self) -> usize {
        PAGE_SIZE - self.upper()
    }

    /// Line pointer by 1-based offset number.
    pub fn line_pointer(&self, lineoff: u16) -> Option<LinePointer> {
        if lineoff == 0 || lineoff as usize > self.line_count() {
            return None;
        }
        let pos = PAGE_HEADER_SIZE + (lineoff as usize - 1) * ITEM_ID_SIZE;
        let raw = u32::from_le_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);
        Some(LinePointer::decode(raw))
    }

    /// Tuple bytes of a normal line pointer.
    pub fn tuple(&self, lineoff: u16) -> Option<TupleView<'a>> {
        let lp = self.line_pointer(lineoff)?;
        if lp.state != LineState::Normal {
            return None;
        }
        let start = lp.offset as usize;
        let bytes = self.data.get(start..start + lp.len as usize)?;
        TupleView::new(bytes).ok()
    }

    /// Normal tuples visible to `snapshot`, in line pointer order.
    pub fn visible_tuples<'s>(
        self,
        snapshot: &'s Snapshot,
    ) -> impl Iterator<Item = (u16, TupleView<'a>)> + 's
    where
        'a: 's,
    {
        let all_visible = self.is_all_visible();
        (1..=self.line_count() as u16).filter_map(move |lineoff| {
            let tuple = self.tuple(lineoff)?;
            (all_visible || snapshot.tuple_visible(&tuple)).then_some((lineoff, tuple))
        })
    }
}

/// An owned storage page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// An empty page.
    pub fn new() -> Self {
        let mut data = vec![0u8; PAGE_SIZE];
        data[0..2].copy_from_slice(&(PAGE_HEADER_SIZE as u16).to_le_bytes());
        data[2..4].copy_from_slice(&(PAGE_SIZE as u16).to_le_bytes());
        Self { data }
    }

    /// Copy page bytes, validating the header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkError> {
        PageView::new(bytes)?;
        Ok(Self {
            data: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn view(&self) -> PageView<'_> {
        PageView { data: &self.data }
    }

    /// Space left for one more tuple including its line pointer.
    pub fn free_space(&self) -> usize {
        let view = self.view();
        (view.upper() - view.lower()).saturating_sub(ITEM_ID_SIZE)
    }

    /// Append a tuple; returns its 1-based line pointer, or `None` if full.
    pub fn add_tuple(&mut self, tuple: &HeapTuple) -> Option<u16> {
        let view = self.view();
        let (lower, upper) = (view.lower(), view.upper());
        let new_upper = max_align_down(upper.checked_sub(tuple.len())?);
        if new_upper < lower + ITEM_ID_SIZE {
            return None;
        }
        let lineoff = view.line_count() as u16 + 1;
        self.data[new_upper..new_upper + tuple.len()].copy_from_slice(tuple.as_bytes());
        let lp = LinePointer {
            offset: new_upper as u16,
            len: tuple.len() as u16,
            state: LineState::Normal,
        };
        self.data[lower..lower + ITEM_ID_SIZE].copy_from_slice(&lp.encode().to_le_bytes());
        self.data[0..2].copy_from_slice(&((lower + ITEM_ID_SIZE) as u16).to_le_bytes());
        self.data[2..4].copy_from_slice(&(new_upper as u16).to_le_bytes());
        Some(lineoff)
    }

    pub fn set_all_visible(&mut self, all_visible: bool) {
        let mut flags = self.view().flags();
        if all_visible {
            flags |= PD_ALL_VISIBLE;
        } else {
            flags &= !PD_ALL_VISIBLE;
        }
        self.data[4..6].copy_from_slice(&flags.to_le_bytes());
    }

    /// Change a line pointer's state.
    pub fn set_line_state(&mut self, lineoff: u16, state: LineState) -> bool {
        let Some(mut lp) = self.view().line_pointer(lineoff) else {
            return false;
        };
        lp.state = state;
        let pos = PAGE_HEADER_SIZE + (lineoff as usize - 1) * ITEM_ID_SIZE;
        self.data[pos..pos + ITEM_ID_SIZE].copy_from_slice(&lp.encode().to_le_bytes());
        true
    }

    /// Stamp `xmax` on a normal tuple; clears the all-visible flag.
    pub fn mark_deleted(&mut self, lineoff: u16, xmax: u32) -> bool {
        let Some(lp) = self.view().line_pointer(lineoff) else {
            return false;
        };
        if lp.state != LineState::Normal {
            return false;
        }
        let start = lp.offset as usize;
        set_tuple_xmax(&mut self.data[start..start + lp.len as usize], xmax);
        self.set_all_visible(false);
        true
    }
}
