//! One task: a source chunk, its device staging, and what it produced.

use std::fmt;

use crate::error::{ChunkError, ScanError};
use crate::gpu::memory::DeviceRegion;
use crate::scan::fallback::reevaluate;
use crate::scan::plan::ScanPlan;
use crate::storage::chunk::{Chunk, FetchedTuple};
use crate::storage::handle::ChunkRef;
use crate::storage::tuple::ItemPointer;
use crate::storage::value::Value;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    /// Device memory reserved.
    Staged,
    DeviceQueued,
    Completed,
    /// Device results discarded, tuples re-evaluated on the host.
    HostReevaluated,
    Released,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Created => "created",
            TaskState::Staged => "staged",
            TaskState::DeviceQueued => "device queued",
            TaskState::Completed => "completed",
            TaskState::HostReevaluated => "host reevaluated",
            TaskState::Released => "released",
        })
    }
}

/// Tuples a completed task hands to the consumer.
pub(crate) enum TaskOutput {
    /// Passing item ids of the source chunk.
    Source {
        source: ChunkRef,
        items: Vec<u32>,
        cursor: usize,
    },
    /// Projected destination chunk.
    Dest { chunk: Chunk, cursor: usize },
    /// Source tuples to re-evaluate on the host.
    Fallback {
        source: ChunkRef,
        items: Vec<u32>,
        cursor: usize,
    },
    /// Error to surface before any further tuple.
    Failed(Option<ScanError>),
}

/// A produced tuple in the plan's row layout.
pub(crate) type TaskRow = (Option<ItemPointer>, Vec<Value>);

pub(crate) struct Task {
    pub id: u64,
    pub state: TaskState,
    pub regions: Vec<DeviceRegion>,
    pub output: Option<TaskOutput>,
}

impl Task {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: TaskState::Created,
            regions: Vec::new(),
            output: None,
        }
    }

    pub fn transition(&mut self, state: TaskState) {
        tracing::trace!(task = self.id, from = %self.state, to = %state, "task state");
        self.state = state;
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.output, Some(TaskOutput::Failed(_)))
    }

    /// Next row in the plan's row layout; `None` once the task is drained.
    pub fn next_row(&mut self, plan: &ScanPlan) -> Result<Option<TaskRow>, ScanError> {
        let Some(output) = self.output.as_mut() else {
            return Ok(None);
        };
        match output {
            TaskOutput::Source {
                source,
                items,
                cursor,
            } => {
                while let Some(&id) = items.get(*cursor) {
                    *cursor += 1;
                    if let Some(FetchedTuple::Heap { ctid, tuple, .. }) = source.fetch_item(id)? {
                        return Ok(Some((Some(ctid), tuple.deform(source.shape())?)));
                    }
                }
                Ok(None)
            }
            TaskOutput::Dest { chunk, cursor } => {
                let Some(fetched) = chunk.fetch_tuple(*cursor)? else {
                    return Ok(None);
                };
                *cursor += 1;
                let ctid = match &fetched {
                    FetchedTuple::Heap { ctid, .. } => Some(*ctid),
                    FetchedTuple::Slot(_) => None,
                };
                Ok(Some((ctid, fetched.to_values(chunk.shape())?)))
            }
            TaskOutput::Fallback {
                source,
                items,
                cursor,
            } => {
                while let Some(&id) = items.get(*cursor) {
                    *cursor += 1;
                    let Some(FetchedTuple::Heap { ctid, tuple, .. }) = source.fetch_item(id)? else {
                        continue;
                    };
                    if let Some(row) = reevaluate(plan, tuple.deform(source.shape())?)? {
                        return Ok(Some((Some(ctid), row)));
                    }
                }
                Ok(None)
            }
            TaskOutput::Failed(error) => Err(error.take().unwrap_or_else(|| {
                ScanError::Chunk(ChunkError::Corrupt(format!("task {} failed twice", self.id)))
            })),
        }
    }

    /// Drop chunks and device regions.
    pub fn release(&mut self) {
        self.output = None;
        self.regions.clear();
        self.transition(TaskState::Released);
    }
}
