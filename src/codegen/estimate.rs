//! Destination buffer sizing.
//!
//! The estimate only sizes the destination chunk. Undershooting is legal:
//! the device reports `DataStoreNoSpace` and the task falls back to the host.

use serde::{Deserialize, Serialize};

use crate::codegen::expr::Expr;
use crate::codegen::projection::{projection_shape, TargetEntry};
use crate::error::CodegenError;
use crate::storage::schema::TupleShape;
use crate::storage::types::DataType;
use crate::storage::MAX_ALIGN;

/// Extra bytes reserved for a boxed numeric in the slot extra region.
pub const NUMERIC_SLOT_EXTRA: usize = 32;

/// Per-tuple extra bytes for each destination layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEstimate {
    /// Row destination growth over the source's average tuple.
    pub row_extra: usize,
    /// Slot extra-region bytes for computed by-reference values.
    pub slot_extra: usize,
}

fn slot_extra_width(t: DataType) -> usize {
    match t {
        DataType::Numeric => NUMERIC_SLOT_EXTRA,
        other if !other.typbyval() && other.typlen() > 0 => {
            (other.typlen() as usize).next_multiple_of(MAX_ALIGN)
        }
        _ => 0,
    }
}

/// Estimate destination extras for the device target list `tlist_dev`.
///
/// Bare columns never need slot extra space: Slot destinations point back
/// into the source chunk for them.
pub fn estimate_buffer_requirements(
    tlist_dev: &[TargetEntry],
    shape: &TupleShape,
) -> Result<BufferEstimate, CodegenError> {
    let dest = projection_shape(shape, tlist_dev)?;
    let row_extra = dest.avg_tuple_width().saturating_sub(shape.avg_tuple_width());

    let mut slot_extra = 0;
    for entry in tlist_dev {
        if !matches!(entry.expr, Expr::Var { .. }) {
            slot_extra += slot_extra_width(entry.expr.result_type()?);
        }
    }
    Ok(BufferEstimate {
        row_extra,
        slot_extra,
    })
}
