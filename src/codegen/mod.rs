//! Kernel code generation.
//!
//! Translates a qualifier list and a device target list over one tuple shape
//! into Metal Shading Language plus a lowered program for the emulated
//! device. Also hosts the expression evaluator used for host fallback.

pub mod devtype;
pub mod emit;
pub mod estimate;
pub mod eval;
pub mod expr;
pub mod filter;
pub mod kernel;
pub mod projection;

pub use estimate::{estimate_buffer_requirements, BufferEstimate};
pub use eval::{AttrSource, EvalMode, Evaluator};
pub use expr::{ArithOp, CmpOp, Expr, VarRef};
pub use filter::{generate_filter_kernel, lower_filter, FilterProgram};
pub use kernel::{KernelCache, KernelProgram, KernelSource};
pub use projection::{
    build_projection, generate_projection_kernel, ProjectionOutput, ProjectionProgram, TargetEntry,
};
