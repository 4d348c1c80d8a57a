//! Filter kernel generation.
//!
//! The generated `eval_filter` evaluates the implicitly AND-ed qualifier list
//! for one tuple and returns true only when every qualifier is TRUE. The
//! `gpuscan_exec_quals_row` and `gpuscan_exec_quals_block` kernels run it
//! over a Row or Block chunk and collect the passing item ids.

use std::collections::BTreeSet;

use crate::codegen::devtype::emit_runtime_header;
use crate::codegen::emit::{declare_kvar, emit_tuple_loads, AttrLoad, ExprEmitter};
use crate::codegen::eval::{AttrSource, Evaluator};
use crate::codegen::expr::{vars_of, Expr};
use crate::config::DEFAULT_THREADS_PER_GROUP;
use crate::error::{CodegenError, EvalError};
use crate::storage::schema::TupleShape;
use crate::storage::types::DataType;

/// Lowered form of a device filter: what the kernel computes, in a shape
/// the emulated device can run directly.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterProgram {
    quals: Vec<Expr>,
    loads: AttrLoad,
}

impl FilterProgram {
    pub fn quals(&self) -> &[Expr] {
        &self.quals
    }

    pub fn loads(&self) -> &AttrLoad {
        &self.loads
    }

    /// No qualifiers: every tuple passes and the launch is skipped.
    pub fn is_empty(&self) -> bool {
        self.quals.is_empty()
    }

    /// Evaluate with device semantics.
    pub fn evaluate<R: AttrSource + ?Sized>(&self, row: &R) -> Result<bool, EvalError> {
        Evaluator::device().eval_quals(&self.quals, row)
    }
}

/// Validate and lower `quals`, emitting `eval_filter` and the quals kernels.
pub(crate) fn filter_section(
    em: &mut ExprEmitter<'_>,
    quals: &[Expr],
) -> Result<(String, FilterProgram), CodegenError> {
    let mut src = String::new();
    src.push_str("// --- Filter ---\n\n");
    src.push_str(
        "static bool eval_filter_tuple(thread kern_context &kcxt,\n\
         \x20                             device const kern_data_store *kds,\n\
         \x20                             device const char *htup) {\n",
    );

    let loads = if quals.is_empty() {
        src.push_str("    return true;\n");
        AttrLoad::None
    } else {
        let mut exprs = Vec::with_capacity(quals.len());
        for qual in quals {
            let t = qual.result_type()?;
            if t != DataType::Bool {
                return Err(CodegenError::NotBoolean(t));
            }
            exprs.push(em.emit(qual)?);
        }
        let vars = vars_of(quals);
        src.push_str("    device const char *addr;\n");
        for var in &vars {
            src.push_str(&declare_kvar(var)?);
        }
        src.push_str("    pg_bool_t rc;\n\n");
        let loads = emit_tuple_loads(&mut src, "kds", &vars, &BTreeSet::new())?;
        src.push('\n');
        for expr in exprs {
            src.push_str(&format!(
                "    rc = {};\n\
                 \x20   if (!pg_bool_is_true(rc))\n\
                 \x20       return false;\n",
                expr
            ));
        }
        src.push_str("    return true;\n");
        loads
    };
    src.push_str("}\n\n");

    src.push_str(
        "static bool eval_filter(thread kern_context &kcxt,\n\
         \x20                       device const kern_data_store *kds,\n\
         \x20                       uint row_index) {\n\
         \x20   return eval_filter_tuple(kcxt, kds, kern_get_tuple_row(kds, row_index));\n\
         }\n\n",
    );
    emit_quals_kernels(&mut src);

    Ok((
        src,
        FilterProgram {
            quals: quals.to_vec(),
            loads,
        },
    ))
}

/// Passing rows are appended to the result buffer with one atomic per
/// thread group: threads count locally, thread 0 reserves the group's range.
fn emit_quals_kernels(src: &mut String) {
    src.push_str(
        "static inline void gpuscan_store_results(device kern_resultbuf *kresults,\n\
         \x20                                         threadgroup atomic_uint *group_count,\n\
         \x20                                         threadgroup uint *group_base,\n\
         \x20                                         bool passed, uint item_id, uint lid) {\n\
         \x20   if (lid == 0)\n\
         \x20       atomic_store_explicit(group_count, 0u, memory_order_relaxed);\n\
         \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
         \x20   uint local = passed ? atomic_fetch_add_explicit(group_count, 1u, memory_order_relaxed) : 0u;\n\
         \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
         \x20   if (lid == 0)\n\
         \x20       *group_base = atomic_fetch_add_explicit(&kresults->nitems,\n\
         \x20                                               atomic_load_explicit(group_count, memory_order_relaxed),\n\
         \x20                                               memory_order_relaxed);\n\
         \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
         \x20   if (passed && *group_base + local < kresults->nrooms)\n\
         \x20       kresults->results[*group_base + local] = item_id;\n\
         }\n\n",
    );
    src.push_str(
        "kernel void gpuscan_exec_quals_row(\n\
         \x20   device const kern_data_store *kds_src [[buffer(0)]],\n\
         \x20   device kern_resultbuf *kresults [[buffer(1)]],\n\
         \x20   uint tid [[thread_position_in_grid]],\n\
         \x20   uint lid [[thread_position_in_threadgroup]]\n\
         ) {\n\
         \x20   threadgroup atomic_uint group_count;\n\
         \x20   threadgroup uint group_base;\n\
         \x20   kern_context kcxt;\n\
         \x20   kcxt.errcode = StromError_Success;\n\
         \x20   bool passed = false;\n\
         \x20   if (tid < kds_src->nitems)\n\
         \x20       passed = eval_filter(kcxt, kds_src, tid);\n\
         \x20   gpuscan_store_results(kresults, &group_count, &group_base, passed, tid, lid);\n\
         \x20   kern_writeback_error(kresults, kcxt);\n\
         }\n\n",
    );
    // One thread group per page; item id is (page index << 16) | lineoff.
    src.push_str(
        "kernel void gpuscan_exec_quals_block(\n\
         \x20   device const kern_data_store *kds_src [[buffer(0)]],\n\
         \x20   device kern_resultbuf *kresults [[buffer(1)]],\n\
         \x20   uint tgid [[threadgroup_position_in_grid]],\n\
         \x20   uint lid [[thread_position_in_threadgroup]]\n\
         ) {\n\
         \x20   threadgroup atomic_uint group_count;\n\
         \x20   threadgroup uint group_base;\n\
         \x20   kern_context kcxt;\n\
         \x20   kcxt.errcode = StromError_Success;\n\
         \x20   if (tgid >= kds_src->nitems)\n\
         \x20       return;\n\
         \x20   device const char *page = kds_block_page(kds_src, tgid);\n\
         \x20   uint nlines = page_line_count(page);\n\
         \x20   for (uint base = 0; base < nlines; base += THREADS_PER_GROUP) {\n\
         \x20       uint lineoff = base + lid + 1;\n\
         \x20       bool passed = false;\n\
         \x20       if (lineoff <= nlines) {\n\
         \x20           device const char *htup = page_tuple(page, lineoff);\n\
         \x20           if (htup)\n\
         \x20               passed = eval_filter_tuple(kcxt, kds_src, htup);\n\
         \x20       }\n\
         \x20       gpuscan_store_results(kresults, &group_count, &group_base, passed, (tgid << 16) | lineoff, lid);\n\
         \x20   }\n\
         \x20   kern_writeback_error(kresults, kcxt);\n\
         }\n\n",
    );
}

/// Lower `quals` without emitting a complete module.
pub fn lower_filter(quals: &[Expr], shape: &TupleShape) -> Result<FilterProgram, CodegenError> {
    let mut em = ExprEmitter::new(shape);
    filter_section(&mut em, quals).map(|(_, program)| program)
}

/// Complete MSL module holding `eval_filter` and the quals kernels.
///
/// An empty qualifier list yields an always-true `eval_filter`.
pub fn generate_filter_kernel(quals: &[Expr], shape: &TupleShape) -> Result<String, CodegenError> {
    let mut em = ExprEmitter::new(shape);
    let (body, _) = filter_section(&mut em, quals)?;
    let mut src = String::new();
    emit_runtime_header(&mut src, DEFAULT_THREADS_PER_GROUP);
    em.emit_support(&mut src)?;
    src.push_str(&body);
    Ok(src)
}
