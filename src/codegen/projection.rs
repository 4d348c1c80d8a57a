//! Device target lists and projection kernel generation.
//!
//! [`build_projection`] decides whether a scan needs a device projection at
//! all and, if so, which entries the device computes. The generated
//! `project` function fills a `kern_projection` struct for one source tuple;
//! the Row and Slot entry points then write it into the destination chunk.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codegen::devtype::{device_struct, emit_runtime_header};
use crate::codegen::emit::{check_var, declare_kvar, emit_tuple_loads, kaddr, AttrLoad, ExprEmitter};
use crate::codegen::expr::{vars_of, Expr, VarRef};
use crate::config::DEFAULT_THREADS_PER_GROUP;
use crate::error::CodegenError;
use crate::storage::chunk::ChunkFormat;
use crate::storage::schema::{AttrDesc, TupleShape};
use crate::storage::types::DataType;
use crate::storage::value::NUMERIC_STORED_SIZE;

/// One output column of a target list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub expr: Expr,
    pub name: String,
    /// Carried for the executor only, never returned to the caller.
    #[serde(default)]
    pub resjunk: bool,
}

impl TargetEntry {
    pub fn new(name: &str, expr: Expr) -> Self {
        Self {
            expr,
            name: name.to_string(),
            resjunk: false,
        }
    }

    pub fn junk(name: &str, expr: Expr) -> Self {
        Self {
            expr,
            name: name.to_string(),
            resjunk: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Device target list
// ---------------------------------------------------------------------------

fn add_unique(tlist_dev: &mut Vec<TargetEntry>, entry: TargetEntry) -> bool {
    if tlist_dev.iter().any(|t| t.expr == entry.expr) {
        return false;
    }
    tlist_dev.push(entry);
    true
}

fn var_entry(var: &VarRef, shape: &TupleShape, resjunk: bool) -> TargetEntry {
    let name = shape
        .attr(var.attnum)
        .map(|a| a.name.clone())
        .unwrap_or_else(|| format!("attr{}", var.attnum));
    TargetEntry {
        expr: Expr::var(var.varno, var.attnum, var.data_type),
        name,
        resjunk,
    }
}

/// Device target list for `tlist`, or `None` when no projection is needed.
///
/// `None` covers whole-row references and target lists that already match
/// the source tuple layout (every column once, in attribute order, with the
/// stored type). Otherwise the result holds bare columns, device-executable
/// expressions, the variables of expressions only the host can compute,
/// the variables of host quals, and (as junk) those of device quals.
pub fn build_projection(
    scan_relid: u32,
    shape: &TupleShape,
    tlist: &[TargetEntry],
    host_quals: &[Expr],
    dev_quals: &[Expr],
) -> Result<Option<Vec<TargetEntry>>, CodegenError> {
    let mut tlist_dev = Vec::new();
    let mut compatible = tlist.len() == shape.natts();

    for (i, entry) in tlist.iter().enumerate() {
        let vars = entry.expr.vars();
        for var in &vars {
            if var.varno != scan_relid {
                return Err(CodegenError::RelationMismatch {
                    expected: scan_relid,
                    found: var.varno,
                });
            }
            if var.attnum <= 0 {
                return Ok(None);
            }
        }
        match &entry.expr {
            Expr::Var {
                attnum, data_type, ..
            } => {
                let resno = i as i16 + 1;
                let stored = shape.attr(*attnum).map(|a| a.data_type);
                if *attnum != resno || stored != Some(*data_type) {
                    compatible = false;
                }
                if !add_unique(&mut tlist_dev, entry.clone()) {
                    compatible = false;
                }
            }
            expr if expr.is_device_executable() => {
                add_unique(&mut tlist_dev, entry.clone());
                compatible = false;
            }
            _ => {
                for var in &vars {
                    add_unique(&mut tlist_dev, var_entry(var, shape, false));
                }
                compatible = false;
            }
        }
    }

    for var in vars_of(host_quals) {
        if var.varno != scan_relid {
            return Err(CodegenError::RelationMismatch {
                expected: scan_relid,
                found: var.varno,
            });
        }
        if var.attnum <= 0 {
            return Ok(None);
        }
        add_unique(&mut tlist_dev, var_entry(&var, shape, false));
    }
    for var in vars_of(dev_quals) {
        if var.varno != scan_relid {
            return Err(CodegenError::RelationMismatch {
                expected: scan_relid,
                found: var.varno,
            });
        }
        add_unique(&mut tlist_dev, var_entry(&var, shape, true));
    }

    Ok(if compatible { None } else { Some(tlist_dev) })
}

/// Shape of the tuples a projection produces.
pub fn projection_shape(shape: &TupleShape, tlist_dev: &[TargetEntry]) -> Result<TupleShape, CodegenError> {
    let attrs = tlist_dev
        .iter()
        .map(|t| Ok(AttrDesc::new(&t.name, t.expr.result_type()?)))
        .collect::<Result<Vec<_>, CodegenError>>()?;
    Ok(TupleShape::new(shape.relid, attrs))
}

// ---------------------------------------------------------------------------
// Lowered program
// ---------------------------------------------------------------------------

/// What the device produces for one output column.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOutput {
    /// Source attribute copied as stored (any type).
    Copy { attnum: i16, data_type: DataType },
    /// Expression evaluated on the device.
    Compute { expr: Expr },
}

impl ProjectionOutput {
    pub fn data_type(&self) -> Result<DataType, CodegenError> {
        match self {
            ProjectionOutput::Copy { data_type, .. } => Ok(*data_type),
            ProjectionOutput::Compute { expr } => expr.result_type(),
        }
    }
}

/// Lowered projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionProgram {
    outputs: Vec<ProjectionOutput>,
    dest_format: ChunkFormat,
    dest_shape: Arc<TupleShape>,
    loads: AttrLoad,
}

impl ProjectionProgram {
    pub fn outputs(&self) -> &[ProjectionOutput] {
        &self.outputs
    }

    pub fn dest_format(&self) -> ChunkFormat {
        self.dest_format
    }

    pub fn dest_shape(&self) -> &Arc<TupleShape> {
        &self.dest_shape
    }

    pub fn loads(&self) -> &AttrLoad {
        &self.loads
    }
}

// ---------------------------------------------------------------------------
// Kernel emission
// ---------------------------------------------------------------------------

fn field(j: usize) -> String {
    format!("c{}", j)
}

/// Stored length and alignment of a computed output value.
fn computed_layout(t: DataType) -> (usize, usize) {
    match t {
        DataType::Numeric => (NUMERIC_STORED_SIZE, 4),
        other => (other.typlen().max(0) as usize, other.typalign()),
    }
}

/// Slot datum of a by-value attribute at address `addr`.
fn copy_datum(t: DataType, addr: &str) -> String {
    match t {
        DataType::Bool => format!("(ulong)(*((device const uchar *){addr}) != 0)"),
        DataType::Int2 => format!("(ulong)(long)*((device const short *){addr})"),
        DataType::Int4 | DataType::Date => format!("(ulong)(long)*((device const int *){addr})"),
        DataType::Float4 => format!("(ulong)*((device const uint *){addr})"),
        _ => format!("*((device const ulong *){addr})"),
    }
}

/// Slot datum of a computed by-value result.
fn compute_datum(t: DataType, v: &str) -> String {
    match t {
        DataType::Bool => format!("(ulong)({v}.value ? 1 : 0)"),
        DataType::Float4 => format!("(ulong)as_type<uint>({v}.value)"),
        _ => format!("(ulong)(long){v}.value"),
    }
}

fn emit_struct(src: &mut String, outputs: &[ProjectionOutput]) -> Result<(), CodegenError> {
    src.push_str("struct kern_projection {\n");
    for (j, out) in outputs.iter().enumerate() {
        match out {
            ProjectionOutput::Copy { .. } => {
                src.push_str(&format!("    device const char *{};\n", field(j)))
            }
            ProjectionOutput::Compute { expr } => src.push_str(&format!(
                "    {} {};\n",
                device_struct(expr.result_type()?)?,
                field(j)
            )),
        }
    }
    src.push_str("};\n\n");
    Ok(())
}

fn emit_project_fn(
    src: &mut String,
    em: &mut ExprEmitter<'_>,
    outputs: &[ProjectionOutput],
) -> Result<AttrLoad, CodegenError> {
    let mut exprs = Vec::new();
    let mut copies = BTreeSet::new();
    for out in outputs {
        match out {
            ProjectionOutput::Copy { attnum, .. } => {
                copies.insert(*attnum);
            }
            ProjectionOutput::Compute { expr } => exprs.push(expr.clone()),
        }
    }
    let rendered = exprs.iter().map(|e| em.emit(e)).collect::<Result<Vec<_>, _>>()?;
    let vars = vars_of(&exprs);

    src.push_str(
        "static void project(thread kern_context &kcxt,\n\
         \x20                   device const kern_data_store *kds_src,\n\
         \x20                   device const char *htup,\n\
         \x20                   thread kern_projection &out) {\n\
         \x20   device const char *addr;\n",
    );
    for var in &vars {
        src.push_str(&declare_kvar(var)?);
    }
    for attnum in &copies {
        src.push_str(&format!("    device const char *{} = nullptr;\n", kaddr(*attnum)));
    }
    let loads = emit_tuple_loads(src, "kds_src", &vars, &copies)?;
    let mut rendered = rendered.into_iter();
    for (j, out) in outputs.iter().enumerate() {
        match out {
            ProjectionOutput::Copy { attnum, .. } => {
                src.push_str(&format!("    out.{} = {};\n", field(j), kaddr(*attnum)))
            }
            ProjectionOutput::Compute { .. } => {
                let text = rendered.next().unwrap_or_default();
                src.push_str(&format!("    out.{} = {};\n", field(j), text));
            }
        }
    }
    src.push_str("}\n\n");
    Ok(loads)
}

/// Destination tuple length and the tuple writer for Row destinations.
fn emit_row_helpers(src: &mut String, outputs: &[ProjectionOutput]) -> Result<(), CodegenError> {
    let natts = outputs.len();
    let isnull = |j: usize, out: &ProjectionOutput| match out {
        ProjectionOutput::Copy { .. } => format!("!p.{}", field(j)),
        ProjectionOutput::Compute { .. } => format!("p.{}.isnull", field(j)),
    };

    src.push_str("static uint projection_hoff(thread const kern_projection &p) {\n");
    src.push_str("    bool has_null = false;\n");
    for (j, out) in outputs.iter().enumerate() {
        src.push_str(&format!("    has_null |= {};\n", isnull(j, out)));
    }
    src.push_str(&format!(
        "    return MAXALIGN(HEAP_TUPLE_HEADER_SIZE + (has_null ? {}u : 0u));\n}}\n\n",
        natts.div_ceil(8)
    ));

    src.push_str(
        "static uint projection_tuple_length(device const kern_data_store *kds_src,\n\
         \x20                                    thread const kern_projection &p) {\n\
         \x20   uint off = projection_hoff(p);\n",
    );
    for (j, out) in outputs.iter().enumerate() {
        let f = field(j);
        match out {
            ProjectionOutput::Copy { attnum, data_type } => src.push_str(&format!(
                "    if (p.{f}) {{ off = TYPEALIGN({}u, off); off += att_stored_length(kds_src->colmeta[{}], p.{f}); }}\n",
                data_type.typalign(),
                attnum - 1
            )),
            ProjectionOutput::Compute { expr } => {
                let (len, align) = computed_layout(expr.result_type()?);
                src.push_str(&format!(
                    "    if (!p.{f}.isnull) {{ off = TYPEALIGN({align}u, off); off += {len}u; }}\n"
                ));
            }
        }
    }
    src.push_str("    return off;\n}\n\n");

    src.push_str(&format!(
        "static void projection_form_tuple(device const kern_data_store *kds_src,\n\
         \x20                                 device char *dst,\n\
         \x20                                 thread const kern_projection &p) {{\n\
         \x20   uint hoff = projection_hoff(p);\n\
         \x20   for (uint i = 0; i < hoff; i++)\n\
         \x20       dst[i] = 0;\n\
         \x20   *((device ushort *)(dst + 8)) = {natts};\n\
         \x20   *((device ushort *)(dst + 10)) = (hoff > HEAP_TUPLE_HEADER_SIZE) ? HEAP_HASNULL : 0;\n\
         \x20   *((device ushort *)(dst + 12)) = (ushort)hoff;\n\
         \x20   uint off = hoff;\n"
    ));
    for (j, out) in outputs.iter().enumerate() {
        let f = field(j);
        src.push_str(&format!(
            "    if ({}) {{\n\
             \x20       dst[HEAP_TUPLE_HEADER_SIZE + {}] |= (char)(1u << {});\n\
             \x20   }} else {{\n",
            isnull(j, out),
            j / 8,
            j % 8
        ));
        match out {
            ProjectionOutput::Copy { attnum, data_type } => src.push_str(&format!(
                "\x20       off = TYPEALIGN({}u, off);\n\
                 \x20       uint len = att_stored_length(kds_src->colmeta[{}], p.{f});\n\
                 \x20       for (uint i = 0; i < len; i++)\n\
                 \x20           dst[off + i] = p.{f}[i];\n\
                 \x20       off += len;\n",
                data_type.typalign(),
                attnum - 1
            )),
            ProjectionOutput::Compute { expr } => src.push_str(&format!(
                "\x20       off = pg_{}_row_store(dst, off, p.{f});\n",
                expr.result_type()?.name()
            )),
        }
        src.push_str("    }\n");
    }
    src.push_str("}\n\n");
    Ok(())
}

/// Extra-region size and slot writer for Slot destinations.
fn emit_slot_helpers(src: &mut String, outputs: &[ProjectionOutput]) -> Result<(), CodegenError> {
    src.push_str("static uint projection_slot_extra(thread const kern_projection &p) {\n    uint sz = 0;\n");
    for (j, out) in outputs.iter().enumerate() {
        if let ProjectionOutput::Compute { expr } = out {
            let t = expr.result_type()?;
            if !t.typbyval() {
                let (len, _) = computed_layout(t);
                src.push_str(&format!(
                    "    if (!p.{}.isnull) sz += MAXALIGN({}u);\n",
                    field(j),
                    len
                ));
            }
        }
    }
    src.push_str("    return sz;\n}\n\n");

    src.push_str(
        "static void projection_write_slot(device const kern_data_store *kds_src,\n\
         \x20                                 device kern_data_store *kds_dst,\n\
         \x20                                 uint row, uint extra_pos,\n\
         \x20                                 thread const kern_projection &p) {\n\
         \x20   device ulong *values = kds_slot_values(kds_dst, row);\n\
         \x20   device bool *isnull = kds_slot_isnull(kds_dst, row);\n\
         \x20   device char *base = (device char *)kds_dst;\n",
    );
    for (j, out) in outputs.iter().enumerate() {
        let f = field(j);
        match out {
            ProjectionOutput::Copy { data_type, .. } => {
                let datum = if data_type.typbyval() {
                    copy_datum(*data_type, &format!("p.{f}"))
                } else {
                    format!(
                        "SLOT_PTR_SOURCE | (ulong)(p.{f} - (device const char *)kds_src)"
                    )
                };
                src.push_str(&format!(
                    "    isnull[{j}] = !p.{f};\n\
                     \x20   values[{j}] = p.{f} ? {datum} : 0;\n"
                ));
            }
            ProjectionOutput::Compute { expr } => {
                let t = expr.result_type()?;
                src.push_str(&format!("    isnull[{j}] = p.{f}.isnull;\n"));
                if t.typbyval() {
                    src.push_str(&format!(
                        "    values[{j}] = p.{f}.isnull ? 0 : {};\n",
                        compute_datum(t, &format!("p.{f}"))
                    ));
                } else {
                    let (len, _) = computed_layout(t);
                    src.push_str(&format!(
                        "    if (!p.{f}.isnull) {{\n\
                         \x20       pg_{}_row_store(base, extra_pos, p.{f});\n\
                         \x20       values[{j}] = extra_pos;\n\
                         \x20       extra_pos += MAXALIGN({len}u);\n\
                         \x20   }} else {{\n\
                         \x20       values[{j}] = 0;\n\
                         \x20   }}\n",
                        t.name()
                    ));
                }
            }
        }
    }
    src.push_str("}\n\n");
    Ok(())
}

fn emit_kernel_helpers(src: &mut String) {
    src.push_str(
        "static inline device const char *gpuscan_fetch_item(device const kern_data_store *kds_src,\n\
         \x20                                                    uint item_id) {\n\
         \x20   if (kds_src->format == KDS_FORMAT_BLOCK) {\n\
         \x20       device const char *page = kds_block_page(kds_src, item_id >> 16);\n\
         \x20       return page_tuple(page, item_id & 0xffffu);\n\
         \x20   }\n\
         \x20   return kern_get_tuple_row(kds_src, item_id);\n\
         }\n\n\
         static inline uint gpuscan_group_reserve(threadgroup atomic_uint *group_total,\n\
         \x20                                        threadgroup uint *group_base,\n\
         \x20                                        device atomic_uint *counter,\n\
         \x20                                        uint amount, uint lid) {\n\
         \x20   if (lid == 0)\n\
         \x20       atomic_store_explicit(group_total, 0u, memory_order_relaxed);\n\
         \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
         \x20   uint local = atomic_fetch_add_explicit(group_total, amount, memory_order_relaxed);\n\
         \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
         \x20   if (lid == 0)\n\
         \x20       *group_base = atomic_fetch_add_explicit(counter,\n\
         \x20                                               atomic_load_explicit(group_total, memory_order_relaxed),\n\
         \x20                                               memory_order_relaxed);\n\
         \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
         \x20   return *group_base + local;\n\
         }\n\n",
    );
}

fn emit_row_kernel(src: &mut String) {
    src.push_str(
        "kernel void gpuscan_projection_row(\n\
         \x20   device const kern_data_store *kds_src [[buffer(0)]],\n\
         \x20   device kern_resultbuf *kresults [[buffer(1)]],\n\
         \x20   device kern_data_store *kds_dst [[buffer(2)]],\n\
         \x20   uint tid [[thread_position_in_grid]],\n\
         \x20   uint lid [[thread_position_in_threadgroup]]\n\
         ) {\n\
         \x20   threadgroup atomic_uint group_total;\n\
         \x20   threadgroup uint group_base;\n\
         \x20   kern_context kcxt;\n\
         \x20   kcxt.errcode = StromError_Success;\n\
         \x20   uint nvalid = kresults->all_visible ? kds_src->nitems\n\
         \x20                                       : atomic_load_explicit(&kresults->nitems, memory_order_relaxed);\n\
         \x20   device const char *htup = nullptr;\n\
         \x20   if (tid < nvalid)\n\
         \x20       htup = gpuscan_fetch_item(kds_src, kresults->all_visible ? tid : kresults->results[tid]);\n\
         \x20   kern_projection proj;\n\
         \x20   uint required = 0;\n\
         \x20   if (htup) {\n\
         \x20       project(kcxt, kds_src, htup, proj);\n\
         \x20       required = MAXALIGN(ROW_ITEM_HEADER + projection_tuple_length(kds_src, proj));\n\
         \x20   }\n\
         \x20   uint usage = gpuscan_group_reserve(&group_total, &group_base,\n\
         \x20                                      (device atomic_uint *)&kds_dst->usage, required, lid) + required;\n\
         \x20   if (tid == 0)\n\
         \x20       kds_dst->nitems = nvalid;\n\
         \x20   if (htup) {\n\
         \x20       if (kds_head_length(kds_dst) + MAXALIGN(4u * nvalid) + usage > kds_dst->length) {\n\
         \x20           STROM_SET_ERROR(kcxt, StromError_DataStoreNoSpace);\n\
         \x20       } else {\n\
         \x20           uint pos = kds_dst->length - usage;\n\
         \x20           device char *item = (device char *)kds_dst + pos;\n\
         \x20           uint t_len = projection_tuple_length(kds_src, proj);\n\
         \x20           *((device uint *)item) = t_len;\n\
         \x20           *((device uint *)(item + 4)) = 0;\n\
         \x20           *((device uint *)(item + 8)) = 0;\n\
         \x20           projection_form_tuple(kds_src, item + ROW_ITEM_HEADER, proj);\n\
         \x20           device uint *row_index = (device uint *)((device char *)kds_dst + kds_head_length(kds_dst));\n\
         \x20           row_index[tid] = pos;\n\
         \x20       }\n\
         \x20   }\n\
         \x20   kern_writeback_error(kresults, kcxt);\n\
         }\n\n",
    );
}

fn emit_slot_kernel(src: &mut String) {
    src.push_str(
        "kernel void gpuscan_projection_slot(\n\
         \x20   device const kern_data_store *kds_src [[buffer(0)]],\n\
         \x20   device kern_resultbuf *kresults [[buffer(1)]],\n\
         \x20   device kern_data_store *kds_dst [[buffer(2)]],\n\
         \x20   uint tid [[thread_position_in_grid]],\n\
         \x20   uint lid [[thread_position_in_threadgroup]]\n\
         ) {\n\
         \x20   threadgroup atomic_uint group_total;\n\
         \x20   threadgroup uint group_base;\n\
         \x20   kern_context kcxt;\n\
         \x20   kcxt.errcode = StromError_Success;\n\
         \x20   uint nvalid = kresults->all_visible ? kds_src->nitems\n\
         \x20                                       : atomic_load_explicit(&kresults->nitems, memory_order_relaxed);\n\
         \x20   device const char *htup = nullptr;\n\
         \x20   if (tid < nvalid && tid >= kds_dst->nrooms)\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_DataStoreNoSpace);\n\
         \x20   else if (tid < nvalid)\n\
         \x20       htup = gpuscan_fetch_item(kds_src, kresults->all_visible ? tid : kresults->results[tid]);\n\
         \x20   kern_projection proj;\n\
         \x20   uint extra = 0;\n\
         \x20   if (htup) {\n\
         \x20       project(kcxt, kds_src, htup, proj);\n\
         \x20       extra = projection_slot_extra(proj);\n\
         \x20   }\n\
         \x20   uint usage = gpuscan_group_reserve(&group_total, &group_base,\n\
         \x20                                      (device atomic_uint *)&kds_dst->usage, extra, lid) + extra;\n\
         \x20   if (tid == 0)\n\
         \x20       kds_dst->nitems = min(nvalid, kds_dst->nrooms);\n\
         \x20   if (htup) {\n\
         \x20       uint slots_end = kds_head_length(kds_dst) + kds_slot_row_size(kds_dst) * kds_dst->nrooms;\n\
         \x20       if (slots_end + usage > kds_dst->length) {\n\
         \x20           STROM_SET_ERROR(kcxt, StromError_DataStoreNoSpace);\n\
         \x20       } else {\n\
         \x20           projection_write_slot(kds_src, kds_dst, tid, kds_dst->length - usage, proj);\n\
         \x20       }\n\
         \x20   }\n\
         \x20   kern_writeback_error(kresults, kcxt);\n\
         }\n\n",
    );
}

/// Lower `tlist_dev` and emit `project` plus the destination kernels.
pub(crate) fn projection_section(
    em: &mut ExprEmitter<'_>,
    tlist_dev: &[TargetEntry],
    dest_format: ChunkFormat,
) -> Result<(String, ProjectionProgram), CodegenError> {
    if !matches!(dest_format, ChunkFormat::Row | ChunkFormat::Slot) {
        return Err(CodegenError::Malformed(format!(
            "projection into a {} chunk",
            dest_format
        )));
    }
    let shape = em.shape().clone();
    let mut outputs = Vec::with_capacity(tlist_dev.len());
    for entry in tlist_dev {
        match &entry.expr {
            Expr::Var {
                varno,
                attnum,
                data_type,
            } => {
                let var = VarRef {
                    varno: *varno,
                    attnum: *attnum,
                    data_type: *data_type,
                };
                check_var(&var, &shape)?;
                outputs.push(ProjectionOutput::Copy {
                    attnum: *attnum,
                    data_type: *data_type,
                });
            }
            expr => outputs.push(ProjectionOutput::Compute { expr: expr.clone() }),
        }
    }

    let mut body = String::new();
    let loads = emit_project_fn(&mut body, em, &outputs)?;
    match dest_format {
        ChunkFormat::Row => emit_row_helpers(&mut body, &outputs)?,
        _ => emit_slot_helpers(&mut body, &outputs)?,
    }

    let mut src = String::from("// --- Projection ---\n\n");
    emit_struct(&mut src, &outputs)?;
    src.push_str(&body);
    emit_kernel_helpers(&mut src);
    if dest_format == ChunkFormat::Row {
        emit_row_kernel(&mut src);
    } else {
        emit_slot_kernel(&mut src);
    }

    let program = ProjectionProgram {
        dest_shape: Arc::new(projection_shape(&shape, tlist_dev)?),
        outputs,
        dest_format,
        loads,
    };
    Ok((src, program))
}

/// Complete MSL module holding `project` and the destination kernel.
pub fn generate_projection_kernel(
    tlist_dev: &[TargetEntry],
    shape: &TupleShape,
    dest_format: ChunkFormat,
) -> Result<String, CodegenError> {
    let mut em = ExprEmitter::new(shape);
    let (body, _) = projection_section(&mut em, tlist_dev, dest_format)?;
    let mut src = String::new();
    emit_runtime_header(&mut src, DEFAULT_THREADS_PER_GROUP);
    em.emit_support(&mut src)?;
    src.push_str(&body);
    Ok(src)
}
