//! Device type catalog and the MSL runtime the generated kernels link against.
//!
//! Every device-supported [`DataType`] maps to a `pg_<name>_t` struct holding
//! the value plus a null flag. The runtime header defines the chunk structs,
//! status codes, and tuple access helpers; per-type helpers (loads, stores,
//! comparisons, arithmetic, casts) are emitted only for the types a kernel
//! actually references.

use std::collections::BTreeSet;

use crate::codegen::expr::{cast_supported, device_supported, ArithOp};
use crate::error::CodegenError;
use crate::storage::types::DataType;

/// MSL name fragment of a device type (`int4` for `pg_int4_t`).
pub fn device_type_name(t: DataType) -> Result<&'static str, CodegenError> {
    if !device_supported(t) {
        return Err(CodegenError::UnsupportedType(t));
    }
    Ok(t.name())
}

/// Full struct name of a device type.
pub fn device_struct(t: DataType) -> Result<String, CodegenError> {
    Ok(format!("pg_{}_t", device_type_name(t)?))
}

/// Scalar base type stored in the `value` field.
fn base_type(t: DataType) -> &'static str {
    match t {
        DataType::Bool => "bool",
        DataType::Int2 => "short",
        DataType::Int4 | DataType::Date => "int",
        DataType::Int8 | DataType::Timestamp => "long",
        DataType::Float4 => "float",
        DataType::Numeric => "long",
        DataType::Uuid => "uchar16",
        DataType::Float8 | DataType::Text => "void",
    }
}

// ---------------------------------------------------------------------------
// Runtime header
// ---------------------------------------------------------------------------

/// Includes, status codes, chunk structs, and tuple access helpers.
pub fn emit_runtime_header(src: &mut String, threads_per_group: usize) {
    src.push_str("#include <metal_stdlib>\nusing namespace metal;\n\n");
    src.push_str(&format!("#define THREADS_PER_GROUP  {}\n", threads_per_group));
    src.push_str(
        "#define StromError_Success              0\n\
         #define StromError_CpuReCheck           1\n\
         #define StromError_DataStoreNoSpace     2\n\
         #define StromError_DataStoreCorruption  3\n\
         #define StromError_InvalidKernel        4\n\
         #define StromError_DeviceFault          5\n\n\
         #define KDS_FORMAT_ROW    1\n\
         #define KDS_FORMAT_SLOT   2\n\
         #define KDS_FORMAT_HASH   3\n\
         #define KDS_FORMAT_BLOCK  4\n\n\
         #define MAXALIGN(x)        (((x) + 7u) & ~7u)\n\
         #define TYPEALIGN(a, x)    (((x) + ((a) - 1u)) & ~((a) - 1u))\n\
         #define HEAP_HASNULL            0x0001\n\
         #define HEAP_TUPLE_HEADER_SIZE  16u\n\
         #define ROW_ITEM_HEADER         16u\n\
         #define PAGE_SIZE               8192u\n\
         #define PAGE_HEADER_SIZE        8u\n\
         #define LP_NORMAL               1u\n\
         #define SLOT_PTR_SOURCE         0x8000000000000000UL\n\
         #define NUMERIC_STORED_SIZE     24u\n\
         #define NUMERIC_MAX_SCALE       16\n\
         #define NUMERIC_MIN_DIV_SCALE   6\n\n",
    );

    src.push_str(
        "struct kern_colmeta {\n\
         \x20   uchar  attbyval;\n\
         \x20   uchar  attalign;\n\
         \x20   short  attlen;\n\
         \x20   short  attnum;\n\
         \x20   short  pad0;\n\
         \x20   int    attcacheoff;\n\
         \x20   uint   type_id;\n\
         \x20   int    typmod;\n\
         \x20   uint   reserved;\n\
         };\n\n\
         struct kern_data_store {\n\
         \x20   uint   length;\n\
         \x20   uint   usage;\n\
         \x20   uint   ncols;\n\
         \x20   uint   nitems;\n\
         \x20   uint   nrooms;\n\
         \x20   uint   nslots;\n\
         \x20   uint   format;\n\
         \x20   uint   table_id;\n\
         \x20   uint   nrows_per_block;\n\
         \x20   uchar  has_notbyval;\n\
         \x20   uchar  has_numeric;\n\
         \x20   ushort pad0;\n\
         \x20   uint   reserved[2];\n\
         \x20   kern_colmeta colmeta[1];\n\
         };\n\n\
         struct kern_context {\n\
         \x20   uint   errcode;\n\
         };\n\n\
         #define STROM_SET_ERROR(kcxt, code)                       \\\n\
         \x20   do {                                                  \\\n\
         \x20       if ((kcxt).errcode == StromError_Success)         \\\n\
         \x20           (kcxt).errcode = (code);                      \\\n\
         \x20   } while (0)\n\n",
    );

    // Result buffer: per-task status plus the indices of passing rows.
    src.push_str(
        "struct kern_resultbuf {\n\
         \x20   atomic_uint status;\n\
         \x20   atomic_uint nitems;\n\
         \x20   uint        nrooms;\n\
         \x20   uint        all_visible;\n\
         \x20   uint        results[1];\n\
         };\n\n\
         static inline void kern_writeback_error(device kern_resultbuf *kresults, thread kern_context &kcxt) {\n\
         \x20   if (kcxt.errcode != StromError_Success) {\n\
         \x20       uint expected = StromError_Success;\n\
         \x20       atomic_compare_exchange_weak_explicit(&kresults->status, &expected, kcxt.errcode,\n\
         \x20                                             memory_order_relaxed, memory_order_relaxed);\n\
         \x20   }\n\
         }\n\n",
    );

    src.push_str(
        "static inline uint kds_head_length(device const kern_data_store *kds) {\n\
         \x20   return MAXALIGN(48u + 24u * kds->ncols);\n\
         }\n\n\
         static inline device const char *kds_addr(device const kern_data_store *kds, uint off) {\n\
         \x20   return (device const char *)kds + off;\n\
         }\n\n\
         static inline device const char *kern_get_tuple_row(device const kern_data_store *kds, uint row_index) {\n\
         \x20   device const uint *row_index_array = (device const uint *)kds_addr(kds, kds_head_length(kds));\n\
         \x20   return kds_addr(kds, row_index_array[row_index] + ROW_ITEM_HEADER);\n\
         }\n\n\
         static inline ushort htup_natts(device const char *htup) {\n\
         \x20   return *((device const ushort *)(htup + 8));\n\
         }\n\n\
         static inline ushort htup_infomask(device const char *htup) {\n\
         \x20   return *((device const ushort *)(htup + 10));\n\
         }\n\n\
         static inline uint htup_hoff(device const char *htup) {\n\
         \x20   return *((device const ushort *)(htup + 12));\n\
         }\n\n\
         static inline bool heap_att_isnull(device const char *htup, uint colidx) {\n\
         \x20   if (colidx >= htup_natts(htup))\n\
         \x20       return true;\n\
         \x20   if ((htup_infomask(htup) & HEAP_HASNULL) == 0)\n\
         \x20       return false;\n\
         \x20   uchar bits = htup[HEAP_TUPLE_HEADER_SIZE + (colidx >> 3)];\n\
         \x20   return (bits & (1u << (colidx & 7u))) != 0;\n\
         }\n\n\
         static inline uint varsize(device const char *addr) {\n\
         \x20   return *((device const uint *)addr);\n\
         }\n\n\
         static inline uint att_stored_length(device const kern_colmeta &cmeta, device const char *addr) {\n\
         \x20   return cmeta.attlen > 0 ? (uint)cmeta.attlen : varsize(addr);\n\
         }\n\n",
    );

    // Single attribute by number: cached offset when the tuple has no
    // nulls, otherwise a walk over the preceding attributes.
    src.push_str(
        "static inline device const char *kern_get_datum_tuple(device const kern_colmeta *colmeta,\n\
         \x20                                                   device const char *htup,\n\
         \x20                                                   uint colidx) {\n\
         \x20   if (heap_att_isnull(htup, colidx))\n\
         \x20       return nullptr;\n\
         \x20   if ((htup_infomask(htup) & HEAP_HASNULL) == 0 && colmeta[colidx].attcacheoff >= 0)\n\
         \x20       return htup + colmeta[colidx].attcacheoff;\n\
         \x20   uint off = htup_hoff(htup);\n\
         \x20   for (uint i = 0; i < colidx; i++) {\n\
         \x20       if (heap_att_isnull(htup, i))\n\
         \x20           continue;\n\
         \x20       off = TYPEALIGN(colmeta[i].attalign, off);\n\
         \x20       off += att_stored_length(colmeta[i], htup + off);\n\
         \x20   }\n\
         \x20   off = TYPEALIGN(colmeta[colidx].attalign, off);\n\
         \x20   return htup + off;\n\
         }\n\n",
    );

    src.push_str(
        "static inline uint kds_slot_row_size(device const kern_data_store *kds) {\n\
         \x20   return MAXALIGN(9u * kds->ncols);\n\
         }\n\n\
         static inline device ulong *kds_slot_values(device kern_data_store *kds, uint row) {\n\
         \x20   return (device ulong *)((device char *)kds + kds_head_length(kds) + kds_slot_row_size(kds) * row);\n\
         }\n\n\
         static inline device bool *kds_slot_isnull(device kern_data_store *kds, uint row) {\n\
         \x20   return (device bool *)(kds_slot_values(kds, row) + kds->ncols);\n\
         }\n\n\
         static inline device const char *kds_block_page(device const kern_data_store *kds, uint index) {\n\
         \x20   return kds_addr(kds, kds_head_length(kds) + MAXALIGN(4u * kds->nrooms) + PAGE_SIZE * index);\n\
         }\n\n\
         static inline uint page_line_count(device const char *page) {\n\
         \x20   uint lower = *((device const ushort *)page);\n\
         \x20   return lower <= PAGE_HEADER_SIZE ? 0u : (lower - PAGE_HEADER_SIZE) / 4u;\n\
         }\n\n\
         static inline device const char *page_tuple(device const char *page, uint lineoff) {\n\
         \x20   uint lp = *((device const uint *)(page + PAGE_HEADER_SIZE + 4u * (lineoff - 1u)));\n\
         \x20   if (((lp >> 15) & 3u) != LP_NORMAL)\n\
         \x20       return nullptr;\n\
         \x20   return page + (lp & 0x7fffu);\n\
         }\n\n",
    );
}

// ---------------------------------------------------------------------------
// Per-type helpers
// ---------------------------------------------------------------------------

fn emit_templates(src: &mut String) {
    src.push_str(
        "#define PG_SCALAR_TEMPLATE(NAME, BASE)                                        \\\n\
         \x20   struct pg_##NAME##_t { BASE value; bool isnull; };                        \\\n\
         \x20   static inline pg_##NAME##_t pg_##NAME##_null() {                           \\\n\
         \x20       pg_##NAME##_t r; r.value = 0; r.isnull = true; return r;               \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_##NAME##_t pg_##NAME##_make(BASE v) {                     \\\n\
         \x20       pg_##NAME##_t r; r.value = v; r.isnull = false; return r;              \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_##NAME##_t pg_##NAME##_datum_ref(thread kern_context &kcxt, \\\n\
         \x20                                                     device const char *addr) { \\\n\
         \x20       if (!addr) return pg_##NAME##_null();                                  \\\n\
         \x20       return pg_##NAME##_make(*((device const BASE *)addr));                  \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline uint pg_##NAME##_row_store(device char *dst, uint off, pg_##NAME##_t v) { \\\n\
         \x20       off = TYPEALIGN(sizeof(BASE), off);                                    \\\n\
         \x20       *((device BASE *)(dst + off)) = v.value;                               \\\n\
         \x20       return off + sizeof(BASE);                                             \\\n\
         \x20   }\n\n",
    );
    src.push_str(
        "#define PG_COMPARE_TEMPLATE(NAME)                                             \\\n\
         \x20   static inline pg_bool_t pgfn_##NAME##_cmp_op(pg_##NAME##_t a, pg_##NAME##_t b, int op) { \\\n\
         \x20       pg_bool_t r; r.isnull = a.isnull || b.isnull; r.value = false;          \\\n\
         \x20       if (!r.isnull) {                                                       \\\n\
         \x20           int c = pg_##NAME##_cmp(a.value, b.value);                         \\\n\
         \x20           r.value = (op == 0 ? c == 0 : op == 1 ? c != 0 : op == 2 ? c < 0 : \\\n\
         \x20                      op == 3 ? c <= 0 : op == 4 ? c > 0 : c >= 0);           \\\n\
         \x20       }                                                                      \\\n\
         \x20       return r;                                                              \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_bool_t pgfn_##NAME##_eq(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { return pgfn_##NAME##_cmp_op(a, b, 0); } \\\n\
         \x20   static inline pg_bool_t pgfn_##NAME##_ne(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { return pgfn_##NAME##_cmp_op(a, b, 1); } \\\n\
         \x20   static inline pg_bool_t pgfn_##NAME##_lt(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { return pgfn_##NAME##_cmp_op(a, b, 2); } \\\n\
         \x20   static inline pg_bool_t pgfn_##NAME##_le(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { return pgfn_##NAME##_cmp_op(a, b, 3); } \\\n\
         \x20   static inline pg_bool_t pgfn_##NAME##_gt(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { return pgfn_##NAME##_cmp_op(a, b, 4); } \\\n\
         \x20   static inline pg_bool_t pgfn_##NAME##_ge(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { return pgfn_##NAME##_cmp_op(a, b, 5); }\n\n",
    );
    // Narrow integers compute in long and range-check the result.
    src.push_str(
        "#define PG_NARROW_INT_ARITH_TEMPLATE(NAME, BASE, MINV, MAXV)                  \\\n\
         \x20   static inline pg_##NAME##_t pg_##NAME##_narrow(thread kern_context &kcxt, long v) { \\\n\
         \x20       if (v < (long)(MINV) || v > (long)(MAXV)) {                            \\\n\
         \x20           STROM_SET_ERROR(kcxt, StromError_CpuReCheck);                      \\\n\
         \x20           return pg_##NAME##_null();                                         \\\n\
         \x20       }                                                                      \\\n\
         \x20       return pg_##NAME##_make((BASE)v);                                      \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_##NAME##_t pgfn_##NAME##_add(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { \\\n\
         \x20       if (a.isnull || b.isnull) return pg_##NAME##_null();                   \\\n\
         \x20       return pg_##NAME##_narrow(kcxt, (long)a.value + (long)b.value);        \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_##NAME##_t pgfn_##NAME##_sub(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { \\\n\
         \x20       if (a.isnull || b.isnull) return pg_##NAME##_null();                   \\\n\
         \x20       return pg_##NAME##_narrow(kcxt, (long)a.value - (long)b.value);        \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_##NAME##_t pgfn_##NAME##_mul(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { \\\n\
         \x20       if (a.isnull || b.isnull) return pg_##NAME##_null();                   \\\n\
         \x20       return pg_##NAME##_narrow(kcxt, (long)a.value * (long)b.value);        \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_##NAME##_t pgfn_##NAME##_div(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { \\\n\
         \x20       if (a.isnull || b.isnull) return pg_##NAME##_null();                   \\\n\
         \x20       if (b.value == 0) { STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_##NAME##_null(); } \\\n\
         \x20       return pg_##NAME##_narrow(kcxt, (long)a.value / (long)b.value);        \\\n\
         \x20   }                                                                          \\\n\
         \x20   static inline pg_##NAME##_t pgfn_##NAME##_mod(thread kern_context &kcxt, pg_##NAME##_t a, pg_##NAME##_t b) { \\\n\
         \x20       if (a.isnull || b.isnull) return pg_##NAME##_null();                   \\\n\
         \x20       if (b.value == 0) { STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_##NAME##_null(); } \\\n\
         \x20       return pg_##NAME##_narrow(kcxt, (long)a.value % (long)b.value);        \\\n\
         \x20   }\n\n",
    );
}

fn emit_scalar(src: &mut String, t: DataType) {
    let name = t.name();
    let base = base_type(t);
    src.push_str(&format!("PG_SCALAR_TEMPLATE({name}, {base})\n"));
    match t {
        DataType::Float4 => src.push_str(
            "static inline int pg_float4_cmp(float a, float b) {\n\
             \x20   bool an = isnan(a), bn = isnan(b);\n\
             \x20   if (an || bn) return an == bn ? 0 : (an ? 1 : -1);\n\
             \x20   return a < b ? -1 : (a > b ? 1 : 0);\n\
             }\n",
        ),
        _ => src.push_str(&format!(
            "static inline int pg_{name}_cmp({base} a, {base} b) {{ return a < b ? -1 : (a > b ? 1 : 0); }}\n"
        )),
    }
    src.push_str(&format!("PG_COMPARE_TEMPLATE({name})\n"));
    match t {
        DataType::Int2 => src.push_str("PG_NARROW_INT_ARITH_TEMPLATE(int2, short, -32768, 32767)\n"),
        DataType::Int4 => {
            src.push_str("PG_NARROW_INT_ARITH_TEMPLATE(int4, int, -2147483648L, 2147483647L)\n")
        }
        DataType::Int8 => emit_int8_arith(src),
        DataType::Float4 => emit_float4_arith(src),
        _ => {}
    }
    src.push('\n');
}

fn emit_int8_arith(src: &mut String) {
    src.push_str(
        "static inline pg_int8_t pgfn_int8_add(thread kern_context &kcxt, pg_int8_t a, pg_int8_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_int8_null();\n\
         \x20   long r = (long)((ulong)a.value + (ulong)b.value);\n\
         \x20   if ((a.value >= 0) == (b.value >= 0) && (r >= 0) != (a.value >= 0)) {\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
         \x20       return pg_int8_null();\n\
         \x20   }\n\
         \x20   return pg_int8_make(r);\n\
         }\n\
         static inline pg_int8_t pgfn_int8_sub(thread kern_context &kcxt, pg_int8_t a, pg_int8_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_int8_null();\n\
         \x20   long r = (long)((ulong)a.value - (ulong)b.value);\n\
         \x20   if ((a.value >= 0) != (b.value >= 0) && (r >= 0) != (a.value >= 0)) {\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
         \x20       return pg_int8_null();\n\
         \x20   }\n\
         \x20   return pg_int8_make(r);\n\
         }\n\
         static inline pg_int8_t pgfn_int8_mul(thread kern_context &kcxt, pg_int8_t a, pg_int8_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_int8_null();\n\
         \x20   long lo = (long)((ulong)a.value * (ulong)b.value);\n\
         \x20   long hi = mulhi(a.value, b.value);\n\
         \x20   if (hi != (lo >> 63)) {\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
         \x20       return pg_int8_null();\n\
         \x20   }\n\
         \x20   return pg_int8_make(lo);\n\
         }\n\
         static inline pg_int8_t pgfn_int8_div(thread kern_context &kcxt, pg_int8_t a, pg_int8_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_int8_null();\n\
         \x20   if (b.value == 0 || (b.value == -1 && a.value == LONG_MIN)) {\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
         \x20       return pg_int8_null();\n\
         \x20   }\n\
         \x20   return pg_int8_make(a.value / b.value);\n\
         }\n\
         static inline pg_int8_t pgfn_int8_mod(thread kern_context &kcxt, pg_int8_t a, pg_int8_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_int8_null();\n\
         \x20   if (b.value == 0) {\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
         \x20       return pg_int8_null();\n\
         \x20   }\n\
         \x20   return pg_int8_make(b.value == -1 ? 0 : a.value % b.value);\n\
         }\n",
    );
}

fn emit_float4_arith(src: &mut String) {
    for (op, sym) in [("add", "+"), ("sub", "-"), ("mul", "*"), ("div", "/")] {
        let zero_check = if op == "div" {
            "\x20   if (b.value == 0.0f) { STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_float4_null(); }\n"
        } else {
            ""
        };
        src.push_str(&format!(
            "static inline pg_float4_t pgfn_float4_{op}(thread kern_context &kcxt, pg_float4_t a, pg_float4_t b) {{\n\
             \x20   if (a.isnull || b.isnull) return pg_float4_null();\n\
             {zero_check}\
             \x20   float r = a.value {sym} b.value;\n\
             \x20   if (isinf(r) && !isinf(a.value) && !isinf(b.value)) {{\n\
             \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
             \x20       return pg_float4_null();\n\
             \x20   }}\n\
             \x20   return pg_float4_make(r);\n\
             }}\n"
        ));
    }
}

/// Numeric on the device: 64-bit mantissa plus scale. Stored numerics carry
/// a 128-bit mantissa; one that does not fit sets CpuReCheck.
fn emit_numeric(src: &mut String) {
    src.push_str(
        "struct pg_numeric_t { long value; int scale; bool isnull; };\n\n\
         static inline pg_numeric_t pg_numeric_null() {\n\
         \x20   pg_numeric_t r; r.value = 0; r.scale = 0; r.isnull = true; return r;\n\
         }\n\
         static inline pg_numeric_t pg_numeric_make(long v, int scale) {\n\
         \x20   pg_numeric_t r; r.value = v; r.scale = scale; r.isnull = false; return r;\n\
         }\n\
         static inline pg_numeric_t pg_numeric_datum_ref(thread kern_context &kcxt, device const char *addr) {\n\
         \x20   if (!addr) return pg_numeric_null();\n\
         \x20   int scale = *((device const ushort *)(addr + 4));\n\
         \x20   device const uint *w = (device const uint *)(addr + 8);\n\
         \x20   long lo = (long)((ulong)w[0] | ((ulong)w[1] << 32));\n\
         \x20   long hi = (long)((ulong)w[2] | ((ulong)w[3] << 32));\n\
         \x20   if (hi != (lo >> 63)) {\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
         \x20       return pg_numeric_null();\n\
         \x20   }\n\
         \x20   return pg_numeric_make(lo, scale);\n\
         }\n\
         static inline uint pg_numeric_row_store(device char *dst, uint off, pg_numeric_t v) {\n\
         \x20   off = TYPEALIGN(4u, off);\n\
         \x20   *((device uint *)(dst + off)) = NUMERIC_STORED_SIZE;\n\
         \x20   *((device ushort *)(dst + off + 4)) = (ushort)v.scale;\n\
         \x20   *((device ushort *)(dst + off + 6)) = 0;\n\
         \x20   device uint *w = (device uint *)(dst + off + 8);\n\
         \x20   ulong sign = (ulong)(v.value >> 63);\n\
         \x20   w[0] = (uint)(ulong)v.value; w[1] = (uint)((ulong)v.value >> 32);\n\
         \x20   w[2] = (uint)sign; w[3] = (uint)sign;\n\
         \x20   return off + NUMERIC_STORED_SIZE;\n\
         }\n\
         static inline bool pg_numeric_pow10(int exp, thread long &out) {\n\
         \x20   long r = 1;\n\
         \x20   for (int i = 0; i < exp; i++) {\n\
         \x20       if (r > LONG_MAX / 10) return false;\n\
         \x20       r *= 10;\n\
         \x20   }\n\
         \x20   out = r;\n\
         \x20   return true;\n\
         }\n\
         static inline bool pg_numeric_checked_mul(long a, long b, thread long &out) {\n\
         \x20   long lo = (long)((ulong)a * (ulong)b);\n\
         \x20   if (mulhi(a, b) != (lo >> 63)) return false;\n\
         \x20   out = lo;\n\
         \x20   return true;\n\
         }\n\
         static inline bool pg_numeric_rescale(pg_numeric_t v, int scale, thread long &out) {\n\
         \x20   long factor;\n\
         \x20   return pg_numeric_pow10(scale - v.scale, factor) && pg_numeric_checked_mul(v.value, factor, out);\n\
         }\n\
         static inline int pg_numeric_cmp3(thread kern_context &kcxt, pg_numeric_t a, pg_numeric_t b) {\n\
         \x20   int scale = max(a.scale, b.scale);\n\
         \x20   long x, y;\n\
         \x20   if (!pg_numeric_rescale(a, scale, x) || !pg_numeric_rescale(b, scale, y)) {\n\
         \x20       STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
         \x20       return 0;\n\
         \x20   }\n\
         \x20   return x < y ? -1 : (x > y ? 1 : 0);\n\
         }\n",
    );
    for (op, test) in [
        ("eq", "c == 0"),
        ("ne", "c != 0"),
        ("lt", "c < 0"),
        ("le", "c <= 0"),
        ("gt", "c > 0"),
        ("ge", "c >= 0"),
    ] {
        src.push_str(&format!(
            "static inline pg_bool_t pgfn_numeric_{op}(thread kern_context &kcxt, pg_numeric_t a, pg_numeric_t b) {{\n\
             \x20   pg_bool_t r; r.isnull = a.isnull || b.isnull; r.value = false;\n\
             \x20   if (!r.isnull) {{ int c = pg_numeric_cmp3(kcxt, a, b); r.value = {test}; }}\n\
             \x20   return r;\n\
             }}\n"
        ));
    }
    src.push_str(
        "#define NUMERIC_RECHECK() do { STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_numeric_null(); } while (0)\n\
         static inline pg_numeric_t pgfn_numeric_add(thread kern_context &kcxt, pg_numeric_t a, pg_numeric_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_numeric_null();\n\
         \x20   int scale = max(a.scale, b.scale);\n\
         \x20   long x, y;\n\
         \x20   if (!pg_numeric_rescale(a, scale, x) || !pg_numeric_rescale(b, scale, y)) NUMERIC_RECHECK();\n\
         \x20   long r = (long)((ulong)x + (ulong)y);\n\
         \x20   if ((x >= 0) == (y >= 0) && (r >= 0) != (x >= 0)) NUMERIC_RECHECK();\n\
         \x20   return pg_numeric_make(r, scale);\n\
         }\n\
         static inline pg_numeric_t pgfn_numeric_sub(thread kern_context &kcxt, pg_numeric_t a, pg_numeric_t b) {\n\
         \x20   if (b.isnull) return pg_numeric_null();\n\
         \x20   if (b.value == LONG_MIN) NUMERIC_RECHECK();\n\
         \x20   return pgfn_numeric_add(kcxt, a, pg_numeric_make(-b.value, b.scale));\n\
         }\n\
         static inline pg_numeric_t pgfn_numeric_mul(thread kern_context &kcxt, pg_numeric_t a, pg_numeric_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_numeric_null();\n\
         \x20   long r;\n\
         \x20   if (!pg_numeric_checked_mul(a.value, b.value, r)) NUMERIC_RECHECK();\n\
         \x20   int scale = a.scale + b.scale;\n\
         \x20   if (scale > NUMERIC_MAX_SCALE) {\n\
         \x20       long p;\n\
         \x20       if (!pg_numeric_pow10(scale - NUMERIC_MAX_SCALE, p)) NUMERIC_RECHECK();\n\
         \x20       r /= p;\n\
         \x20       scale = NUMERIC_MAX_SCALE;\n\
         \x20   }\n\
         \x20   return pg_numeric_make(r, scale);\n\
         }\n\
         static inline pg_numeric_t pgfn_numeric_div(thread kern_context &kcxt, pg_numeric_t a, pg_numeric_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_numeric_null();\n\
         \x20   if (b.value == 0) NUMERIC_RECHECK();\n\
         \x20   int scale = min(max(max(a.scale, b.scale), NUMERIC_MIN_DIV_SCALE), NUMERIC_MAX_SCALE);\n\
         \x20   int shift = scale + b.scale - a.scale;\n\
         \x20   long p, n;\n\
         \x20   if (!pg_numeric_pow10(abs(shift), p)) NUMERIC_RECHECK();\n\
         \x20   if (shift >= 0) {\n\
         \x20       if (!pg_numeric_checked_mul(a.value, p, n)) NUMERIC_RECHECK();\n\
         \x20   } else {\n\
         \x20       n = a.value / p;\n\
         \x20   }\n\
         \x20   if (b.value == -1 && n == LONG_MIN) NUMERIC_RECHECK();\n\
         \x20   return pg_numeric_make(n / b.value, scale);\n\
         }\n\
         static inline pg_numeric_t pgfn_numeric_mod(thread kern_context &kcxt, pg_numeric_t a, pg_numeric_t b) {\n\
         \x20   if (a.isnull || b.isnull) return pg_numeric_null();\n\
         \x20   int scale = max(a.scale, b.scale);\n\
         \x20   long x, y;\n\
         \x20   if (!pg_numeric_rescale(a, scale, x) || !pg_numeric_rescale(b, scale, y) || y == 0) NUMERIC_RECHECK();\n\
         \x20   return pg_numeric_make(y == -1 ? 0 : x % y, scale);\n\
         }\n\n",
    );
}

fn emit_uuid(src: &mut String) {
    src.push_str(
        "struct pg_uuid_t { uchar value[16]; bool isnull; };\n\
         static inline pg_uuid_t pg_uuid_null() { pg_uuid_t r; r.isnull = true; return r; }\n\
         static inline pg_uuid_t pg_uuid_datum_ref(thread kern_context &kcxt, device const char *addr) {\n\
         \x20   pg_uuid_t r;\n\
         \x20   if (!addr) return pg_uuid_null();\n\
         \x20   for (int i = 0; i < 16; i++) r.value[i] = (uchar)addr[i];\n\
         \x20   r.isnull = false;\n\
         \x20   return r;\n\
         }\n\
         static inline pg_uuid_t pg_uuid_from_words(ulong hi, ulong lo) {\n\
         \x20   pg_uuid_t r;\n\
         \x20   for (int i = 0; i < 8; i++) {\n\
         \x20       r.value[i] = (uchar)(hi >> (56 - 8 * i));\n\
         \x20       r.value[8 + i] = (uchar)(lo >> (56 - 8 * i));\n\
         \x20   }\n\
         \x20   r.isnull = false;\n\
         \x20   return r;\n\
         }\n\
         static inline uint pg_uuid_row_store(device char *dst, uint off, pg_uuid_t v) {\n\
         \x20   for (int i = 0; i < 16; i++) dst[off + i] = (char)v.value[i];\n\
         \x20   return off + 16;\n\
         }\n",
    );
    for (op, test) in [
        ("eq", "c == 0"),
        ("ne", "c != 0"),
        ("lt", "c < 0"),
        ("le", "c <= 0"),
        ("gt", "c > 0"),
        ("ge", "c >= 0"),
    ] {
        src.push_str(&format!(
            "static inline pg_bool_t pgfn_uuid_{op}(thread kern_context &kcxt, pg_uuid_t a, pg_uuid_t b) {{\n\
             \x20   pg_bool_t r; r.isnull = a.isnull || b.isnull; r.value = false;\n\
             \x20   if (!r.isnull) {{\n\
             \x20       int c = 0;\n\
             \x20       for (int i = 0; i < 16 && c == 0; i++) c = (int)a.value[i] - (int)b.value[i];\n\
             \x20       r.value = {test};\n\
             \x20   }}\n\
             \x20   return r;\n\
             }}\n"
        ));
    }
    src.push('\n');
}

fn emit_bool_ops(src: &mut String) {
    src.push_str(
        "static inline pg_bool_t pg_bool_not(pg_bool_t a) {\n\
         \x20   if (!a.isnull) a.value = !a.value;\n\
         \x20   return a;\n\
         }\n\
         static inline bool pg_bool_is_true(pg_bool_t a) {\n\
         \x20   return !a.isnull && a.value;\n\
         }\n\
         static inline bool pg_bool_is_false(pg_bool_t a) {\n\
         \x20   return !a.isnull && !a.value;\n\
         }\n\
         static inline pg_bool_t pg_bool_and(pg_bool_t a, pg_bool_t b) {\n\
         \x20   if (pg_bool_is_false(a) || pg_bool_is_false(b)) return pg_bool_make(false);\n\
         \x20   if (a.isnull || b.isnull) return pg_bool_null();\n\
         \x20   return pg_bool_make(true);\n\
         }\n\
         static inline pg_bool_t pg_bool_or(pg_bool_t a, pg_bool_t b) {\n\
         \x20   if (pg_bool_is_true(a) || pg_bool_is_true(b)) return pg_bool_make(true);\n\
         \x20   if (a.isnull || b.isnull) return pg_bool_null();\n\
         \x20   return pg_bool_make(false);\n\
         }\n\n",
    );
}

/// Name of the device function for an arithmetic operator.
pub fn arith_fn(t: DataType, op: ArithOp) -> Result<String, CodegenError> {
    Ok(format!("pgfn_{}_{}", device_type_name(t)?, op.fn_name()))
}

/// Name of the device cast function.
pub fn cast_fn(from: DataType, to: DataType) -> Result<String, CodegenError> {
    Ok(format!(
        "pgfn_cast_{}_to_{}",
        device_type_name(from)?,
        device_type_name(to)?
    ))
}

fn emit_cast(src: &mut String, from: DataType, to: DataType) -> Result<(), CodegenError> {
    let fname = cast_fn(from, to)?;
    let (fs, ts) = (device_struct(from)?, device_struct(to)?);
    let to_name = device_type_name(to)?;
    let body = match (from, to) {
        (DataType::Date, DataType::Timestamp) => {
            "\x20   return pg_timestamp_make((long)a.value * 86400000000L);\n".to_string()
        }
        (DataType::Timestamp, DataType::Date) => {
            "\x20   long d = a.value / 86400000000L;\n\
             \x20   if (a.value % 86400000000L < 0) d -= 1;\n\
             \x20   if (d < INT_MIN || d > INT_MAX) { STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_date_null(); }\n\
             \x20   return pg_date_make((int)d);\n"
                .to_string()
        }
        (DataType::Int4, DataType::Bool) => "\x20   return pg_bool_make(a.value != 0);\n".to_string(),
        (DataType::Bool, DataType::Int4) => "\x20   return pg_int4_make(a.value ? 1 : 0);\n".to_string(),
        (f, DataType::Numeric) if f.is_integer() => {
            "\x20   return pg_numeric_make((long)a.value, 0);\n".to_string()
        }
        (DataType::Numeric, DataType::Float4) => {
            "\x20   long p;\n\
             \x20   if (!pg_numeric_pow10(a.scale, p)) { STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_float4_null(); }\n\
             \x20   return pg_float4_make((float)((double)a.value / (double)p));\n"
                .to_string()
        }
        // Float to numeric needs decimal formatting the device lacks.
        (DataType::Float4, DataType::Numeric) => {
            "\x20   STROM_SET_ERROR(kcxt, StromError_CpuReCheck);\n\
             \x20   return pg_numeric_null();\n"
                .to_string()
        }
        (DataType::Numeric, t) if t.is_integer() => format!(
            "\x20   long p;\n\
             \x20   if (!pg_numeric_pow10(a.scale, p)) {{ STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_{to_name}_null(); }}\n\
             \x20   long q = a.value / p, r = a.value % p;\n\
             \x20   if (2 * abs(r) >= p) q += (a.value < 0 ? -1 : 1);\n\
             \x20   return pg_{to_name}_narrow_cast(kcxt, q);\n"
        ),
        (DataType::Float4, t) if t.is_integer() => format!(
            "\x20   float f = rint_away(a.value);\n\
             \x20   if (isnan(f) || fabs(f) >= 9.2e18f) {{ STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_{to_name}_null(); }}\n\
             \x20   return pg_{to_name}_narrow_cast(kcxt, (long)f);\n"
        ),
        (f, DataType::Float4) if f.is_integer() => {
            "\x20   return pg_float4_make((float)a.value);\n".to_string()
        }
        (f, t) if f.is_integer() && t.is_integer() => {
            format!("\x20   return pg_{to_name}_narrow_cast(kcxt, (long)a.value);\n")
        }
        _ => {
            return Err(CodegenError::Malformed(format!(
                "no device cast from {} to {}",
                from, to
            )))
        }
    };
    let null_ret = format!("pg_{}_null()", to_name);
    src.push_str(&format!(
        "static inline {ts} {fname}(thread kern_context &kcxt, {fs} a) {{\n\
         \x20   if (a.isnull) return {null_ret};\n\
         {body}\
         }}\n"
    ));
    Ok(())
}

fn emit_cast_support(src: &mut String, types: &BTreeSet<DataType>) {
    src.push_str(
        "static inline float rint_away(float f) {\n\
         \x20   return f < 0.0f ? -floor(-f + 0.5f) : floor(f + 0.5f);\n\
         }\n",
    );
    for (t, lo, hi) in [
        (DataType::Int2, "-32768L", "32767L"),
        (DataType::Int4, "-2147483648L", "2147483647L"),
        (DataType::Int8, "LONG_MIN", "LONG_MAX"),
    ] {
        if !types.contains(&t) {
            continue;
        }
        let name = t.name();
        let base = base_type(t);
        src.push_str(&format!(
            "static inline pg_{name}_t pg_{name}_narrow_cast(thread kern_context &kcxt, long v) {{\n\
             \x20   if (v < {lo} || v > {hi}) {{ STROM_SET_ERROR(kcxt, StromError_CpuReCheck); return pg_{name}_null(); }}\n\
             \x20   return pg_{name}_make(({base})v);\n\
             }}\n"
        ));
    }
    src.push('\n');
}

/// Emit helpers for `types` (bool is always included) and for every cast
/// pair in `casts`.
pub fn emit_type_support(
    src: &mut String,
    types: &BTreeSet<DataType>,
    casts: &BTreeSet<(DataType, DataType)>,
) -> Result<(), CodegenError> {
    let mut all = types.clone();
    all.insert(DataType::Bool);
    for (from, to) in casts {
        all.insert(*from);
        all.insert(*to);
    }
    for t in &all {
        device_type_name(*t)?;
    }

    src.push_str("// --- Device type support ---\n\n");
    emit_templates(src);
    // bool first: every comparison returns pg_bool_t.
    emit_scalar(src, DataType::Bool);
    emit_bool_ops(src);
    for t in all.iter().copied() {
        match t {
            DataType::Bool => {}
            DataType::Numeric => emit_numeric(src),
            DataType::Uuid => emit_uuid(src),
            _ => emit_scalar(src, t),
        }
    }
    if !casts.is_empty() {
        emit_cast_support(src, &all);
        for (from, to) in casts {
            if !cast_supported(*from, *to) {
                return Err(CodegenError::Malformed(format!("no cast from {} to {}", from, to)));
            }
            emit_cast(src, *from, *to)?;
        }
        src.push('\n');
    }
    src.push_str("// --- End device type support ---\n\n");
    Ok(())
}
