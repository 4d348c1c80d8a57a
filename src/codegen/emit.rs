//! Expression to MSL lowering shared by the filter and projection generators.

use std::collections::BTreeSet;

use crate::codegen::devtype::{arith_fn, cast_fn, device_struct, device_type_name, emit_type_support};
use crate::codegen::expr::{common_numeric_type, comparison_type, Expr, VarRef};
use crate::error::CodegenError;
use crate::storage::schema::TupleShape;
use crate::storage::types::DataType;
use crate::storage::value::Value;

/// Name of the typed local holding attribute `attnum`.
pub fn kvar(attnum: i16) -> String {
    format!("KVAR_{}", attnum)
}

/// Check a variable against the scan's tuple shape.
pub fn check_var(var: &VarRef, shape: &TupleShape) -> Result<(), CodegenError> {
    if var.varno != shape.relid {
        return Err(CodegenError::RelationMismatch {
            expected: shape.relid,
            found: var.varno,
        });
    }
    if var.attnum <= 0 {
        return Err(CodegenError::UnsupportedAttribute { attnum: var.attnum });
    }
    let attr = shape.attr(var.attnum).ok_or(CodegenError::AttributeOutOfRange {
        attnum: var.attnum,
        natts: shape.natts(),
    })?;
    if attr.data_type != var.data_type {
        return Err(CodegenError::AttributeType {
            attnum: var.attnum,
            declared: var.data_type,
            stored: attr.data_type,
        });
    }
    Ok(())
}

/// Lowers expressions and records which device types and casts they need.
pub struct ExprEmitter<'a> {
    shape: &'a TupleShape,
    types: BTreeSet<DataType>,
    casts: BTreeSet<(DataType, DataType)>,
}

impl<'a> ExprEmitter<'a> {
    pub fn new(shape: &'a TupleShape) -> Self {
        Self {
            shape,
            types: BTreeSet::new(),
            casts: BTreeSet::new(),
        }
    }

    pub fn shape(&self) -> &TupleShape {
        self.shape
    }

    /// Record a type whose helpers the kernel needs.
    pub fn use_type(&mut self, t: DataType) -> Result<(), CodegenError> {
        device_type_name(t)?;
        self.types.insert(t);
        Ok(())
    }

    /// Emit helpers for every type and cast recorded so far.
    pub fn emit_support(&self, src: &mut String) -> Result<(), CodegenError> {
        emit_type_support(src, &self.types, &self.casts)
    }

    /// MSL expression of type `pg_<t>_t` computing `expr`.
    pub fn emit(&mut self, expr: &Expr) -> Result<String, CodegenError> {
        let t = expr.result_type()?;
        self.use_type(t)?;
        match expr {
            Expr::Var {
                varno,
                attnum,
                data_type,
            } => {
                check_var(
                    &VarRef {
                        varno: *varno,
                        attnum: *attnum,
                        data_type: *data_type,
                    },
                    self.shape,
                )?;
                Ok(kvar(*attnum))
            }
            Expr::Const { value, data_type } => literal(value, *data_type),
            Expr::Arith { op, left, right } => {
                let (lt, rt) = (left.result_type()?, right.result_type()?);
                let l = self.emit_as(left, lt, t)?;
                let r = self.emit_as(right, rt, t)?;
                Ok(format!("{}(kcxt, {}, {})", arith_fn(t, *op)?, l, r))
            }
            Expr::Cmp { op, left, right } => {
                let (lt, rt) = (left.result_type()?, right.result_type()?);
                let ct = comparison_type(lt, rt)
                    .or_else(|| common_numeric_type(lt, rt))
                    .ok_or_else(|| CodegenError::Malformed(format!("cannot compare {} with {}", lt, rt)))?;
                self.use_type(ct)?;
                let l = self.emit_as(left, lt, ct)?;
                let r = self.emit_as(right, rt, ct)?;
                Ok(format!(
                    "pgfn_{}_{}(kcxt, {}, {})",
                    device_type_name(ct)?,
                    op.fn_name(),
                    l,
                    r
                ))
            }
            Expr::And { args } | Expr::Or { args } => {
                let func = if matches!(expr, Expr::And { .. }) {
                    "pg_bool_and"
                } else {
                    "pg_bool_or"
                };
                let parts = args.iter().map(|a| self.emit(a)).collect::<Result<Vec<_>, _>>()?;
                let mut parts = parts.into_iter();
                let Some(first) = parts.next() else {
                    // Empty AND is TRUE, empty OR is FALSE.
                    return Ok(format!("pg_bool_make({})", matches!(expr, Expr::And { .. })));
                };
                Ok(parts.fold(first, |acc, p| format!("{}({}, {})", func, acc, p)))
            }
            Expr::Not { arg } => Ok(format!("pg_bool_not({})", self.emit(arg)?)),
            Expr::IsNull { arg, negated } => {
                let inner = self.emit(arg)?;
                Ok(format!(
                    "pg_bool_make({}({}).isnull)",
                    if *negated { "!" } else { "" },
                    inner
                ))
            }
            Expr::Cast { arg, to } => {
                let from = arg.result_type()?;
                self.emit_as(arg, from, *to)
            }
        }
    }

    fn emit_as(&mut self, expr: &Expr, from: DataType, to: DataType) -> Result<String, CodegenError> {
        let inner = self.emit(expr)?;
        if from == to {
            return Ok(inner);
        }
        self.use_type(to)?;
        self.casts.insert((from, to));
        Ok(format!("{}(kcxt, {})", cast_fn(from, to)?, inner))
    }
}

/// Inline literal of a device type.
fn literal(value: &Value, t: DataType) -> Result<String, CodegenError> {
    let name = device_type_name(t)?;
    if value.is_null() {
        return Ok(format!("pg_{}_null()", name));
    }
    let body = match value {
        Value::Bool(b) => b.to_string(),
        Value::Int2(v) => format!("(short){}", v),
        Value::Int4(v) | Value::Date(v) => format!("(int){}L", v),
        Value::Int8(v) | Value::Timestamp(v) => format!("(long){}UL", *v as u64),
        Value::Float4(v) => format!("as_type<float>(0x{:08x}u)", v.to_bits()),
        Value::Numeric(n) => {
            let m = i64::try_from(n.mantissa()).map_err(|_| {
                CodegenError::Malformed(format!("numeric literal {} exceeds device precision", n))
            })?;
            return Ok(format!("pg_numeric_make((long){}UL, {})", m as u64, n.scale()));
        }
        Value::Uuid(u) => {
            let hi = u64::from_be_bytes([u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7]]);
            let lo = u64::from_be_bytes([u[8], u[9], u[10], u[11], u[12], u[13], u[14], u[15]]);
            return Ok(format!("pg_uuid_from_words(0x{:016x}UL, 0x{:016x}UL)", hi, lo));
        }
        other => {
            return Err(CodegenError::Malformed(format!(
                "literal {} has no device form",
                other
            )))
        }
    };
    if value.data_type() != Some(t) {
        return Err(CodegenError::Malformed(format!(
            "literal {} declared as {}",
            value, t
        )));
    }
    Ok(format!("pg_{}_make({})", name, body))
}

/// Declaration of the typed local for `var`.
pub fn declare_kvar(var: &VarRef) -> Result<String, CodegenError> {
    Ok(format!("    {} {};\n", device_struct(var.data_type)?, kvar(var.attnum)))
}

/// Name of the local holding the raw address of attribute `attnum`.
pub fn kaddr(attnum: i16) -> String {
    format!("KADDR_{}", attnum)
}

// ---------------------------------------------------------------------------
// Attribute loads
// ---------------------------------------------------------------------------

/// How a kernel pulls referenced attributes out of a heap tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrLoad {
    /// Nothing referenced.
    None,
    /// One attribute, fetched by number (cached offset when possible).
    Single(i16),
    /// One sequential walk up to attribute `upto`, keeping `attnums`.
    Walk { attnums: Vec<i16>, upto: i16 },
}

impl AttrLoad {
    /// Plan loads for a set of attribute numbers.
    pub fn plan(attnums: &BTreeSet<i16>) -> AttrLoad {
        match attnums.len() {
            0 => AttrLoad::None,
            1 => attnums.iter().next().map_or(AttrLoad::None, |a| AttrLoad::Single(*a)),
            _ => AttrLoad::Walk {
                attnums: attnums.iter().copied().collect(),
                upto: attnums.iter().copied().max().unwrap_or(0),
            },
        }
    }

    pub fn attnums(&self) -> Vec<i16> {
        match self {
            AttrLoad::None => Vec::new(),
            AttrLoad::Single(a) => vec![*a],
            AttrLoad::Walk { attnums, .. } => attnums.clone(),
        }
    }
}

/// Emit loads from `htup` into typed locals (`typed`) and raw address
/// locals (`addrs`). Locals must already be declared.
pub fn emit_tuple_loads(
    src: &mut String,
    kds: &str,
    typed: &[VarRef],
    addrs: &BTreeSet<i16>,
) -> Result<AttrLoad, CodegenError> {
    let mut attnums: BTreeSet<i16> = typed.iter().map(|v| v.attnum).collect();
    attnums.extend(addrs.iter().copied());
    let plan = AttrLoad::plan(&attnums);

    let assign = |attnum: i16, indent: &str| -> Result<String, CodegenError> {
        let mut out = String::new();
        for v in typed.iter().filter(|v| v.attnum == attnum) {
            out.push_str(&format!(
                "{indent}{} = pg_{}_datum_ref(kcxt, addr);\n",
                kvar(attnum),
                device_type_name(v.data_type)?
            ));
        }
        if addrs.contains(&attnum) {
            out.push_str(&format!("{indent}{} = addr;\n", kaddr(attnum)));
        }
        Ok(out)
    };

    match &plan {
        AttrLoad::None => {}
        AttrLoad::Single(attnum) => {
            src.push_str(&format!(
                "    addr = kern_get_datum_tuple({kds}->colmeta, htup, {});\n",
                attnum - 1
            ));
            src.push_str(&assign(*attnum, "    ")?);
        }
        AttrLoad::Walk { attnums, upto } => {
            src.push_str(&format!(
                "    {{\n\
                 \x20       uint off = htup_hoff(htup);\n\
                 \x20       for (uint colidx = 0; colidx < {upto}; colidx++) {{\n\
                 \x20           device const kern_colmeta &cmeta = {kds}->colmeta[colidx];\n\
                 \x20           if (heap_att_isnull(htup, colidx)) {{\n\
                 \x20               addr = nullptr;\n\
                 \x20           }} else {{\n\
                 \x20               off = TYPEALIGN(cmeta.attalign, off);\n\
                 \x20               addr = htup + off;\n\
                 \x20               off += att_stored_length(cmeta, addr);\n\
                 \x20           }}\n\
                 \x20           switch (colidx) {{\n"
            ));
            for attnum in attnums {
                src.push_str(&format!("\x20           case {}:\n", attnum - 1));
                src.push_str(&assign(*attnum, "                ")?);
                src.push_str("                break;\n");
            }
            src.push_str(
                "            default:\n\
                 \x20               break;\n\
                 \x20           }\n\
                 \x20       }\n\
                 \x20   }\n",
            );
        }
    }
    Ok(plan)
}
