//! Expression trees for scan filters and target lists.
//!
//! Expressions are typed: every `Var` and `Const` carries its data type and
//! operators derive theirs via [`Expr::result_type`]. The same tree drives
//! kernel generation and host-side (fallback) evaluation.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops;

use serde::{Deserialize, Serialize};

use crate::error::CodegenError;
use crate::storage::schema::TupleShape;
use crate::storage::types::DataType;
use crate::storage::value::Value;

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }

    /// Suffix of the device function implementing the operator.
    pub fn fn_name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    pub fn fn_name(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }

    /// Whether `ordering` (left vs right) satisfies the operator.
    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
        }
    }
}

/// A reference to one attribute of one relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarRef {
    pub varno: u32,
    pub attnum: i16,
    pub data_type: DataType,
}

/// Typed expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// Attribute `attnum` (1-based; 0 is the whole row) of relation `varno`.
    Var {
        varno: u32,
        attnum: i16,
        data_type: DataType,
    },
    /// Literal; `value` may be `Null`.
    Const { value: Value, data_type: DataType },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Cmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And { args: Vec<Expr> },
    Or { args: Vec<Expr> },
    Not { arg: Box<Expr> },
    IsNull { arg: Box<Expr>, negated: bool },
    Cast { arg: Box<Expr>, to: DataType },
}

// ============================================================================
// Type rules
// ============================================================================

fn numeric_rank(t: DataType) -> Option<u8> {
    match t {
        DataType::Int2 => Some(1),
        DataType::Int4 => Some(2),
        DataType::Int8 => Some(3),
        DataType::Numeric => Some(4),
        DataType::Float4 => Some(5),
        DataType::Float8 => Some(6),
        _ => None,
    }
}

/// Common type of two numeric-family operands.
///
/// Integers widen to the larger integer; numeric absorbs integers; floats
/// absorb everything, and a float4 mixed with anything but float4 becomes
/// float8.
pub fn common_numeric_type(a: DataType, b: DataType) -> Option<DataType> {
    let (ra, rb) = (numeric_rank(a)?, numeric_rank(b)?);
    if a.is_float() || b.is_float() {
        if a == DataType::Float4 && b == DataType::Float4 {
            return Some(DataType::Float4);
        }
        return Some(DataType::Float8);
    }
    Some(if ra >= rb { a } else { b })
}

/// Type both sides of a comparison are converted to.
pub fn comparison_type(a: DataType, b: DataType) -> Option<DataType> {
    if a == b {
        return Some(a);
    }
    match (a, b) {
        (DataType::Date, DataType::Timestamp) | (DataType::Timestamp, DataType::Date) => {
            Some(DataType::Timestamp)
        }
        _ => common_numeric_type(a, b),
    }
}

/// Whether an explicit cast from `from` to `to` exists.
pub fn cast_supported(from: DataType, to: DataType) -> bool {
    from == to
        || (numeric_rank(from).is_some() && numeric_rank(to).is_some())
        || matches!(
            (from, to),
            (DataType::Date, DataType::Timestamp)
                | (DataType::Timestamp, DataType::Date)
                | (DataType::Int4, DataType::Bool)
                | (DataType::Bool, DataType::Int4)
        )
}

/// Whether generated kernels can hold values of this type. Text has no
/// device representation; float8 has none because MSL lacks `double`.
pub fn device_supported(t: DataType) -> bool {
    !matches!(t, DataType::Text | DataType::Float8)
}

// ============================================================================
// Construction
// ============================================================================

impl Expr {
    pub fn var(varno: u32, attnum: i16, data_type: DataType) -> Expr {
        Expr::Var {
            varno,
            attnum,
            data_type,
        }
    }

    /// Variable for a named column of `shape`.
    pub fn column(shape: &TupleShape, name: &str) -> Option<Expr> {
        let attnum = shape.attnum_of(name)?;
        let attr = shape.attr(attnum)?;
        Some(Expr::var(shape.relid, attnum, attr.data_type))
    }

    /// Typed literal. `Value::Null` becomes a NULL of type bool; use
    /// [`Expr::null`] for other types.
    pub fn constant(value: Value) -> Expr {
        let data_type = value.data_type().unwrap_or(DataType::Bool);
        Expr::Const { value, data_type }
    }

    pub fn null(data_type: DataType) -> Expr {
        Expr::Const {
            value: Value::Null,
            data_type,
        }
    }

    pub fn int4(v: i32) -> Expr {
        Expr::constant(Value::Int4(v))
    }

    pub fn int8(v: i64) -> Expr {
        Expr::constant(Value::Int8(v))
    }

    fn arith(self, op: ArithOp, rhs: Expr) -> Expr {
        Expr::Arith {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    pub fn compare(self, op: CmpOp, rhs: Expr) -> Expr {
        Expr::Cmp {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    pub fn equal(self, rhs: Expr) -> Expr {
        self.compare(CmpOp::Eq, rhs)
    }

    pub fn not_equal(self, rhs: Expr) -> Expr {
        self.compare(CmpOp::Ne, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        self.compare(CmpOp::Lt, rhs)
    }

    pub fn le(self, rhs: Expr) -> Expr {
        self.compare(CmpOp::Le, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        self.compare(CmpOp::Gt, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        self.compare(CmpOp::Ge, rhs)
    }

    pub fn and(args: Vec<Expr>) -> Expr {
        Expr::And { args }
    }

    pub fn or(args: Vec<Expr>) -> Expr {
        Expr::Or { args }
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull {
            arg: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNull {
            arg: Box::new(self),
            negated: true,
        }
    }

    pub fn cast(self, to: DataType) -> Expr {
        Expr::Cast {
            arg: Box::new(self),
            to,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Expr::Var { .. })
    }
}

impl ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        self.arith(ArithOp::Add, rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        self.arith(ArithOp::Sub, rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        self.arith(ArithOp::Mul, rhs)
    }
}

impl ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        self.arith(ArithOp::Div, rhs)
    }
}

impl ops::Rem for Expr {
    type Output = Expr;
    fn rem(self, rhs: Expr) -> Expr {
        self.arith(ArithOp::Mod, rhs)
    }
}

impl ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        Expr::Not { arg: Box::new(self) }
    }
}

// ============================================================================
// Analysis
// ============================================================================

impl Expr {
    /// Result type, checking operand compatibility on the way.
    pub fn result_type(&self) -> Result<DataType, CodegenError> {
        match self {
            Expr::Var { data_type, .. } | Expr::Const { data_type, .. } => Ok(*data_type),
            Expr::Arith { op, left, right } => {
                let (lt, rt) = (left.result_type()?, right.result_type()?);
                let t = common_numeric_type(lt, rt).ok_or_else(|| {
                    CodegenError::Malformed(format!("no operator {} {} {}", lt, op.symbol(), rt))
                })?;
                if *op == ArithOp::Mod && t.is_float() {
                    return Err(CodegenError::Malformed(format!("no operator {} % {}", lt, rt)));
                }
                Ok(t)
            }
            Expr::Cmp { op, left, right } => {
                let (lt, rt) = (left.result_type()?, right.result_type()?);
                comparison_type(lt, rt).ok_or_else(|| {
                    CodegenError::Malformed(format!("no operator {} {} {}", lt, op.symbol(), rt))
                })?;
                Ok(DataType::Bool)
            }
            Expr::And { args } | Expr::Or { args } => {
                for arg in args {
                    let t = arg.result_type()?;
                    if t != DataType::Bool {
                        return Err(CodegenError::NotBoolean(t));
                    }
                }
                Ok(DataType::Bool)
            }
            Expr::Not { arg } => match arg.result_type()? {
                DataType::Bool => Ok(DataType::Bool),
                t => Err(CodegenError::NotBoolean(t)),
            },
            Expr::IsNull { arg, .. } => {
                arg.result_type()?;
                Ok(DataType::Bool)
            }
            Expr::Cast { arg, to } => {
                let from = arg.result_type()?;
                if !cast_supported(from, *to) {
                    return Err(CodegenError::Malformed(format!("no cast from {} to {}", from, to)));
                }
                Ok(*to)
            }
        }
    }

    /// Direct children.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Var { .. } | Expr::Const { .. } => Vec::new(),
            Expr::Arith { left, right, .. } | Expr::Cmp { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
            Expr::And { args } | Expr::Or { args } => args.iter().collect(),
            Expr::Not { arg } | Expr::IsNull { arg, .. } | Expr::Cast { arg, .. } => {
                vec![arg.as_ref()]
            }
        }
    }

    /// Append every variable reference, in tree order.
    pub fn collect_vars(&self, out: &mut Vec<VarRef>) {
        if let Expr::Var {
            varno,
            attnum,
            data_type,
        } = self
        {
            out.push(VarRef {
                varno: *varno,
                attnum: *attnum,
                data_type: *data_type,
            });
        }
        for child in self.children() {
            child.collect_vars(out);
        }
    }

    /// Distinct variables ordered by (relation, attribute).
    pub fn vars(&self) -> Vec<VarRef> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out.sort();
        out.dedup();
        out
    }

    /// Whether the device can evaluate this expression: every node's type
    /// and every operand type has a device implementation, numeric literals
    /// fit the device's 64-bit form, and no whole-row or system attributes
    /// are referenced.
    pub fn is_device_executable(&self) -> bool {
        let Ok(t) = self.result_type() else {
            return false;
        };
        if !device_supported(t) {
            return false;
        }
        let node_ok = match self {
            Expr::Var { attnum, .. } => *attnum > 0,
            Expr::Const {
                value: Value::Numeric(n),
                ..
            } => n.fits_device(),
            _ => true,
        };
        node_ok && self.children().iter().all(|c| c.is_device_executable())
    }
}

/// Distinct variables of a list of expressions.
pub fn vars_of(exprs: &[Expr]) -> Vec<VarRef> {
    let mut out = Vec::new();
    for e in exprs {
        e.collect_vars(&mut out);
    }
    out.sort();
    out.dedup();
    out
}

// ============================================================================
// Structure hash
// ============================================================================

/// Hash of the expression structure, literal values included (they are
/// inlined into the generated source).
pub fn structure_hash<'a, I>(exprs: I) -> u64
where
    I: IntoIterator<Item = &'a Expr>,
{
    let mut hasher = DefaultHasher::new();
    for e in exprs {
        hash_expr(e, &mut hasher);
    }
    hasher.finish()
}

pub(crate) fn hash_expr(expr: &Expr, hasher: &mut DefaultHasher) {
    match expr {
        Expr::Var {
            varno,
            attnum,
            data_type,
        } => {
            "Var".hash(hasher);
            varno.hash(hasher);
            attnum.hash(hasher);
            data_type.hash(hasher);
        }
        Expr::Const { value, data_type } => {
            "Const".hash(hasher);
            data_type.hash(hasher);
            hash_value(value, hasher);
        }
        Expr::Arith { op, .. } => {
            "Arith".hash(hasher);
            op.hash(hasher);
        }
        Expr::Cmp { op, .. } => {
            "Cmp".hash(hasher);
            op.hash(hasher);
        }
        Expr::And { args } => {
            "And".hash(hasher);
            args.len().hash(hasher);
        }
        Expr::Or { args } => {
            "Or".hash(hasher);
            args.len().hash(hasher);
        }
        Expr::Not { .. } => "Not".hash(hasher),
        Expr::IsNull { negated, .. } => {
            "IsNull".hash(hasher);
            negated.hash(hasher);
        }
        Expr::Cast { to, .. } => {
            "Cast".hash(hasher);
            to.hash(hasher);
        }
    }
    for child in expr.children() {
        hash_expr(child, hasher);
    }
}

fn hash_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => b.hash(hasher),
        Value::Float4(f) => f.to_bits().hash(hasher),
        Value::Float8(f) => f.to_bits().hash(hasher),
        Value::Numeric(n) => {
            n.mantissa().hash(hasher);
            n.scale().hash(hasher);
        }
        Value::Uuid(u) => u.hash(hasher),
        Value::Text(s) => s.hash(hasher),
        other => other.as_i64().hash(hasher),
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var { attnum, .. } => write!(f, "${}", attnum),
            Expr::Const {
                value: Value::Null,
                data_type,
            } => write!(f, "NULL::{}", data_type),
            Expr::Const {
                value: Value::Text(s),
                ..
            } => write!(f, "'{}'", s),
            Expr::Const { value, .. } => write!(f, "{}", value),
            Expr::Arith { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::Cmp { op, left, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::And { args } | Expr::Or { args } => {
                let sep = if matches!(self, Expr::And { .. }) {
                    " AND "
                } else {
                    " OR "
                };
                f.write_str("(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Not { arg } => write!(f, "NOT {}", arg),
            Expr::IsNull { arg, negated } => {
                write!(f, "{} IS {}NULL", arg, if *negated { "NOT " } else { "" })
            }
            Expr::Cast { arg, to } => write!(f, "CAST({} AS {})", arg, to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::AttrDesc;
    use crate::storage::value::Numeric;

    fn shape() -> TupleShape {
        TupleShape::new(
            42,
            vec![
                AttrDesc::new("id", DataType::Int4),
                AttrDesc::new("v", DataType::Int8),
                AttrDesc::new("price", DataType::Numeric),
                AttrDesc::new("name", DataType::Text),
                AttrDesc::new("ratio", DataType::Float8),
            ],
        )
    }

    fn col(name: &str) -> Expr {
        Expr::column(&shape(), name).unwrap()
    }

    #[test]
    fn test_result_types() {
        assert_eq!((col("id") + col("v")).result_type().unwrap(), DataType::Int8);
        assert_eq!((col("id") * col("price")).result_type().unwrap(), DataType::Numeric);
        assert_eq!((col("v") / col("ratio")).result_type().unwrap(), DataType::Float8);
        assert_eq!(col("v").gt(Expr::int4(8)).result_type().unwrap(), DataType::Bool);
        assert!(matches!(
            (col("name") + col("id")).result_type(),
            Err(CodegenError::Malformed(_))
        ));
        assert!(matches!(
            Expr::and(vec![col("id")]).result_type(),
            Err(CodegenError::NotBoolean(DataType::Int4))
        ));
        assert!(col("ratio").cast(DataType::Date).result_type().is_err());
    }

    #[test]
    fn test_vars_are_distinct_and_sorted() {
        let e = Expr::and(vec![
            col("v").gt(Expr::int4(8)),
            (col("id") + col("v")).lt(Expr::int8(100)),
            col("price").is_not_null(),
        ]);
        let attnums: Vec<i16> = e.vars().iter().map(|v| v.attnum).collect();
        assert_eq!(attnums, vec![1, 2, 3]);
    }

    #[test]
    fn test_device_executability() {
        assert!(col("v").gt(Expr::int4(8)).is_device_executable());
        assert!(!col("name").is_not_null().is_device_executable());
        assert!(!col("ratio").gt(Expr::constant(Value::Float8(0.5))).is_device_executable());
        assert!(!Expr::var(42, 0, DataType::Int4).is_not_null().is_device_executable());

        let wide = Expr::constant(Value::Numeric(Numeric::new(i64::MAX as i128 * 10, 0)));
        assert!(!col("price").lt(wide).is_device_executable());
    }

    #[test]
    fn test_structure_hash_includes_literals() {
        let a = col("v").gt(Expr::int4(8));
        let b = col("v").gt(Expr::int4(9));
        let c = col("v").gt(Expr::int4(8));
        assert_ne!(structure_hash([&a]), structure_hash([&b]));
        assert_eq!(structure_hash([&a]), structure_hash([&c]));
        assert_ne!(structure_hash([&a]), structure_hash([&col("v").ge(Expr::int4(8))]));
    }

    #[test]
    fn test_display_and_serde() {
        let e = Expr::and(vec![col("v").gt(Expr::int4(8)), !col("id").is_null()]);
        assert_eq!(e.to_string(), "($2 > 8 AND NOT $1 IS NULL)");
        let json = serde_json::to_string(&e).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
