//! Expression evaluation with SQL semantics.
//!
//! One evaluator serves two roles. In [`EvalMode::Device`] it reproduces what
//! the generated kernels compute: numerics live in a 64-bit internal form and
//! anything that does not fit is reported as [`EvalError::DevicePrecision`],
//! which the device turns into a host recheck. In [`EvalMode::Host`] numerics
//! use the full 128-bit mantissa and every error is a real error.

use std::cmp::Ordering;

use crate::codegen::expr::{cast_supported, ArithOp, CmpOp, Expr};
use crate::error::EvalError;
use crate::storage::types::DataType;
use crate::storage::value::{Numeric, Value};

const USECS_PER_DAY: i64 = 86_400_000_000;

/// Where an evaluation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Host,
    Device,
}

/// Attribute lookup for the row being evaluated.
pub trait AttrSource {
    /// Value of attribute `attnum` (1-based).
    fn attr(&self, attnum: i16) -> Result<Value, EvalError>;
}

impl AttrSource for [Value] {
    fn attr(&self, attnum: i16) -> Result<Value, EvalError> {
        if attnum < 1 {
            return Err(EvalError::MissingAttribute(attnum));
        }
        self.get(attnum as usize - 1)
            .cloned()
            .ok_or(EvalError::MissingAttribute(attnum))
    }
}

impl AttrSource for Vec<Value> {
    fn attr(&self, attnum: i16) -> Result<Value, EvalError> {
        self.as_slice().attr(attnum)
    }
}

/// Evaluates expressions against one row at a time.
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    mode: EvalMode,
}

impl Evaluator {
    pub const fn host() -> Self {
        Self {
            mode: EvalMode::Host,
        }
    }

    pub const fn device() -> Self {
        Self {
            mode: EvalMode::Device,
        }
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    /// Implicitly AND-ed qualifier list; passes only on TRUE.
    pub fn eval_quals<R: AttrSource + ?Sized>(
        &self,
        quals: &[Expr],
        row: &R,
    ) -> Result<bool, EvalError> {
        for qual in quals {
            if self.eval(qual, row)? != Value::Bool(true) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn eval<R: AttrSource + ?Sized>(&self, expr: &Expr, row: &R) -> Result<Value, EvalError> {
        match expr {
            Expr::Var { attnum, .. } => {
                let value = row.attr(*attnum)?;
                self.check_device(&value)?;
                Ok(value)
            }
            Expr::Const { value, .. } => {
                self.check_device(value)?;
                Ok(value.clone())
            }
            Expr::Arith { op, left, right } => {
                let a = self.eval(left, row)?;
                let b = self.eval(right, row)?;
                let result = self.arith(*op, a, b)?;
                self.check_device(&result)?;
                Ok(result)
            }
            Expr::Cmp { op, left, right } => {
                let a = self.eval(left, row)?;
                let b = self.eval(right, row)?;
                if a.is_null() || b.is_null() {
                    return Ok(Value::Null);
                }
                Ok(Value::Bool(op.matches(compare_values(*op, &a, &b)?)))
            }
            Expr::And { args } => {
                let mut saw_null = false;
                for arg in args {
                    match self.eval(arg, row)? {
                        Value::Bool(false) => return Ok(Value::Bool(false)),
                        Value::Bool(true) => {}
                        Value::Null => saw_null = true,
                        other => return Err(type_mismatch("AND", &other)),
                    }
                }
                Ok(if saw_null { Value::Null } else { Value::Bool(true) })
            }
            Expr::Or { args } => {
                let mut saw_null = false;
                for arg in args {
                    match self.eval(arg, row)? {
                        Value::Bool(true) => return Ok(Value::Bool(true)),
                        Value::Bool(false) => {}
                        Value::Null => saw_null = true,
                        other => return Err(type_mismatch("OR", &other)),
                    }
                }
                Ok(if saw_null { Value::Null } else { Value::Bool(false) })
            }
            Expr::Not { arg } => match self.eval(arg, row)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                Value::Null => Ok(Value::Null),
                other => Err(type_mismatch("NOT", &other)),
            },
            Expr::IsNull { arg, negated } => {
                let isnull = self.eval(arg, row)?.is_null();
                Ok(Value::Bool(isnull != *negated))
            }
            Expr::Cast { arg, to } => {
                let value = self.eval(arg, row)?;
                let result = cast_value(value, *to)?;
                self.check_device(&result)?;
                Ok(result)
            }
        }
    }

    fn check_device(&self, value: &Value) -> Result<(), EvalError> {
        match (self.mode, value) {
            (EvalMode::Device, Value::Numeric(n)) if !n.fits_device() => {
                Err(EvalError::DevicePrecision)
            }
            _ => Ok(()),
        }
    }

    fn arith(&self, op: ArithOp, a: Value, b: Value) -> Result<Value, EvalError> {
        let (Some(ta), Some(tb)) = (a.data_type(), b.data_type()) else {
            return Ok(Value::Null);
        };
        let t = crate::codegen::expr::common_numeric_type(ta, tb)
            .ok_or_else(|| type_mismatch(op.symbol(), &a))?;
        match t {
            DataType::Int2 | DataType::Int4 | DataType::Int8 => {
                let (x, y) = (int_of(&a)?, int_of(&b)?);
                narrow_int(t, int_op(op, x, y)?)
            }
            DataType::Numeric => {
                let (x, y) = (numeric_of(&a)?, numeric_of(&b)?);
                numeric_op(op, x, y).map(Value::Numeric)
            }
            _ => {
                let (x, y) = (float_of(&a)?, float_of(&b)?);
                float_op(op, t, x, y)
            }
        }
    }
}

fn type_mismatch(op: &'static str, operand: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op,
        operand: operand
            .data_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "null".to_string()),
    }
}

fn int_of(v: &Value) -> Result<i64, EvalError> {
    v.as_i64().ok_or_else(|| type_mismatch("integer arithmetic", v))
}

fn float_of(v: &Value) -> Result<f64, EvalError> {
    v.as_f64().ok_or_else(|| type_mismatch("float arithmetic", v))
}

fn numeric_of(v: &Value) -> Result<Numeric, EvalError> {
    match v {
        Value::Numeric(n) => Ok(*n),
        other => other
            .as_i64()
            .filter(|_| other.data_type().is_some_and(DataType::is_integer))
            .map(Numeric::from_i64)
            .ok_or_else(|| type_mismatch("numeric arithmetic", other)),
    }
}

fn int_op(op: ArithOp, x: i64, y: i64) -> Result<i64, EvalError> {
    let overflow = EvalError::Overflow(DataType::Int8);
    match op {
        ArithOp::Add => x.checked_add(y).ok_or(overflow),
        ArithOp::Sub => x.checked_sub(y).ok_or(overflow),
        ArithOp::Mul => x.checked_mul(y).ok_or(overflow),
        ArithOp::Div if y == 0 => Err(EvalError::DivisionByZero),
        ArithOp::Div => x.checked_div(y).ok_or(overflow),
        ArithOp::Mod if y == 0 => Err(EvalError::DivisionByZero),
        ArithOp::Mod if y == -1 => Ok(0),
        ArithOp::Mod => Ok(x % y),
    }
}

fn narrow_int(t: DataType, v: i64) -> Result<Value, EvalError> {
    let overflow = EvalError::Overflow(t);
    Ok(match t {
        DataType::Int2 => Value::Int2(i16::try_from(v).map_err(|_| overflow)?),
        DataType::Int4 => Value::Int4(i32::try_from(v).map_err(|_| overflow)?),
        _ => Value::Int8(v),
    })
}

fn numeric_op(op: ArithOp, x: Numeric, y: Numeric) -> Result<Numeric, EvalError> {
    if matches!(op, ArithOp::Div | ArithOp::Mod) && y.is_zero() {
        return Err(EvalError::DivisionByZero);
    }
    let result = match op {
        ArithOp::Add => x.checked_add(y),
        ArithOp::Sub => x.checked_sub(y),
        ArithOp::Mul => x.checked_mul(y),
        ArithOp::Div => x.checked_div(y),
        ArithOp::Mod => x.checked_rem(y),
    };
    result.ok_or(EvalError::Overflow(DataType::Numeric))
}

fn float_op(op: ArithOp, t: DataType, x: f64, y: f64) -> Result<Value, EvalError> {
    let r = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div if y == 0.0 => return Err(EvalError::DivisionByZero),
        ArithOp::Div => x / y,
        ArithOp::Mod => return Err(type_mismatch("%", &Value::Float8(x))),
    };
    float_result(t, r, x.is_finite() && y.is_finite())
}

fn float_result(t: DataType, r: f64, inputs_finite: bool) -> Result<Value, EvalError> {
    if t == DataType::Float4 {
        let narrowed = r as f32;
        if narrowed.is_infinite() && inputs_finite {
            return Err(EvalError::Overflow(t));
        }
        Ok(Value::Float4(narrowed))
    } else {
        if r.is_infinite() && inputs_finite {
            return Err(EvalError::Overflow(t));
        }
        Ok(Value::Float8(r))
    }
}

/// NaN sorts above every other float and equals itself.
fn float_cmp(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn timestamp_of(v: &Value) -> Option<i64> {
    match v {
        Value::Date(d) => (*d as i64).checked_mul(USECS_PER_DAY),
        Value::Timestamp(t) => Some(*t),
        _ => None,
    }
}

/// Order two non-null values of comparable types.
pub fn compare_values(op: CmpOp, a: &Value, b: &Value) -> Result<Ordering, EvalError> {
    let mismatch = || type_mismatch(op.symbol(), b);
    Ok(match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Uuid(x), Value::Uuid(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::Date(_) | Value::Timestamp(_), Value::Date(_) | Value::Timestamp(_)) => {
            let x = timestamp_of(a).ok_or(EvalError::Overflow(DataType::Timestamp))?;
            let y = timestamp_of(b).ok_or(EvalError::Overflow(DataType::Timestamp))?;
            x.cmp(&y)
        }
        _ => {
            let (ta, tb) = (
                a.data_type().ok_or_else(mismatch)?,
                b.data_type().ok_or_else(mismatch)?,
            );
            match crate::codegen::expr::common_numeric_type(ta, tb).ok_or_else(mismatch)? {
                DataType::Float4 | DataType::Float8 => float_cmp(float_of(a)?, float_of(b)?),
                DataType::Numeric => numeric_of(a)?.cmp(&numeric_of(b)?),
                _ => int_of(a)?.cmp(&int_of(b)?),
            }
        }
    })
}

/// Round half away from zero to an integer.
fn numeric_round(n: Numeric) -> Option<i128> {
    let p = 10i128.checked_pow(n.scale() as u32)?;
    let (q, r) = (n.mantissa() / p, n.mantissa() % p);
    Some(if 2 * r.abs() >= p { q + n.mantissa().signum() } else { q })
}

fn float_to_numeric(f: f64) -> Result<Numeric, EvalError> {
    if !f.is_finite() {
        return Err(EvalError::Overflow(DataType::Numeric));
    }
    let text = format!("{:.6}", f);
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    Numeric::parse(trimmed).ok_or(EvalError::Overflow(DataType::Numeric))
}

/// Explicit cast with SQL rounding and range checks.
pub fn cast_value(value: Value, to: DataType) -> Result<Value, EvalError> {
    let Some(from) = value.data_type() else {
        return Ok(Value::Null);
    };
    if from == to {
        return Ok(value);
    }
    if !cast_supported(from, to) {
        return Err(type_mismatch("CAST", &value));
    }
    let overflow = EvalError::Overflow(to);
    match to {
        DataType::Int2 | DataType::Int4 | DataType::Int8 => {
            let wide: i128 = match &value {
                Value::Bool(b) => *b as i128,
                Value::Numeric(n) => numeric_round(*n).ok_or(overflow.clone())?,
                Value::Float4(_) | Value::Float8(_) => {
                    let f = float_of(&value)?.round();
                    if !f.is_finite() || f.abs() >= 9.3e18 {
                        return Err(overflow);
                    }
                    f as i128
                }
                other => int_of(other)? as i128,
            };
            narrow_int(to, i64::try_from(wide).map_err(|_| overflow)?)
        }
        DataType::Numeric => match &value {
            Value::Float4(_) | Value::Float8(_) => float_to_numeric(float_of(&value)?).map(Value::Numeric),
            other => numeric_of(other).map(Value::Numeric),
        },
        DataType::Float4 | DataType::Float8 => {
            let f = float_of(&value)?;
            float_result(to, f, f.is_finite())
        }
        DataType::Timestamp => timestamp_of(&value)
            .map(Value::Timestamp)
            .ok_or(overflow),
        DataType::Date => match value {
            Value::Timestamp(t) => i32::try_from(t.div_euclid(USECS_PER_DAY))
                .map(Value::Date)
                .map_err(|_| overflow),
            other => Err(type_mismatch("CAST", &other)),
        },
        DataType::Bool => Ok(Value::Bool(int_of(&value)? != 0)),
        DataType::Uuid | DataType::Text => Err(type_mismatch("CAST", &value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(attnum: i16, t: DataType) -> Expr {
        Expr::var(1, attnum, t)
    }

    fn num(s: &str) -> Value {
        Value::Numeric(Numeric::parse(s).unwrap())
    }

    // -----------------------------------------------------------------------
    // Three-valued logic
    // -----------------------------------------------------------------------

    #[test]
    fn test_three_valued_logic() {
        let ev = Evaluator::host();
        let row = vec![Value::Null, Value::Int4(5)];
        let null_gt = var(1, DataType::Int4).gt(Expr::int4(1));
        let true_gt = var(2, DataType::Int4).gt(Expr::int4(1));
        let false_gt = var(2, DataType::Int4).gt(Expr::int4(10));

        assert_eq!(ev.eval(&null_gt, &row).unwrap(), Value::Null);
        assert_eq!(
            ev.eval(&Expr::and(vec![null_gt.clone(), false_gt.clone()]), &row).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            ev.eval(&Expr::and(vec![null_gt.clone(), true_gt.clone()]), &row).unwrap(),
            Value::Null
        );
        assert_eq!(
            ev.eval(&Expr::or(vec![null_gt.clone(), true_gt]), &row).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(ev.eval(&!null_gt.clone(), &row).unwrap(), Value::Null);
        assert!(!ev.eval_quals(&[null_gt], &row).unwrap());
        assert_eq!(
            ev.eval(&var(1, DataType::Int4).is_null(), &row).unwrap(),
            Value::Bool(true)
        );
    }

    // -----------------------------------------------------------------------
    // Arithmetic
    // -----------------------------------------------------------------------

    #[test]
    fn test_integer_overflow_and_division() {
        let ev = Evaluator::host();
        let row = vec![Value::Int4(i32::MAX), Value::Int4(0)];
        let overflow = var(1, DataType::Int4) + Expr::int4(1);
        assert_eq!(
            ev.eval(&overflow, &row).unwrap_err(),
            EvalError::Overflow(DataType::Int4)
        );
        let widened = var(1, DataType::Int4) + Expr::int8(1);
        assert_eq!(ev.eval(&widened, &row).unwrap(), Value::Int8(i32::MAX as i64 + 1));
        let div = var(1, DataType::Int4) / var(2, DataType::Int4);
        assert_eq!(ev.eval(&div, &row).unwrap_err(), EvalError::DivisionByZero);
        let m = Expr::int4(-7) % Expr::int4(3);
        assert_eq!(ev.eval(&m, &row).unwrap(), Value::Int4(-1));
    }

    #[test]
    fn test_numeric_device_precision() {
        let row = vec![num("92233720368547758.07")];
        let doubled = var(1, DataType::Numeric) * Expr::int4(2);
        assert_eq!(
            Evaluator::device().eval(&doubled, &row).unwrap_err(),
            EvalError::DevicePrecision
        );
        assert_eq!(
            Evaluator::host().eval(&doubled, &row).unwrap(),
            num("184467440737095516.14")
        );
    }

    #[test]
    fn test_numeric_mixed_arithmetic() {
        let ev = Evaluator::host();
        let row = vec![Value::Int4(10), num("1.5")];
        let e = var(1, DataType::Int4).cast(DataType::Numeric) * var(2, DataType::Numeric);
        assert_eq!(ev.eval(&e, &row).unwrap(), num("15.0"));
        let d = var(2, DataType::Numeric) / Expr::int4(4);
        assert_eq!(ev.eval(&d, &row).unwrap(), num("0.375"));
    }

    #[test]
    fn test_float_semantics() {
        let ev = Evaluator::host();
        let row = vec![Value::Float8(f64::NAN), Value::Float8(1.0)];
        let nan_gt = var(1, DataType::Float8).gt(var(2, DataType::Float8));
        assert_eq!(ev.eval(&nan_gt, &row).unwrap(), Value::Bool(true));
        let big = Expr::constant(Value::Float8(f64::MAX)) * Expr::constant(Value::Float8(2.0));
        assert_eq!(
            ev.eval(&big, &row).unwrap_err(),
            EvalError::Overflow(DataType::Float8)
        );
    }

    // -----------------------------------------------------------------------
    // Casts and comparisons
    // -----------------------------------------------------------------------

    #[test]
    fn test_casts_round_half_away() {
        assert_eq!(cast_value(num("2.5"), DataType::Int4).unwrap(), Value::Int4(3));
        assert_eq!(cast_value(num("-2.5"), DataType::Int4).unwrap(), Value::Int4(-3));
        assert_eq!(cast_value(Value::Float8(1.49), DataType::Int2).unwrap(), Value::Int2(1));
        assert_eq!(
            cast_value(Value::Int8(70000), DataType::Int2).unwrap_err(),
            EvalError::Overflow(DataType::Int2)
        );
        assert_eq!(cast_value(Value::Float8(0.25), DataType::Numeric).unwrap(), num("0.25"));
        assert_eq!(
            cast_value(Value::Date(1), DataType::Timestamp).unwrap(),
            Value::Timestamp(USECS_PER_DAY)
        );
        assert_eq!(cast_value(Value::Null, DataType::Int8).unwrap(), Value::Null);
    }

    #[test]
    fn test_mixed_comparisons() {
        let lt = |a: Value, b: Value| compare_values(CmpOp::Lt, &a, &b).unwrap();
        assert_eq!(lt(Value::Int2(3), Value::Int8(4)), Ordering::Less);
        assert_eq!(lt(num("3.00"), Value::Int4(3)), Ordering::Equal);
        assert_eq!(lt(Value::Float4(2.5), Value::Int4(2)), Ordering::Greater);
        assert_eq!(lt(Value::Date(1), Value::Timestamp(USECS_PER_DAY)), Ordering::Equal);
        assert!(compare_values(CmpOp::Eq, &Value::Text("a".into()), &Value::Int4(1)).is_err());
    }

    #[test]
    fn test_missing_attribute() {
        let row = vec![Value::Int4(1)];
        assert_eq!(
            Evaluator::host().eval(&var(3, DataType::Int4), &row).unwrap_err(),
            EvalError::MissingAttribute(3)
        );
    }
}
