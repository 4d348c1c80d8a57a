//! Logical values and their stored (on-page) encodings.
//!
//! Fixed-length values are stored little-endian at their natural width.
//! Variable-length values carry a 4-byte total length header:
//!
//! ```text
//! numeric: [len=24 u32][scale u16][pad u16][mantissa i128]
//! text:    [len u32][utf-8 bytes]
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ChunkError;
use crate::storage::types::DataType;

/// Size of the varlena length header.
pub const VARHDRSZ: usize = 4;

/// Stored size of a numeric value (header + scale + pad + 128-bit mantissa).
pub const NUMERIC_STORED_SIZE: usize = 24;

/// Largest scale a numeric may carry.
pub const NUMERIC_MAX_SCALE: u16 = 16;

/// Scale used for the quotient of a numeric division when both inputs are
/// integral.
pub const NUMERIC_MIN_DIV_SCALE: u16 = 6;

// ============================================================================
// Numeric
// ============================================================================

/// Fixed-point decimal: `mantissa * 10^-scale`.
///
/// Host arithmetic is exact over the 128-bit mantissa. The device only keeps
/// 64 bits (see [`Numeric::fits_device`]); values outside that range must be
/// rechecked on the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Numeric {
    mantissa: i128,
    scale: u16,
}

fn pow10(exp: u16) -> Option<i128> {
    10i128.checked_pow(exp as u32)
}

impl Numeric {
    pub fn new(mantissa: i128, scale: u16) -> Self {
        Self { mantissa, scale }
    }

    pub fn from_i64(v: i64) -> Self {
        Self::new(v as i128, 0)
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u16 {
        self.scale
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    /// Parse a plain decimal literal such as `-12.50`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (neg, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let scale = u16::try_from(frac_part.len()).ok()?;
        if scale > NUMERIC_MAX_SCALE {
            return None;
        }
        let mut mantissa: i128 = 0;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            mantissa = mantissa.checked_mul(10)?.checked_add((b - b'0') as i128)?;
        }
        if neg {
            mantissa = -mantissa;
        }
        Some(Self::new(mantissa, scale))
    }

    /// Increase the scale without loss; `None` on overflow or when the
    /// requested scale is smaller than the current one.
    pub fn rescale(self, scale: u16) -> Option<Self> {
        if scale < self.scale {
            return None;
        }
        let factor = pow10(scale - self.scale)?;
        Some(Self::new(self.mantissa.checked_mul(factor)?, scale))
    }

    fn align_scales(self, other: Self) -> Option<(i128, i128, u16)> {
        let scale = self.scale.max(other.scale);
        let a = self.rescale(scale)?;
        let b = other.rescale(scale)?;
        Some((a.mantissa, b.mantissa, scale))
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        let (a, b, scale) = self.align_scales(other)?;
        Some(Self::new(a.checked_add(b)?, scale))
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        let (a, b, scale) = self.align_scales(other)?;
        Some(Self::new(a.checked_sub(b)?, scale))
    }

    pub fn checked_mul(self, other: Self) -> Option<Self> {
        let mut mantissa = self.mantissa.checked_mul(other.mantissa)?;
        let mut scale = self.scale + other.scale;
        if scale > NUMERIC_MAX_SCALE {
            mantissa /= pow10(scale - NUMERIC_MAX_SCALE)?;
            scale = NUMERIC_MAX_SCALE;
        }
        Some(Self::new(mantissa, scale))
    }

    /// Truncating division. The caller rejects a zero divisor.
    pub fn checked_div(self, other: Self) -> Option<Self> {
        if other.is_zero() {
            return None;
        }
        let scale = self
            .scale
            .max(other.scale)
            .max(NUMERIC_MIN_DIV_SCALE)
            .min(NUMERIC_MAX_SCALE);
        // a/10^sa / (b/10^sb) = (a * 10^(scale + sb - sa) / b) / 10^scale
        let shift = scale as i32 + other.scale as i32 - self.scale as i32;
        let numerator = if shift >= 0 {
            self.mantissa.checked_mul(pow10(shift as u16)?)?
        } else {
            self.mantissa / pow10((-shift) as u16)?
        };
        Some(Self::new(numerator.checked_div(other.mantissa)?, scale))
    }

    pub fn checked_rem(self, other: Self) -> Option<Self> {
        let (a, b, scale) = self.align_scales(other)?;
        Some(Self::new(a.checked_rem(b)?, scale))
    }

    pub fn checked_neg(self) -> Option<Self> {
        Some(Self::new(self.mantissa.checked_neg()?, self.scale))
    }

    /// Whether the device's 64-bit internal form can hold this value.
    pub fn fits_device(&self) -> bool {
        i64::try_from(self.mantissa).is_ok()
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }

    /// Truncate toward zero to an integer.
    pub fn trunc_to_i128(&self) -> Option<i128> {
        Some(self.mantissa / pow10(self.scale)?)
    }
}

impl PartialEq for Numeric {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Numeric {}

impl PartialOrd for Numeric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Numeric {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.align_scales(*other) {
            Some((a, b, _)) => a.cmp(&b),
            None => self
                .to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}

// ============================================================================
// Value
// ============================================================================

/// One logical attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Date(i32),
    Timestamp(i64),
    Numeric(Numeric),
    Uuid([u8; 16]),
    Text(String),
}

impl Value {
    /// Type of a non-null value.
    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Value::Null => return None,
            Value::Bool(_) => DataType::Bool,
            Value::Int2(_) => DataType::Int2,
            Value::Int4(_) => DataType::Int4,
            Value::Int8(_) => DataType::Int8,
            Value::Float4(_) => DataType::Float4,
            Value::Float8(_) => DataType::Float8,
            Value::Date(_) => DataType::Date,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Numeric(_) => DataType::Numeric,
            Value::Uuid(_) => DataType::Uuid,
            Value::Text(_) => DataType::Text,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of integer-like values (ints, date, timestamp).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int2(v) => Some(*v as i64),
            Value::Int4(v) | Value::Date(v) => Some(*v as i64),
            Value::Int8(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating-point view of numeric-like values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float4(v) => Some(*v as f64),
            Value::Float8(v) => Some(*v),
            Value::Numeric(n) => Some(n.to_f64()),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Bytes this value occupies when stored in a tuple (0 for NULL).
    pub fn stored_size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Numeric(_) => NUMERIC_STORED_SIZE,
            Value::Text(s) => VARHDRSZ + s.len(),
            other => other
                .data_type()
                .map(|t| t.typlen() as usize)
                .unwrap_or(0),
        }
    }

    /// Append the stored encoding to `buf`. NULL writes nothing.
    pub fn append_stored(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => {}
            Value::Bool(b) => buf.push(*b as u8),
            Value::Int2(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Int4(v) | Value::Date(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Int8(v) | Value::Timestamp(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Float4(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Float8(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Numeric(n) => {
                buf.extend_from_slice(&(NUMERIC_STORED_SIZE as u32).to_le_bytes());
                buf.extend_from_slice(&n.scale.to_le_bytes());
                buf.extend_from_slice(&0u16.to_le_bytes());
                buf.extend_from_slice(&n.mantissa.to_le_bytes());
            }
            Value::Uuid(u) => buf.extend_from_slice(u),
            Value::Text(s) => {
                buf.extend_from_slice(&((VARHDRSZ + s.len()) as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }

    /// Decode a stored value of type `ty` starting at `bytes[0]`.
    pub fn decode_stored(ty: DataType, bytes: &[u8]) -> Result<Value, ChunkError> {
        let len = stored_len(ty, bytes)?;
        let b = bytes
            .get(..len)
            .ok_or_else(|| ChunkError::Corrupt(format!("{} value truncated", ty)))?;
        Ok(match ty {
            DataType::Bool => Value::Bool(b[0] != 0),
            DataType::Int2 => Value::Int2(i16::from_le_bytes([b[0], b[1]])),
            DataType::Int4 => Value::Int4(i32::from_le_bytes(le4(b))),
            DataType::Date => Value::Date(i32::from_le_bytes(le4(b))),
            DataType::Int8 => Value::Int8(i64::from_le_bytes(le8(b))),
            DataType::Timestamp => Value::Timestamp(i64::from_le_bytes(le8(b))),
            DataType::Float4 => Value::Float4(f32::from_bits(u32::from_le_bytes(le4(b)))),
            DataType::Float8 => Value::Float8(f64::from_bits(u64::from_le_bytes(le8(b)))),
            DataType::Numeric => {
                if len != NUMERIC_STORED_SIZE {
                    return Err(ChunkError::Corrupt(format!("numeric length {}", len)));
                }
                let scale = u16::from_le_bytes([b[4], b[5]]);
                let mut m = [0u8; 16];
                m.copy_from_slice(&b[8..24]);
                Value::Numeric(Numeric::new(i128::from_le_bytes(m), scale))
            }
            DataType::Uuid => {
                let mut u = [0u8; 16];
                u.copy_from_slice(&b[..16]);
                Value::Uuid(u)
            }
            DataType::Text => {
                let s = std::str::from_utf8(&b[VARHDRSZ..])
                    .map_err(|e| ChunkError::Corrupt(format!("text: {}", e)))?;
                Value::Text(s.to_string())
            }
        })
    }

    /// Slot datum of a by-value type: the value widened to 64 bits.
    pub fn to_datum(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Bool(b) => *b as u64,
            Value::Float4(v) => v.to_bits() as u64,
            Value::Float8(v) => v.to_bits(),
            other => other.as_i64().unwrap_or(0) as u64,
        }
    }

    /// Inverse of [`Value::to_datum`] for by-value types.
    pub fn from_datum(ty: DataType, datum: u64) -> Option<Value> {
        Some(match ty {
            DataType::Bool => Value::Bool(datum != 0),
            DataType::Int2 => Value::Int2(datum as i64 as i16),
            DataType::Int4 => Value::Int4(datum as i64 as i32),
            DataType::Date => Value::Date(datum as i64 as i32),
            DataType::Int8 => Value::Int8(datum as i64),
            DataType::Timestamp => Value::Timestamp(datum as i64),
            DataType::Float4 => Value::Float4(f32::from_bits(datum as u32)),
            DataType::Float8 => Value::Float8(f64::from_bits(datum)),
            DataType::Numeric | DataType::Uuid | DataType::Text => return None,
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "t" } else { "f" }),
            Value::Int2(v) => write!(f, "{}", v),
            Value::Int4(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Float4(v) => write!(f, "{}", v),
            Value::Float8(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "date({})", v),
            Value::Timestamp(v) => write!(f, "ts({})", v),
            Value::Numeric(n) => write!(f, "{}", n),
            Value::Uuid(u) => {
                for (i, b) in u.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        f.write_str("-")?;
                    }
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Stored length of the value of type `ty` at `bytes[0]`.
pub fn stored_len(ty: DataType, bytes: &[u8]) -> Result<usize, ChunkError> {
    if !ty.is_varlena() {
        return Ok(ty.typlen() as usize);
    }
    let hdr = bytes
        .get(..VARHDRSZ)
        .ok_or_else(|| ChunkError::Corrupt("varlena header truncated".into()))?;
    let len = u32::from_le_bytes(le4(hdr)) as usize;
    if len < VARHDRSZ {
        return Err(ChunkError::Corrupt(format!("varlena length {}", len)));
    }
    Ok(len)
}

fn le4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn le8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_parse_and_display() {
        let n = Numeric::parse("-12.50").unwrap();
        assert_eq!(n.mantissa(), -1250);
        assert_eq!(n.scale(), 2);
        assert_eq!(n.to_string(), "-12.50");
        assert_eq!(Numeric::parse("0.05").unwrap().to_string(), "0.05");
        assert!(Numeric::parse("1.2.3").is_none());
        assert!(Numeric::parse("").is_none());
    }

    #[test]
    fn test_numeric_arithmetic() {
        let a = Numeric::parse("1.5").unwrap();
        let b = Numeric::from_i64(2);
        assert_eq!(a.checked_add(b).unwrap(), Numeric::parse("3.5").unwrap());
        assert_eq!(a.checked_mul(b).unwrap(), Numeric::parse("3.0").unwrap());
        assert_eq!(b.checked_div(Numeric::from_i64(4)).unwrap().to_string(), "0.500000");
        assert!(a.checked_div(Numeric::from_i64(0)).is_none());
        assert_eq!(Numeric::parse("2.50").unwrap(), Numeric::parse("2.5").unwrap());
    }

    #[test]
    fn test_numeric_device_range() {
        assert!(Numeric::from_i64(i64::MAX).fits_device());
        assert!(!Numeric::new(i64::MAX as i128 + 1, 0).fits_device());
    }

    #[test]
    fn test_stored_encoding_roundtrip_by_type() {
        let values = vec![
            Value::Bool(true),
            Value::Int2(-7),
            Value::Int4(123_456),
            Value::Int8(-9_000_000_000),
            Value::Float8(2.5),
            Value::Numeric(Numeric::parse("99.125").unwrap()),
            Value::Uuid([7u8; 16]),
            Value::Text("hello".into()),
        ];
        for v in values {
            let mut buf = Vec::new();
            v.append_stored(&mut buf);
            assert_eq!(buf.len(), v.stored_size(), "size mismatch for {:?}", v);
            let back = Value::decode_stored(v.data_type().unwrap(), &buf).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_datum_sign_extension() {
        let d = Value::Int4(-5).to_datum();
        assert_eq!(Value::from_datum(DataType::Int4, d), Some(Value::Int4(-5)));
        assert_eq!(Value::from_datum(DataType::Numeric, 0), None);
    }
}
