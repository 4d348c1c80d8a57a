//! Tuple shape: the ordered, typed attribute list of one base relation.
//!
//! The shape is what the planner hands to the scan (a tuple descriptor) and
//! what chunks copy into their column metadata. Attribute numbers are
//! 1-based, as in expressions.

use serde::{Deserialize, Serialize};

use crate::storage::tuple::HEAP_TUPLE_HEADER_SIZE;
use crate::storage::types::DataType;
use crate::storage::{max_align, type_align};

/// One attribute of a tuple shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttrDesc {
    /// Column name.
    pub name: String,
    /// Stored data type.
    pub data_type: DataType,
    /// Whether the column may contain NULL.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Type modifier (numeric precision/scale, -1 when unused).
    #[serde(default = "default_typmod")]
    pub typmod: i32,
}

fn default_nullable() -> bool {
    true
}

fn default_typmod() -> i32 {
    -1
}

impl AttrDesc {
    /// A nullable attribute without type modifier.
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable: true,
            typmod: -1,
        }
    }

    /// Mark the attribute NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Attribute list of a base relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleShape {
    /// Relation the attributes belong to.
    pub relid: u32,
    attrs: Vec<AttrDesc>,
}

impl TupleShape {
    pub fn new(relid: u32, attrs: Vec<AttrDesc>) -> Self {
        Self { relid, attrs }
    }

    /// Number of attributes.
    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    pub fn attrs(&self) -> &[AttrDesc] {
        &self.attrs
    }

    /// Attribute by 1-based attribute number.
    pub fn attr(&self, attnum: i16) -> Option<&AttrDesc> {
        if attnum < 1 {
            return None;
        }
        self.attrs.get(attnum as usize - 1)
    }

    /// 1-based attribute number of a column (case-insensitive).
    pub fn attnum_of(&self, name: &str) -> Option<i16> {
        self.attrs
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))
            .map(|i| i as i16 + 1)
    }

    /// Any attribute stored by reference.
    pub fn has_notbyval(&self) -> bool {
        self.attrs.iter().any(|a| !a.data_type.typbyval())
    }

    /// Any numeric attribute.
    pub fn has_numeric(&self) -> bool {
        self.attrs.iter().any(|a| a.data_type == DataType::Numeric)
    }

    /// Cached attribute offsets from the start of a tuple without nulls.
    ///
    /// Offsets stay valid up to the first variable-length attribute; it and
    /// every later one get -1. With `use_internal`, numeric counts as an
    /// 8-byte by-value attribute (the device's internal form).
    pub fn cache_offsets(&self, use_internal: bool) -> Vec<i32> {
        let mut offsets = Vec::with_capacity(self.attrs.len());
        let mut off = max_align(HEAP_TUPLE_HEADER_SIZE) as i32;
        for attr in &self.attrs {
            let (len, align) = if use_internal && attr.data_type == DataType::Numeric {
                (8, 8)
            } else {
                (attr.data_type.typlen() as i32, attr.data_type.typalign())
            };
            if off < 0 || len < 0 {
                off = -1;
                offsets.push(-1);
                continue;
            }
            off = type_align(align, off as usize) as i32;
            offsets.push(off);
            off += len;
        }
        offsets
    }

    /// Estimated stored width of a tuple of this shape (header included).
    pub fn avg_tuple_width(&self) -> usize {
        let mut width = HEAP_TUPLE_HEADER_SIZE;
        if self.attrs.iter().any(|a| a.nullable) {
            width += self.attrs.len().div_ceil(8);
        }
        width = max_align(width);
        for attr in &self.attrs {
            width = type_align(attr.data_type.typalign(), width) + attr.data_type.avg_width();
        }
        max_align(width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_shape() -> TupleShape {
        TupleShape::new(
            1,
            vec![
                AttrDesc::new("id", DataType::Int4).not_null(),
                AttrDesc::new("flag", DataType::Bool),
                AttrDesc::new("amount", DataType::Int8),
                AttrDesc::new("note", DataType::Text),
                AttrDesc::new("qty", DataType::Int2),
            ],
        )
    }

    #[test]
    fn test_attr_lookup() {
        let shape = mixed_shape();
        assert_eq!(shape.natts(), 5);
        assert_eq!(shape.attr(1).unwrap().name, "id");
        assert!(shape.attr(0).is_none());
        assert!(shape.attr(6).is_none());
        assert_eq!(shape.attnum_of("AMOUNT"), Some(3));
        assert_eq!(shape.attnum_of("missing"), None);
        assert!(shape.has_notbyval());
        assert!(!shape.has_numeric());
    }

    #[test]
    fn test_cache_offsets_stop_at_varlena() {
        let offsets = mixed_shape().cache_offsets(false);
        // header 16, int4 at 16, bool at 20, int8 aligned to 24, then text
        assert_eq!(offsets, vec![16, 20, 24, -1, -1]);
    }

    #[test]
    fn test_cache_offsets_internal_numeric() {
        let shape = TupleShape::new(
            1,
            vec![
                AttrDesc::new("a", DataType::Int2),
                AttrDesc::new("n", DataType::Numeric),
                AttrDesc::new("b", DataType::Int4),
            ],
        );
        assert_eq!(shape.cache_offsets(false), vec![16, -1, -1]);
        assert_eq!(shape.cache_offsets(true), vec![16, 24, 32]);
    }
}
