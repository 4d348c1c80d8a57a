//! Scalar data types and their physical storage properties.
//!
//! Type ids follow the catalog numbering of the host engine so that a chunk
//! header can be matched against the engine's own tuple descriptors.

use serde::{Deserialize, Serialize};

/// Scalar data types supported by the scan engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Boolean, 1 byte by value.
    Bool,
    /// 16-bit signed integer.
    Int2,
    /// 32-bit signed integer.
    Int4,
    /// 64-bit signed integer.
    Int8,
    /// 32-bit IEEE 754 float.
    Float4,
    /// 64-bit IEEE 754 float.
    Float8,
    /// Days since 2000-01-01, stored as a 32-bit integer.
    Date,
    /// Microseconds since 2000-01-01, stored as a 64-bit integer.
    Timestamp,
    /// Scaled decimal, variable length on disk, boxed on the device.
    Numeric,
    /// 16-byte identifier stored by reference.
    Uuid,
    /// Variable-length UTF-8 text.
    Text,
}

impl DataType {
    /// All types, in type id order of declaration.
    pub const ALL: [DataType; 11] = [
        DataType::Bool,
        DataType::Int2,
        DataType::Int4,
        DataType::Int8,
        DataType::Float4,
        DataType::Float8,
        DataType::Date,
        DataType::Timestamp,
        DataType::Numeric,
        DataType::Uuid,
        DataType::Text,
    ];

    /// Catalog type id stored in chunk column metadata.
    pub fn type_id(self) -> u32 {
        match self {
            DataType::Bool => 16,
            DataType::Int8 => 20,
            DataType::Int2 => 21,
            DataType::Int4 => 23,
            DataType::Text => 25,
            DataType::Float4 => 700,
            DataType::Float8 => 701,
            DataType::Date => 1082,
            DataType::Timestamp => 1114,
            DataType::Numeric => 1700,
            DataType::Uuid => 2950,
        }
    }

    /// Inverse of [`DataType::type_id`].
    pub fn from_type_id(id: u32) -> Option<Self> {
        DataType::ALL.iter().copied().find(|t| t.type_id() == id)
    }

    /// Physical length in bytes, or -1 for variable-length types.
    pub fn typlen(self) -> i16 {
        match self {
            DataType::Bool => 1,
            DataType::Int2 => 2,
            DataType::Int4 | DataType::Float4 | DataType::Date => 4,
            DataType::Int8 | DataType::Float8 | DataType::Timestamp => 8,
            DataType::Uuid => 16,
            DataType::Numeric | DataType::Text => -1,
        }
    }

    /// Required alignment of the stored value.
    pub fn typalign(self) -> usize {
        match self {
            DataType::Bool | DataType::Uuid => 1,
            DataType::Int2 => 2,
            DataType::Int4
            | DataType::Float4
            | DataType::Date
            | DataType::Numeric
            | DataType::Text => 4,
            DataType::Int8 | DataType::Float8 | DataType::Timestamp => 8,
        }
    }

    /// Whether the value fits in a slot datum directly.
    pub fn typbyval(self) -> bool {
        !matches!(self, DataType::Numeric | DataType::Uuid | DataType::Text)
    }

    /// True for variable-length (varlena) types.
    pub fn is_varlena(self) -> bool {
        self.typlen() < 0
    }

    /// Planner-style average stored width, used for buffer estimates.
    pub fn avg_width(self) -> usize {
        match self {
            DataType::Numeric => 24,
            DataType::Text => 32,
            other => other.typlen() as usize,
        }
    }

    /// Whether this is one of the integer family types.
    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int2 | DataType::Int4 | DataType::Int8)
    }

    /// Whether this is one of the floating-point types.
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float4 | DataType::Float8)
    }

    /// SQL-level type name.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int2 => "int2",
            DataType::Int4 => "int4",
            DataType::Int8 => "int8",
            DataType::Float4 => "float4",
            DataType::Float8 => "float8",
            DataType::Date => "date",
            DataType::Timestamp => "timestamp",
            DataType::Numeric => "numeric",
            DataType::Uuid => "uuid",
            DataType::Text => "text",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
