//! Schema descriptors for columnar data.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical element kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 8-bit unsigned integer.
    UInt8,
    /// 16-bit unsigned integer.
    UInt16,
    /// 32-bit unsigned integer.
    UInt32,
    /// 64-bit unsigned integer.
    UInt64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// Variable-length byte string.
    Bytes,
    /// Timestamp (microseconds since epoch).
    Timestamp,
}

impl DataType {
    /// Returns the fixed element width in bytes, or `None` for
    /// variable-length types.
    #[must_use]
    pub const fn fixed_width(self) -> Option<u32> {
        match self {
            DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 | DataType::Timestamp => Some(8),
            DataType::Bytes => None,
        }
    }

    /// Returns true for integer and floating point types.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, DataType::Bytes | DataType::Timestamp)
    }

    /// Returns true for floating point types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Constructs a data type from its numeric tag, the inverse of
    /// [`DataType::tag`].
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DataType::Int8),
            1 => Some(DataType::Int16),
            2 => Some(DataType::Int32),
            3 => Some(DataType::Int64),
            4 => Some(DataType::UInt8),
            5 => Some(DataType::UInt16),
            6 => Some(DataType::UInt32),
            7 => Some(DataType::UInt64),
            8 => Some(DataType::Float32),
            9 => Some(DataType::Float64),
            10 => Some(DataType::Bytes),
            11 => Some(DataType::Timestamp),
            _ => None,
        }
    }

    /// Returns the numeric tag identifying this type on the wire.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            DataType::Int8 => 0,
            DataType::Int16 => 1,
            DataType::Int32 => 2,
            DataType::Int64 => 3,
            DataType::UInt8 => 4,
            DataType::UInt16 => 5,
            DataType::UInt32 => 6,
            DataType::UInt64 => 7,
            DataType::Float32 => 8,
            DataType::Float64 => 9,
            DataType::Bytes => 10,
            DataType::Timestamp => 11,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A fully-specified column type: the logical tag plus the width,
/// precision, scale, and size carried through plan descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnType {
    /// The logical element kind.
    pub data_type: DataType,
    /// Display width.
    pub width: i32,
    /// Numeric precision.
    pub precision: i32,
    /// Numeric scale.
    pub scale: i32,
    /// Element size in bytes (0 for variable-length types).
    pub size: i32,
}

impl ColumnType {
    /// Creates a column type with defaults derived from the data type.
    #[must_use]
    pub fn new(data_type: DataType) -> Self {
        let size = data_type.fixed_width().unwrap_or(0) as i32;
        Self {
            data_type,
            width: size * 8,
            precision: 0,
            scale: 0,
            size,
        }
    }
}

impl From<DataType> for ColumnType {
    fn from(data_type: DataType) -> Self {
        Self::new(data_type)
    }
}

/// A named, typed field in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type.
    pub column_type: ColumnType,
    /// Whether the field admits nulls.
    pub nullable: bool,
}

impl Field {
    /// Creates a nullable field.
    #[must_use]
    pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::new(data_type),
            nullable: true,
        }
    }

    /// Creates a non-nullable field.
    #[must_use]
    pub fn not_null(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::new(data_type),
            nullable: false,
        }
    }

    /// Returns the field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the logical data type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.column_type.data_type
    }
}

/// An ordered collection of fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Creates a new schema from fields.
    #[must_use]
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Returns the fields.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Returns the field at the given index.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Returns the index of the field with the given name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Projects the schema to the given field indices.
    #[must_use]
    pub fn project(&self, indices: &[usize]) -> Schema {
        let fields = indices
            .iter()
            .filter_map(|&i| self.fields.get(i).cloned())
            .collect();
        Schema::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width() {
        assert_eq!(DataType::Int32.fixed_width(), Some(4));
        assert_eq!(DataType::Float64.fixed_width(), Some(8));
        assert_eq!(DataType::Bytes.fixed_width(), None);
    }

    #[test]
    fn test_tag_round_trip() {
        for tag in 0..12 {
            let dt = DataType::from_tag(tag).unwrap();
            assert_eq!(dt.tag(), tag);
        }
        assert!(DataType::from_tag(99).is_none());
    }

    #[test]
    fn test_column_type_defaults() {
        let ct = ColumnType::new(DataType::Int64);
        assert_eq!(ct.size, 8);
        assert_eq!(ct.width, 64);

        let ct = ColumnType::new(DataType::Bytes);
        assert_eq!(ct.size, 0);
    }

    #[test]
    fn test_schema_index_of() {
        let schema = Schema::new(vec![
            Field::not_null("a", DataType::Int64),
            Field::nullable("b", DataType::Bytes),
        ]);
        assert_eq!(schema.index_of("b"), Some(1));
        assert_eq!(schema.index_of("c"), None);
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn test_schema_project() {
        let schema = Schema::new(vec![
            Field::not_null("a", DataType::Int64),
            Field::nullable("b", DataType::Bytes),
            Field::nullable("c", DataType::Float64),
        ]);
        let projected = schema.project(&[2, 0]);
        assert_eq!(projected.fields()[0].name(), "c");
        assert_eq!(projected.fields()[1].name(), "a");
    }
}
