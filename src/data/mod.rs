//! Scalar data types, values, rows and schemas
//!
//! Every block in the system stores rows of a fixed schema. Schemas are
//! immutable for the lifetime of a block; column indices are stable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Scalar data type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    Float32,
    Float64,
    String,
    /// List of a scalar element type
    List(Box<DataType>),
    /// Map of scalar key to scalar value
    Map(Box<DataType>, Box<DataType>),
}

impl DataType {
    /// Fixed size in bytes (0 for variable-length types)
    pub fn fixed_size(&self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Int128 => 16,
            DataType::String | DataType::List(_) | DataType::Map(..) => 0,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        matches!(self, DataType::String | DataType::List(_) | DataType::Map(..))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int8 => write!(f, "i8"),
            DataType::Int16 => write!(f, "i16"),
            DataType::Int32 => write!(f, "i32"),
            DataType::Int64 => write!(f, "i64"),
            DataType::Int128 => write!(f, "i128"),
            DataType::Float32 => write!(f, "f32"),
            DataType::Float64 => write!(f, "f64"),
            DataType::String => write!(f, "string"),
            DataType::List(t) => write!(f, "list<{}>", t),
            DataType::Map(k, v) => write!(f, "map<{},{}>", k, v),
        }
    }
}

/// A single scalar value; `Null` is representable for every type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    Float32(f32),
    Float64(f64),
    String(String),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can be stored in a column of the given type.
    /// Null is storable everywhere.
    pub fn matches(&self, dtype: &DataType) -> bool {
        match (self, dtype) {
            (Value::Null, _) => true,
            (Value::Bool(_), DataType::Bool) => true,
            (Value::Int8(_), DataType::Int8) => true,
            (Value::Int16(_), DataType::Int16) => true,
            (Value::Int32(_), DataType::Int32) => true,
            (Value::Int64(_), DataType::Int64) => true,
            (Value::Int128(_), DataType::Int128) => true,
            (Value::Float32(_), DataType::Float32) => true,
            (Value::Float64(_), DataType::Float64) => true,
            (Value::String(_), DataType::String) => true,
            (Value::List(items), DataType::List(elem)) => {
                items.iter().all(|v| v.matches(elem))
            }
            (Value::Map(entries), DataType::Map(k, v)) => entries
                .iter()
                .all(|(ek, ev)| ek.matches(k) && ev.matches(v)),
            _ => false,
        }
    }

    /// Ordering between two scalar values of the same type; `None` for
    /// mixed types, nulls and nested values.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int8(a), Value::Int8(b)) => Some(a.cmp(b)),
            (Value::Int16(a), Value::Int16(b)) => Some(a.cmp(b)),
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Int128(a), Value::Int128(b)) => Some(a.cmp(b)),
            (Value::Float32(a), Value::Float32(b)) => a.partial_cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Numeric view for histogram bucketing
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int8(x) => Some(*x as f64),
            Value::Int16(x) => Some(*x as f64),
            Value::Int32(x) => Some(*x as f64),
            Value::Int64(x) => Some(*x as f64),
            Value::Int128(x) => Some(*x as f64),
            Value::Float32(x) => Some(*x as f64),
            Value::Float64(x) => Some(*x),
            _ => None,
        }
    }

    /// Short type tag for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int8(_) => "i8",
            Value::Int16(_) => "i16",
            Value::Int32(_) => "i32",
            Value::Int64(_) => "i64",
            Value::Int128(_) => "i128",
            Value::Float32(_) => "f32",
            Value::Float64(_) => "f64",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

/// Named, typed field of a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered sequence of named, typed fields with stable column indices
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single input row: field name to value
///
/// Fields absent from the row read back as null.
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: HashMap<String, Value>,
}

static NULL: Value = Value::Null;

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Read a field by name; missing fields are null
    pub fn get(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&NULL)
    }

    pub fn is_null(&self, name: &str) -> bool {
        self.get(name).is_null()
    }
}

/// Field evaluator: how a materialized column reads its value from an
/// input row. The common case is a plain column read; constants appear in
/// aggregation keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldExpr {
    /// Read the schema field with this name from the input row
    Column(String),
    /// A constant value, independent of the input row
    Const(Value),
}

impl FieldExpr {
    pub fn column(name: impl Into<String>) -> Self {
        FieldExpr::Column(name.into())
    }

    pub fn constant(value: Value) -> Self {
        FieldExpr::Const(value)
    }

    /// Evaluate against an input row
    pub fn eval<'a>(&'a self, row: &'a Row) -> &'a Value {
        match self {
            FieldExpr::Column(name) => row.get(name),
            FieldExpr::Const(v) => v,
        }
    }
}
