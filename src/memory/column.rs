//! Column vectors backing the flat row container
//!
//! Fixed-width columns are stored column-major in native vectors; strings,
//! lists and maps keep a per-row offset array plus a shared heap. Lists and
//! maps recurse one level into child columns.

use crate::data::{DataType, Value};
use crate::{NebulaError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Packed null/presence bitmap (bit i set = row i is null)
#[derive(Debug, Clone, Default)]
pub struct NullBitmap {
    bits: Vec<u8>,
    len: usize,
}

impl NullBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, is_null: bool) {
        let byte = self.len / 8;
        let bit = self.len % 8;
        if byte >= self.bits.len() {
            self.bits.push(0);
        }
        if is_null {
            self.bits[byte] |= 1 << bit;
        } else {
            self.bits[byte] &= !(1 << bit);
        }
        self.len += 1;
    }

    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return true;
        }
        let byte = idx / 8;
        let bit = idx % 8;
        (self.bits[byte] >> bit) & 1 == 1
    }

    pub fn set(&mut self, idx: usize, is_null: bool) {
        if idx >= self.len {
            return;
        }
        let byte = idx / 8;
        let bit = idx % 8;
        if is_null {
            self.bits[byte] |= 1 << bit;
        } else {
            self.bits[byte] &= !(1 << bit);
        }
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
            self.bits.truncate((len + 7) / 8);
        }
    }

    /// Number of set (null) bits
    pub fn count_nulls(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i)).count()
    }

    /// Exact serialized width for `len` rows
    pub fn byte_len(&self) -> usize {
        (self.len + 7) / 8
    }

    pub fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let byte_len = self.byte_len();
        w.write_all(&self.bits[..byte_len.min(self.bits.len())])?;
        // push() grows lazily, so the vec can be one byte short of byte_len
        for _ in self.bits.len()..byte_len {
            w.write_all(&[0])?;
        }
        Ok(())
    }

    pub fn read(bytes: &[u8], pos: &mut usize, len: usize) -> Result<Self> {
        let byte_len = (len + 7) / 8;
        if *pos + byte_len > bytes.len() {
            return Err(NebulaError::CorruptBlock("null bitmap truncated".into()));
        }
        let bits = bytes[*pos..*pos + byte_len].to_vec();
        *pos += byte_len;
        Ok(Self { bits, len })
    }
}

/// Column-major storage for one materialized field
#[derive(Debug, Clone)]
pub enum ColumnVec {
    Bool { bits: Vec<u8>, len: usize },
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Int128(Vec<i128>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String {
        offsets: Vec<u32>,
        heap: Vec<u8>,
    },
    List {
        offsets: Vec<u32>,
        /// element nullability, indexed like `child`
        nulls: NullBitmap,
        child: Box<ColumnVec>,
    },
    Map {
        offsets: Vec<u32>,
        /// per-entry value nullability (keys are never null)
        val_nulls: NullBitmap,
        keys: Box<ColumnVec>,
        vals: Box<ColumnVec>,
    },
}

fn corrupt(msg: &str) -> NebulaError {
    NebulaError::CorruptBlock(msg.to_string())
}

impl ColumnVec {
    pub fn new(dtype: &DataType) -> Self {
        match dtype {
            DataType::Bool => ColumnVec::Bool {
                bits: Vec::new(),
                len: 0,
            },
            DataType::Int8 => ColumnVec::Int8(Vec::new()),
            DataType::Int16 => ColumnVec::Int16(Vec::new()),
            DataType::Int32 => ColumnVec::Int32(Vec::new()),
            DataType::Int64 => ColumnVec::Int64(Vec::new()),
            DataType::Int128 => ColumnVec::Int128(Vec::new()),
            DataType::Float32 => ColumnVec::Float32(Vec::new()),
            DataType::Float64 => ColumnVec::Float64(Vec::new()),
            DataType::String => ColumnVec::String {
                offsets: vec![0],
                heap: Vec::new(),
            },
            DataType::List(elem) => ColumnVec::List {
                offsets: vec![0],
                nulls: NullBitmap::new(),
                child: Box::new(ColumnVec::new(elem)),
            },
            DataType::Map(k, v) => ColumnVec::Map {
                offsets: vec![0],
                val_nulls: NullBitmap::new(),
                keys: Box::new(ColumnVec::new(k)),
                vals: Box::new(ColumnVec::new(v)),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnVec::Bool { len, .. } => *len,
            ColumnVec::Int8(v) => v.len(),
            ColumnVec::Int16(v) => v.len(),
            ColumnVec::Int32(v) => v.len(),
            ColumnVec::Int64(v) => v.len(),
            ColumnVec::Int128(v) => v.len(),
            ColumnVec::Float32(v) => v.len(),
            ColumnVec::Float64(v) => v.len(),
            ColumnVec::String { offsets, .. } => offsets.len() - 1,
            ColumnVec::List { offsets, .. } => offsets.len() - 1,
            ColumnVec::Map { offsets, .. } => offsets.len() - 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one value; null appends the type's zero/empty slot (the
    /// caller tracks nullability in the column bitmap).
    pub fn push(&mut self, value: &Value) -> Result<()> {
        match (self, value) {
            (ColumnVec::Bool { bits, len }, v) => {
                let b = match v {
                    Value::Bool(b) => *b,
                    Value::Null => false,
                    other => return Err(type_err("bool", other)),
                };
                let byte = *len / 8;
                let bit = *len % 8;
                if byte >= bits.len() {
                    bits.push(0);
                }
                if b {
                    bits[byte] |= 1 << bit;
                } else {
                    bits[byte] &= !(1 << bit);
                }
                *len += 1;
            }
            (ColumnVec::Int8(vec), Value::Int8(x)) => vec.push(*x),
            (ColumnVec::Int8(vec), Value::Null) => vec.push(0),
            (ColumnVec::Int16(vec), Value::Int16(x)) => vec.push(*x),
            (ColumnVec::Int16(vec), Value::Null) => vec.push(0),
            (ColumnVec::Int32(vec), Value::Int32(x)) => vec.push(*x),
            (ColumnVec::Int32(vec), Value::Null) => vec.push(0),
            (ColumnVec::Int64(vec), Value::Int64(x)) => vec.push(*x),
            (ColumnVec::Int64(vec), Value::Null) => vec.push(0),
            (ColumnVec::Int128(vec), Value::Int128(x)) => vec.push(*x),
            (ColumnVec::Int128(vec), Value::Null) => vec.push(0),
            (ColumnVec::Float32(vec), Value::Float32(x)) => vec.push(*x),
            (ColumnVec::Float32(vec), Value::Null) => vec.push(0.0),
            (ColumnVec::Float64(vec), Value::Float64(x)) => vec.push(*x),
            (ColumnVec::Float64(vec), Value::Null) => vec.push(0.0),
            (ColumnVec::String { offsets, heap }, Value::String(s)) => {
                heap.extend_from_slice(s.as_bytes());
                offsets.push(heap.len() as u32);
            }
            (ColumnVec::String { offsets, heap }, Value::Null) => {
                offsets.push(heap.len() as u32);
            }
            (
                ColumnVec::List {
                    offsets,
                    nulls,
                    child,
                },
                Value::List(items),
            ) => {
                for item in items {
                    nulls.push(item.is_null());
                    child.push(item)?;
                }
                offsets.push(child.len() as u32);
            }
            (ColumnVec::List { offsets, child, .. }, Value::Null) => {
                offsets.push(child.len() as u32);
            }
            (
                ColumnVec::Map {
                    offsets,
                    val_nulls,
                    keys,
                    vals,
                },
                Value::Map(entries),
            ) => {
                for (k, v) in entries {
                    keys.push(k)?;
                    val_nulls.push(v.is_null());
                    vals.push(v)?;
                }
                offsets.push(keys.len() as u32);
            }
            (ColumnVec::Map { offsets, keys, .. }, Value::Null) => {
                offsets.push(keys.len() as u32);
            }
            (col, other) => return Err(type_err(col.type_name(), other)),
        }
        Ok(())
    }

    /// Drop rows beyond `len`, recursing into child columns
    pub fn truncate(&mut self, len: usize) {
        match self {
            ColumnVec::Bool { bits, len: l } => {
                if len < *l {
                    *l = len;
                    bits.truncate((len + 7) / 8);
                }
            }
            ColumnVec::Int8(v) => v.truncate(len),
            ColumnVec::Int16(v) => v.truncate(len),
            ColumnVec::Int32(v) => v.truncate(len),
            ColumnVec::Int64(v) => v.truncate(len),
            ColumnVec::Int128(v) => v.truncate(len),
            ColumnVec::Float32(v) => v.truncate(len),
            ColumnVec::Float64(v) => v.truncate(len),
            ColumnVec::String { offsets, heap } => {
                if len + 1 < offsets.len() {
                    offsets.truncate(len + 1);
                    heap.truncate(offsets[len] as usize);
                }
            }
            ColumnVec::List {
                offsets,
                nulls,
                child,
            } => {
                if len + 1 < offsets.len() {
                    offsets.truncate(len + 1);
                    let child_len = offsets[len] as usize;
                    nulls.truncate(child_len);
                    child.truncate(child_len);
                }
            }
            ColumnVec::Map {
                offsets,
                val_nulls,
                keys,
                vals,
            } => {
                if len + 1 < offsets.len() {
                    offsets.truncate(len + 1);
                    let child_len = offsets[len] as usize;
                    val_nulls.truncate(child_len);
                    keys.truncate(child_len);
                    vals.truncate(child_len);
                }
            }
        }
    }

    /// Materializing read of one slot
    pub fn value_at(&self, idx: usize) -> Value {
        match self {
            ColumnVec::Bool { bits, .. } => {
                Value::Bool((bits[idx / 8] >> (idx % 8)) & 1 == 1)
            }
            ColumnVec::Int8(v) => Value::Int8(v[idx]),
            ColumnVec::Int16(v) => Value::Int16(v[idx]),
            ColumnVec::Int32(v) => Value::Int32(v[idx]),
            ColumnVec::Int64(v) => Value::Int64(v[idx]),
            ColumnVec::Int128(v) => Value::Int128(v[idx]),
            ColumnVec::Float32(v) => Value::Float32(v[idx]),
            ColumnVec::Float64(v) => Value::Float64(v[idx]),
            ColumnVec::String { .. } => {
                Value::String(self.str_at(idx).unwrap_or_default().to_string())
            }
            ColumnVec::List {
                offsets,
                nulls,
                child,
            } => {
                let start = offsets[idx] as usize;
                let end = offsets[idx + 1] as usize;
                let items = (start..end)
                    .map(|j| {
                        if nulls.get(j) {
                            Value::Null
                        } else {
                            child.value_at(j)
                        }
                    })
                    .collect();
                Value::List(items)
            }
            ColumnVec::Map {
                offsets,
                val_nulls,
                keys,
                vals,
            } => {
                let start = offsets[idx] as usize;
                let end = offsets[idx + 1] as usize;
                let entries = (start..end)
                    .map(|j| {
                        let v = if val_nulls.get(j) {
                            Value::Null
                        } else {
                            vals.value_at(j)
                        };
                        (keys.value_at(j), v)
                    })
                    .collect();
                Value::Map(entries)
            }
        }
    }

    /// Zero-copy string read; `None` for non-string columns
    pub fn str_at(&self, idx: usize) -> Option<&str> {
        if let ColumnVec::String { offsets, heap } = self {
            let start = offsets[idx] as usize;
            let end = offsets[idx + 1] as usize;
            std::str::from_utf8(&heap[start..end]).ok()
        } else {
            None
        }
    }

    /// In-place merge of an incoming value into an occupied slot.
    /// Only fixed-width numeric slots support arithmetic reducers; the
    /// variable-width types accept `First` (keep) only.
    pub fn merge_at(&mut self, idx: usize, incoming: &Value, op: MergeOp) -> Result<()> {
        if let MergeOp::Custom(f) = op {
            let merged = f(&self.value_at(idx), incoming);
            return self.store_at(idx, &merged);
        }
        match op {
            MergeOp::First => Ok(()),
            MergeOp::Count => {
                let merged = match self.value_at(idx) {
                    Value::Int8(x) => Value::Int8(x.wrapping_add(1)),
                    Value::Int16(x) => Value::Int16(x.wrapping_add(1)),
                    Value::Int32(x) => Value::Int32(x.wrapping_add(1)),
                    Value::Int64(x) => Value::Int64(x.wrapping_add(1)),
                    Value::Int128(x) => Value::Int128(x.wrapping_add(1)),
                    other => other,
                };
                self.store_at(idx, &merged)
            }
            MergeOp::Sum | MergeOp::Min | MergeOp::Max => {
                if incoming.is_null() {
                    return Ok(());
                }
                let merged = reduce(&self.value_at(idx), incoming, op)?;
                self.store_at(idx, &merged)
            }
            MergeOp::Custom(_) => unreachable!(),
        }
    }

    /// Overwrite a fixed-width slot
    pub(crate) fn store_at(&mut self, idx: usize, value: &Value) -> Result<()> {
        match (self, value) {
            (ColumnVec::Bool { bits, .. }, Value::Bool(b)) => {
                if *b {
                    bits[idx / 8] |= 1 << (idx % 8);
                } else {
                    bits[idx / 8] &= !(1 << (idx % 8));
                }
                Ok(())
            }
            (ColumnVec::Int8(v), Value::Int8(x)) => {
                v[idx] = *x;
                Ok(())
            }
            (ColumnVec::Int16(v), Value::Int16(x)) => {
                v[idx] = *x;
                Ok(())
            }
            (ColumnVec::Int32(v), Value::Int32(x)) => {
                v[idx] = *x;
                Ok(())
            }
            (ColumnVec::Int64(v), Value::Int64(x)) => {
                v[idx] = *x;
                Ok(())
            }
            (ColumnVec::Int128(v), Value::Int128(x)) => {
                v[idx] = *x;
                Ok(())
            }
            (ColumnVec::Float32(v), Value::Float32(x)) => {
                v[idx] = *x;
                Ok(())
            }
            (ColumnVec::Float64(v), Value::Float64(x)) => {
                v[idx] = *x;
                Ok(())
            }
            (col, other) => Err(type_err(col.type_name(), other)),
        }
    }

    /// Approximate in-memory payload size
    pub fn byte_size(&self) -> usize {
        match self {
            ColumnVec::Bool { bits, .. } => bits.len(),
            ColumnVec::Int8(v) => v.len(),
            ColumnVec::Int16(v) => v.len() * 2,
            ColumnVec::Int32(v) => v.len() * 4,
            ColumnVec::Int64(v) => v.len() * 8,
            ColumnVec::Int128(v) => v.len() * 16,
            ColumnVec::Float32(v) => v.len() * 4,
            ColumnVec::Float64(v) => v.len() * 8,
            ColumnVec::String { offsets, heap } => offsets.len() * 4 + heap.len(),
            ColumnVec::List {
                offsets,
                nulls,
                child,
            } => offsets.len() * 4 + nulls.byte_len() + child.byte_size(),
            ColumnVec::Map {
                offsets,
                val_nulls,
                keys,
                vals,
            } => offsets.len() * 4 + val_nulls.byte_len() + keys.byte_size() + vals.byte_size(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ColumnVec::Bool { .. } => "bool",
            ColumnVec::Int8(_) => "i8",
            ColumnVec::Int16(_) => "i16",
            ColumnVec::Int32(_) => "i32",
            ColumnVec::Int64(_) => "i64",
            ColumnVec::Int128(_) => "i128",
            ColumnVec::Float32(_) => "f32",
            ColumnVec::Float64(_) => "f64",
            ColumnVec::String { .. } => "string",
            ColumnVec::List { .. } => "list",
            ColumnVec::Map { .. } => "map",
        }
    }

    // ========================================================================
    // Wire encoding (little-endian, u64 section lengths)
    // ========================================================================

    /// Exact number of bytes `write` will produce
    pub fn serialized_len(&self) -> usize {
        match self {
            ColumnVec::Bool { len, .. } => (len + 7) / 8,
            ColumnVec::Int8(v) => v.len(),
            ColumnVec::Int16(v) => v.len() * 2,
            ColumnVec::Int32(v) => v.len() * 4,
            ColumnVec::Int64(v) => v.len() * 8,
            ColumnVec::Int128(v) => v.len() * 16,
            ColumnVec::Float32(v) => v.len() * 4,
            ColumnVec::Float64(v) => v.len() * 8,
            ColumnVec::String { offsets, heap } => offsets.len() * 4 + 8 + heap.len(),
            ColumnVec::List {
                offsets,
                nulls,
                child,
            } => offsets.len() * 4 + nulls.byte_len() + child.serialized_len(),
            ColumnVec::Map {
                offsets,
                val_nulls,
                keys,
                vals,
            } => {
                offsets.len() * 4
                    + val_nulls.byte_len()
                    + keys.serialized_len()
                    + vals.serialized_len()
            }
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            ColumnVec::Bool { bits, len } => {
                let byte_len = (*len + 7) / 8;
                w.write_all(&bits[..byte_len.min(bits.len())])?;
                for _ in bits.len()..byte_len {
                    w.write_all(&[0])?;
                }
            }
            ColumnVec::Int8(v) => {
                for x in v {
                    w.write_i8(*x)?;
                }
            }
            ColumnVec::Int16(v) => {
                for x in v {
                    w.write_i16::<LittleEndian>(*x)?;
                }
            }
            ColumnVec::Int32(v) => {
                for x in v {
                    w.write_i32::<LittleEndian>(*x)?;
                }
            }
            ColumnVec::Int64(v) => {
                for x in v {
                    w.write_i64::<LittleEndian>(*x)?;
                }
            }
            ColumnVec::Int128(v) => {
                for x in v {
                    w.write_i128::<LittleEndian>(*x)?;
                }
            }
            ColumnVec::Float32(v) => {
                for x in v {
                    w.write_u32::<LittleEndian>(x.to_bits())?;
                }
            }
            ColumnVec::Float64(v) => {
                for x in v {
                    w.write_u64::<LittleEndian>(x.to_bits())?;
                }
            }
            ColumnVec::String { offsets, heap } => {
                for o in offsets {
                    w.write_u32::<LittleEndian>(*o)?;
                }
                w.write_u64::<LittleEndian>(heap.len() as u64)?;
                w.write_all(heap)?;
            }
            ColumnVec::List {
                offsets,
                nulls,
                child,
            } => {
                for o in offsets {
                    w.write_u32::<LittleEndian>(*o)?;
                }
                nulls.write(w)?;
                child.write(w)?;
            }
            ColumnVec::Map {
                offsets,
                val_nulls,
                keys,
                vals,
            } => {
                for o in offsets {
                    w.write_u32::<LittleEndian>(*o)?;
                }
                val_nulls.write(w)?;
                keys.write(w)?;
                vals.write(w)?;
            }
        }
        Ok(())
    }

    /// Parse one column of `rows` slots from `bytes` at `*pos`
    pub fn read(bytes: &[u8], pos: &mut usize, dtype: &DataType, rows: usize) -> Result<Self> {
        match dtype {
            DataType::Bool => {
                let byte_len = (rows + 7) / 8;
                let bits = take(bytes, pos, byte_len, "bool bits")?.to_vec();
                Ok(ColumnVec::Bool { bits, len: rows })
            }
            DataType::Int8 => {
                let raw = take(bytes, pos, rows, "i8 column")?;
                Ok(ColumnVec::Int8(raw.iter().map(|b| *b as i8).collect()))
            }
            DataType::Int16 => Ok(ColumnVec::Int16(read_fixed(bytes, pos, rows, 2, |c| {
                i16::from_le_bytes(c.try_into().unwrap())
            })?)),
            DataType::Int32 => Ok(ColumnVec::Int32(read_fixed(bytes, pos, rows, 4, |c| {
                i32::from_le_bytes(c.try_into().unwrap())
            })?)),
            DataType::Int64 => Ok(ColumnVec::Int64(read_fixed(bytes, pos, rows, 8, |c| {
                i64::from_le_bytes(c.try_into().unwrap())
            })?)),
            DataType::Int128 => Ok(ColumnVec::Int128(read_fixed(bytes, pos, rows, 16, |c| {
                i128::from_le_bytes(c.try_into().unwrap())
            })?)),
            DataType::Float32 => Ok(ColumnVec::Float32(read_fixed(bytes, pos, rows, 4, |c| {
                f32::from_bits(u32::from_le_bytes(c.try_into().unwrap()))
            })?)),
            DataType::Float64 => Ok(ColumnVec::Float64(read_fixed(bytes, pos, rows, 8, |c| {
                f64::from_bits(u64::from_le_bytes(c.try_into().unwrap()))
            })?)),
            DataType::String => {
                let offsets = read_offsets(bytes, pos, rows)?;
                let heap_len = read_u64(bytes, pos)? as usize;
                if *offsets.last().unwrap() as usize != heap_len {
                    return Err(corrupt("string heap length mismatch"));
                }
                let heap = take(bytes, pos, heap_len, "string heap")?.to_vec();
                Ok(ColumnVec::String { offsets, heap })
            }
            DataType::List(elem) => {
                let offsets = read_offsets(bytes, pos, rows)?;
                let child_rows = *offsets.last().unwrap() as usize;
                let nulls = NullBitmap::read(bytes, pos, child_rows)?;
                let child = ColumnVec::read(bytes, pos, elem, child_rows)?;
                Ok(ColumnVec::List {
                    offsets,
                    nulls,
                    child: Box::new(child),
                })
            }
            DataType::Map(k, v) => {
                let offsets = read_offsets(bytes, pos, rows)?;
                let child_rows = *offsets.last().unwrap() as usize;
                let val_nulls = NullBitmap::read(bytes, pos, child_rows)?;
                let keys = ColumnVec::read(bytes, pos, k, child_rows)?;
                let vals = ColumnVec::read(bytes, pos, v, child_rows)?;
                Ok(ColumnVec::Map {
                    offsets,
                    val_nulls,
                    keys: Box::new(keys),
                    vals: Box::new(vals),
                })
            }
        }
    }
}

/// Reducer applied when a hashed row slot receives another row
#[derive(Debug, Clone, Copy)]
pub enum MergeOp {
    Sum,
    Min,
    Max,
    /// Increment the slot by one per merged row, ignoring the incoming value
    Count,
    /// Keep the first-written value
    First,
    /// User-supplied reducer over (existing, incoming)
    Custom(fn(&Value, &Value) -> Value),
}

fn reduce(existing: &Value, incoming: &Value, op: MergeOp) -> Result<Value> {
    macro_rules! arith {
        ($variant:ident, $a:expr, $b:expr) => {
            match op {
                MergeOp::Sum => Value::$variant($a.wrapping_add(*$b)),
                MergeOp::Min => Value::$variant((*$a).min(*$b)),
                MergeOp::Max => Value::$variant((*$a).max(*$b)),
                _ => unreachable!(),
            }
        };
    }
    Ok(match (existing, incoming) {
        (Value::Null, v) => v.clone(),
        (Value::Int8(a), Value::Int8(b)) => arith!(Int8, a, b),
        (Value::Int16(a), Value::Int16(b)) => arith!(Int16, a, b),
        (Value::Int32(a), Value::Int32(b)) => arith!(Int32, a, b),
        (Value::Int64(a), Value::Int64(b)) => arith!(Int64, a, b),
        (Value::Int128(a), Value::Int128(b)) => arith!(Int128, a, b),
        (Value::Float32(a), Value::Float32(b)) => match op {
            MergeOp::Sum => Value::Float32(a + b),
            MergeOp::Min => Value::Float32(a.min(*b)),
            MergeOp::Max => Value::Float32(a.max(*b)),
            _ => unreachable!(),
        },
        (Value::Float64(a), Value::Float64(b)) => match op {
            MergeOp::Sum => Value::Float64(a + b),
            MergeOp::Min => Value::Float64(a.min(*b)),
            MergeOp::Max => Value::Float64(a.max(*b)),
            _ => unreachable!(),
        },
        (a, b) => return Err(type_err(a.type_name(), b)),
    })
}

fn type_err(expected: &str, got: &Value) -> NebulaError {
    NebulaError::Schema {
        field: String::new(),
        expected: expected.to_string(),
        actual: got.type_name().to_string(),
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize, what: &str) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .ok_or_else(|| NebulaError::CorruptBlock(format!("{} length overflow", what)))?;
    if end > bytes.len() {
        return Err(NebulaError::CorruptBlock(format!("{} truncated", what)));
    }
    let s = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let raw = take(bytes, pos, 8, "u64 length")?;
    Ok(u64::from_le_bytes(raw.try_into().unwrap()))
}

fn read_offsets(bytes: &[u8], pos: &mut usize, rows: usize) -> Result<Vec<u32>> {
    let width = rows
        .checked_add(1)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt("offset array length overflow"))?;
    let raw = take(bytes, pos, width, "offset array")?;
    let offsets: Vec<u32> = raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    // offsets must start at zero and never decrease
    if offsets[0] != 0 || offsets.windows(2).any(|w| w[1] < w[0]) {
        return Err(corrupt("offset array not monotonic"));
    }
    Ok(offsets)
}

fn read_fixed<T, F: Fn(&[u8]) -> T>(
    bytes: &[u8],
    pos: &mut usize,
    rows: usize,
    width: usize,
    decode: F,
) -> Result<Vec<T>> {
    let total = rows
        .checked_mul(width)
        .ok_or_else(|| corrupt("fixed-width column length overflow"))?;
    let raw = take(bytes, pos, total, "fixed-width column")?;
    Ok(raw.chunks_exact(width).map(|c| decode(c)).collect())
}
