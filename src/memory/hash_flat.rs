//! Hashed flat buffer for keyed aggregation
//!
//! A HashFlat maintains a mapping from a key tuple (evaluated per input
//! row at construction-declared evaluators) to a single row slot. Adding a
//! row whose key already exists merges the configured columns in place
//! instead of appending; columns without a reducer keep their first-written
//! value. Serialization goes through the plain FlatBuffer format; the hash
//! index is rebuilt from rows alone on demand.

use crate::data::{FieldExpr, Row, Schema, Value};
use crate::memory::column::MergeOp;
use crate::memory::flat::{FlatBuffer, RowView};
use crate::{NebulaError, Result};
use ahash::AHashMap;

/// Hashable projection of a scalar value (floats key by bit pattern)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HashKey {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    Float32(u32),
    Float64(u64),
    Str(String),
}

fn key_of(value: &Value) -> Result<HashKey> {
    Ok(match value {
        Value::Null => HashKey::Null,
        Value::Bool(b) => HashKey::Bool(*b),
        Value::Int8(x) => HashKey::Int8(*x),
        Value::Int16(x) => HashKey::Int16(*x),
        Value::Int32(x) => HashKey::Int32(*x),
        Value::Int64(x) => HashKey::Int64(*x),
        Value::Int128(x) => HashKey::Int128(*x),
        Value::Float32(x) => HashKey::Float32(x.to_bits()),
        Value::Float64(x) => HashKey::Float64(x.to_bits()),
        Value::String(s) => HashKey::Str(s.clone()),
        other => {
            return Err(NebulaError::Schema {
                field: String::new(),
                expected: "scalar key".to_string(),
                actual: other.type_name().to_string(),
            })
        }
    })
}

pub struct HashFlat {
    flat: FlatBuffer,
    keys: Vec<FieldExpr>,
    /// Reducer per materialized column; None keeps the first-written value
    merges: Vec<Option<MergeOp>>,
    index: AHashMap<Vec<HashKey>, usize>,
}

impl HashFlat {
    /// `merges` names the columns that fold on key collision; everything
    /// else is first-write-wins.
    pub fn new(
        schema: Schema,
        field_names: &[&str],
        keys: Vec<FieldExpr>,
        merges: &[(&str, MergeOp)],
    ) -> Result<Self> {
        let flat = FlatBuffer::new(schema, field_names)?;
        let mut per_column = vec![None; flat.fields().len()];
        for (name, op) in merges {
            let idx = flat
                .field_index(name)
                .ok_or_else(|| NebulaError::FieldNotFound((*name).to_string()))?;
            per_column[idx] = Some(*op);
        }
        Ok(Self {
            flat,
            keys,
            merges: per_column,
            index: AHashMap::new(),
        })
    }

    /// Rebuild the hash index over an existing buffer (e.g. one received
    /// off the wire); on duplicate keys the later row wins the slot.
    pub fn from_flat(
        flat: FlatBuffer,
        keys: Vec<FieldExpr>,
        merges: &[(&str, MergeOp)],
    ) -> Result<Self> {
        let mut per_column = vec![None; flat.fields().len()];
        for (name, op) in merges {
            let idx = flat
                .field_index(name)
                .ok_or_else(|| NebulaError::FieldNotFound((*name).to_string()))?;
            per_column[idx] = Some(*op);
        }
        let mut index = AHashMap::with_capacity(flat.rows() as usize);
        for i in 0..flat.rows() as usize {
            let row = flat.row(i).to_row();
            let key = Self::key_tuple(&keys, &row)?;
            index.insert(key, i);
        }
        Ok(Self {
            flat,
            keys,
            merges: per_column,
            index,
        })
    }

    fn key_tuple(keys: &[FieldExpr], row: &Row) -> Result<Vec<HashKey>> {
        keys.iter().map(|k| key_of(k.eval(row))).collect()
    }

    /// Upsert one row: a new key tuple appends and indexes, a seen key
    /// merges in place.
    pub fn add(&mut self, row: &Row) -> Result<usize> {
        let key = Self::key_tuple(&self.keys, row)?;
        if let Some(&slot) = self.index.get(&key) {
            self.merge_into(slot, row)?;
            return Ok(slot);
        }
        let slot = self.flat.add(row)?;
        self.index.insert(key, slot);
        Ok(slot)
    }

    fn merge_into(&mut self, slot: usize, row: &Row) -> Result<()> {
        let fields: Vec<_> = self.flat.fields().to_vec();
        for (i, field) in fields.iter().enumerate() {
            let op = match self.merges[i] {
                Some(op) => op,
                None => continue,
            };
            let incoming = row.get(&field.name);
            let slot_is_null = self.flat.null_bitmap(i).get(slot);
            match op {
                MergeOp::First => {}
                MergeOp::Count => {
                    self.flat.column_mut(i).merge_at(slot, incoming, op)?;
                }
                _ => {
                    if incoming.is_null() {
                        continue;
                    }
                    if slot_is_null {
                        // a null slot adopts the first non-null contribution
                        self.flat.column_mut(i).store_at(slot, incoming)?;
                        self.flat.null_bitmap_mut(i).set(slot, false);
                    } else {
                        self.flat.column_mut(i).merge_at(slot, incoming, op)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.flat.rows()
    }

    pub fn raw_size(&self) -> u64 {
        self.flat.raw_size()
    }

    /// Read handle over the current merged row
    pub fn row(&self, idx: usize) -> RowView<'_> {
        self.flat.row(idx)
    }

    pub fn prepare_serde(&mut self) -> u64 {
        self.flat.prepare_serde()
    }

    pub fn serialize(&self, dst: &mut [u8]) -> Result<u64> {
        self.flat.serialize(dst)
    }

    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.flat.to_bytes()
    }

    /// Hand the merged rows over as a plain buffer
    pub fn into_flat(self) -> FlatBuffer {
        self.flat
    }
}

impl std::fmt::Debug for HashFlat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashFlat")
            .field("rows", &self.flat.rows())
            .field("keys", &self.keys.len())
            .finish()
    }
}
