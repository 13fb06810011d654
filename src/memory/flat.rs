//! Append-only flat row container
//!
//! A FlatBuffer materializes an ordered projection of schema columns and
//! stores appended rows column-major. It backs every in-memory data block,
//! the hashed aggregation buffer, and the query wire format.
//!
//! Serialization is self-describing given the (schema, fields) pair the
//! receiver already holds: the wire form carries the row count, per-column
//! null bitmaps, offset arrays and heaps, and a trailing crc32.

use crate::data::{Field, Row, Schema, Value};
use crate::memory::column::{ColumnVec, NullBitmap};
use crate::{NebulaError, Result};
use byteorder::{LittleEndian, WriteBytesExt};

/// Magic bytes "NBFB"
const MAGIC: u32 = 0x4E42_4642;
const VERSION: u16 = 1;
/// magic + version + column count + row count
const HEADER_SIZE: usize = 4 + 2 + 2 + 8;
const FOOTER_SIZE: usize = 4;

pub struct FlatBuffer {
    schema: Schema,
    /// Materialized projection, in declared order
    fields: Vec<Field>,
    columns: Vec<ColumnVec>,
    nulls: Vec<NullBitmap>,
    rows: usize,
    /// Serialized length once `prepare_serde` ran; mutation is rejected after
    frozen: Option<u64>,
    /// Armed by `add`, cleared by `rollback`
    can_rollback: bool,
}

impl FlatBuffer {
    /// Create an empty buffer materializing `field_names` (an ordered
    /// projection of schema columns; pass all names for a full buffer).
    pub fn new(schema: Schema, field_names: &[&str]) -> Result<Self> {
        let mut fields = Vec::with_capacity(field_names.len());
        for name in field_names {
            let idx = schema
                .index_of(name)
                .ok_or_else(|| NebulaError::FieldNotFound((*name).to_string()))?;
            fields.push(schema.field(idx).expect("index from index_of").clone());
        }
        let columns = fields
            .iter()
            .map(|f| ColumnVec::new(&f.data_type))
            .collect();
        let nulls = fields.iter().map(|_| NullBitmap::new()).collect();
        Ok(Self {
            schema,
            fields,
            columns,
            nulls,
            rows: 0,
            frozen: None,
            can_rollback: false,
        })
    }

    /// Full-schema buffer
    pub fn with_schema(schema: Schema) -> Result<Self> {
        let names: Vec<String> = schema.fields().iter().map(|f| f.name.clone()).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        Self::new(schema, &refs)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn rows(&self) -> u64 {
        self.rows as u64
    }

    /// Current payload size across all columns
    pub fn raw_size(&self) -> u64 {
        self.columns.iter().map(|c| c.byte_size() as u64).sum()
    }

    /// Append one row; every field is read from the row by name and missing
    /// fields become null. A type mismatch aborts the row with the buffer
    /// unchanged.
    pub fn add(&mut self, row: &Row) -> Result<usize> {
        if self.frozen.is_some() {
            return Err(NebulaError::Frozen);
        }
        // validate before any column is touched so a failed row leaves
        // no partial state behind
        for field in &self.fields {
            let value = row.get(&field.name);
            if !value.matches(&field.data_type) {
                return Err(NebulaError::Schema {
                    field: field.name.clone(),
                    expected: field.data_type.to_string(),
                    actual: value.type_name().to_string(),
                });
            }
        }
        for (i, field) in self.fields.iter().enumerate() {
            let value = row.get(&field.name);
            self.nulls[i].push(value.is_null());
            self.columns[i].push(value)?;
        }
        self.rows += 1;
        self.can_rollback = true;
        Ok(self.rows - 1)
    }

    /// Drop exactly the most recently appended row. A no-op when the buffer
    /// is empty or when the last appended row was already rolled back.
    pub fn rollback(&mut self) {
        if self.frozen.is_some() || !self.can_rollback || self.rows == 0 {
            return;
        }
        let target = self.rows - 1;
        for col in &mut self.columns {
            col.truncate(target);
        }
        for nb in &mut self.nulls {
            nb.truncate(target);
        }
        self.rows = target;
        self.can_rollback = false;
    }

    /// Zero-copy read handle for one row; valid while the buffer lives
    pub fn row(&self, idx: usize) -> RowView<'_> {
        debug_assert!(idx < self.rows);
        RowView { flat: self, idx }
    }

    pub(crate) fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub(crate) fn column(&self, idx: usize) -> &ColumnVec {
        &self.columns[idx]
    }

    pub(crate) fn column_mut(&mut self, idx: usize) -> &mut ColumnVec {
        &mut self.columns[idx]
    }

    pub(crate) fn null_bitmap(&self, idx: usize) -> &NullBitmap {
        &self.nulls[idx]
    }

    pub(crate) fn null_bitmap_mut(&mut self, idx: usize) -> &mut NullBitmap {
        &mut self.nulls[idx]
    }

    // ========================================================================
    // Serde
    // ========================================================================

    /// Compute the exact serialized byte length and freeze the buffer.
    pub fn prepare_serde(&mut self) -> u64 {
        if let Some(n) = self.frozen {
            return n;
        }
        let mut total = HEADER_SIZE + FOOTER_SIZE;
        for (col, nb) in self.columns.iter().zip(&self.nulls) {
            total += nb.byte_len() + col.serialized_len();
        }
        let n = total as u64;
        self.frozen = Some(n);
        n
    }

    /// Write the serialized form into `dst`. Writes exactly the length
    /// returned by `prepare_serde` and returns it.
    pub fn serialize(&self, dst: &mut [u8]) -> Result<u64> {
        let expected = self.frozen.ok_or_else(|| {
            NebulaError::Serialization("serialize called before prepare_serde".into())
        })?;
        if (dst.len() as u64) < expected {
            return Err(NebulaError::Serialization(format!(
                "destination holds {} bytes, need {}",
                dst.len(),
                expected
            )));
        }
        let body_len = expected as usize - FOOTER_SIZE;
        let mut cursor = std::io::Cursor::new(&mut dst[..body_len]);
        cursor.write_u32::<LittleEndian>(MAGIC)?;
        cursor.write_u16::<LittleEndian>(VERSION)?;
        cursor.write_u16::<LittleEndian>(self.columns.len() as u16)?;
        cursor.write_u64::<LittleEndian>(self.rows as u64)?;
        for (col, nb) in self.columns.iter().zip(&self.nulls) {
            nb.write(&mut cursor)?;
            col.write(&mut cursor)?;
        }
        if cursor.position() as usize != body_len {
            return Err(NebulaError::Serialization(format!(
                "wrote {} body bytes, expected {}",
                cursor.position(),
                body_len
            )));
        }
        let crc = crc32fast::hash(&dst[..body_len]);
        dst[body_len..body_len + FOOTER_SIZE].copy_from_slice(&crc.to_le_bytes());
        Ok(expected)
    }

    /// Convenience: prepare + serialize into a fresh vector
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.prepare_serde() as usize;
        let mut buf = vec![0u8; n];
        self.serialize(&mut buf)?;
        Ok(buf)
    }

    /// Deserializing constructor; takes ownership of the byte region.
    /// The receiver supplies the same (schema, fields) the producer used.
    pub fn from_bytes(schema: Schema, field_names: &[&str], bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(NebulaError::CorruptBlock("buffer shorter than header".into()));
        }
        let body_len = bytes.len() - FOOTER_SIZE;
        let stored_crc = u32::from_le_bytes(bytes[body_len..].try_into().unwrap());
        if crc32fast::hash(&bytes[..body_len]) != stored_crc {
            return Err(NebulaError::CorruptBlock("checksum mismatch".into()));
        }

        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(NebulaError::CorruptBlock("bad magic".into()));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(NebulaError::CorruptBlock(format!(
                "unsupported version {}",
                version
            )));
        }
        let ncols = u16::from_le_bytes(bytes[6..8].try_into().unwrap()) as usize;
        if ncols != field_names.len() {
            return Err(NebulaError::CorruptBlock(format!(
                "column count {} does not match field list {}",
                ncols,
                field_names.len()
            )));
        }
        let rows = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
        // each column carries a ceil(rows/8)-byte bitmap, so a sane row
        // count is bounded by the buffer size
        if ncols > 0 && rows / 8 > bytes.len() {
            return Err(NebulaError::CorruptBlock(format!(
                "row count {} impossible for {} bytes",
                rows,
                bytes.len()
            )));
        }

        let mut flat = FlatBuffer::new(schema, field_names)?;
        let mut pos = HEADER_SIZE;
        let mut columns = Vec::with_capacity(ncols);
        let mut nulls = Vec::with_capacity(ncols);
        for field in &flat.fields {
            let nb = NullBitmap::read(&bytes, &mut pos, rows)?;
            let col = ColumnVec::read(&bytes, &mut pos, &field.data_type, rows)?;
            nulls.push(nb);
            columns.push(col);
        }
        if pos != body_len {
            return Err(NebulaError::CorruptBlock(format!(
                "{} trailing bytes after last column",
                body_len - pos
            )));
        }
        flat.columns = columns;
        flat.nulls = nulls;
        flat.rows = rows;
        Ok(flat)
    }
}

impl std::fmt::Debug for FlatBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatBuffer")
            .field("fields", &self.fields.len())
            .field("rows", &self.rows)
            .field("raw_size", &self.raw_size())
            .finish()
    }
}

/// Zero-copy read handle over one row of a FlatBuffer
#[derive(Clone, Copy)]
pub struct RowView<'a> {
    flat: &'a FlatBuffer,
    idx: usize,
}

impl<'a> RowView<'a> {
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn is_null(&self, name: &str) -> bool {
        match self.flat.field_index(name) {
            Some(col) => self.flat.null_bitmap(col).get(self.idx),
            None => true,
        }
    }

    /// Materializing read by field name; unknown or null fields read as null
    pub fn value(&self, name: &str) -> Value {
        match self.flat.field_index(name) {
            Some(col) if !self.flat.null_bitmap(col).get(self.idx) => {
                self.flat.column(col).value_at(self.idx)
            }
            _ => Value::Null,
        }
    }

    /// Materializing read by column index
    pub fn value_at(&self, col: usize) -> Value {
        if self.flat.null_bitmap(col).get(self.idx) {
            Value::Null
        } else {
            self.flat.column(col).value_at(self.idx)
        }
    }

    /// Zero-copy string read; None when null or not a string column
    pub fn read_str(&self, name: &str) -> Option<&'a str> {
        let col = self.flat.field_index(name)?;
        if self.flat.null_bitmap(col).get(self.idx) {
            return None;
        }
        self.flat.column(col).str_at(self.idx)
    }

    /// Materialize the whole row as an input-style Row
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        for field in self.flat.fields() {
            row.insert(field.name.clone(), self.value(&field.name));
        }
        row
    }
}
