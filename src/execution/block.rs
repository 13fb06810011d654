//! Data block identity, metadata and loading
//!
//! A BatchBlock is the in-memory result of executing one ingestion spec (or
//! a shard of it). Its signature is its identity: two blocks with equal
//! signatures are interchangeable.

use crate::data::{DataType, Schema, Value};
use crate::memory::FlatBuffer;
use crate::{NebulaError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of buckets in the approximate column histograms
const HIST_BUCKETS: usize = 8;

/// Immutable identity of a memory batch. Equality and hash cover all
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockSignature {
    pub table: String,
    /// The ingestion spec that produced this block
    pub spec_id: String,
    /// Monotonically assigned within a spec
    pub id: u64,
    /// Unix seconds; the window is inclusive on both ends
    pub time_start: u64,
    pub time_end: u64,
    /// Origin URL or stream offset; informational
    pub storage_locator: String,
}

impl BlockSignature {
    /// Whether this block's window intersects `[t_start, t_end]`
    pub fn overlaps(&self, t_start: u64, t_end: u64) -> bool {
        self.time_start <= t_end && self.time_end >= t_start
    }
}

impl std::fmt::Display for BlockSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}#{}[{}-{}]",
            self.table, self.spec_id, self.id, self.time_start, self.time_end
        )
    }
}

/// Per-column statistics cached on a block, used for query-time pruning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnStats {
    pub rows: u64,
    pub nulls: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
    /// Equi-width bucket counts between min and max (numeric columns only)
    pub histogram: Option<Vec<u64>>,
}

impl ColumnStats {
    /// Fold another column's stats into this one (bucket-wise histogram sum
    /// when shapes agree, dropped otherwise)
    pub fn merge(&mut self, other: &ColumnStats) {
        self.rows += other.rows;
        self.nulls += other.nulls;
        self.min = match (self.min.take(), other.min.clone()) {
            (Some(a), Some(b)) => Some(match a.compare(&b) {
                Some(std::cmp::Ordering::Greater) => b,
                _ => a,
            }),
            (a, b) => a.or(b),
        };
        self.max = match (self.max.take(), other.max.clone()) {
            (Some(a), Some(b)) => Some(match a.compare(&b) {
                Some(std::cmp::Ordering::Less) => b,
                _ => a,
            }),
            (a, b) => a.or(b),
        };
        self.histogram = match (self.histogram.take(), other.histogram.as_ref()) {
            (Some(mut a), Some(b)) if a.len() == b.len() => {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
                Some(a)
            }
            _ => None,
        };
    }
}

/// Compute stats for every materialized column of a buffer
fn compute_stats(flat: &FlatBuffer) -> Vec<(String, ColumnStats)> {
    let rows = flat.rows() as usize;
    flat.fields()
        .iter()
        .map(|field| {
            let mut stats = ColumnStats {
                rows: rows as u64,
                ..Default::default()
            };
            for i in 0..rows {
                let view = flat.row(i);
                let v = view.value(&field.name);
                if v.is_null() {
                    stats.nulls += 1;
                    continue;
                }
                stats.min = Some(match stats.min.take() {
                    Some(m) if m.compare(&v) != Some(std::cmp::Ordering::Greater) => m,
                    _ => v.clone(),
                });
                stats.max = Some(match stats.max.take() {
                    Some(m) if m.compare(&v) != Some(std::cmp::Ordering::Less) => m,
                    _ => v.clone(),
                });
            }
            if matches!(
                field.data_type,
                DataType::Int8
                    | DataType::Int16
                    | DataType::Int32
                    | DataType::Int64
                    | DataType::Int128
                    | DataType::Float32
                    | DataType::Float64
            ) {
                stats.histogram = histogram(flat, &field.name, &stats);
            }
            (field.name.clone(), stats)
        })
        .collect()
}

fn histogram(flat: &FlatBuffer, name: &str, stats: &ColumnStats) -> Option<Vec<u64>> {
    let lo = stats.min.as_ref()?.as_f64()?;
    let hi = stats.max.as_ref()?.as_f64()?;
    let width = (hi - lo) / HIST_BUCKETS as f64;
    let mut buckets = vec![0u64; HIST_BUCKETS];
    for i in 0..flat.rows() as usize {
        if let Some(x) = flat.row(i).value(name).as_f64() {
            let b = if width > 0.0 {
                (((x - lo) / width) as usize).min(HIST_BUCKETS - 1)
            } else {
                0
            };
            buckets[b] += 1;
        }
    }
    Some(buckets)
}

/// A block signature paired with its data and cached statistics.
/// Created by the ingest path, read-only thereafter; shadow entries carry
/// metadata only (the coordinator's view of remote blocks).
#[derive(Debug)]
pub struct BatchBlock {
    signature: BlockSignature,
    data: Option<FlatBuffer>,
    stats: Vec<(String, ColumnStats)>,
    rows: u64,
    raw_size: u64,
}

impl BatchBlock {
    /// Wrap a freshly ingested buffer
    pub fn new(signature: BlockSignature, data: FlatBuffer) -> Self {
        let stats = compute_stats(&data);
        let rows = data.rows();
        let raw_size = data.raw_size();
        Self {
            signature,
            data: Some(data),
            stats,
            rows,
            raw_size,
        }
    }

    /// Metadata-only entry describing a block held by a remote node
    pub fn shadow(
        signature: BlockSignature,
        rows: u64,
        raw_size: u64,
        stats: Vec<(String, ColumnStats)>,
    ) -> Self {
        Self {
            signature,
            data: None,
            stats,
            rows,
            raw_size,
        }
    }

    pub fn signature(&self) -> &BlockSignature {
        &self.signature
    }

    /// The backing buffer; None for shadow entries
    pub fn data(&self) -> Option<&FlatBuffer> {
        self.data.as_ref()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    pub fn stats(&self) -> &[(String, ColumnStats)] {
        &self.stats
    }

    pub fn column_stats(&self, name: &str) -> Option<&ColumnStats> {
        self.stats
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }
}

/// Turns an ingestion signature into loaded blocks. Implementations read a
/// data source, build FlatBuffers and wrap them with computed statistics.
pub trait BlockLoader: Send + Sync {
    fn load(&self, sign: &BlockSignature) -> Result<Vec<Arc<BatchBlock>>>;
}

/// Loader for newline-delimited JSON files on the local filesystem.
/// One file becomes one block; the schema comes from the loader's table
/// registry.
pub struct JsonFileLoader {
    schemas: ahash::AHashMap<String, Schema>,
}

impl JsonFileLoader {
    pub fn new() -> Self {
        Self {
            schemas: ahash::AHashMap::new(),
        }
    }

    pub fn register(&mut self, table: impl Into<String>, schema: Schema) {
        self.schemas.insert(table.into(), schema);
    }

    pub(crate) fn json_to_value(dtype: &DataType, v: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as J;
        let fail = || {
            NebulaError::Schema {
                field: String::new(),
                expected: dtype.to_string(),
                actual: v.to_string(),
            }
        };
        if v.is_null() {
            return Ok(Value::Null);
        }
        Ok(match dtype {
            DataType::Bool => Value::Bool(v.as_bool().ok_or_else(fail)?),
            DataType::Int8 => Value::Int8(v.as_i64().ok_or_else(fail)? as i8),
            DataType::Int16 => Value::Int16(v.as_i64().ok_or_else(fail)? as i16),
            DataType::Int32 => Value::Int32(v.as_i64().ok_or_else(fail)? as i32),
            DataType::Int64 => Value::Int64(v.as_i64().ok_or_else(fail)?),
            DataType::Int128 => Value::Int128(v.as_i64().ok_or_else(fail)? as i128),
            DataType::Float32 => Value::Float32(v.as_f64().ok_or_else(fail)? as f32),
            DataType::Float64 => Value::Float64(v.as_f64().ok_or_else(fail)?),
            DataType::String => Value::String(v.as_str().ok_or_else(fail)?.to_string()),
            DataType::List(elem) => match v {
                J::Array(items) => Value::List(
                    items
                        .iter()
                        .map(|item| Self::json_to_value(elem, item))
                        .collect::<Result<_>>()?,
                ),
                _ => return Err(fail()),
            },
            DataType::Map(k, val) => match v {
                J::Object(entries) if matches!(**k, DataType::String) => Value::Map(
                    entries
                        .iter()
                        .map(|(ek, ev)| {
                            Ok((Value::String(ek.clone()), Self::json_to_value(val, ev)?))
                        })
                        .collect::<Result<_>>()?,
                ),
                _ => return Err(fail()),
            },
        })
    }
}

impl Default for JsonFileLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockLoader for JsonFileLoader {
    fn load(&self, sign: &BlockSignature) -> Result<Vec<Arc<BatchBlock>>> {
        let schema = self
            .schemas
            .get(&sign.table)
            .ok_or_else(|| NebulaError::TableNotFound(sign.table.clone()))?;
        let path = crate::meta::locator::local_path(&sign.storage_locator)?;
        let content = std::fs::read_to_string(&path)?;

        let mut flat = FlatBuffer::with_schema(schema.clone())?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let json: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| NebulaError::Serialization(e.to_string()))?;
            let mut row = crate::data::Row::new();
            for field in schema.fields() {
                if let Some(cell) = json.get(&field.name) {
                    row.insert(field.name.clone(), Self::json_to_value(&field.data_type, cell)?);
                }
            }
            // a malformed row aborts itself, not the batch
            if let Err(e) = flat.add(&row) {
                log::warn!("skipping row in {}: {}", sign.storage_locator, e);
            }
        }

        if flat.rows() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Arc::new(BatchBlock::new(sign.clone(), flat))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Field, Row};

    fn sig(spec: &str, id: u64) -> BlockSignature {
        BlockSignature {
            table: "events".into(),
            spec_id: spec.into(),
            id,
            time_start: 100,
            time_end: 199,
            storage_locator: "file:///tmp/part".into(),
        }
    }

    #[test]
    fn test_signature_equality_and_overlap() {
        assert_eq!(sig("s1", 0), sig("s1", 0));
        assert_ne!(sig("s1", 0), sig("s1", 1));
        assert!(sig("s1", 0).overlaps(150, 300));
        assert!(sig("s1", 0).overlaps(199, 199));
        assert!(!sig("s1", 0).overlaps(200, 300));
    }

    #[test]
    fn test_block_stats() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int32),
            Field::new("name", DataType::String),
        ]);
        let mut flat = FlatBuffer::with_schema(schema).unwrap();
        for (i, name) in [(3, Some("c")), (1, Some("a")), (2, None)] {
            let mut row = Row::new().set("id", Value::Int32(i));
            if let Some(n) = name {
                row.insert("name", Value::String(n.into()));
            }
            flat.add(&row).unwrap();
        }
        let block = BatchBlock::new(sig("s1", 0), flat);
        assert_eq!(block.rows(), 3);
        let id_stats = block.column_stats("id").unwrap();
        assert_eq!(id_stats.min, Some(Value::Int32(1)));
        assert_eq!(id_stats.max, Some(Value::Int32(3)));
        assert!(id_stats.histogram.is_some());
        let name_stats = block.column_stats("name").unwrap();
        assert_eq!(name_stats.nulls, 1);
        assert_eq!(name_stats.min, Some(Value::String("a".into())));
    }

    #[test]
    fn test_json_loader() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.json");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, r#"{{"id": 1, "name": "a"}}"#).unwrap();
        writeln!(f, r#"{{"id": 2}}"#).unwrap();

        let mut loader = JsonFileLoader::new();
        loader.register(
            "events",
            Schema::new(vec![
                Field::new("id", DataType::Int32),
                Field::new("name", DataType::String),
            ]),
        );
        let mut s = sig("s1", 0);
        s.storage_locator = path.to_string_lossy().to_string();
        let blocks = loader.load(&s).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].rows(), 2);
        assert!(blocks[0].data().unwrap().row(1).is_null("name"));
    }
}
