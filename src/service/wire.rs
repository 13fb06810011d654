//! Wire protocol between coordinator and workers
//!
//! Length-delimited (u32 big-endian prefix) msgpack messages over a
//! byte stream. Echo, query, poll and task all share one request/response
//! pair per connection.

use crate::data::Schema;
use crate::execution::block::BatchBlock;
use crate::query::QueryPlan;
use crate::service::task::{Task, TaskState};
use crate::{NebulaError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Frames above this size are rejected as corrupt
const MAX_FRAME: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Echo { name: String },
    /// Repeated liveness probe; the reply batches `count` messages
    Echos { name: String, count: u32 },
    Query(QueryPlan),
    Poll,
    Task(Task),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Echo { message: String },
    Echos { messages: Vec<String> },
    Query(BatchRows),
    Poll(NodeStateReply),
    Task { state: TaskState },
    Error { message: String },
}

/// Encoding of the rows attached to a query reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    /// `data` is exactly the bytes produced by `FlatBuffer::serialize`
    Flat,
    Json,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryStats {
    pub blocks_scan: u64,
    pub rows_scan: u64,
    pub rows_ret: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRows {
    pub schema: Schema,
    pub batch_type: BatchType,
    pub stats: QueryStats,
    pub data: Vec<u8>,
}

/// One block as enumerated in a poll reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBlockInfo {
    pub table: String,
    pub id: u64,
    pub time_start: u64,
    pub time_end: u64,
    pub spec: String,
    pub storage: String,
    pub rows: u64,
    pub raw_size: u64,
    /// Per-column stats as JSON documents, keyed order matches the block's
    /// stats order
    pub column_histograms: Vec<String>,
}

impl DataBlockInfo {
    pub fn from_block(block: &BatchBlock) -> Self {
        let sign = block.signature();
        let column_histograms = block
            .stats()
            .iter()
            .map(|(name, stats)| {
                serde_json::json!({ "column": name, "stats": stats }).to_string()
            })
            .collect();
        Self {
            table: sign.table.clone(),
            id: sign.id,
            time_start: sign.time_start,
            time_end: sign.time_end,
            spec: sign.spec_id.clone(),
            storage: sign.storage_locator.clone(),
            rows: block.rows(),
            raw_size: block.raw_size(),
            column_histograms,
        }
    }

    /// Parse the stats documents back into named column stats
    pub fn parse_stats(&self) -> Vec<(String, crate::execution::block::ColumnStats)> {
        self.column_histograms
            .iter()
            .filter_map(|doc| {
                let v: serde_json::Value = serde_json::from_str(doc).ok()?;
                let column = v.get("column")?.as_str()?.to_string();
                let stats = serde_json::from_value(v.get("stats")?.clone()).ok()?;
                Some((column, stats))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStateReply {
    pub blocks: Vec<DataBlockInfo>,
    pub empty_specs: Vec<String>,
}

// ============================================================================
// Framing
// ============================================================================

/// Read one length-delimited frame; None on a clean EOF between frames
pub fn read_frame<R: Read>(stream: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(NebulaError::Wire(format!("frame of {} bytes too large", len)));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(stream: &mut W, data: &[u8]) -> Result<()> {
    stream.write_all(&(data.len() as u32).to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(msg).map_err(|e| NebulaError::Wire(e.to_string()))
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| NebulaError::Wire(e.to_string()))
}

/// Send one request and wait for its reply over a byte stream
pub fn round_trip<S: Read + Write>(stream: &mut S, request: &Request) -> Result<Response> {
    write_frame(stream, &encode(request)?)?;
    match read_frame(stream)? {
        Some(frame) => decode(&frame),
        None => Err(NebulaError::Wire("connection closed mid-request".into())),
    }
}
