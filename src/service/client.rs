//! Node client abstraction
//!
//! The transport-agnostic capability set the control loops and the query
//! fan-out consume, plus the TCP implementation speaking the framed
//! msgpack protocol.

use crate::data::Row;
use crate::execution::block::{BatchBlock, BlockSignature};
use crate::execution::manager::{BlockManager, TableStates};
use crate::execution::table_state::TableState;
use crate::memory::FlatBuffer;
use crate::meta::NodeInfo;
use crate::query::QueryPlan;
use crate::service::task::{Task, TaskState};
use crate::service::wire::{self, BatchType, Request, Response};
use crate::{NebulaError, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Lazy cursor over query result rows
pub type RowCursor = Box<dyn Iterator<Item = Row> + Send>;

/// Capabilities the coordinator needs from a worker node
pub trait NodeClient {
    /// Fetch the node's current `{blocks, empty_specs}` and replace its
    /// shadow in the block manager atomically
    fn update(&mut self) -> Result<()>;

    /// Dispatch an ingestion, expiration or command task
    fn task(&mut self, task: &Task) -> TaskState;

    /// Fan one query plan out to the node
    fn execute(&mut self, plan: &QueryPlan) -> Result<RowCursor>;
}

/// Factory the control loops use to reach a node
pub type ClientMaker<'a> = &'a dyn Fn(&NodeInfo) -> Result<Box<dyn NodeClient>>;

/// Framed-TCP client with per-operation deadlines
pub struct TcpNodeClient {
    addr: String,
    blocks: Arc<BlockManager>,
    timeout: Duration,
}

impl TcpNodeClient {
    pub fn new(addr: impl Into<String>, blocks: Arc<BlockManager>) -> Self {
        Self {
            addr: addr.into(),
            blocks,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NebulaError::Wire(format!("cannot resolve '{}'", self.addr)))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = self.connect()?;
        wire::round_trip(&mut stream, request)
    }

    /// Liveness probe
    pub fn echo(&self, name: &str) -> Result<String> {
        match self.call(&Request::Echo {
            name: name.to_string(),
        })? {
            Response::Echo { message } => Ok(message),
            other => Err(unexpected(&other)),
        }
    }

    /// Repeated liveness probe
    pub fn echos(&self, name: &str, count: u32) -> Result<Vec<String>> {
        match self.call(&Request::Echos {
            name: name.to_string(),
            count,
        })? {
            Response::Echos { messages } => Ok(messages),
            other => Err(unexpected(&other)),
        }
    }
}

impl NodeClient for TcpNodeClient {
    fn update(&mut self) -> Result<()> {
        let reply = match self.call(&Request::Poll)? {
            Response::Poll(reply) => reply,
            Response::Error { message } => return Err(NebulaError::Wire(message)),
            other => return Err(unexpected(&other)),
        };

        let mut states = TableStates::new();
        for info in &reply.blocks {
            let sign = BlockSignature {
                table: info.table.clone(),
                spec_id: info.spec.clone(),
                id: info.id,
                time_start: info.time_start,
                time_end: info.time_end,
                storage_locator: info.storage.clone(),
            };
            let shadow =
                BatchBlock::shadow(sign, info.rows, info.raw_size, info.parse_stats());
            states
                .entry(info.table.clone())
                .or_insert_with(|| TableState::new(info.table.clone()))
                .add(Arc::new(shadow));
        }
        self.blocks.swap(&self.addr, states);
        for spec in &reply.empty_specs {
            self.blocks.record_empty_spec(spec);
        }
        Ok(())
    }

    fn task(&mut self, task: &Task) -> TaskState {
        match self.call(&Request::Task(task.clone())) {
            Ok(Response::Task { state }) => state,
            Ok(Response::Error { message }) => {
                log::warn!("task {} rejected by {}: {}", task.signature(), self.addr, message);
                TaskState::Failed
            }
            Ok(other) => {
                log::warn!("task {} got unexpected reply: {:?}", task.signature(), other);
                TaskState::Failed
            }
            Err(e) => {
                // timeouts land here; the next control-loop tick retries
                log::warn!("task {} to {} failed: {}", task.signature(), self.addr, e);
                TaskState::Failed
            }
        }
    }

    fn execute(&mut self, plan: &QueryPlan) -> Result<RowCursor> {
        let reply = match self.call(&Request::Query(plan.clone()))? {
            Response::Query(reply) => reply,
            Response::Error { message } => return Err(NebulaError::Wire(message)),
            other => return Err(unexpected(&other)),
        };

        let rows: Vec<Row> = match reply.batch_type {
            BatchType::Flat => {
                let names: Vec<String> = reply
                    .schema
                    .fields()
                    .iter()
                    .map(|f| f.name.clone())
                    .collect();
                let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
                let flat = FlatBuffer::from_bytes(reply.schema.clone(), &refs, reply.data)?;
                (0..flat.rows() as usize)
                    .map(|i| flat.row(i).to_row())
                    .collect()
            }
            BatchType::Json => {
                let docs: Vec<serde_json::Value> = serde_json::from_slice(&reply.data)
                    .map_err(|e| NebulaError::Wire(e.to_string()))?;
                let mut rows = Vec::with_capacity(docs.len());
                for doc in docs {
                    let mut row = Row::new();
                    for field in reply.schema.fields() {
                        if let Some(cell) = doc.get(&field.name) {
                            row.insert(
                                field.name.clone(),
                                crate::execution::JsonFileLoader::json_to_value(
                                    &field.data_type,
                                    cell,
                                )?,
                            );
                        }
                    }
                    rows.push(row);
                }
                rows
            }
        };
        Ok(Box::new(rows.into_iter()))
    }
}

fn unexpected(response: &Response) -> NebulaError {
    NebulaError::Wire(format!("unexpected reply variant: {:?}", response))
}
