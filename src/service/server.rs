//! Worker node server
//!
//! Serves the framed msgpack protocol over TCP: echo, poll, task and
//! query. Queries run on the pool's high-priority queue; ingestion and
//! expiration tasks run low. One thread per connection, sync I/O.

use crate::data::{DataType, FieldExpr, Row, Schema};
use crate::execution::block::{BlockLoader, BlockSignature};
use crate::execution::manager::BlockManager;
use crate::memory::{FlatBuffer, HashFlat, MergeOp};
use crate::query::QueryPlan;
use crate::service::pool::{Priority, TaskPool};
use crate::service::task::{Task, TaskPayload, TaskState};
use crate::service::wire::{
    self, BatchRows, BatchType, DataBlockInfo, NodeStateReply, QueryStats, Request, Response,
};
use crate::Result;
use rayon::prelude::*;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

pub struct NodeServer {
    blocks: Arc<BlockManager>,
    loader: Arc<dyn BlockLoader>,
    pool: TaskPool,
}

impl NodeServer {
    pub fn new(blocks: Arc<BlockManager>, loader: Arc<dyn BlockLoader>) -> Self {
        Self {
            blocks,
            loader,
            pool: TaskPool::new(),
        }
    }

    /// Accept loop; one handler thread per connection
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        log::info!("node server listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self);
                    std::thread::spawn(move || server.handle_connection(stream));
                }
                Err(e) => log::warn!("accept failed: {}", e),
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        loop {
            let frame = match wire::read_frame(&mut stream) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    log::warn!("read from {} failed: {}", peer, e);
                    return;
                }
            };
            let response = match wire::decode::<Request>(&frame) {
                Ok(request) => self.handle(request),
                Err(e) => Response::Error {
                    message: format!("invalid request: {}", e),
                },
            };
            let bytes = match wire::encode(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("encode reply for {} failed: {}", peer, e);
                    return;
                }
            };
            if let Err(e) = wire::write_frame(&mut stream, &bytes) {
                log::warn!("write to {} failed: {}", peer, e);
                return;
            }
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Echo { name } => Response::Echo { message: name },
            Request::Echos { name, count } => Response::Echos {
                messages: (0..count).map(|i| format!("{}#{}", name, i)).collect(),
            },
            Request::Poll => Response::Poll(self.poll()),
            Request::Task(task) => Response::Task {
                state: self.run_task(task),
            },
            Request::Query(plan) => {
                let blocks = Arc::clone(&self.blocks);
                let result = self
                    .pool
                    .execute(Priority::High, move || execute_plan(&blocks, &plan));
                match result {
                    Ok(batch) => Response::Query(batch),
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }
        }
    }

    fn poll(&self) -> NodeStateReply {
        let blocks = self.blocks.local_blocks();
        NodeStateReply {
            blocks: blocks.iter().map(|b| DataBlockInfo::from_block(b)).collect(),
            empty_specs: self.blocks.empty_specs().into_iter().collect(),
        }
    }

    fn run_task(&self, task: Task) -> TaskState {
        let blocks = Arc::clone(&self.blocks);
        let loader = Arc::clone(&self.loader);
        if task.sync {
            self.pool
                .execute(Priority::Low, move || apply_task(&blocks, &*loader, task))
        } else {
            self.pool.submit(Priority::Low, move || {
                let signature = task.signature();
                let state = apply_task(&blocks, &*loader, task);
                log::info!("queued task {} finished: {}", signature, state.code());
            });
            TaskState::Queue
        }
    }
}

fn apply_task(blocks: &BlockManager, loader: &dyn BlockLoader, task: Task) -> TaskState {
    match task.payload {
        TaskPayload::Ingest(spec) => {
            let sign = BlockSignature {
                table: spec.table.clone(),
                spec_id: spec.id().to_string(),
                id: 0,
                time_start: spec.time_start,
                time_end: spec.time_end,
                storage_locator: spec.domain_locator.clone(),
            };
            match blocks.add_by_signature(loader, &sign) {
                Ok(added) => {
                    log::info!("ingested {} blocks for {}", added, spec.id());
                    TaskState::Succeeded
                }
                Err(e) => {
                    log::warn!("ingestion of {} failed: {}", spec.id(), e);
                    TaskState::Failed
                }
            }
        }
        TaskPayload::Expire(pairs) => {
            let mut removed = 0;
            for (table, spec_id) in &pairs {
                removed += blocks.remove_by_spec(table, spec_id);
            }
            log::info!("expired {} blocks over {} specs", removed, pairs.len());
            TaskState::Succeeded
        }
        TaskPayload::Command(cmd) => {
            log::info!("command task: {}", cmd);
            TaskState::Succeeded
        }
    }
}

// ============================================================================
// Query execution over local blocks
// ============================================================================

/// Scan the local blocks a plan may touch, filter, project, optionally
/// group, sort and limit. The reply's data is a serialized FlatBuffer.
pub fn execute_plan(blocks: &BlockManager, plan: &QueryPlan) -> Result<BatchRows> {
    let hit_blocks = blocks.query(&plan.table, plan);
    let mut stats = QueryStats {
        blocks_scan: hit_blocks.len() as u64,
        ..Default::default()
    };

    // output schema: the projected subset of the first block's schema
    let Some(source_schema) = hit_blocks
        .iter()
        .find_map(|b| b.data().map(|d| d.schema().clone()))
    else {
        return empty_reply(stats);
    };
    let out_schema = project_schema(&source_schema, &plan.fields);

    // per-block scan, parallel across blocks
    let scanned: Vec<Vec<Row>> = hit_blocks
        .par_iter()
        .map(|block| {
            let Some(data) = block.data() else {
                return Vec::new();
            };
            let mut out = Vec::new();
            for i in 0..data.rows() as usize {
                let view = data.row(i);
                if !plan.filter.matches(&view) {
                    continue;
                }
                let mut row = Row::new();
                for field in out_schema.fields() {
                    row.insert(field.name.clone(), view.value(&field.name));
                }
                out.push(row);
            }
            out
        })
        .collect();

    stats.rows_scan = hit_blocks.iter().map(|b| b.rows()).sum();
    let mut rows: Vec<Row> = scanned.into_iter().flatten().collect();

    if !plan.groups.is_empty() {
        rows = aggregate(&out_schema, &plan.groups, rows)?;
    }
    if !plan.sorts.is_empty() {
        sort_rows(&mut rows, &plan.sorts, plan.desc);
    }
    if plan.limit > 0 && rows.len() > plan.limit as usize {
        rows.truncate(plan.limit as usize);
    }
    stats.rows_ret = rows.len() as u64;

    let mut flat = FlatBuffer::with_schema(out_schema.clone())?;
    for row in &rows {
        flat.add(row)?;
    }
    let data = flat.to_bytes()?;
    Ok(BatchRows {
        schema: out_schema,
        batch_type: BatchType::Flat,
        stats,
        data,
    })
}

fn empty_reply(stats: QueryStats) -> Result<BatchRows> {
    let schema = Schema::default();
    let mut flat = FlatBuffer::with_schema(schema.clone())?;
    let data = flat.to_bytes()?;
    Ok(BatchRows {
        schema,
        batch_type: BatchType::Flat,
        stats,
        data,
    })
}

fn project_schema(source: &Schema, fields: &[String]) -> Schema {
    if fields.is_empty() {
        return source.clone();
    }
    Schema::new(
        fields
            .iter()
            .filter_map(|name| {
                source
                    .index_of(name)
                    .and_then(|i| source.field(i))
                    .cloned()
            })
            .collect(),
    )
}

/// Fold rows by the group columns; non-group numeric columns sum
fn aggregate(schema: &Schema, groups: &[String], rows: Vec<Row>) -> Result<Vec<Row>> {
    let keys: Vec<FieldExpr> = groups.iter().map(FieldExpr::column).collect();
    let merges: Vec<(&str, MergeOp)> = schema
        .fields()
        .iter()
        .filter(|f| !groups.contains(&f.name))
        .filter(|f| {
            matches!(
                f.data_type,
                DataType::Int8
                    | DataType::Int16
                    | DataType::Int32
                    | DataType::Int64
                    | DataType::Int128
                    | DataType::Float32
                    | DataType::Float64
            )
        })
        .map(|f| (f.name.as_str(), MergeOp::Sum))
        .collect();

    let names: Vec<&str> = schema.fields().iter().map(|f| f.name.as_str()).collect();
    let mut hashed = HashFlat::new(schema.clone(), &names, keys, &merges)?;
    for row in &rows {
        hashed.add(row)?;
    }
    Ok((0..hashed.rows() as usize)
        .map(|i| hashed.row(i).to_row())
        .collect())
}

fn sort_rows(rows: &mut [Row], sorts: &[String], desc: bool) {
    rows.sort_by(|a, b| {
        let mut ord = std::cmp::Ordering::Equal;
        for col in sorts {
            ord = a
                .get(col)
                .compare(b.get(col))
                .unwrap_or(std::cmp::Ordering::Equal);
            if ord != std::cmp::Ordering::Equal {
                break;
            }
        }
        if desc {
            ord.reverse()
        } else {
            ord
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Field, Value};
    use crate::execution::block::BatchBlock;
    use crate::query::{CompareOp, Filter};

    fn seed_blocks(bm: &BlockManager) {
        let schema = Schema::new(vec![
            Field::new("region", DataType::String),
            Field::new("clicks", DataType::Int64),
            Field::new("_time_", DataType::Int64),
        ]);
        for (spec, t0, rows) in [
            ("s1", 0u64, vec![("us", 3, 5), ("eu", 2, 7)]),
            ("s2", 100, vec![("us", 4, 105), ("ap", 1, 110)]),
        ] {
            let mut flat = FlatBuffer::with_schema(schema.clone()).unwrap();
            for (region, clicks, t) in rows {
                flat.add(
                    &Row::new()
                        .set("region", Value::String(region.into()))
                        .set("clicks", Value::Int64(clicks))
                        .set("_time_", Value::Int64(t)),
                )
                .unwrap();
            }
            bm.add(Arc::new(BatchBlock::new(
                BlockSignature {
                    table: "events".into(),
                    spec_id: spec.into(),
                    id: 0,
                    time_start: t0,
                    time_end: t0 + 99,
                    storage_locator: String::new(),
                },
                flat,
            )));
        }
    }

    #[test]
    fn test_execute_filter_and_projection() {
        let bm = BlockManager::new();
        seed_blocks(&bm);

        let plan = QueryPlan {
            fields: vec!["region".into(), "clicks".into()],
            filter: Filter::Compare {
                field: "clicks".into(),
                op: CompareOp::Ge,
                value: Value::Int64(3),
            },
            ..QueryPlan::scan("events")
        };
        let reply = execute_plan(&bm, &plan).unwrap();
        assert_eq!(reply.stats.blocks_scan, 2);
        assert_eq!(reply.stats.rows_scan, 4);
        assert_eq!(reply.stats.rows_ret, 2);
        assert_eq!(reply.batch_type, BatchType::Flat);

        let flat =
            FlatBuffer::from_bytes(reply.schema.clone(), &["region", "clicks"], reply.data)
                .unwrap();
        assert_eq!(flat.rows(), 2);
    }

    #[test]
    fn test_execute_group_by_sums() {
        let bm = BlockManager::new();
        seed_blocks(&bm);

        let plan = QueryPlan {
            fields: vec!["region".into(), "clicks".into()],
            groups: vec!["region".into()],
            sorts: vec!["clicks".into()],
            desc: true,
            ..QueryPlan::scan("events")
        };
        let reply = execute_plan(&bm, &plan).unwrap();
        let flat =
            FlatBuffer::from_bytes(reply.schema.clone(), &["region", "clicks"], reply.data)
                .unwrap();
        assert_eq!(flat.rows(), 3);
        // us folded 3 + 4 = 7 and sorts first
        assert_eq!(flat.row(0).value("region"), Value::String("us".into()));
        assert_eq!(flat.row(0).value("clicks"), Value::Int64(7));
    }

    #[test]
    fn test_execute_time_pruning() {
        let bm = BlockManager::new();
        seed_blocks(&bm);

        let plan = QueryPlan {
            time_start: 0,
            time_end: 99,
            ..QueryPlan::scan("events")
        };
        let reply = execute_plan(&bm, &plan).unwrap();
        assert_eq!(reply.stats.blocks_scan, 1);
        assert_eq!(reply.stats.rows_ret, 2);
    }

    #[test]
    fn test_task_dispatch_expire() {
        let bm = Arc::new(BlockManager::new());
        seed_blocks(&bm);
        let loader = Arc::new(crate::execution::JsonFileLoader::new());
        let server = NodeServer::new(Arc::clone(&bm), loader);

        let state = server.run_task(Task::expire(vec![("events".into(), "s1".into())]));
        assert_eq!(state, TaskState::Succeeded);
        assert_eq!(bm.metrics("events").num_blocks(), 1);
    }

    #[test]
    fn test_echo_and_poll() {
        let bm = Arc::new(BlockManager::new());
        seed_blocks(&bm);
        let loader = Arc::new(crate::execution::JsonFileLoader::new());
        let server = NodeServer::new(bm, loader);

        match server.handle(Request::Echo {
            name: "nebula".into(),
        }) {
            Response::Echo { message } => assert_eq!(message, "nebula"),
            other => panic!("wrong reply: {:?}", other),
        }
        match server.handle(Request::Poll) {
            Response::Poll(reply) => {
                assert_eq!(reply.blocks.len(), 2);
                assert!(reply.blocks.iter().any(|b| b.spec == "s1"));
            }
            other => panic!("wrong reply: {:?}", other),
        }
    }
}
