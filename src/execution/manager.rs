//! Process-wide block registry
//!
//! Maps node address to per-table states. The distinguished local entry is
//! this node's real data; other entries are the coordinator's shadow view
//! of remote nodes, replaced wholesale when a poll completes. One mutex
//! serializes structural changes; query results hand out reference-counted
//! blocks so concurrent eviction never dangles an iteration.

use crate::execution::block::{BatchBlock, BlockLoader, BlockSignature, ColumnStats};
use crate::execution::table_state::TableState;
use crate::meta::NodeInfo;
use crate::query::QueryPlan;
use crate::Result;
use ahash::{AHashMap, AHashSet};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

/// Address key of the local (in-process) node
pub const LOCAL_NODE: &str = "<local>";

pub type TableStates = AHashMap<String, TableState>;

static GLOBAL: Lazy<Arc<BlockManager>> = Lazy::new(|| Arc::new(BlockManager::new()));

#[derive(Default)]
struct Inner {
    /// node address -> table -> state
    data: AHashMap<String, TableStates>,
    /// specs that legitimately produced zero rows this cycle
    empty_specs: AHashSet<String>,
    /// blocks added over the process lifetime
    blocks: u64,
}

pub struct BlockManager {
    inner: Mutex<Inner>,
}

impl Default for BlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockManager {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.data.insert(LOCAL_NODE.to_string(), TableStates::new());
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Process-wide instance used by the server binaries
    pub fn global() -> Arc<BlockManager> {
        Arc::clone(&GLOBAL)
    }

    /// Register one loaded block under the local node
    pub fn add(&self, block: Arc<BatchBlock>) -> bool {
        let mut inner = self.inner.lock();
        let table = block.signature().table.clone();
        let states = inner.data.get_mut(LOCAL_NODE).expect("local entry");
        let added = states
            .entry(table.clone())
            .or_insert_with(|| TableState::new(table))
            .add(block);
        if added {
            inner.blocks += 1;
        }
        added
    }

    /// Ask the loader for the block list behind a signature and add each.
    /// Returns the number of blocks added; zero rows records an empty spec.
    pub fn add_by_signature(&self, loader: &dyn BlockLoader, sign: &BlockSignature) -> Result<usize> {
        let blocks = loader.load(sign)?;
        if blocks.is_empty() {
            self.record_empty_spec(&sign.spec_id);
            return Ok(0);
        }
        let mut added = 0;
        for block in blocks {
            if self.add(block) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Evict local blocks of one spec
    pub fn remove_by_spec(&self, table: &str, spec_id: &str) -> usize {
        let mut inner = self.inner.lock();
        inner
            .data
            .get_mut(LOCAL_NODE)
            .and_then(|states| states.get_mut(table))
            .map(|ts| ts.remove_by_spec(spec_id))
            .unwrap_or(0)
    }

    pub fn record_empty_spec(&self, spec_id: &str) {
        self.inner.lock().empty_specs.insert(spec_id.to_string());
    }

    pub fn empty_specs(&self) -> AHashSet<String> {
        self.inner.lock().empty_specs.clone()
    }

    /// Runs at the start of every expire cycle
    pub fn clear_empty_specs(&self) {
        self.inner.lock().empty_specs.clear();
    }

    /// Atomically replace a remote node's shadow view
    pub fn swap(&self, node_addr: &str, states: TableStates) {
        self.inner.lock().data.insert(node_addr.to_string(), states);
    }

    pub fn remove_node(&self, node_addr: &str) {
        if node_addr == LOCAL_NODE {
            return;
        }
        self.inner.lock().data.remove(node_addr);
    }

    /// States snapshot for one node (reference-counted blocks)
    pub fn specs_of_node(&self, node_addr: &str) -> AHashMap<String, AHashSet<String>> {
        let inner = self.inner.lock();
        inner
            .data
            .get(node_addr)
            .map(|states| {
                states
                    .iter()
                    .map(|(table, ts)| (table.clone(), ts.specs()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(table, spec_id)` pairs held by a node but rejected by the callback
    pub fn expired_on_node<F>(&self, node_addr: &str, is_online: F) -> AHashSet<(String, String)>
    where
        F: Fn(&str, &str) -> bool,
    {
        let inner = self.inner.lock();
        let mut out = AHashSet::new();
        if let Some(states) = inner.data.get(node_addr) {
            for ts in states.values() {
                out.extend(ts.expired(&is_online));
            }
        }
        out
    }

    /// Total raw bytes held by one node, for cluster sizing
    pub fn node_raw_bytes(&self, node_addr: &str) -> u64 {
        let inner = self.inner.lock();
        inner
            .data
            .get(node_addr)
            .map(|states| states.values().map(|ts| ts.raw_bytes()).sum())
            .unwrap_or(0)
    }

    /// Local blocks that may satisfy the plan's window and predicates.
    /// The returned blocks are reference-held for the caller's iteration.
    pub fn query(&self, table: &str, plan: &QueryPlan) -> Vec<Arc<BatchBlock>> {
        let inner = self.inner.lock();
        inner
            .data
            .get(LOCAL_NODE)
            .and_then(|states| states.get(table))
            .map(|ts| {
                ts.query(plan.time_start, plan.time_end, |block| {
                    plan.filter.may_match(|col| block.column_stats(col))
                })
            })
            .unwrap_or_default()
    }

    /// Addresses of nodes currently holding data for a table
    pub fn nodes_for_table(&self, table: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .data
            .iter()
            .filter(|(_, states)| states.get(table).map(|ts| ts.num_blocks() > 0).unwrap_or(false))
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Union of spec ids seen from the given (active) nodes' shadow states
    pub fn active_specs(&self, nodes: &[NodeInfo]) -> AHashSet<String> {
        let inner = self.inner.lock();
        let mut specs = AHashSet::new();
        for node in nodes {
            if let Some(states) = inner.data.get(node.addr.as_str()) {
                for ts in states.values() {
                    specs.extend(ts.specs());
                }
            }
        }
        specs
    }

    /// Cluster-wide metric view of a table: merge of all nodes' states
    pub fn metrics(&self, table: &str) -> TableState {
        let inner = self.inner.lock();
        let mut merged = TableState::new(table);
        for states in inner.data.values() {
            if let Some(ts) = states.get(table) {
                merged.merge(ts);
            }
        }
        merged
    }

    /// Up to `limit` distinct table names across all nodes
    pub fn tables(&self, limit: usize) -> AHashSet<String> {
        let inner = self.inner.lock();
        let mut out = AHashSet::new();
        for states in inner.data.values() {
            for table in states.keys() {
                out.insert(table.clone());
                if out.len() >= limit {
                    return out;
                }
            }
        }
        out
    }

    /// Merged histogram/stats of one column across the whole cluster view
    pub fn hist(&self, table: &str, column: &str) -> Option<ColumnStats> {
        self.metrics(table).column_stats(column)
    }

    pub fn num_blocks(&self) -> u64 {
        self.inner.lock().blocks
    }

    /// Whether a node's view (or the empty-spec set) contains a spec
    pub fn has_spec(&self, table: &str, spec_id: &str, node_addr: &str) -> bool {
        let inner = self.inner.lock();
        if inner.empty_specs.contains(spec_id) {
            return true;
        }
        inner
            .data
            .get(node_addr)
            .and_then(|states| states.get(table))
            .map(|ts| ts.has_spec(spec_id))
            .unwrap_or(false)
    }

    /// Snapshot of the local node's blocks for the poll reply
    pub fn local_blocks(&self) -> Vec<Arc<BatchBlock>> {
        let inner = self.inner.lock();
        inner
            .data
            .get(LOCAL_NODE)
            .map(|states| {
                states
                    .values()
                    .flat_map(|ts| ts.blocks().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Field, Row, Schema, Value};
    use crate::memory::FlatBuffer;
    use crate::query::{Filter, QueryPlan};

    fn block(table: &str, spec: &str, id: u64, t0: u64, t1: u64) -> Arc<BatchBlock> {
        let schema = Schema::new(vec![Field::new("v", DataType::Int64)]);
        let mut flat = FlatBuffer::with_schema(schema).unwrap();
        for i in 0..4 {
            flat.add(&Row::new().set("v", Value::Int64(i))).unwrap();
        }
        Arc::new(BatchBlock::new(
            BlockSignature {
                table: table.into(),
                spec_id: spec.into(),
                id,
                time_start: t0,
                time_end: t1,
                storage_locator: String::new(),
            },
            flat,
        ))
    }

    #[test]
    fn test_add_remove_restores_count() {
        let bm = BlockManager::new();
        let before = bm.metrics("events").num_blocks();
        bm.add(block("events", "s1", 0, 0, 9));
        bm.add(block("events", "s1", 1, 10, 19));
        assert_eq!(bm.metrics("events").num_blocks(), before + 2);
        assert_eq!(bm.remove_by_spec("events", "s1"), 2);
        assert_eq!(bm.metrics("events").num_blocks(), before);
    }

    #[test]
    fn test_query_prunes_by_time() {
        let bm = BlockManager::new();
        bm.add(block("events", "s1", 0, 0, 9));
        bm.add(block("events", "s1", 1, 100, 109));

        let plan = QueryPlan {
            time_start: 0,
            time_end: 50,
            filter: Filter::True,
            ..QueryPlan::scan("events")
        };
        let hits = bm.query("events", &plan);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].signature().id, 0);
    }

    #[test]
    fn test_swap_replaces_shadow() {
        let bm = BlockManager::new();
        let mut states = TableStates::new();
        let mut ts = TableState::new("events");
        ts.add(block("events", "s9", 0, 0, 9));
        states.insert("events".into(), ts);
        bm.swap("10.0.0.1:9190", states);

        let node = NodeInfo::new("10.0.0.1:9190");
        let specs = bm.active_specs(&[node]);
        assert!(specs.contains("s9"));

        bm.swap("10.0.0.1:9190", TableStates::new());
        let specs = bm.active_specs(&[NodeInfo::new("10.0.0.1:9190")]);
        assert!(specs.is_empty());
    }

    #[test]
    fn test_empty_specs_cycle() {
        let bm = BlockManager::new();
        bm.record_empty_spec("s-empty");
        assert!(bm.empty_specs().contains("s-empty"));
        assert!(bm.has_spec("events", "s-empty", LOCAL_NODE));
        bm.clear_empty_specs();
        assert!(bm.empty_specs().is_empty());
    }

    #[test]
    fn test_metrics_merges_nodes() {
        let bm = BlockManager::new();
        bm.add(block("events", "s1", 0, 0, 9));

        let mut states = TableStates::new();
        let mut ts = TableState::new("events");
        ts.add(block("events", "s2", 0, 10, 19));
        states.insert("events".into(), ts);
        bm.swap("10.0.0.2:9190", states);

        let merged = bm.metrics("events");
        assert_eq!(merged.num_blocks(), 2);
        assert_eq!(merged.rows(), 8);
    }
}
