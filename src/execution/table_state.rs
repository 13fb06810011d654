//! Per-table block index
//!
//! Holds the set of BatchBlocks for a single table on a single node,
//! indexed by signature, by spec id and by time range. Aggregate counters
//! always equal the sum over the currently held blocks.

use crate::execution::block::{BatchBlock, BlockSignature, ColumnStats};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct TableState {
    table: String,
    blocks: AHashMap<BlockSignature, Arc<BatchBlock>>,
    by_spec: AHashMap<String, AHashSet<BlockSignature>>,
    /// time_start -> signatures, for window pruning
    by_start: BTreeMap<u64, Vec<BlockSignature>>,
    rows: u64,
    raw_bytes: u64,
}

impl TableState {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn raw_bytes(&self) -> u64 {
        self.raw_bytes
    }

    /// Insert a block; duplicates (equal signature) are ignored.
    /// Returns true when the block was actually added.
    pub fn add(&mut self, block: Arc<BatchBlock>) -> bool {
        let sign = block.signature().clone();
        if self.blocks.contains_key(&sign) {
            return false;
        }
        self.rows += block.rows();
        self.raw_bytes += block.raw_size();
        self.by_spec
            .entry(sign.spec_id.clone())
            .or_default()
            .insert(sign.clone());
        self.by_start
            .entry(sign.time_start)
            .or_default()
            .push(sign.clone());
        self.blocks.insert(sign, block);
        true
    }

    /// Remove every block produced by the given spec; returns the count
    pub fn remove_by_spec(&mut self, spec_id: &str) -> usize {
        let Some(signs) = self.by_spec.remove(spec_id) else {
            return 0;
        };
        let mut removed = 0;
        for sign in signs {
            if let Some(block) = self.blocks.remove(&sign) {
                self.rows -= block.rows();
                self.raw_bytes -= block.raw_size();
                if let Some(list) = self.by_start.get_mut(&sign.time_start) {
                    list.retain(|s| s != &sign);
                    if list.is_empty() {
                        self.by_start.remove(&sign.time_start);
                    }
                }
                removed += 1;
            }
        }
        removed
    }

    /// Blocks that might satisfy the window and stats predicate. May return
    /// false positives, never false negatives. Both window ends inclusive.
    pub fn query<F>(&self, t_start: u64, t_end: u64, pred: F) -> Vec<Arc<BatchBlock>>
    where
        F: Fn(&BatchBlock) -> bool,
    {
        let mut out = Vec::new();
        // any block starting after t_end cannot overlap
        for signs in self.by_start.range(..=t_end).map(|(_, v)| v) {
            for sign in signs {
                if sign.time_end < t_start {
                    continue;
                }
                if let Some(block) = self.blocks.get(sign) {
                    if pred(block) {
                        out.push(Arc::clone(block));
                    }
                }
            }
        }
        out
    }

    /// Spec ids of held blocks that are no longer online per the callback
    pub fn expired<F>(&self, is_online: F) -> AHashSet<(String, String)>
    where
        F: Fn(&str, &str) -> bool,
    {
        let mut out = AHashSet::new();
        for spec_id in self.by_spec.keys() {
            if !is_online(&self.table, spec_id) {
                out.insert((self.table.clone(), spec_id.clone()));
            }
        }
        out
    }

    pub fn has_spec(&self, spec_id: &str) -> bool {
        self.by_spec.contains_key(spec_id)
    }

    pub fn specs(&self) -> AHashSet<String> {
        self.by_spec.keys().cloned().collect()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Arc<BatchBlock>> {
        self.blocks.values()
    }

    /// Union another state for the same table into this one; duplicate
    /// signatures are ignored, so merging is commutative and associative.
    pub fn merge(&mut self, other: &TableState) {
        for block in other.blocks.values() {
            self.add(Arc::clone(block));
        }
    }

    /// Merged stats for one column across all held blocks
    pub fn column_stats(&self, column: &str) -> Option<ColumnStats> {
        let mut merged: Option<ColumnStats> = None;
        for block in self.blocks.values() {
            if let Some(stats) = block.column_stats(column) {
                match merged.as_mut() {
                    Some(m) => m.merge(stats),
                    None => merged = Some(stats.clone()),
                }
            }
        }
        merged
    }
}
