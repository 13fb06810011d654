//! Query plan and filtering
//!
//! The plan travels from the coordinator to every node holding data for
//! the table. The core consumes it twice: block pruning against cached
//! column statistics (never a false negative) and row-level filtering
//! during the scan.

use crate::data::Value;
use crate::execution::block::ColumnStats;
use crate::memory::RowView;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A filter condition over row fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Always true
    True,
    /// Compare a field to a constant
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// Field is one of the listed values
    In { field: String, values: Vec<Value> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Row-level evaluation; null fields never match a comparison
    pub fn matches(&self, row: &RowView<'_>) -> bool {
        match self {
            Filter::True => true,
            Filter::Compare { field, op, value } => {
                let v = row.value(field);
                if v.is_null() {
                    return false;
                }
                match v.compare(value) {
                    Some(ord) => op_holds(*op, ord),
                    None => false,
                }
            }
            Filter::In { field, values } => {
                let v = row.value(field);
                !v.is_null() && values.iter().any(|candidate| v == *candidate)
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
            Filter::Not(inner) => !inner.matches(row),
        }
    }

    /// Stats-level pruning check: false means no row in a block with these
    /// stats can match; true is allowed to be a false positive. Unknown
    /// columns, missing stats and incomparable values stay true.
    pub fn may_match<'a, F>(&self, stats_of: F) -> bool
    where
        F: Fn(&str) -> Option<&'a ColumnStats> + Copy,
    {
        match self {
            Filter::True => true,
            Filter::Compare { field, op, value } => {
                let Some(stats) = stats_of(field) else { return true };
                let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
                    // all-null column: only a comparison can never hold
                    return stats.nulls < stats.rows;
                };
                match op {
                    CompareOp::Eq => {
                        within(min, value) != Some(Ordering::Greater)
                            && within(max, value) != Some(Ordering::Less)
                    }
                    CompareOp::Ne => {
                        // only prunable when every row equals the constant
                        !(min == value && max == value && stats.nulls == 0)
                    }
                    CompareOp::Lt => within(min, value) == Some(Ordering::Less),
                    CompareOp::Le => within(min, value) != Some(Ordering::Greater),
                    CompareOp::Gt => within(max, value) == Some(Ordering::Greater),
                    CompareOp::Ge => within(max, value) != Some(Ordering::Less),
                }
            }
            Filter::In { field, values } => {
                let Some(stats) = stats_of(field) else { return true };
                let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
                    return stats.nulls < stats.rows;
                };
                values.iter().any(|v| {
                    within(min, v) != Some(Ordering::Greater)
                        && within(max, v) != Some(Ordering::Less)
                })
            }
            Filter::And(filters) => filters.iter().all(|f| f.may_match(stats_of)),
            Filter::Or(filters) => filters.iter().any(|f| f.may_match(stats_of)),
            // negation over ranges cannot prune safely
            Filter::Not(_) => true,
        }
    }
}

fn op_holds(op: CompareOp, ord: Ordering) -> bool {
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    }
}

/// Conservative compare: None (incomparable) must read as "cannot prune"
fn within(bound: &Value, value: &Value) -> Option<Ordering> {
    bound.compare(value)
}

/// Query plan fanned out by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub uuid: String,
    pub table: String,
    pub filter: Filter,
    /// Opaque custom column expressions; evaluated by the UDF layer, which
    /// sits outside the core
    #[serde(default)]
    pub customs: Vec<String>,
    /// Projected columns; empty means all schema columns
    #[serde(default)]
    pub fields: Vec<String>,
    /// Group-by columns (a subset of `fields`); non-group numeric
    /// projections fold with a sum
    #[serde(default)]
    pub groups: Vec<String>,
    /// Sort columns applied before the limit
    #[serde(default)]
    pub sorts: Vec<String>,
    #[serde(default)]
    pub desc: bool,
    /// 0 means unlimited
    #[serde(default)]
    pub limit: u64,
    pub time_start: u64,
    pub time_end: u64,
}

impl QueryPlan {
    /// Full-window scan of a table
    pub fn scan(table: impl Into<String>) -> Self {
        Self {
            uuid: String::new(),
            table: table.into(),
            filter: Filter::True,
            customs: Vec::new(),
            fields: Vec::new(),
            groups: Vec::new(),
            sorts: Vec::new(),
            desc: false,
            limit: 0,
            time_start: 0,
            time_end: u64::MAX,
        }
    }
}
