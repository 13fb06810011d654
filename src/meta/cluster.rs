//! Cluster membership and table configuration
//!
//! The YAML cluster document (env `NCONF`) is the source of truth; the
//! control loops read a snapshot each cycle and report node sizes back.

use crate::data::{DataType, Field, Schema};
use crate::{NebulaError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Environment variable naming the cluster configuration document
pub const NCONF: &str = "NCONF";
/// Environment variable naming the coordinator address on workers
pub const NSERVER: &str = "NSERVER";

/// One node as seen by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub addr: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Reported memory footprint in bytes, refreshed by the expire loop
    #[serde(default)]
    pub size: u64,
    /// Unix seconds of the last completed poll
    #[serde(default)]
    pub last_polled: u64,
}

fn default_true() -> bool {
    true
}

impl NodeInfo {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            active: true,
            size: 0,
            last_polled: 0,
        }
    }
}

/// Column entry of a table config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// One table in the cluster document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Path template with time/custom markers
    pub locator: String,
    /// How long enumerated specs stay in the registry
    pub retention_seconds: u64,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    /// Custom marker values expanded by the Cartesian product
    #[serde(default)]
    pub macros: BTreeMap<String, Vec<String>>,
}

impl TableConfig {
    pub fn schema(&self) -> Result<Schema> {
        let fields = self
            .columns
            .iter()
            .map(|c| Ok(Field::new(c.name.clone(), parse_type(&c.type_name)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema::new(fields))
    }
}

/// Parse a type string such as `i64`, `string`, `list<string>` or
/// `map<string,i32>`.
pub fn parse_type(s: &str) -> Result<DataType> {
    let s = s.trim();
    let bad = || NebulaError::Config(format!("unknown column type '{}'", s));
    Ok(match s {
        "bool" => DataType::Bool,
        "i8" => DataType::Int8,
        "i16" => DataType::Int16,
        "i32" => DataType::Int32,
        "i64" => DataType::Int64,
        "i128" => DataType::Int128,
        "f32" => DataType::Float32,
        "f64" => DataType::Float64,
        "string" => DataType::String,
        _ => {
            if let Some(inner) = s.strip_prefix("list<").and_then(|r| r.strip_suffix('>')) {
                DataType::List(Box::new(parse_type(inner)?))
            } else if let Some(inner) = s.strip_prefix("map<").and_then(|r| r.strip_suffix('>')) {
                let (k, v) = inner.split_once(',').ok_or_else(bad)?;
                DataType::Map(Box::new(parse_type(k)?), Box::new(parse_type(v)?))
            } else {
                return Err(bad());
            }
        }
    })
}

/// Raw cluster document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl ClusterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&content).map_err(|e| NebulaError::Config(e.to_string()))
    }

    /// Load from the document named by `NCONF`
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(NCONF)
            .map_err(|_| NebulaError::Config(format!("{} is not set", NCONF)))?;
        Self::from_file(path)
    }
}

/// Mutable cluster view shared by the control loops
pub struct ClusterInfo {
    inner: RwLock<ClusterConfig>,
}

impl ClusterInfo {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn version(&self) -> String {
        self.inner.read().version.clone()
    }

    /// Snapshot of all configured nodes
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.read().nodes.clone()
    }

    /// Snapshot of all table configs
    pub fn tables(&self) -> Vec<TableConfig> {
        self.inner.read().tables.clone()
    }

    pub fn update_node_size(&self, addr: &str, size: u64) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.iter_mut().find(|n| n.addr == addr) {
            node.size = size;
            node.last_polled = chrono::Utc::now().timestamp() as u64;
        }
    }

    pub fn set_node_active(&self, addr: &str, active: bool) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.iter_mut().find(|n| n.addr == addr) {
            node.active = active;
        }
    }
}
