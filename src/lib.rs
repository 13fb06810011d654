//! Nebula Core Engine
//!
//! A distributed in-memory columnar analytics engine. A coordinator turns
//! table configurations into ingestion specs, assigns them to worker nodes,
//! and workers keep the resulting data blocks in memory for fan-out queries.

pub mod data;
pub mod memory;
pub mod execution;
pub mod meta;
pub mod ingest;
pub mod query;
pub mod service;

// Re-export main types
pub use data::{DataType, Row, Schema, Value};
pub use execution::{BatchBlock, BlockManager, BlockSignature, TableState};
pub use memory::{FlatBuffer, HashFlat};
pub use meta::{ClusterInfo, NodeInfo, Spec, SpecState};

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum NebulaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema mismatch for field '{field}': expected {expected}, got {actual}")]
    Schema {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Corrupt block: {0}")]
    CorruptBlock(String),

    #[error("No active node available for assignment")]
    NoActiveNode,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wire protocol error: {0}")]
    Wire(String),

    #[error("Buffer is frozen for serialization")]
    Frozen,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, NebulaError>;
