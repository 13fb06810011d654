//! Tasks dispatched from the coordinator to worker nodes

use crate::meta::Spec;
use serde::{Deserialize, Serialize};

/// Outcome of a task dispatch as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Succeeded,
    Failed,
    /// Accepted into the node's low-priority queue
    Queue,
    InProgress,
}

impl TaskState {
    /// Single-byte state code used in logs and the wire reply
    pub fn code(&self) -> char {
        match self {
            TaskState::Succeeded => 'S',
            TaskState::Failed => 'F',
            TaskState::Queue => 'Q',
            TaskState::InProgress => 'P',
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskPayload {
    /// Ingest one spec's data source into memory blocks
    Ingest(Spec),
    /// Evict all blocks of the listed `(table, spec_id)` pairs
    Expire(Vec<(String, String)>),
    /// Operational command (flush logs, profiling toggles, ...)
    Command(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub payload: TaskPayload,
    /// Synchronous tasks run inline and report the final state; async
    /// submissions return QUEUE immediately
    pub sync: bool,
}

impl Task {
    pub fn ingest(spec: Spec) -> Self {
        Self {
            payload: TaskPayload::Ingest(spec),
            sync: true,
        }
    }

    pub fn expire(pairs: Vec<(String, String)>) -> Self {
        Self {
            payload: TaskPayload::Expire(pairs),
            sync: true,
        }
    }

    pub fn command(cmd: impl Into<String>) -> Self {
        Self {
            payload: TaskPayload::Command(cmd.into()),
            sync: true,
        }
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Short identity for logs
    pub fn signature(&self) -> String {
        match &self.payload {
            TaskPayload::Ingest(spec) => format!("ingest:{}", spec.id()),
            TaskPayload::Expire(pairs) => format!("expire:{}", pairs.len()),
            TaskPayload::Command(cmd) => format!("command:{}", cmd),
        }
    }
}
