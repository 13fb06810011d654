//! Service surface: wire protocol, node client/server and the worker pool.

pub mod client;
pub mod pool;
pub mod server;
pub mod task;
pub mod wire;

pub use client::{ClientMaker, NodeClient, RowCursor, TcpNodeClient};
pub use pool::{Priority, TaskPool};
pub use server::NodeServer;
pub use task::{Task, TaskPayload, TaskState};
pub use wire::{BatchRows, BatchType, DataBlockInfo, NodeStateReply, QueryStats};
