//! Metadata: path macros, ingestion specs, locators and cluster state.

pub mod cluster;
pub mod locator;
pub mod macros;
pub mod spec;

pub use cluster::{ClusterConfig, ClusterInfo, NodeInfo, TableConfig, NCONF, NSERVER};
pub use locator::{Locator, Scheme};
pub use macros::{Macro, PatternMacro};
pub use spec::{Spec, SpecState, TableRegistry};
