//! searchgrid-state — embedded state store for SearchGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for nodes, enabled namespaces, replicas, index shards,
//! repositories, tasks, and task partitions.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace_id}:{replica_id}`, `{index_id}:{project_id}`,
//! `{partition_id}:{task_id}`) enable efficient prefix scans for related
//! records, and make the (index, project) uniqueness constraint structural.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Multi-record operations commit in a
//! single write transaction.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
