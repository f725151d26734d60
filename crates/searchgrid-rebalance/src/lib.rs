//! searchgrid-rebalance — capacity rebalancer for SearchGrid.
//!
//! The periodic control loop: re-levels every shard's reserve against its
//! node, drives the eviction pipeline for unresolved critical pressure,
//! reconciles orphaned shards, drains and deletes shards on their way
//! out, and repairs stale cached watermark levels.

pub mod rebalancer;

pub use rebalancer::{Rebalancer, TickReport};
