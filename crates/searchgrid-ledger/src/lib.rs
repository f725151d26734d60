//! searchgrid-ledger — storage ledger for SearchGrid index shards.
//!
//! Per-index and per-replica byte accounting: reserved vs. used vs. free
//! storage, graded watermark classification, and the bounded reserve
//! grow/shrink resolution driven by the capacity rebalancer.

pub mod config;
pub mod ledger;

pub use config::{ConfigError, LedgerConfig, WatermarkThresholds};
pub use ledger::{StorageLedger, appropriate_watermark_level};
