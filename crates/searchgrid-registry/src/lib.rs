//! searchgrid-registry — node registry for the SearchGrid fleet.
//!
//! Ingests heartbeat reports from search-node agents, derives per-node
//! storage metrics (usable and unclaimed bytes), and answers liveness and
//! capability queries for the placement planner and capacity rebalancer.

pub mod config;
pub mod registry;

pub use config::{ConfigError, NodeThresholds, RegistryConfig};
pub use registry::{NodeRegistry, NodeReport};
