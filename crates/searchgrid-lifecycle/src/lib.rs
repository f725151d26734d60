//! searchgrid-lifecycle — repository and task lifecycle for SearchGrid.
//!
//! Owns per-project index membership (repositories), bulk task creation
//! and deduplication, the ordered per-project-unique dequeue, pure task
//! classification, batch outcome application, and time-partitioned task
//! log retention.

pub mod catalog;
pub mod config;
pub mod error;
pub mod lifecycle;

pub use catalog::{ProjectCatalog, StaticProjectCatalog};
pub use config::LifecycleConfig;
pub use error::{LifecycleError, LifecycleResult};
pub use lifecycle::{
    PartitionReport, TaskDisposition, TaskLifecycle, determine_task_state,
};
