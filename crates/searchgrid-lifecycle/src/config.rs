//! Lifecycle configuration — retries, schema versioning, partition retention.

use std::time::Duration;

use searchgrid_state::DEFAULT_RETRIES;

/// Tunables for the repository/task lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Retry budget for new repositories and tasks.
    pub default_retries: u32,
    /// Schema version newly indexed repositories are written at; ready
    /// repositories behind this version are re-indexed.
    pub current_schema_version: u32,
    /// A new task partition opens once the active one's oldest row exceeds
    /// this age.
    pub max_partition_age: Duration,
    /// A partition with rows may be detached once its newest row exceeds
    /// this age (and nothing in it is pending or processing).
    pub detach_after: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_retries: DEFAULT_RETRIES,
            current_schema_version: 1,
            max_partition_age: Duration::from_secs(3 * 24 * 60 * 60),
            detach_after: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}
