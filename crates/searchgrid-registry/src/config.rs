//! Registry configuration — liveness windows and node-level watermarks.

use std::time::Duration;

use thiserror::Error;

/// Configuration error for invalid threshold orderings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node thresholds must satisfy low < high < critical (got {low}, {high}, {critical})")]
    NodeThresholdOrder {
        low: f64,
        high: f64,
        critical: f64,
    },
}

/// Node-level storage-pressure thresholds, as fractions of used/total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeThresholds {
    pub low: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for NodeThresholds {
    fn default() -> Self {
        Self {
            low: 0.7,
            high: 0.8,
            critical: 0.9,
        }
    }
}

impl NodeThresholds {
    /// Enforce the strictly-increasing ordering invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low < self.high && self.high < self.critical {
            Ok(())
        } else {
            Err(ConfigError::NodeThresholdOrder {
                low: self.low,
                high: self.high,
                critical: self.critical,
            })
        }
    }
}

/// Liveness and anti-thrashing settings for the node registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A node is online while its last heartbeat is within this window.
    pub online_duration: Duration,
    /// A node is lost once unseen for this long. `None` disables lost
    /// detection entirely: no node is ever lost.
    pub lost_threshold: Option<Duration>,
    /// How long a freshly computed `usable_storage_bytes` is locked against
    /// recomputation from subsequent heartbeats.
    pub usable_storage_lock_ttl: Duration,
    /// Node-level watermark fractions.
    pub thresholds: NodeThresholds,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            online_duration: Duration::from_secs(90),
            lost_threshold: Some(Duration::from_secs(12 * 60 * 60)),
            usable_storage_lock_ttl: Duration::from_secs(30 * 60),
            thresholds: NodeThresholds::default(),
        }
    }
}
