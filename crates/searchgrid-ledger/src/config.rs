//! Ledger configuration — index watermark bands and storage floors.

use thiserror::Error;

use searchgrid_state::DEFAULT_RESERVED_BYTES;

/// Configuration error for invalid threshold orderings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "index thresholds must satisfy ideal < low < high < critical \
         (got {ideal}, {low}, {high}, {critical})"
    )]
    ThresholdOrder {
        ideal: f64,
        low: f64,
        high: f64,
        critical: f64,
    },
}

/// Index-level watermark fractions over the used/reserved ratio.
///
/// `ideal` is the provisioning target the grow/shrink resolution steers
/// toward; the three watermark fractions grade the pressure above it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatermarkThresholds {
    pub ideal: f64,
    pub low: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for WatermarkThresholds {
    fn default() -> Self {
        Self {
            ideal: 0.4,
            low: 0.7,
            high: 0.8,
            critical: 0.9,
        }
    }
}

impl WatermarkThresholds {
    /// Enforce the strictly-increasing ordering invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ideal < self.low && self.low < self.high && self.high < self.critical {
            Ok(())
        } else {
            Err(ConfigError::ThresholdOrder {
                ideal: self.ideal,
                low: self.low,
                high: self.high,
                critical: self.critical,
            })
        }
    }
}

/// Storage-ledger tunables.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub thresholds: WatermarkThresholds,
    /// Reserve never shrinks below this floor.
    pub reserve_floor_bytes: i64,
    /// Recomputed used bytes never report below this floor; an all-empty
    /// index would otherwise read as infinitely overprovisioned.
    pub min_used_bytes: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            thresholds: WatermarkThresholds::default(),
            reserve_floor_bytes: DEFAULT_RESERVED_BYTES,
            min_used_bytes: 1024 * 1024 * 1024,
        }
    }
}
