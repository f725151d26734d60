//! Storage ledger — per-index byte accounting and watermark resolution.
//!
//! Classifies each index shard's used/reserved ratio into a graded
//! pressure level and resolves reserve adjustments against the owning
//! node's unclaimed storage: grow under pressure (bounded by what the node
//! can spare), shrink when overprovisioned and stable.

use tracing::{debug, warn};

use searchgrid_state::*;

use crate::config::{LedgerConfig, WatermarkThresholds};

/// Classify a used/reserved pair into a watermark level.
///
/// Total and pure: every input maps to a level and nothing is raised.
/// A non-positive reserve classifies critical — an index with no reserve
/// has no budget at all, which is the most urgent condition, not an
/// undefined one.
pub fn appropriate_watermark_level(
    used_bytes: u64,
    reserved_bytes: i64,
    thresholds: &WatermarkThresholds,
) -> WatermarkLevel {
    if reserved_bytes <= 0 {
        return WatermarkLevel::CriticalWatermarkExceeded;
    }
    let ratio = used_bytes as f64 / reserved_bytes as f64;
    if ratio < thresholds.ideal {
        WatermarkLevel::Overprovisioned
    } else if ratio < thresholds.low {
        WatermarkLevel::Healthy
    } else if ratio < thresholds.high {
        WatermarkLevel::LowWatermarkExceeded
    } else if ratio < thresholds.critical {
        WatermarkLevel::HighWatermarkExceeded
    } else {
        WatermarkLevel::CriticalWatermarkExceeded
    }
}

/// Per-index byte accounting over the state store.
pub struct StorageLedger {
    state: StateStore,
    config: LedgerConfig,
}

impl StorageLedger {
    /// Create a ledger with default configuration.
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            config: LedgerConfig::default(),
        }
    }

    /// Override the ledger configuration.
    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Classify a shard with this ledger's thresholds.
    pub fn watermark_level_for(&self, shard: &IndexShard) -> WatermarkLevel {
        appropriate_watermark_level(
            shard.used_storage_bytes,
            shard.reserved_storage_bytes,
            &self.config.thresholds,
        )
    }

    /// Recompute a shard's used bytes and resolve its reserve and
    /// watermark level.
    ///
    /// Idempotent: with no intervening repository or node change, a second
    /// call leaves the shard untouched — growth is bounded by the node's
    /// unclaimed storage (which the first call consumed), and shrink steers
    /// to a fixed target.
    ///
    /// A node with nothing left to spare blocks growth and leaves the
    /// stored level at the worse classification; the rebalancer reads that
    /// as the backpressure signal for eviction.
    pub fn update_storage_bytes_and_watermark_level(
        &self,
        index_id: IndexId,
        skip_used_storage_bytes: bool,
        now: u64,
    ) -> StateResult<IndexShard> {
        let mut shard = self
            .state
            .get_index(index_id)?
            .ok_or_else(|| StateError::NotFound(format!("index {index_id}")))?;

        if !skip_used_storage_bytes {
            let sum: u64 = self
                .state
                .list_repositories_for_index(index_id)?
                .iter()
                .map(|r| r.size_bytes)
                .sum();
            shard.used_storage_bytes = sum.max(self.config.min_used_bytes);
        }

        let mut level = self.watermark_level_for(&shard);

        if level >= WatermarkLevel::LowWatermarkExceeded {
            self.grow_reserve(&mut shard, &mut level)?;
        } else if level == WatermarkLevel::Overprovisioned && shard.state == IndexState::Ready {
            self.shrink_reserve(&mut shard, &mut level);
        }

        shard.watermark_level = level;
        shard.updated_at = now;
        self.state.put_index(&shard)?;
        Ok(shard)
    }

    /// Grow the reserve toward the ideal target, bounded by the node's
    /// unclaimed storage. The bound is computed from a fresh node read so
    /// the claim can never drive the node's unclaimed storage negative;
    /// pre-existing negative unclaimed storage blocks growth entirely.
    fn grow_reserve(
        &self,
        shard: &mut IndexShard,
        level: &mut WatermarkLevel,
    ) -> StateResult<()> {
        let Some(node) = self.state.get_node(&shard.node_id)? else {
            warn!(index_id = shard.id, node_id = %shard.node_id, "node missing, reserve growth blocked");
            return Ok(());
        };

        let reserved_on_node: i64 = self
            .state
            .list_indices_on_node(&node.id)?
            .iter()
            .map(|s| s.reserved_storage_bytes)
            .sum();
        let unclaimed = node.usable_storage_bytes as i64 - reserved_on_node;
        let spare = unclaimed.max(0);

        let desired =
            (shard.used_storage_bytes as f64 / self.config.thresholds.ideal).ceil() as i64;
        let needed = desired - shard.reserved_storage_bytes;
        if needed <= 0 || spare == 0 {
            // Nothing to grow with; the stored level keeps the worse
            // classification as backpressure toward the rebalancer.
            return Ok(());
        }

        let growth = needed.min(spare);
        shard.reserved_storage_bytes += growth;
        *level = self.watermark_level_for(shard);
        debug!(
            index_id = shard.id,
            growth,
            reserved = shard.reserved_storage_bytes,
            ?level,
            "reserve grown"
        );
        Ok(())
    }

    /// Shrink an overprovisioned, stable shard's reserve back to the ideal
    /// target, never below the floor.
    fn shrink_reserve(&self, shard: &mut IndexShard, level: &mut WatermarkLevel) {
        let ideal_target =
            (shard.used_storage_bytes as f64 / self.config.thresholds.ideal).ceil() as i64;
        let target = ideal_target.max(self.config.reserve_floor_bytes);
        if target < shard.reserved_storage_bytes {
            debug!(
                index_id = shard.id,
                from = shard.reserved_storage_bytes,
                to = target,
                "reserve shrunk"
            );
            shard.reserved_storage_bytes = target;
            *level = self.watermark_level_for(shard);
        }
    }

    /// Shards whose cached watermark level diverges from the freshly
    /// computed one, including the zero-reserve edge (classifies critical,
    /// never errors).
    pub fn indices_with_mismatched_watermark_levels(&self) -> StateResult<Vec<IndexShard>> {
        let mut mismatched = Vec::new();
        for shard in self.state.list_indices()? {
            if shard.watermark_level != self.watermark_level_for(&shard) {
                mismatched.push(shard);
            }
        }
        Ok(mismatched)
    }

    /// Shards whose reserve has gone negative. Tolerated transiently;
    /// surfaced here for correction.
    pub fn indices_with_negative_reserve(&self) -> StateResult<Vec<IndexShard>> {
        let mut negative = Vec::new();
        for shard in self.state.list_indices()? {
            if shard.reserved_storage_bytes < 0 {
                negative.push(shard);
            }
        }
        Ok(negative)
    }
}
