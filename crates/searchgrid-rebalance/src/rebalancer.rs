//! Capacity rebalancer — the periodic control loop.
//!
//! Each tick re-levels every index shard's reserve against its node,
//! drives the eviction pipeline for shards whose pressure the ledger could
//! not resolve, reconciles orphaned shards, and deletes shards that have
//! fully drained. Capacity problems are never errors here: they are
//! persisted state the next tick observes and keeps leveling.
//!
//! The tick is idempotent and re-entrant; the external scheduler may fire
//! it again while a previous invocation is still in flight.

use std::time::Duration;

use anyhow::bail;
use tracing::{debug, error, info, warn};

use searchgrid_ledger::StorageLedger;
use searchgrid_registry::NodeRegistry;
use searchgrid_state::*;

/// What one rebalance tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Shards whose storage bytes and watermark were re-leveled.
    pub updated: usize,
    /// Shards newly scheduled for eviction.
    pub pending_eviction: Vec<IndexId>,
    /// Shards whose eviction completed (replica severed).
    pub evicted: Vec<IndexId>,
    /// Shards newly marked orphaned.
    pub orphaned: Vec<IndexId>,
    /// Repositories marked for deletion on draining shards.
    pub repositories_marked: usize,
    /// Shards hard-deleted after draining.
    pub deleted: Vec<IndexId>,
    /// Cached watermark levels corrected outside the main update pass.
    pub watermarks_reconciled: usize,
    /// Nodes past the lost threshold (log-only).
    pub lost_nodes: Vec<NodeId>,
}

/// Periodically re-evaluates storage pressure and drives index shard
/// state transitions.
pub struct Rebalancer {
    state: StateStore,
    registry: NodeRegistry,
    ledger: StorageLedger,
}

impl Rebalancer {
    /// Build a rebalancer, validating the threshold configuration of its
    /// collaborators, including the cross-level invariant: the index
    /// critical fraction must not exceed the node critical fraction, or
    /// index-level leveling would under-react relative to node-level
    /// capacity alarms.
    pub fn new(
        state: StateStore,
        registry: NodeRegistry,
        ledger: StorageLedger,
    ) -> anyhow::Result<Self> {
        registry.config().thresholds.validate()?;
        ledger.config().thresholds.validate()?;
        let index_critical = ledger.config().thresholds.critical;
        let node_critical = registry.config().thresholds.critical;
        if index_critical > node_critical {
            bail!(
                "index critical threshold {index_critical} exceeds node \
                 critical threshold {node_critical}"
            );
        }
        Ok(Self {
            state,
            registry,
            ledger,
        })
    }

    /// Run one rebalance pass over the whole fleet.
    pub fn tick(&self, now: u64) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();

        self.update_ledger(now, &mut report)?;
        // Orphans reconcile before evictions complete, so a shard whose
        // eviction severs its replica stays observable as `evicted` for a
        // full tick before the orphan pass picks it up.
        self.reconcile_orphans(now, &mut report)?;
        self.complete_evictions(now, &mut report)?;
        self.schedule_evictions(now, &mut report)?;
        self.drain_deletable(now, &mut report)?;
        self.reconcile_watermarks(now, &mut report)?;
        report.lost_nodes = self.registry.lost_nodes(now)?;

        debug!(?report, "rebalance tick complete");
        Ok(report)
    }

    /// Re-level storage bytes, reserves, and watermark for every shard
    /// still in service. Shards already on their way out keep their
    /// accounting frozen.
    fn update_ledger(&self, now: u64, report: &mut TickReport) -> anyhow::Result<()> {
        for shard in self.state.list_indices()? {
            if shard.state.marked_for_removal() {
                continue;
            }
            self.ledger
                .update_storage_bytes_and_watermark_level(shard.id, false, now)?;
            report.updated += 1;
        }

        for shard in self.ledger.indices_with_negative_reserve()? {
            warn!(
                index_id = shard.id,
                reserved = shard.reserved_storage_bytes,
                "index reserve is negative"
            );
        }
        Ok(())
    }

    /// `pending_eviction → evicted`: sever the replica association. The
    /// namespace's next placement lands elsewhere; the drained shard then
    /// falls out through the orphan/deletion pipeline.
    fn complete_evictions(&self, now: u64, report: &mut TickReport) -> anyhow::Result<()> {
        for mut shard in self.state.list_indices()? {
            if shard.state != IndexState::PendingEviction {
                continue;
            }
            shard.replica_id = None;
            shard.state = IndexState::Evicted;
            shard.updated_at = now;
            self.state.put_index(&shard)?;
            info!(index_id = shard.id, "index evicted");
            report.evicted.push(shard.id);
        }
        Ok(())
    }

    /// Shards at critical pressure the ledger could not relieve, still
    /// holding a replica and not already on their way out, enter the
    /// eviction pipeline.
    fn schedule_evictions(&self, now: u64, report: &mut TickReport) -> anyhow::Result<()> {
        for mut shard in self.state.list_indices()? {
            let should_be_pending_eviction = shard.watermark_level
                == WatermarkLevel::CriticalWatermarkExceeded
                && shard.replica_id.is_some()
                && !shard.state.marked_for_removal();
            if !should_be_pending_eviction {
                continue;
            }
            shard.state = IndexState::PendingEviction;
            shard.updated_at = now;
            self.state.put_index(&shard)?;
            info!(index_id = shard.id, "index scheduled for eviction");
            report.pending_eviction.push(shard.id);
        }
        Ok(())
    }

    /// A valid shard needs both its namespace and its replica. Anything
    /// missing either association (and not already orphaned or marked for
    /// deletion) is reconciled to `orphaned`.
    fn reconcile_orphans(&self, now: u64, report: &mut TickReport) -> anyhow::Result<()> {
        for mut shard in self.state.list_indices()? {
            if matches!(
                shard.state,
                IndexState::Orphaned | IndexState::PendingDeletion
            ) {
                continue;
            }
            let namespace_present = self.state.get_namespace(shard.namespace_id)?.is_some();
            let replica_present = match shard.replica_id {
                Some(replica_id) => self
                    .state
                    .list_replicas_for_namespace(shard.namespace_id)?
                    .iter()
                    .any(|r| r.id == replica_id),
                None => false,
            };
            if namespace_present && replica_present {
                continue;
            }
            shard.state = IndexState::Orphaned;
            shard.updated_at = now;
            self.state.put_index(&shard)?;
            warn!(
                index_id = shard.id,
                namespace_present, replica_present, "index orphaned"
            );
            report.orphaned.push(shard.id);
        }
        Ok(())
    }

    /// Drain shards eligible for deletion: mark their repositories for
    /// deletion (the task lifecycle turns those into delete tasks) and
    /// hard-delete the shard once no repositories remain. The store
    /// rejects a premature delete, so ordering bugs surface loudly.
    fn drain_deletable(&self, now: u64, report: &mut TickReport) -> anyhow::Result<()> {
        for shard in self.state.list_indices()? {
            if !shard.should_be_deleted() {
                continue;
            }
            let repos = self.state.list_repositories_for_index(shard.id)?;
            if repos.is_empty() {
                match self.state.delete_index(shard.id) {
                    Ok(()) => {
                        info!(index_id = shard.id, "drained index deleted");
                        report.deleted.push(shard.id);
                    }
                    Err(e) => error!(index_id = shard.id, error = %e, "index delete failed"),
                }
                continue;
            }
            for mut repo in repos {
                if matches!(
                    repo.state,
                    RepositoryState::PendingDeletion | RepositoryState::Orphaned
                ) {
                    continue;
                }
                repo.state = RepositoryState::PendingDeletion;
                repo.updated_at = now;
                self.state.put_repository(&repo)?;
                report.repositories_marked += 1;
            }
        }
        Ok(())
    }

    /// Correct cached watermark levels that diverged from the computed
    /// classification — covers shards the main update pass skips, and the
    /// zero-reserve edge (classifies critical, never raises).
    fn reconcile_watermarks(&self, now: u64, report: &mut TickReport) -> anyhow::Result<()> {
        for mut shard in self.ledger.indices_with_mismatched_watermark_levels()? {
            let level = self.ledger.watermark_level_for(&shard);
            debug!(
                index_id = shard.id,
                cached = ?shard.watermark_level,
                actual = ?level,
                "watermark level reconciled"
            );
            shard.watermark_level = level;
            shard.updated_at = now;
            self.state.put_index(&shard)?;
            report.watermarks_reconciled += 1;
        }
        Ok(())
    }

    /// Run the rebalance loop until shutdown.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "rebalancer started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let now = epoch_secs();
                    if let Err(e) = self.tick(now) {
                        error!(error = %e, "rebalance tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("rebalancer shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
