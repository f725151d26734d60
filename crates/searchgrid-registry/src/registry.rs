//! Node registry — tracks fleet members and their reported capacity.
//!
//! Processes heartbeat reports from search-node agents, derives storage
//! metrics (usable and unclaimed bytes), and answers liveness and
//! capability queries for the placement planner and rebalancer.

use tracing::{debug, warn};

use searchgrid_state::*;

use crate::config::RegistryConfig;

/// Heartbeat payload from a search-node agent. The transport that carries
/// it is out of scope; the registry only sees the decoded fields.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeReport {
    pub uuid: String,
    pub index_url: String,
    pub search_url: Option<String>,
    pub disk_all_bytes: u64,
    pub disk_free_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_indexed_bytes: Option<u64>,
    pub name: String,
    pub task_count: u32,
    pub concurrency: u32,
    pub version: Option<String>,
    pub schema_version: Option<u32>,
    pub knowledge_graph: Option<bool>,
}

impl NodeReport {
    /// A report is persistable only with an identity, an index endpoint,
    /// and a non-zero disk size.
    fn valid(&self) -> bool {
        !self.uuid.is_empty() && !self.index_url.is_empty() && self.disk_all_bytes > 0
    }
}

/// Tracks fleet members, their capacity, and their liveness.
pub struct NodeRegistry {
    state: StateStore,
    config: RegistryConfig,
}

impl NodeRegistry {
    /// Create a registry with default configuration.
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            config: RegistryConfig::default(),
        }
    }

    /// Override the registry configuration.
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Idempotent upsert keyed by the agent-supplied UUID.
    ///
    /// Returns `Ok(None)` without persisting anything when the report is
    /// missing required fields. `last_seen_at` always advances; the
    /// usable-storage derivation is skipped while the lock timestamp is in
    /// the future, and re-armed after each recompute.
    pub fn register_or_update(
        &self,
        report: &NodeReport,
        now: u64,
    ) -> StateResult<Option<NodeInfo>> {
        if !report.valid() {
            warn!(uuid = %report.uuid, "rejecting incomplete node report");
            return Ok(None);
        }

        let existing = self.state.get_node(&report.uuid)?;
        let indexed_bytes = report.disk_indexed_bytes.unwrap_or(0);

        let (usable, locked_until) = match &existing {
            Some(node)
                if node
                    .usable_storage_locked_until
                    .is_some_and(|until| until > now) =>
            {
                // Lock still armed: keep the previous derivation untouched.
                (node.usable_storage_bytes, node.usable_storage_locked_until)
            }
            _ => (
                report.disk_free_bytes + indexed_bytes,
                Some(now + self.config.usable_storage_lock_ttl.as_secs()),
            ),
        };

        let node = NodeInfo {
            id: report.uuid.clone(),
            index_url: report.index_url.clone(),
            search_url: report.search_url.clone(),
            total_bytes: report.disk_all_bytes,
            used_bytes: report.disk_used_bytes,
            indexed_bytes,
            usable_storage_bytes: usable,
            usable_storage_locked_until: locked_until,
            last_seen_at: now,
            services: NodeServices {
                search: report.search_url.is_some(),
                knowledge_graph: report.knowledge_graph.unwrap_or(false),
            },
            metadata: NodeMetadata {
                name: report.name.clone(),
                task_count: report.task_count,
                concurrency: report.concurrency,
                version: report.version.clone(),
                schema_version: report.schema_version,
                concurrency_override: existing
                    .as_ref()
                    .and_then(|n| n.metadata.concurrency_override),
            },
        };

        self.state.put_node(&node)?;
        debug!(node_id = %node.id, usable, "node heartbeat processed");
        Ok(Some(node))
    }

    /// Usable storage minus everything already reserved by the node's index
    /// shards. Negative means the node is over-committed; callers must
    /// handle that, the registry only surfaces it.
    pub fn unclaimed_storage_bytes(&self, node: &NodeInfo) -> StateResult<i64> {
        let reserved: i64 = self
            .state
            .list_indices_on_node(&node.id)?
            .iter()
            .map(|s| s.reserved_storage_bytes)
            .sum();
        Ok(node.usable_storage_bytes as i64 - reserved)
    }

    /// Whether the node's used/total ratio is at or above the low fraction.
    pub fn watermark_exceeded_low(&self, node: &NodeInfo) -> bool {
        node.used_ratio() >= self.config.thresholds.low
    }

    /// Whether the node's used/total ratio is at or above the high fraction.
    pub fn watermark_exceeded_high(&self, node: &NodeInfo) -> bool {
        node.used_ratio() >= self.config.thresholds.high
    }

    /// Whether the node's used/total ratio is at or above the critical fraction.
    pub fn watermark_exceeded_critical(&self, node: &NodeInfo) -> bool {
        node.used_ratio() >= self.config.thresholds.critical
    }

    /// Liveness: heard from within the online window.
    pub fn online(&self, node: &NodeInfo, now: u64) -> bool {
        now.saturating_sub(node.last_seen_at) <= self.config.online_duration.as_secs()
    }

    /// A node is lost once unseen past the lost threshold. With the
    /// threshold disabled (`None`), no node is ever lost.
    pub fn lost(&self, node: &NodeInfo, now: u64) -> bool {
        match self.config.lost_threshold {
            Some(threshold) => {
                now.saturating_sub(node.last_seen_at) > threshold.as_secs()
            }
            None => false,
        }
    }

    /// Online, search-capable nodes holding at least one ready repository
    /// for the project.
    pub fn searchable_nodes_for_project(
        &self,
        project_id: ProjectId,
        now: u64,
    ) -> StateResult<Vec<NodeInfo>> {
        let repos = self.state.list_repositories_for_project(project_id)?;
        let mut node_ids: Vec<NodeId> = Vec::new();
        for repo in repos {
            if repo.state != RepositoryState::Ready {
                continue;
            }
            if let Some(shard) = self.state.get_index(repo.index_id)?
                && !node_ids.contains(&shard.node_id)
            {
                node_ids.push(shard.node_id);
            }
        }

        let mut nodes = Vec::new();
        for node_id in node_ids {
            if let Some(node) = self.state.get_node(&node_id)?
                && node.services.search
                && self.online(&node, now)
            {
                nodes.push(node);
            }
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    /// All nodes paired with their unclaimed bytes, most spare capacity
    /// first, ties broken by id for determinism.
    pub fn nodes_by_unclaimed_desc(&self) -> StateResult<Vec<(NodeInfo, i64)>> {
        let mut pairs = Vec::new();
        for node in self.state.list_nodes()? {
            let unclaimed = self.unclaimed_storage_bytes(&node)?;
            pairs.push((node, unclaimed));
        }
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        Ok(pairs)
    }

    /// The subset of nodes with spare capacity left to claim.
    pub fn nodes_with_positive_unclaimed(&self) -> StateResult<Vec<(NodeInfo, i64)>> {
        let mut pairs = self.nodes_by_unclaimed_desc()?;
        pairs.retain(|(_, unclaimed)| *unclaimed > 0);
        Ok(pairs)
    }

    /// Scan for lost nodes. Log-only: lost nodes stay registered so their
    /// shards remain attributable, but the rebalancer and planner treat
    /// them as unavailable.
    pub fn lost_nodes(&self, now: u64) -> StateResult<Vec<NodeId>> {
        let mut lost = Vec::new();
        for node in self.state.list_nodes()? {
            if self.lost(&node, now) {
                warn!(node_id = %node.id, last_seen_at = node.last_seen_at, "node lost");
                lost.push(node.id);
            }
        }
        Ok(lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::NodeThresholds;

    fn test_state() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn test_report(uuid: &str) -> NodeReport {
        NodeReport {
            uuid: uuid.to_string(),
            index_url: format!("http://{uuid}:6080"),
            search_url: Some(format!("http://{uuid}:6090")),
            disk_all_bytes: 1000,
            disk_free_bytes: 700,
            disk_used_bytes: 300,
            disk_indexed_bytes: Some(200),
            name: uuid.to_string(),
            task_count: 0,
            concurrency: 4,
            version: Some("1.0.0".to_string()),
            schema_version: Some(1),
            knowledge_graph: None,
        }
    }

    fn test_index_on(node_id: &str, id: IndexId, reserved: i64) -> IndexShard {
        IndexShard {
            id,
            node_id: node_id.to_string(),
            replica_id: Some(1),
            namespace_id: 42,
            state: IndexState::Ready,
            used_storage_bytes: 0,
            reserved_storage_bytes: reserved,
            watermark_level: WatermarkLevel::Overprovisioned,
            metadata: IndexMetadata::default(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn register_computes_usable_storage() {
        let registry = NodeRegistry::new(test_state());
        let node = registry
            .register_or_update(&test_report("node-1"), 1000)
            .unwrap()
            .unwrap();

        // usable = free + indexed = 700 + 200.
        assert_eq!(node.usable_storage_bytes, 900);
        assert_eq!(node.last_seen_at, 1000);
        assert!(node.services.search);
    }

    #[test]
    fn register_rejects_incomplete_report() {
        let state = test_state();
        let registry = NodeRegistry::new(state.clone());

        let mut report = test_report("node-1");
        report.index_url = String::new();

        assert!(registry.register_or_update(&report, 1000).unwrap().is_none());
        assert!(state.get_node("node-1").unwrap().is_none());
    }

    #[test]
    fn usable_storage_locked_against_recompute() {
        let registry = NodeRegistry::new(test_state()).with_config(RegistryConfig {
            usable_storage_lock_ttl: Duration::from_secs(600),
            ..RegistryConfig::default()
        });

        registry
            .register_or_update(&test_report("node-1"), 1000)
            .unwrap();

        // Fresh report with very different numbers, inside the lock window.
        let mut report = test_report("node-1");
        report.disk_free_bytes = 100;
        report.disk_indexed_bytes = Some(0);
        let node = registry.register_or_update(&report, 1100).unwrap().unwrap();

        // Derivation suppressed; raw metrics still updated.
        assert_eq!(node.usable_storage_bytes, 900);
        assert_eq!(node.indexed_bytes, 0);

        // Past the lock window the derivation runs again.
        let node = registry.register_or_update(&report, 1000 + 601).unwrap().unwrap();
        assert_eq!(node.usable_storage_bytes, 100);
    }

    #[test]
    fn unclaimed_subtracts_reservations_and_may_go_negative() {
        let state = test_state();
        let registry = NodeRegistry::new(state.clone());
        let node = registry
            .register_or_update(&test_report("node-1"), 1000)
            .unwrap()
            .unwrap();

        state.put_index(&test_index_on("node-1", 1, 300)).unwrap();
        state.put_index(&test_index_on("node-1", 2, 200)).unwrap();
        assert_eq!(registry.unclaimed_storage_bytes(&node).unwrap(), 400);

        state.put_index(&test_index_on("node-1", 3, 1000)).unwrap();
        assert_eq!(registry.unclaimed_storage_bytes(&node).unwrap(), -600);
    }

    #[test]
    fn node_watermark_flags() {
        let registry = NodeRegistry::new(test_state()).with_config(RegistryConfig {
            thresholds: NodeThresholds {
                low: 0.7,
                high: 0.8,
                critical: 0.9,
            },
            ..RegistryConfig::default()
        });

        let mut report = test_report("node-1");
        report.disk_used_bytes = 0;
        let idle = registry.register_or_update(&report, 1000).unwrap().unwrap();
        assert!(!registry.watermark_exceeded_low(&idle));
        assert!(!registry.watermark_exceeded_high(&idle));
        assert!(!registry.watermark_exceeded_critical(&idle));

        report.disk_used_bytes = 900; // total × critical fraction.
        let full = registry.register_or_update(&report, 1000).unwrap().unwrap();
        assert!(registry.watermark_exceeded_low(&full));
        assert!(registry.watermark_exceeded_high(&full));
        assert!(registry.watermark_exceeded_critical(&full));
    }

    #[test]
    fn online_and_lost_liveness() {
        let registry = NodeRegistry::new(test_state()).with_config(RegistryConfig {
            online_duration: Duration::from_secs(90),
            lost_threshold: Some(Duration::from_secs(3600)),
            ..RegistryConfig::default()
        });
        let node = registry
            .register_or_update(&test_report("node-1"), 1000)
            .unwrap()
            .unwrap();

        assert!(registry.online(&node, 1050));
        assert!(!registry.online(&node, 1000 + 91));
        assert!(!registry.lost(&node, 1000 + 3600));
        assert!(registry.lost(&node, 1000 + 3601));
    }

    #[test]
    fn disabled_lost_threshold_means_never_lost() {
        let registry = NodeRegistry::new(test_state()).with_config(RegistryConfig {
            lost_threshold: None,
            ..RegistryConfig::default()
        });
        let node = registry
            .register_or_update(&test_report("node-1"), 1000)
            .unwrap()
            .unwrap();

        assert!(!registry.lost(&node, u64::MAX));
        assert!(registry.lost_nodes(u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn searchable_nodes_require_ready_repo_and_liveness() {
        let state = test_state();
        let registry = NodeRegistry::new(state.clone());

        registry
            .register_or_update(&test_report("node-1"), 1000)
            .unwrap();
        state.put_index(&test_index_on("node-1", 1, 100)).unwrap();

        let mut repo = Repository {
            index_id: 1,
            project_id: 7,
            state: RepositoryState::Pending,
            size_bytes: 10,
            schema_version: 1,
            retries_left: DEFAULT_RETRIES,
            created_at: 1000,
            updated_at: 1000,
        };
        state.put_repository(&repo).unwrap();

        // Pending repository: not searchable yet.
        assert!(registry.searchable_nodes_for_project(7, 1010).unwrap().is_empty());

        repo.state = RepositoryState::Ready;
        state.put_repository(&repo).unwrap();
        let nodes = registry.searchable_nodes_for_project(7, 1010).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "node-1");

        // Node offline: excluded again.
        assert!(registry.searchable_nodes_for_project(7, 5000).unwrap().is_empty());
    }

    #[test]
    fn unclaimed_ordering_is_deterministic() {
        let state = test_state();
        let registry = NodeRegistry::new(state.clone());

        for id in ["node-a", "node-b", "node-c"] {
            registry.register_or_update(&test_report(id), 1000).unwrap();
        }
        // node-b fully committed, node-c over-committed.
        state.put_index(&test_index_on("node-b", 1, 900)).unwrap();
        state.put_index(&test_index_on("node-c", 2, 1500)).unwrap();

        let ranked = registry.nodes_by_unclaimed_desc().unwrap();
        let ids: Vec<&str> = ranked.iter().map(|(n, _)| n.id.as_str()).collect();
        assert_eq!(ids, vec!["node-a", "node-b", "node-c"]);

        let positive = registry.nodes_with_positive_unclaimed().unwrap();
        assert_eq!(positive.len(), 1);
        assert_eq!(positive[0].0.id, "node-a");
    }
}
