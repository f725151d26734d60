//! Placement planner — decides which index/node receives a project.
//!
//! Selection order:
//! 1. An existing assignment always wins (assignment stability — a project
//!    never silently moves without going through reallocation).
//! 2. Otherwise the ready index with the greatest free reserve, ties broken
//!    by lowest index id.
//! 3. A replica with no indices yields nothing; the caller provisions first.
//!
//! Given identical store state, repeated calls return identical results —
//! task creation retries depend on that.

use tracing::debug;

use searchgrid_registry::NodeRegistry;
use searchgrid_state::*;

/// Sort candidate shards for placement: greatest free reserve first,
/// lowest id on ties.
pub fn rank_indices(mut shards: Vec<IndexShard>) -> Vec<IndexShard> {
    shards.sort_by(|a, b| {
        b.free_storage_bytes()
            .cmp(&a.free_storage_bytes())
            .then_with(|| a.id.cmp(&b.id))
    });
    shards
}

/// Chooses the target index/node for a project that needs indexing.
pub struct PlacementPlanner {
    state: StateStore,
}

impl PlacementPlanner {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// The indices that should receive indexing work for the project.
    ///
    /// Returns at most one shard: the existing assignment if any, else the
    /// best-ranked ready shard among the namespace's replicas. Empty when
    /// the namespace has no indices yet.
    pub fn fetch_indices_for_indexing(
        &self,
        project_id: ProjectId,
        root_namespace_id: NamespaceId,
    ) -> StateResult<Vec<IndexShard>> {
        let replicas = self.state.list_replicas_for_namespace(root_namespace_id)?;

        let mut candidates: Vec<IndexShard> = Vec::new();
        for replica in &replicas {
            for shard in self.state.list_indices_for_replica(replica.id)? {
                if self.state.get_repository(shard.id, project_id)?.is_some() {
                    debug!(
                        project_id,
                        index_id = shard.id,
                        "placement reuses existing assignment"
                    );
                    return Ok(vec![shard]);
                }
                if shard.state == IndexState::Ready {
                    candidates.push(shard);
                }
            }
        }

        let ranked = rank_indices(candidates);
        Ok(ranked.into_iter().take(1).collect())
    }

    /// The nodes that should receive indexing work for the project.
    ///
    /// Explicit node ids resolve directly (unknown ids are dropped);
    /// otherwise nodes derive from the index selection.
    pub fn fetch_nodes_for_indexing(
        &self,
        project_id: ProjectId,
        root_namespace_id: NamespaceId,
        node_ids: &[NodeId],
    ) -> StateResult<Vec<NodeInfo>> {
        if !node_ids.is_empty() {
            let mut nodes = Vec::new();
            for node_id in node_ids {
                if let Some(node) = self.state.get_node(node_id)? {
                    nodes.push(node);
                }
            }
            return Ok(nodes);
        }

        let mut nodes = Vec::new();
        for shard in self.fetch_indices_for_indexing(project_id, root_namespace_id)? {
            if let Some(node) = self.state.get_node(&shard.node_id)?
                && !nodes.iter().any(|n: &NodeInfo| n.id == node.id)
            {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// The node a brand-new shard should land on: the online fleet member
    /// with the most unclaimed storage left to spare.
    pub fn fetch_node_for_new_index(
        &self,
        registry: &NodeRegistry,
        now: u64,
    ) -> StateResult<Option<NodeInfo>> {
        let pool = registry.nodes_with_positive_unclaimed()?;
        Ok(pool
            .into_iter()
            .map(|(node, _)| node)
            .find(|node| registry.online(node, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use searchgrid_registry::NodeReport;

    fn test_state() -> StateStore {
        let state = StateStore::open_in_memory().unwrap();
        state
            .put_namespace(&EnabledNamespace {
                root_namespace_id: 42,
                created_at: 1000,
            })
            .unwrap();
        state
    }

    fn test_index(id: IndexId, replica_id: ReplicaId, used: u64, reserved: i64) -> IndexShard {
        IndexShard {
            id,
            node_id: format!("node-{id}"),
            replica_id: Some(replica_id),
            namespace_id: 42,
            state: IndexState::Ready,
            used_storage_bytes: used,
            reserved_storage_bytes: reserved,
            watermark_level: WatermarkLevel::Healthy,
            metadata: IndexMetadata::default(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_repo(index_id: IndexId, project_id: ProjectId) -> Repository {
        Repository {
            index_id,
            project_id,
            state: RepositoryState::Ready,
            size_bytes: 100,
            schema_version: 1,
            retries_left: DEFAULT_RETRIES,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_node(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            index_url: format!("http://{id}:6080"),
            search_url: None,
            total_bytes: 1000,
            used_bytes: 0,
            indexed_bytes: 0,
            usable_storage_bytes: 1000,
            usable_storage_locked_until: None,
            last_seen_at: 1000,
            services: NodeServices::default(),
            metadata: NodeMetadata::default(),
        }
    }

    #[test]
    fn existing_assignment_wins_over_free_space() {
        let state = test_state();
        let replica = state.get_or_create_replica(42, 1000).unwrap();
        // I1 is nearly full; I2 has plenty of room.
        state.put_index(&test_index(1, replica.id, 90, 100)).unwrap();
        state.put_index(&test_index(2, replica.id, 0, 1000)).unwrap();
        state.put_repository(&test_repo(1, 7)).unwrap();

        let planner = PlacementPlanner::new(state);
        let indices = planner.fetch_indices_for_indexing(7, 42).unwrap();

        let ids: Vec<IndexId> = indices.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn fallback_picks_greatest_free_reserve() {
        let state = test_state();
        let replica = state.get_or_create_replica(42, 1000).unwrap();
        state.put_index(&test_index(1, replica.id, 50, 100)).unwrap(); // free 50
        state.put_index(&test_index(2, replica.id, 10, 500)).unwrap(); // free 490
        state.put_index(&test_index(3, replica.id, 0, 200)).unwrap(); // free 200

        let planner = PlacementPlanner::new(state);
        let indices = planner.fetch_indices_for_indexing(7, 42).unwrap();

        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].id, 2);
    }

    #[test]
    fn ties_break_toward_lowest_index_id() {
        let state = test_state();
        let replica = state.get_or_create_replica(42, 1000).unwrap();
        state.put_index(&test_index(5, replica.id, 0, 300)).unwrap();
        state.put_index(&test_index(3, replica.id, 0, 300)).unwrap();

        let planner = PlacementPlanner::new(state);
        let indices = planner.fetch_indices_for_indexing(7, 42).unwrap();
        assert_eq!(indices[0].id, 3);
    }

    #[test]
    fn non_ready_shards_are_not_candidates() {
        let state = test_state();
        let replica = state.get_or_create_replica(42, 1000).unwrap();
        let mut pending = test_index(1, replica.id, 0, 1000);
        pending.state = IndexState::Pending;
        state.put_index(&pending).unwrap();
        state.put_index(&test_index(2, replica.id, 0, 100)).unwrap();

        let planner = PlacementPlanner::new(state);
        let indices = planner.fetch_indices_for_indexing(7, 42).unwrap();
        assert_eq!(indices[0].id, 2);
    }

    #[test]
    fn empty_replica_yields_nothing() {
        let state = test_state();
        state.get_or_create_replica(42, 1000).unwrap();

        let planner = PlacementPlanner::new(state);
        assert!(planner.fetch_indices_for_indexing(7, 42).unwrap().is_empty());
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let state = test_state();
        let replica = state.get_or_create_replica(42, 1000).unwrap();
        for id in [4, 2, 9] {
            state.put_index(&test_index(id, replica.id, 0, 300)).unwrap();
        }

        let planner = PlacementPlanner::new(state);
        let first = planner.fetch_indices_for_indexing(7, 42).unwrap();
        let second = planner.fetch_indices_for_indexing(7, 42).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn explicit_node_ids_resolve_directly() {
        let state = test_state();
        state.put_node(&test_node("node-a")).unwrap();
        state.put_node(&test_node("node-b")).unwrap();

        let planner = PlacementPlanner::new(state);
        let nodes = planner
            .fetch_nodes_for_indexing(7, 42, &["node-b".to_string(), "node-x".to_string()])
            .unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "node-b");
    }

    #[test]
    fn nodes_derive_from_index_selection() {
        let state = test_state();
        let replica = state.get_or_create_replica(42, 1000).unwrap();
        let shard = test_index(1, replica.id, 0, 300);
        state.put_node(&test_node(&shard.node_id)).unwrap();
        state.put_index(&shard).unwrap();

        let planner = PlacementPlanner::new(state);
        let nodes = planner.fetch_nodes_for_indexing(7, 42, &[]).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "node-1");
    }

    #[test]
    fn new_index_lands_on_most_unclaimed_online_node() {
        let state = test_state();
        let registry = NodeRegistry::new(state.clone());
        for (uuid, free) in [("node-a", 200u64), ("node-b", 800)] {
            registry
                .register_or_update(
                    &NodeReport {
                        uuid: uuid.to_string(),
                        index_url: format!("http://{uuid}:6080"),
                        search_url: None,
                        disk_all_bytes: 1000,
                        disk_free_bytes: free,
                        disk_used_bytes: 1000 - free,
                        disk_indexed_bytes: None,
                        name: uuid.to_string(),
                        task_count: 0,
                        concurrency: 4,
                        version: None,
                        schema_version: None,
                        knowledge_graph: None,
                    },
                    1000,
                )
                .unwrap();
        }

        let planner = PlacementPlanner::new(state);
        let node = planner.fetch_node_for_new_index(&registry, 1010).unwrap();
        assert_eq!(node.unwrap().id, "node-b");
    }
}
