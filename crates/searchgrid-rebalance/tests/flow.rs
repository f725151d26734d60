//! End-to-end controller flow over an in-memory store: heartbeat,
//! provisioning, placement, task lifecycle, search eligibility, and the
//! teardown path through orphaning and deletion.

use searchgrid_ledger::StorageLedger;
use searchgrid_lifecycle::{
    StaticProjectCatalog, TaskDisposition, TaskLifecycle,
};
use searchgrid_placement::PlacementPlanner;
use searchgrid_rebalance::Rebalancer;
use searchgrid_registry::{NodeRegistry, NodeReport};
use searchgrid_state::*;

fn heartbeat(uuid: &str) -> NodeReport {
    NodeReport {
        uuid: uuid.to_string(),
        index_url: format!("http://{uuid}:6080"),
        search_url: Some(format!("http://{uuid}:6090")),
        disk_all_bytes: 100 * 1024 * 1024 * 1024,
        disk_free_bytes: 80 * 1024 * 1024 * 1024,
        disk_used_bytes: 20 * 1024 * 1024 * 1024,
        disk_indexed_bytes: Some(5 * 1024 * 1024 * 1024),
        name: uuid.to_string(),
        task_count: 0,
        concurrency: 4,
        version: Some("1.0.0".to_string()),
        schema_version: Some(1),
        knowledge_graph: None,
    }
}

/// Provision one shard for the namespace's replica on the given node.
fn provision_index(state: &StateStore, node_id: &str, replica: &Replica, now: u64) -> IndexShard {
    let shard = IndexShard {
        id: state.next_id().unwrap(),
        node_id: node_id.to_string(),
        replica_id: Some(replica.id),
        namespace_id: replica.namespace_id,
        state: IndexState::Ready,
        used_storage_bytes: 0,
        reserved_storage_bytes: DEFAULT_RESERVED_BYTES,
        watermark_level: WatermarkLevel::Overprovisioned,
        metadata: IndexMetadata::default(),
        created_at: now,
        updated_at: now,
    };
    state.put_index(&shard).unwrap();
    shard
}

#[test]
fn project_becomes_searchable_end_to_end() {
    let state = StateStore::open_in_memory().unwrap();
    let registry = NodeRegistry::new(state.clone());
    let planner = PlacementPlanner::new(state.clone());
    let lifecycle = TaskLifecycle::new(state.clone());
    let mut catalog = StaticProjectCatalog::new();
    catalog.insert(7, true);

    // Heartbeat registers the node; the namespace opts in; a replica and
    // shard are provisioned.
    let node = registry
        .register_or_update(&heartbeat("node-1"), 1000)
        .unwrap()
        .unwrap();
    state.enable_namespace(42, None, 1000).unwrap();
    let replica = state.get_or_create_replica(42, 1000).unwrap();
    let shard = provision_index(&state, &node.id, &replica, 1000);

    // Placement selects the shard; the repository lands on it.
    let placed = planner.fetch_indices_for_indexing(7, 42).unwrap();
    assert_eq!(placed[0].id, shard.id);
    lifecycle
        .find_or_create_repository(shard.id, 7, 1100)
        .unwrap();

    // Scheduler tick creates the index task; dispatch claims and finishes it.
    let tasks = lifecycle.create_bulk_tasks(TaskType::IndexRepo, 1200).unwrap();
    assert_eq!(tasks.len(), 1);
    let claimed = lifecycle.each_task_for_processing(10, 1300, &catalog).unwrap();
    assert_eq!(claimed.len(), 1);
    let outcomes = vec![(claimed[0].clone(), TaskDisposition::Done)];
    lifecycle.update_task_states(&outcomes, 1400).unwrap();

    // The next heartbeat keeps the node online; the project is now
    // searchable on it.
    registry
        .register_or_update(&heartbeat("node-1"), 1440)
        .unwrap();
    let searchable = registry.searchable_nodes_for_project(7, 1450).unwrap();
    assert_eq!(searchable.len(), 1);
    assert_eq!(searchable[0].id, "node-1");

    // Placement keeps returning the same shard for the project.
    let placed = planner.fetch_indices_for_indexing(7, 42).unwrap();
    assert_eq!(placed[0].id, shard.id);
}

#[test]
fn namespace_teardown_drains_through_delete_tasks() {
    let state = StateStore::open_in_memory().unwrap();
    let registry = NodeRegistry::new(state.clone());
    let ledger = StorageLedger::new(state.clone());
    let lifecycle = TaskLifecycle::new(state.clone());
    let rebalancer = Rebalancer::new(state.clone(), registry, ledger).unwrap();
    let mut catalog = StaticProjectCatalog::new();
    catalog.insert(7, true);

    let node_registry = NodeRegistry::new(state.clone());
    let node = node_registry
        .register_or_update(&heartbeat("node-1"), 1000)
        .unwrap()
        .unwrap();
    state.enable_namespace(42, None, 1000).unwrap();
    let replica = state.get_or_create_replica(42, 1000).unwrap();
    let shard = provision_index(&state, &node.id, &replica, 1000);
    lifecycle
        .find_or_create_repository(shard.id, 7, 1100)
        .unwrap();

    // The namespace opts out; the rebalancer orphans the shard and marks
    // its repository for deletion.
    state.destroy_namespace(42).unwrap();
    let report = rebalancer.tick(2000).unwrap();
    assert_eq!(report.orphaned, vec![shard.id]);
    assert_eq!(report.repositories_marked, 1);

    // Delete task flows through dispatch; its completion removes the
    // repository row.
    let tasks = lifecycle.create_bulk_tasks(TaskType::DeleteRepo, 2100).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::DeleteRepo);
    let claimed = lifecycle.each_task_for_processing(10, 2200, &catalog).unwrap();
    assert_eq!(claimed.len(), 1);
    lifecycle
        .update_task_states(&[(claimed[0].clone(), TaskDisposition::Done)], 2300)
        .unwrap();
    assert!(state.get_repository(shard.id, 7).unwrap().is_none());

    // The drained shard is hard-deleted on the next tick.
    let report = rebalancer.tick(3000).unwrap();
    assert_eq!(report.deleted, vec![shard.id]);
    assert!(state.get_index(shard.id).unwrap().is_none());
}
