//! redb table definitions for the SearchGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Node info keyed by `{node_id}` (agent-supplied UUID).
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Enabled namespaces keyed by `{root_namespace_id}`.
pub const NAMESPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("namespaces");

/// Replicas keyed by `{namespace_id}:{replica_id}`.
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");

/// Index shards keyed by `{index_id}`.
pub const INDICES: TableDefinition<&str, &[u8]> = TableDefinition::new("indices");

/// Repository assignments keyed by `{index_id}:{project_id}`.
pub const REPOSITORIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("repositories");

/// Tasks keyed by `{partition_id}:{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Task partitions keyed by `{partition_id}`.
pub const TASK_PARTITIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("task_partitions");

/// Store-internal counters (id sequence) keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Meta key for the monotonic id sequence shared by replicas, indices,
/// tasks, and partitions.
pub const ID_SEQUENCE: &str = "id_sequence";
