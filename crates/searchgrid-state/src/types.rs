//! Domain types for the SearchGrid state store.
//!
//! These types represent the persisted state of search nodes, enabled
//! namespaces, replicas, index shards, repository assignments, and tasks.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a search node (UUID string supplied by the agent).
pub type NodeId = String;

/// Identifier of a root namespace opted into indexing.
pub type NamespaceId = u64;

/// Unique identifier for a replica within a namespace.
pub type ReplicaId = u64;

/// Unique identifier for an index shard.
pub type IndexId = u64;

/// Identifier of a project in the external project system.
pub type ProjectId = u64;

/// Unique identifier for a task.
pub type TaskId = u64;

/// Unique identifier for a task partition.
pub type PartitionId = u64;

/// Default reserved-storage floor for a fresh index shard (10 GiB).
pub const DEFAULT_RESERVED_BYTES: i64 = 10 * 1024 * 1024 * 1024;

/// Default retry budget for repositories and tasks.
pub const DEFAULT_RETRIES: u32 = 3;

// ── Node ──────────────────────────────────────────────────────────

/// Information about a search node in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Base URL for indexing traffic.
    pub index_url: String,
    /// Base URL for search traffic (absent on index-only nodes).
    pub search_url: Option<String>,
    /// Total disk capacity reported by the agent (bytes).
    pub total_bytes: u64,
    /// Disk in use, all consumers (bytes).
    pub used_bytes: u64,
    /// Disk occupied by search indices (bytes).
    pub indexed_bytes: u64,
    /// Derived: free + indexed. Recomputed on heartbeat unless locked.
    pub usable_storage_bytes: u64,
    /// While in the future, heartbeats skip the usable-storage recompute.
    /// Cooperative anti-thrashing only, not mutual exclusion.
    pub usable_storage_locked_until: Option<u64>,
    /// Unix timestamp of the last heartbeat.
    pub last_seen_at: u64,
    /// Service capability flags.
    pub services: NodeServices,
    /// Extensible non-relational attributes.
    pub metadata: NodeMetadata,
}

/// Which services a node advertises.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeServices {
    pub search: bool,
    pub knowledge_graph: bool,
}

/// Extensible node attributes carried in the metadata blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeMetadata {
    pub name: String,
    pub task_count: u32,
    pub concurrency: u32,
    pub version: Option<String>,
    pub schema_version: Option<u32>,
    pub concurrency_override: Option<u32>,
}

impl NodeInfo {
    /// Free disk on the node as reported (total − used).
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// Fraction of total disk in use. Zero-capacity nodes read as fully used.
    pub fn used_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

// ── EnabledNamespace ──────────────────────────────────────────────

/// A root namespace opted into search indexing.
///
/// Only root namespaces may be enabled; the enabling call validates
/// that the descriptor has no parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnabledNamespace {
    pub root_namespace_id: NamespaceId,
    pub created_at: u64,
}

// ── Replica ───────────────────────────────────────────────────────

/// One search-data replica set for an enabled namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replica {
    pub id: ReplicaId,
    /// Must equal the owning enabled namespace's root id.
    pub namespace_id: NamespaceId,
    pub created_at: u64,
}

impl Replica {
    /// Build the composite key for the replicas table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.namespace_id, self.id)
    }
}

// ── Index ─────────────────────────────────────────────────────────

/// Lifecycle state of an index shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Pending,
    Initializing,
    Ready,
    /// A project is being moved between indices of the same replica.
    /// The only state tolerating duplicate project-to-replica assignment.
    Reallocating,
    PendingEviction,
    Evicted,
    Orphaned,
    PendingDeletion,
}

impl IndexState {
    /// States in which the shard is already on its way out and must not
    /// re-enter the eviction pipeline.
    pub fn marked_for_removal(self) -> bool {
        matches!(
            self,
            IndexState::PendingEviction
                | IndexState::Evicted
                | IndexState::Orphaned
                | IndexState::PendingDeletion
        )
    }
}

/// Graded storage-pressure classification for an index shard.
///
/// Ordered from least to most pressure; `Ord` gives "worse than"
/// comparisons for free.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkLevel {
    Overprovisioned,
    Healthy,
    LowWatermarkExceeded,
    HighWatermarkExceeded,
    CriticalWatermarkExceeded,
}

/// Sharding range hints carried in the index metadata blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IndexMetadata {
    pub project_id_from: Option<ProjectId>,
    pub project_id_to: Option<ProjectId>,
}

/// One physical index shard, assigned to one node and (normally) one replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexShard {
    pub id: IndexId,
    pub node_id: NodeId,
    /// Severed by eviction or namespace destruction; a shard missing its
    /// replica is an orphan candidate.
    pub replica_id: Option<ReplicaId>,
    pub namespace_id: NamespaceId,
    pub state: IndexState,
    pub used_storage_bytes: u64,
    /// Shared budget drawn from the node's unclaimed storage. Negative only
    /// transiently; surfaced by the negative-reserve scan.
    pub reserved_storage_bytes: i64,
    /// Cached classification; reconciled against the freshly computed level
    /// by the rebalancer.
    pub watermark_level: WatermarkLevel,
    pub metadata: IndexMetadata,
    pub created_at: u64,
    pub updated_at: u64,
}

impl IndexShard {
    /// Reserved minus used. Negative when the shard has outgrown its reserve.
    pub fn free_storage_bytes(&self) -> i64 {
        self.reserved_storage_bytes - self.used_storage_bytes as i64
    }

    /// Deletion eligibility: only orphaned or administratively marked shards.
    pub fn should_be_deleted(&self) -> bool {
        matches!(
            self.state,
            IndexState::Orphaned | IndexState::PendingDeletion
        )
    }
}

// ── Repository ────────────────────────────────────────────────────

/// Per-project membership state within an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    Pending,
    Initializing,
    Ready,
    Failed,
    Orphaned,
    PendingDeletion,
}

/// The assignment of one project to one index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub index_id: IndexId,
    pub project_id: ProjectId,
    pub state: RepositoryState,
    pub size_bytes: u64,
    pub schema_version: u32,
    pub retries_left: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Repository {
    /// Build the composite key for the repositories table.
    pub fn table_key(&self) -> String {
        repository_key(self.index_id, self.project_id)
    }
}

/// Composite key for a repository: unique per (index, project).
pub fn repository_key(index_id: IndexId, project_id: ProjectId) -> String {
    format!("{index_id}:{project_id}")
}

// ── Task ──────────────────────────────────────────────────────────

/// The kind of work dispatched to a node agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IndexRepo,
    DeleteRepo,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Done,
    Failed,
    Skipped,
    Orphaned,
}

impl TaskState {
    /// Pending and processing rows pin their partition against detachment.
    pub fn blocks_detach(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Processing)
    }
}

/// A unit of work for one repository, dispatched to a node agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub partition_id: PartitionId,
    pub index_id: IndexId,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub state: TaskState,
    /// Unix timestamp the task becomes due.
    pub perform_at: u64,
    pub retries_left: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Task {
    /// Build the composite key for the tasks table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.partition_id, self.id)
    }
}

// ── Task partition ────────────────────────────────────────────────

/// A time partition of the task log. New tasks land in the newest
/// non-detached partition; detachment drops the partition's rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPartition {
    pub id: PartitionId,
    pub created_at: u64,
    pub detached: bool,
    pub detached_at: Option<u64>,
}
