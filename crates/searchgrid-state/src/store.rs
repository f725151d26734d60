//! StateStore — redb-backed state persistence for SearchGrid.
//!
//! Provides typed CRUD operations over nodes, namespaces, replicas, index
//! shards, repositories, tasks, and task partitions. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Multi-record operations (bulk task creation, cascading namespace
//! destruction, guarded index deletion, partition detachment) commit in a
//! single write transaction; redb's single-writer model makes them atomic
//! with respect to every other write.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
        txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        txn.open_table(INDICES).map_err(map_err!(Table))?;
        txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(TASK_PARTITIONS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Id sequence ────────────────────────────────────────────────

    /// Allocate the next id from the shared monotonic sequence.
    pub fn next_id(&self) -> StateResult<u64> {
        Ok(self.next_ids(1)?[0])
    }

    /// Allocate a contiguous run of ids from the shared sequence.
    pub fn next_ids(&self, count: u64) -> StateResult<Vec<u64>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let ids;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let current = table
                .get(ID_SEQUENCE)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            ids = (current + 1..=current + count).collect();
            table
                .insert(ID_SEQUENCE, current + count)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(ids)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a node by its UUID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Administratively delete a node. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Enabled namespaces ─────────────────────────────────────────

    /// Opt a root namespace into indexing. Idempotent.
    ///
    /// Only root namespaces may be enabled: a descriptor carrying a parent
    /// is rejected at this boundary and nothing is persisted.
    pub fn enable_namespace(
        &self,
        namespace_id: NamespaceId,
        parent_id: Option<NamespaceId>,
        now: u64,
    ) -> StateResult<EnabledNamespace> {
        if let Some(parent_id) = parent_id {
            return Err(StateError::Validation(format!(
                "namespace {namespace_id} is not a root namespace (parent {parent_id})"
            )));
        }
        if let Some(existing) = self.get_namespace(namespace_id)? {
            return Ok(existing);
        }
        let ns = EnabledNamespace {
            root_namespace_id: namespace_id,
            created_at: now,
        };
        self.put_namespace(&ns)?;
        debug!(namespace_id, "namespace enabled for indexing");
        Ok(ns)
    }

    /// Insert or update an enabled namespace.
    pub fn put_namespace(&self, ns: &EnabledNamespace) -> StateResult<()> {
        let key = ns.root_namespace_id.to_string();
        let value = serde_json::to_vec(ns).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an enabled namespace by root id.
    pub fn get_namespace(&self, namespace_id: NamespaceId) -> StateResult<Option<EnabledNamespace>> {
        let key = namespace_id.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let ns: EnabledNamespace =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(ns))
            }
            None => Ok(None),
        }
    }

    /// List all enabled namespaces.
    pub fn list_namespaces(&self) -> StateResult<Vec<EnabledNamespace>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let ns: EnabledNamespace =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(ns);
        }
        Ok(results)
    }

    /// Destroy an enabled namespace: removes the namespace and its replicas,
    /// and nullifies the replica reference on the namespace's index shards
    /// (the shards themselves become orphan candidates for the rebalancer).
    ///
    /// Returns `(replicas_removed, indices_detached)`.
    pub fn destroy_namespace(&self, namespace_id: NamespaceId) -> StateResult<(u32, u32)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut replicas_removed = 0u32;
        let mut indices_detached = 0u32;
        {
            let mut namespaces = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            let key = namespace_id.to_string();
            if namespaces.remove(key.as_str()).map_err(map_err!(Write))?.is_none() {
                return Err(StateError::NotFound(format!("namespace {namespace_id}")));
            }

            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let prefix = format!("{namespace_id}:");
            let keys: Vec<String> = replicas
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                replicas.remove(key.as_str()).map_err(map_err!(Write))?;
                replicas_removed += 1;
            }

            let mut indices = txn.open_table(INDICES).map_err(map_err!(Table))?;
            let mut detached = Vec::new();
            for entry in indices.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let shard: IndexShard =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if shard.namespace_id == namespace_id && shard.replica_id.is_some() {
                    detached.push(shard);
                }
            }
            for mut shard in detached {
                shard.replica_id = None;
                let key = shard.id.to_string();
                let value = serde_json::to_vec(&shard).map_err(map_err!(Serialize))?;
                indices
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                indices_detached += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            namespace_id,
            replicas_removed, indices_detached, "namespace destroyed"
        );
        Ok((replicas_removed, indices_detached))
    }

    // ── Replicas ───────────────────────────────────────────────────

    /// Get an existing replica for the namespace, or create one.
    ///
    /// Check and insert run inside a single write transaction, which stands
    /// in for the insert-on-conflict-select pattern: concurrent callers
    /// serialize on the writer and reconcile to the same replica.
    pub fn get_or_create_replica(
        &self,
        namespace_id: NamespaceId,
        now: u64,
    ) -> StateResult<Replica> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let replica;
        {
            let namespaces = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            let ns_key = namespace_id.to_string();
            if namespaces.get(ns_key.as_str()).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::Validation(format!(
                    "namespace {namespace_id} is not enabled for indexing"
                )));
            }

            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let prefix = format!("{namespace_id}:");
            let mut existing: Option<Replica> = None;
            for entry in replicas.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                let r: Replica =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                match &existing {
                    Some(prev) if prev.id <= r.id => {}
                    _ => existing = Some(r),
                }
            }

            replica = match existing {
                Some(r) => r,
                None => {
                    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
                    let current = meta
                        .get(ID_SEQUENCE)
                        .map_err(map_err!(Read))?
                        .map(|g| g.value())
                        .unwrap_or(0);
                    meta.insert(ID_SEQUENCE, current + 1)
                        .map_err(map_err!(Write))?;

                    let r = Replica {
                        id: current + 1,
                        namespace_id,
                        created_at: now,
                    };
                    let key = r.table_key();
                    let value = serde_json::to_vec(&r).map_err(map_err!(Serialize))?;
                    replicas
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    debug!(namespace_id, replica_id = r.id, "replica created");
                    r
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(replica)
    }

    /// List the replicas owned by a namespace.
    pub fn list_replicas_for_namespace(
        &self,
        namespace_id: NamespaceId,
    ) -> StateResult<Vec<Replica>> {
        let prefix = format!("{namespace_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let r: Replica =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(r);
            }
        }
        results.sort_by_key(|r| r.id);
        Ok(results)
    }

    // ── Index shards ───────────────────────────────────────────────

    /// Insert or update an index shard.
    pub fn put_index(&self, shard: &IndexShard) -> StateResult<()> {
        let key = shard.id.to_string();
        let value = serde_json::to_vec(shard).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INDICES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an index shard by id.
    pub fn get_index(&self, index_id: IndexId) -> StateResult<Option<IndexShard>> {
        let key = index_id.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INDICES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let shard: IndexShard =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(shard))
            }
            None => Ok(None),
        }
    }

    /// List all index shards.
    pub fn list_indices(&self) -> StateResult<Vec<IndexShard>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INDICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let shard: IndexShard =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(shard);
        }
        results.sort_by_key(|s| s.id);
        Ok(results)
    }

    /// List the index shards assigned to a node.
    pub fn list_indices_on_node(&self, node_id: &str) -> StateResult<Vec<IndexShard>> {
        let mut shards = self.list_indices()?;
        shards.retain(|s| s.node_id == node_id);
        Ok(shards)
    }

    /// List the index shards belonging to a replica.
    pub fn list_indices_for_replica(&self, replica_id: ReplicaId) -> StateResult<Vec<IndexShard>> {
        let mut shards = self.list_indices()?;
        shards.retain(|s| s.replica_id == Some(replica_id));
        Ok(shards)
    }

    /// Hard-delete an index shard.
    ///
    /// Rejected while any repository still references the shard
    /// (repositories must be deleted first), and unless the shard has
    /// reached a deletable state.
    pub fn delete_index(&self, index_id: IndexId) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut indices = txn.open_table(INDICES).map_err(map_err!(Table))?;
            let key = index_id.to_string();
            let shard: IndexShard = match indices.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(format!("index {index_id}"))),
            };
            if !shard.should_be_deleted() {
                return Err(StateError::Validation(format!(
                    "index {index_id} is {:?}, not deletable",
                    shard.state
                )));
            }

            let repositories = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            let prefix = format!("{index_id}:");
            for entry in repositories.iter().map_err(map_err!(Read))? {
                let (rkey, _) = entry.map_err(map_err!(Read))?;
                if rkey.value().starts_with(&prefix) {
                    return Err(StateError::ReferentialIntegrity(format!(
                        "index {index_id} still has repositories"
                    )));
                }
            }

            indices.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(index_id, "index deleted");
        Ok(())
    }

    // ── Repositories ───────────────────────────────────────────────

    /// Create a repository. Fails with `Conflict` if the (index, project)
    /// assignment already exists.
    pub fn create_repository(&self, repo: &Repository) -> StateResult<()> {
        let key = repo.table_key();
        let value = serde_json::to_vec(repo).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "repository already exists for index {} project {}",
                    repo.index_id, repo.project_id
                )));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or update a repository.
    pub fn put_repository(&self, repo: &Repository) -> StateResult<()> {
        let key = repo.table_key();
        let value = serde_json::to_vec(repo).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a repository by (index, project).
    pub fn get_repository(
        &self,
        index_id: IndexId,
        project_id: ProjectId,
    ) -> StateResult<Option<Repository>> {
        let key = repository_key(index_id, project_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let repo: Repository =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(repo))
            }
            None => Ok(None),
        }
    }

    /// List all repositories in an index.
    pub fn list_repositories_for_index(&self, index_id: IndexId) -> StateResult<Vec<Repository>> {
        let prefix = format!("{index_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let repo: Repository =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(repo);
            }
        }
        Ok(results)
    }

    /// List every repository.
    pub fn list_repositories(&self) -> StateResult<Vec<Repository>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let repo: Repository =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(repo);
        }
        Ok(results)
    }

    /// List the repositories assigned anywhere for a project.
    pub fn list_repositories_for_project(&self, project_id: ProjectId) -> StateResult<Vec<Repository>> {
        let mut repos = self.list_repositories()?;
        repos.retain(|r| r.project_id == project_id);
        Ok(repos)
    }

    /// Delete a repository. Returns true if it existed.
    pub fn delete_repository(
        &self,
        index_id: IndexId,
        project_id: ProjectId,
    ) -> StateResult<bool> {
        let key = repository_key(index_id, project_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Task partitions ────────────────────────────────────────────

    /// Insert or update a task partition.
    pub fn put_partition(&self, partition: &TaskPartition) -> StateResult<()> {
        let key = partition.id.to_string();
        let value = serde_json::to_vec(partition).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASK_PARTITIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List all task partitions, oldest first.
    pub fn list_partitions(&self) -> StateResult<Vec<TaskPartition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASK_PARTITIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let p: TaskPartition =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(p);
        }
        results.sort_by_key(|p| p.id);
        Ok(results)
    }

    /// The newest non-detached partition, if any.
    pub fn active_partition(&self) -> StateResult<Option<TaskPartition>> {
        let partitions = self.list_partitions()?;
        Ok(partitions.into_iter().filter(|p| !p.detached).next_back())
    }

    /// Open a new partition. New tasks land in the newest partition.
    pub fn create_partition(&self, now: u64) -> StateResult<TaskPartition> {
        let id = self.next_id()?;
        let partition = TaskPartition {
            id,
            created_at: now,
            detached: false,
            detached_at: None,
        };
        self.put_partition(&partition)?;
        debug!(partition_id = id, "task partition opened");
        Ok(partition)
    }

    /// Ensure an active partition exists, creating the first one if needed.
    pub fn ensure_active_partition(&self, now: u64) -> StateResult<TaskPartition> {
        match self.active_partition()? {
            Some(p) => Ok(p),
            None => self.create_partition(now),
        }
    }

    /// Detach a partition: marks it detached and drops its task rows.
    /// Returns the number of rows purged. The caller is responsible for
    /// checking the detachment predicate first.
    pub fn detach_partition(&self, partition_id: PartitionId, now: u64) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut purged = 0u32;
        {
            let mut partitions = txn.open_table(TASK_PARTITIONS).map_err(map_err!(Table))?;
            let key = partition_id.to_string();
            let mut partition: TaskPartition =
                match partitions.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?,
                    None => {
                        return Err(StateError::NotFound(format!(
                            "partition {partition_id}"
                        )))
                    }
                };
            partition.detached = true;
            partition.detached_at = Some(now);
            let value = serde_json::to_vec(&partition).map_err(map_err!(Serialize))?;
            partitions
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let prefix = format!("{partition_id}:");
            let keys: Vec<String> = tasks
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                tasks.remove(key.as_str()).map_err(map_err!(Write))?;
                purged += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(partition_id, purged, "task partition detached");
        Ok(purged)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a task.
    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        let key = task.table_key();
        let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a task by (partition, task id).
    pub fn get_task(
        &self,
        partition_id: PartitionId,
        task_id: TaskId,
    ) -> StateResult<Option<Task>> {
        let key = format!("{partition_id}:{task_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let task: Task =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// List the tasks in one partition.
    pub fn list_tasks_in_partition(&self, partition_id: PartitionId) -> StateResult<Vec<Task>> {
        let prefix = format!("{partition_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let task: Task =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(task);
            }
        }
        results.sort_by_key(|t| t.id);
        Ok(results)
    }

    /// List every task across all partitions.
    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let task: Task =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(task);
        }
        results.sort_by_key(|t| t.id);
        Ok(results)
    }

    /// Write a batch of tasks and repositories in one transaction.
    ///
    /// Used for bulk task creation (tasks plus repository state
    /// transitions commit together or not at all), for claiming a dequeue
    /// batch, and for applying precomputed task classifications.
    pub fn put_tasks_and_repositories(
        &self,
        tasks: &[Task],
        repositories: &[Repository],
    ) -> StateResult<()> {
        self.apply_task_outcomes(tasks, repositories, &[])
    }

    /// Write task updates, repository updates, and repository deletions in
    /// one transaction. Deletions serve completed delete tasks: the
    /// repository row goes away together with the task's terminal state.
    pub fn apply_task_outcomes(
        &self,
        tasks: &[Task],
        repositories: &[Repository],
        repository_deletes: &[(IndexId, ProjectId)],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut task_table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            for task in tasks {
                let key = task.table_key();
                let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
                task_table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            let mut repo_table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            for repo in repositories {
                let key = repo.table_key();
                let value = serde_json::to_vec(repo).map_err(map_err!(Serialize))?;
                repo_table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            for &(index_id, project_id) in repository_deletes {
                let key = repository_key(index_id, project_id);
                repo_table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}
