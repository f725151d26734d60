//! Repository and task lifecycle — bulk scheduling, ordered dequeue, and
//! partition retention.
//!
//! Tasks are created in bulk by the scheduler tick, claimed by an ordered
//! dequeue that guarantees at most one outstanding task per project, and
//! resolved through precomputed classifications so the processing loop
//! never halts on one bad row. The task log is time-partitioned; stale
//! partitions are detached once nothing in them is in flight.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use searchgrid_state::*;

use crate::catalog::ProjectCatalog;
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult};

/// Classification of a task against its backing repository, computed
/// before any mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Claimable: dispatch to the node agent.
    Valid,
    /// Terminal skip: the repository is failed or on its way out.
    Skipped,
    /// Terminal: the project or backing repository no longer exists.
    Orphaned,
    /// Immediate success: nothing to index is a valid outcome.
    Done,
}

/// Pure classification of one task. Side-effect-free so a whole batch can
/// be precomputed against a read snapshot before anything commits.
///
/// Delete tasks always proceed: cleanup must still be attempted even when
/// the project or repository is gone.
pub fn determine_task_state(
    task: &Task,
    repository: Option<&Repository>,
    catalog: &dyn ProjectCatalog,
) -> TaskDisposition {
    let Some(repo) = repository else {
        return match task.task_type {
            TaskType::IndexRepo => TaskDisposition::Orphaned,
            TaskType::DeleteRepo => TaskDisposition::Valid,
        };
    };

    if !catalog.exists(repo.project_id) {
        return match task.task_type {
            TaskType::IndexRepo => TaskDisposition::Orphaned,
            TaskType::DeleteRepo => TaskDisposition::Valid,
        };
    }

    if matches!(
        repo.state,
        RepositoryState::Failed | RepositoryState::PendingDeletion
    ) {
        return match task.task_type {
            TaskType::IndexRepo => TaskDisposition::Skipped,
            TaskType::DeleteRepo => TaskDisposition::Valid,
        };
    }

    if task.task_type == TaskType::IndexRepo && !catalog.has_content(repo.project_id) {
        return TaskDisposition::Done;
    }

    TaskDisposition::Valid
}

/// What `advance_partitions` did in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionReport {
    /// Newly opened partition, if the active one aged out.
    pub opened: Option<PartitionId>,
    /// Partitions detached (rows purged) in this pass.
    pub detached: Vec<PartitionId>,
}

/// Drives repository membership and the task queue.
pub struct TaskLifecycle {
    state: StateStore,
    config: LifecycleConfig,
}

impl TaskLifecycle {
    /// Create a lifecycle controller with default configuration.
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            config: LifecycleConfig::default(),
        }
    }

    /// Override the lifecycle configuration.
    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ── Repositories ───────────────────────────────────────────────

    /// Get or create the repository assigning a project to an index.
    ///
    /// New repositories start `pending`. Assigning a project to a second
    /// index of the same replica is rejected unless one of the two shards
    /// is mid-reallocation. Concurrent creations are not specially
    /// handled: the (index, project) key is the safety net and callers
    /// retry on `Conflict`.
    pub fn find_or_create_repository(
        &self,
        index_id: IndexId,
        project_id: ProjectId,
        now: u64,
    ) -> LifecycleResult<Repository> {
        if let Some(existing) = self.state.get_repository(index_id, project_id)? {
            return Ok(existing);
        }

        let shard = self
            .state
            .get_index(index_id)?
            .ok_or(LifecycleError::IndexNotFound(index_id))?;

        if let Some(replica_id) = shard.replica_id {
            for sibling in self.state.list_indices_for_replica(replica_id)? {
                if sibling.id == index_id {
                    continue;
                }
                let occupied = self
                    .state
                    .get_repository(sibling.id, project_id)?
                    .is_some();
                let mid_reallocation = sibling.state == IndexState::Reallocating
                    || shard.state == IndexState::Reallocating;
                if occupied && !mid_reallocation {
                    return Err(LifecycleError::DuplicateAssignment {
                        project_id,
                        replica_id,
                        other_index_id: sibling.id,
                    });
                }
            }
        }

        let repo = Repository {
            index_id,
            project_id,
            state: RepositoryState::Pending,
            size_bytes: 0,
            schema_version: self.config.current_schema_version,
            retries_left: self.config.default_retries,
            created_at: now,
            updated_at: now,
        };
        self.state.create_repository(&repo)?;
        debug!(index_id, project_id, "repository created");
        Ok(repo)
    }

    // ── Index transitions ──────────────────────────────────────────

    /// Move a ready index into `reallocating` — the only state in which a
    /// project may be assigned to two indices of the same replica while
    /// it moves between them.
    pub fn begin_reallocation(&self, index_id: IndexId, now: u64) -> LifecycleResult<IndexShard> {
        self.transition_index(index_id, IndexState::Ready, IndexState::Reallocating, now)
    }

    /// Return a reallocating index to `ready` once the move settled.
    pub fn complete_reallocation(
        &self,
        index_id: IndexId,
        now: u64,
    ) -> LifecycleResult<IndexShard> {
        self.transition_index(index_id, IndexState::Reallocating, IndexState::Ready, now)
    }

    /// Bring a provisioned index into service once its repositories have
    /// loaded.
    pub fn mark_index_ready(&self, index_id: IndexId, now: u64) -> LifecycleResult<IndexShard> {
        let shard = self
            .state
            .get_index(index_id)?
            .ok_or(LifecycleError::IndexNotFound(index_id))?;
        match shard.state {
            IndexState::Ready => Ok(shard),
            IndexState::Pending | IndexState::Initializing => {
                self.transition_index(index_id, shard.state, IndexState::Ready, now)
            }
            other => Err(LifecycleError::InvalidTransition {
                index_id,
                from: other,
                to: IndexState::Ready,
            }),
        }
    }

    /// Administratively mark an index for removal. Its repositories drain
    /// through delete tasks before the shard itself is hard-deleted.
    pub fn mark_index_pending_deletion(
        &self,
        index_id: IndexId,
        now: u64,
    ) -> LifecycleResult<IndexShard> {
        let mut shard = self
            .state
            .get_index(index_id)?
            .ok_or(LifecycleError::IndexNotFound(index_id))?;
        if shard.state == IndexState::PendingDeletion {
            return Ok(shard);
        }
        shard.state = IndexState::PendingDeletion;
        shard.updated_at = now;
        self.state.put_index(&shard)?;
        info!(index_id, "index marked for deletion");
        Ok(shard)
    }

    fn transition_index(
        &self,
        index_id: IndexId,
        from: IndexState,
        to: IndexState,
        now: u64,
    ) -> LifecycleResult<IndexShard> {
        let mut shard = self
            .state
            .get_index(index_id)?
            .ok_or(LifecycleError::IndexNotFound(index_id))?;
        if shard.state != from {
            return Err(LifecycleError::InvalidTransition {
                index_id,
                from: shard.state,
                to,
            });
        }
        shard.state = to;
        shard.updated_at = now;
        self.state.put_index(&shard)?;
        debug!(index_id, ?from, ?to, "index transitioned");
        Ok(shard)
    }

    /// Repositories that need (re-)indexing: pending, or ready at a stale
    /// schema version.
    pub fn should_be_indexed(&self) -> StateResult<Vec<Repository>> {
        let mut repos = self.state.list_repositories()?;
        repos.retain(|r| {
            r.state == RepositoryState::Pending
                || (r.state == RepositoryState::Ready
                    && r.schema_version != self.config.current_schema_version)
        });
        Ok(repos)
    }

    // ── Bulk task creation ─────────────────────────────────────────

    /// Create one task per eligible repository, transitioning the
    /// repositories in the same write transaction: either all tasks and
    /// state transitions commit, or none do.
    ///
    /// Repositories with a task of the same type already in flight are
    /// skipped, which makes the scheduler tick safe to re-run at any time.
    pub fn create_bulk_tasks(
        &self,
        task_type: TaskType,
        now: u64,
    ) -> LifecycleResult<Vec<Task>> {
        let partition = self.state.ensure_active_partition(now)?;
        let all_tasks = self.state.list_tasks()?;

        let in_flight: HashSet<(IndexId, ProjectId, TaskType)> = all_tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Processing))
            .map(|t| (t.index_id, t.project_id, t.task_type))
            .collect();
        let has_any_task: HashSet<(IndexId, ProjectId)> = all_tasks
            .iter()
            .map(|t| (t.index_id, t.project_id))
            .collect();

        let mut selected: Vec<Repository> = match task_type {
            TaskType::IndexRepo => self
                .should_be_indexed()?
                .into_iter()
                .filter(|r| !in_flight.contains(&(r.index_id, r.project_id, task_type)))
                .collect(),
            TaskType::DeleteRepo => self
                .state
                .list_repositories()?
                .into_iter()
                .filter(|r| match r.state {
                    RepositoryState::Failed => {
                        !in_flight.contains(&(r.index_id, r.project_id, task_type))
                    }
                    // Repositories already marked for removal but never
                    // scheduled at all.
                    RepositoryState::Orphaned | RepositoryState::PendingDeletion => {
                        !has_any_task.contains(&(r.index_id, r.project_id))
                    }
                    _ => false,
                })
                .collect(),
        };
        selected.sort_by_key(|r| (r.index_id, r.project_id));

        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self.state.next_ids(selected.len() as u64)?;
        let mut tasks = Vec::with_capacity(selected.len());
        let mut repos = Vec::with_capacity(selected.len());
        for (repo, id) in selected.into_iter().zip(ids) {
            tasks.push(Task {
                id,
                partition_id: partition.id,
                index_id: repo.index_id,
                project_id: repo.project_id,
                task_type,
                state: TaskState::Pending,
                perform_at: now,
                retries_left: self.config.default_retries,
                created_at: now,
                updated_at: now,
            });
            let mut repo = repo;
            repo.state = match task_type {
                TaskType::IndexRepo => RepositoryState::Initializing,
                TaskType::DeleteRepo => RepositoryState::PendingDeletion,
            };
            repo.updated_at = now;
            repos.push(repo);
        }

        self.state.put_tasks_and_repositories(&tasks, &repos)?;
        info!(?task_type, count = tasks.len(), "bulk tasks created");
        Ok(tasks)
    }

    // ── Dequeue ────────────────────────────────────────────────────

    /// Dequeue up to `limit` due tasks, earliest `perform_at` first (ties
    /// by task id), at most one per project, claiming each into
    /// `processing`. Tasks classified terminal by `determine_task_state`
    /// are resolved instead of claimed, so one bad row never stalls the
    /// queue. Already-failed tasks are never re-claimed.
    ///
    /// Classification runs against a read snapshot; claims and terminal
    /// resolutions then commit in a single write transaction. There is no
    /// max-processing-duration: a claim that never reports back is bounded
    /// only by `retries_left` and partition retention.
    pub fn each_task_for_processing(
        &self,
        limit: usize,
        now: u64,
        catalog: &dyn ProjectCatalog,
    ) -> LifecycleResult<Vec<Task>> {
        let partitions = self.state.list_partitions()?;
        let mut pending: Vec<Task> = Vec::new();
        let mut busy_projects: HashSet<ProjectId> = HashSet::new();
        for partition in partitions.iter().filter(|p| !p.detached) {
            for task in self.state.list_tasks_in_partition(partition.id)? {
                match task.state {
                    TaskState::Pending if task.perform_at <= now => pending.push(task),
                    TaskState::Processing => {
                        busy_projects.insert(task.project_id);
                    }
                    _ => {}
                }
            }
        }
        pending.sort_by_key(|t| (t.perform_at, t.id));

        let mut task_updates: Vec<Task> = Vec::new();
        let mut repo_updates: Vec<Repository> = Vec::new();
        let mut claimed: Vec<Task> = Vec::new();

        for mut task in pending {
            if claimed.len() >= limit {
                break;
            }
            if busy_projects.contains(&task.project_id) {
                continue;
            }

            let repo = self.state.get_repository(task.index_id, task.project_id)?;
            match determine_task_state(&task, repo.as_ref(), catalog) {
                TaskDisposition::Valid => {
                    task.state = TaskState::Processing;
                    task.updated_at = now;
                    busy_projects.insert(task.project_id);
                    claimed.push(task.clone());
                    task_updates.push(task);
                }
                TaskDisposition::Done => {
                    task.state = TaskState::Done;
                    task.updated_at = now;
                    if let Some(mut repo) = repo {
                        repo.state = RepositoryState::Ready;
                        repo.updated_at = now;
                        repo_updates.push(repo);
                    }
                    task_updates.push(task);
                }
                TaskDisposition::Skipped => {
                    task.state = TaskState::Skipped;
                    task.updated_at = now;
                    task_updates.push(task);
                }
                TaskDisposition::Orphaned => {
                    task.state = TaskState::Orphaned;
                    task.updated_at = now;
                    task_updates.push(task);
                }
            }
        }

        self.state
            .put_tasks_and_repositories(&task_updates, &repo_updates)?;
        debug!(
            claimed = claimed.len(),
            resolved = task_updates.len() - claimed.len(),
            "dequeue pass"
        );
        Ok(claimed)
    }

    /// Bulk-apply precomputed classifications. Every touched row shares
    /// one `now`. A `done` index task flips the backing repository to
    /// `ready`; a `done` delete task removes the repository row — the
    /// agent confirmed the data is gone, so the assignment goes with it.
    pub fn update_task_states(
        &self,
        states: &[(Task, TaskDisposition)],
        now: u64,
    ) -> LifecycleResult<()> {
        let mut task_updates: Vec<Task> = Vec::new();
        let mut repo_updates: Vec<Repository> = Vec::new();
        let mut repo_deletes: Vec<(IndexId, ProjectId)> = Vec::new();

        for (task, disposition) in states {
            let mut task = task.clone();
            task.updated_at = now;
            match disposition {
                TaskDisposition::Valid => continue,
                TaskDisposition::Done => {
                    task.state = TaskState::Done;
                    match task.task_type {
                        TaskType::IndexRepo => {
                            if let Some(mut repo) = self
                                .state
                                .get_repository(task.index_id, task.project_id)?
                            {
                                repo.state = RepositoryState::Ready;
                                repo.updated_at = now;
                                repo_updates.push(repo);
                            }
                        }
                        TaskType::DeleteRepo => {
                            repo_deletes.push((task.index_id, task.project_id));
                        }
                    }
                }
                TaskDisposition::Skipped => task.state = TaskState::Skipped,
                TaskDisposition::Orphaned => task.state = TaskState::Orphaned,
            }
            task_updates.push(task);
        }

        self.state
            .apply_task_outcomes(&task_updates, &repo_updates, &repo_deletes)?;
        Ok(())
    }

    /// Record a dispatch failure. The task returns to `pending` while it
    /// has retries left; once exhausted, task and repository both go
    /// `failed` (and stay there until explicit intervention).
    pub fn record_task_failure(&self, task: &Task, now: u64) -> LifecycleResult<Task> {
        let mut task = task.clone();
        task.retries_left = task.retries_left.saturating_sub(1);
        task.updated_at = now;

        let mut repo_updates = Vec::new();
        if task.retries_left == 0 {
            task.state = TaskState::Failed;
            if let Some(mut repo) =
                self.state.get_repository(task.index_id, task.project_id)?
            {
                repo.state = RepositoryState::Failed;
                repo.updated_at = now;
                repo_updates.push(repo);
            }
            warn!(
                task_id = task.id,
                project_id = task.project_id,
                "task retries exhausted"
            );
        } else {
            task.state = TaskState::Pending;
        }

        self.state
            .put_tasks_and_repositories(std::slice::from_ref(&task), &repo_updates)?;
        Ok(task)
    }

    // ── Partition retention ────────────────────────────────────────

    /// Roll the task log forward: open a new partition once the active
    /// one's oldest row ages out, and detach partitions that hold nothing
    /// in flight and are old enough (or empty).
    ///
    /// Rows whose index or node has vanished never block detachment — a
    /// dead node's leftovers must not pin retention forever.
    pub fn advance_partitions(&self, now: u64) -> LifecycleResult<PartitionReport> {
        let active = self.state.ensure_active_partition(now)?;
        let mut report = PartitionReport::default();

        let rows = self.state.list_tasks_in_partition(active.id)?;
        if let Some(oldest) = rows.iter().map(|t| t.created_at).min()
            && now.saturating_sub(oldest) > self.config.max_partition_age.as_secs()
        {
            let opened = self.state.create_partition(now)?;
            report.opened = Some(opened.id);
        }

        let newest_active = report.opened.unwrap_or(active.id);
        for partition in self.state.list_partitions()? {
            if partition.detached || partition.id == newest_active {
                continue;
            }
            let rows = self.state.list_tasks_in_partition(partition.id)?;

            let mut blocked = false;
            for task in rows.iter().filter(|t| t.state.blocks_detach()) {
                if self.node_present_for(task)? {
                    blocked = true;
                    break;
                }
            }
            if blocked {
                continue;
            }

            let old_enough = match rows.iter().map(|t| t.updated_at).max() {
                None => true,
                Some(newest) => {
                    now.saturating_sub(newest) > self.config.detach_after.as_secs()
                }
            };
            if old_enough {
                self.state.detach_partition(partition.id, now)?;
                report.detached.push(partition.id);
            }
        }

        Ok(report)
    }

    /// Whether the task's index still resolves to a registered node.
    fn node_present_for(&self, task: &Task) -> StateResult<bool> {
        match self.state.get_index(task.index_id)? {
            Some(shard) => Ok(self.state.get_node(&shard.node_id)?.is_some()),
            None => Ok(false),
        }
    }
}
