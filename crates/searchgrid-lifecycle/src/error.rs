//! Lifecycle error types.

use thiserror::Error;

use searchgrid_state::{IndexId, IndexState, ProjectId, ReplicaId};

/// Errors that can occur during repository/task lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("index not found: {0}")]
    IndexNotFound(IndexId),

    #[error(
        "project {project_id} is already assigned to index {other_index_id} \
         of replica {replica_id}"
    )]
    DuplicateAssignment {
        project_id: ProjectId,
        replica_id: ReplicaId,
        other_index_id: IndexId,
    },

    #[error("index {index_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        index_id: IndexId,
        from: IndexState,
        to: IndexState,
    },

    #[error("state store error: {0}")]
    State(#[from] searchgrid_state::StateError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
