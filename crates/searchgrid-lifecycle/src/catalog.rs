//! Project catalog — the controller's view of the external project system.
//!
//! The controller never owns project records; it only needs to know whether
//! a project still exists and whether it has any content to index. The
//! catalog is injected so tests (and embedders) can supply their own view.

use std::collections::HashMap;

use searchgrid_state::ProjectId;

/// Answers existence and content questions about projects.
pub trait ProjectCatalog {
    /// Whether the project still exists.
    fn exists(&self, project_id: ProjectId) -> bool;

    /// Whether the project has an underlying content repository. A project
    /// without content is a valid indexing no-op, not a failure.
    fn has_content(&self, project_id: ProjectId) -> bool;
}

/// A fixed map of projects: `project_id → has_content`. Absent ids do not
/// exist. Serves tests and single-process embeddings.
#[derive(Debug, Clone, Default)]
pub struct StaticProjectCatalog {
    projects: HashMap<ProjectId, bool>,
}

impl StaticProjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a project and whether it has content.
    pub fn insert(&mut self, project_id: ProjectId, has_content: bool) {
        self.projects.insert(project_id, has_content);
    }

    /// Remove a project, as if it were deleted externally.
    pub fn remove(&mut self, project_id: ProjectId) {
        self.projects.remove(&project_id);
    }
}

impl ProjectCatalog for StaticProjectCatalog {
    fn exists(&self, project_id: ProjectId) -> bool {
        self.projects.contains_key(&project_id)
    }

    fn has_content(&self, project_id: ProjectId) -> bool {
        self.projects.get(&project_id).copied().unwrap_or(false)
    }
}
