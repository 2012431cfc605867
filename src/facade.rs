//! The surface the agent execution runtime holds.
//!
//! Everything is keyed by agent id. Callers get back a directory path and
//! plain summaries; branch names, commit ids, and workspace ids stay inside
//! the engine.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::error::EngineError;
use crate::lifecycle::WorkspaceManager;
use crate::model::records::Workspace;
use crate::model::types::{AgentId, WorkspaceStatus};
use crate::registry::WorkspaceFilter;

/// How an agent's workspace is released without merging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// The task was cancelled.
    Abandoned,
    /// The agent failed; its work is auto-checkpointed first if configured.
    Failed,
}

/// Result of [`RuntimeFacade::checkpoint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub iteration: u32,
    pub files_changed: u32,
}

/// Result of [`RuntimeFacade::merge`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub status: WorkspaceStatus,
    /// Paths resolved newest-wins, sorted.
    pub conflicted_paths: Vec<String>,
}

/// Agent-keyed access to the workspace engine.
#[derive(Debug, Clone)]
pub struct RuntimeFacade {
    manager: Arc<WorkspaceManager>,
}

impl RuntimeFacade {
    #[must_use]
    pub const fn new(manager: Arc<WorkspaceManager>) -> Self {
        Self { manager }
    }

    /// Allocate a workspace for `agent` and return its directory.
    ///
    /// With `parent_agent`, the workspace starts from that agent's active
    /// workspace, or from its most recent one if none is active.
    ///
    /// # Errors
    /// Any allocation error, or `InvalidInput` if `parent_agent` owns no
    /// workspace.
    pub fn allocate(&self, agent: &str, parent_agent: Option<&str>) -> Result<PathBuf, EngineError> {
        let agent = AgentId::new(agent)?;
        let parent = match parent_agent {
            None => None,
            Some(name) => {
                let parent_agent = AgentId::new(name)?;
                let found = match self.manager.active_workspace_for(&parent_agent)? {
                    Some(ws) => Some(ws),
                    None => self.manager.latest_workspace_for(&parent_agent)?,
                };
                Some(found.ok_or_else(|| EngineError::InvalidInput {
                    detail: format!("agent '{parent_agent}' has no workspace to start from"),
                })?)
            }
        };
        let allocation = self
            .manager
            .create_workspace(&agent, parent.as_ref().map(|ws| &ws.id))?;
        Ok(allocation.working_directory)
    }

    /// Checkpoint the agent's active workspace.
    ///
    /// # Errors
    /// `InvalidInput` if the agent has no active workspace, or any
    /// checkpoint error.
    pub fn checkpoint(
        &self,
        agent: &str,
        label: Option<&str>,
    ) -> Result<CheckpointSummary, EngineError> {
        let ws = self.active(agent)?;
        let commit = self.manager.checkpoint(&ws.id, label)?;
        Ok(CheckpointSummary {
            iteration: commit.iteration,
            files_changed: commit.files_changed,
        })
    }

    /// Merge the agent's active workspace back into its parent.
    ///
    /// # Errors
    /// `InvalidInput` if the agent has no active workspace, or any merge
    /// error.
    pub fn merge(&self, agent: &str) -> Result<MergeSummary, EngineError> {
        let ws = self.active(agent)?;
        let result = self.manager.merge_to_parent(&ws.id)?;
        Ok(MergeSummary {
            status: result.status,
            conflicted_paths: result
                .resolution
                .conflicts
                .into_iter()
                .map(|c| c.file_path)
                .collect(),
        })
    }

    /// Release the agent's active workspace without merging. A no-op if the
    /// agent has no active workspace.
    ///
    /// # Errors
    /// Any registry failure.
    pub fn release(&self, agent: &str, how: Release) -> Result<(), EngineError> {
        let agent = AgentId::new(agent)?;
        let Some(ws) = self.manager.active_workspace_for(&agent)? else {
            return Ok(());
        };
        match how {
            Release::Abandoned => {
                self.manager
                    .abandon_workspace(&ws.id, Some("released by runtime"))?;
            }
            Release::Failed => {
                self.manager
                    .fail_workspace(&ws.id, Some("agent failed"))?;
            }
        }
        Ok(())
    }

    /// Delete the directory of the agent's most recent finished workspace
    /// and return the bytes reclaimed. Already-cleaned workspaces reclaim 0.
    ///
    /// # Errors
    /// `InvalidInput` if the agent has no finished workspace, or any cleanup
    /// error.
    pub fn cleanup(&self, agent: &str, preserve_history: bool) -> Result<u64, EngineError> {
        let agent = AgentId::new(agent)?;
        let finished = self
            .manager
            .list_workspaces(&WorkspaceFilter {
                status: None,
                agent: Some(agent.clone()),
            })?
            .into_iter()
            .rev()
            .find(|ws| ws.status != WorkspaceStatus::Active)
            .ok_or_else(|| EngineError::InvalidInput {
                detail: format!("agent '{agent}' has no finished workspace"),
            })?;
        let result = self
            .manager
            .cleanup_workspace(&finished.id, preserve_history)?;
        Ok(result.reclaimed_bytes)
    }

    fn active(&self, agent: &str) -> Result<Workspace, EngineError> {
        let agent = AgentId::new(agent)?;
        self.manager
            .active_workspace_for(&agent)?
            .ok_or_else(|| EngineError::InvalidInput {
                detail: format!("agent '{agent}' has no active workspace"),
            })
    }
}
