//! Lifecycle manager: the boundary every workspace operation goes through.
//!
//! [`WorkspaceManager`] owns the snapshot store, the registry, and the
//! keyed locks, whose lock files sit beside the registry so separate
//! processes on one registry exclude each other too. It is `Sync`; share it
//! behind an `Arc`. Store and
//! registry failures are translated into [`EngineError`] here and nowhere
//! else.
//!
//! Locking: every mutation of a workspace holds `ws:<id>`. Merges
//! additionally hold `target:<branch>` and take it first (see
//! [`crate::merge`]).

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::locks::{KeyGuard, KeyedLocks, workspace_key};
use crate::model::records::{ChangeSet, Commit, MergeConflictResolution, Workspace};
use crate::model::types::{
    AgentId, CommitKind, GitOid, WorkspaceId, WorkspaceStatus, now_unix_ms,
};
use crate::registry::{NewCommit, Registry, RegistryError, WorkspaceFilter};
use crate::store::{self, Identity, SnapshotStore, StoreError, refs};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What `create_workspace` hands back.
///
/// Only `working_directory` is meant for the agent runtime; the rest is for
/// operators and tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub workspace_id: WorkspaceId,
    pub working_directory: PathBuf,
    pub branch: String,
    pub base_point: GitOid,
}

/// What happened to a cleaned workspace's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "history", rename_all = "snake_case")]
pub enum HistoryDisposition {
    /// The branch was moved under the archive namespace.
    Archived { reference: String },
    /// The branch was deleted.
    Deleted,
}

/// Outcome of `cleanup_workspace`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupResult {
    pub workspace_id: WorkspaceId,
    pub reclaimed_bytes: u64,
    #[serde(flatten)]
    pub history: HistoryDisposition,
}

/// Default label for a checkpoint created without one.
#[must_use]
pub fn default_checkpoint_label(agent: &AgentId, iteration: u32) -> String {
    format!("[agent {agent}] iteration {iteration} - ready for validation")
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Creates, checkpoints, merges, abandons, and cleans up workspaces.
#[derive(Debug)]
pub struct WorkspaceManager {
    pub(crate) config: EngineConfig,
    pub(crate) store: SnapshotStore,
    pub(crate) registry: Registry,
    pub(crate) locks: KeyedLocks,
}

impl WorkspaceManager {
    /// Open the repository and registry named by `config`.
    ///
    /// When the workspace or registry directories live inside the
    /// repository they are added to `info/exclude`, so checkpoints of the
    /// main checkout never pick them up.
    ///
    /// # Errors
    /// `Internal` if the repository or registry cannot be opened.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let registry = Registry::open(&config.workspace.registry)
            .map_err(|e| EngineError::registry("open registry", &e))?;
        Self::with_registry(config, registry)
    }

    /// Open the repository named by `config` with an already-open registry.
    ///
    /// # Errors
    /// `Internal` if the repository cannot be opened.
    pub fn with_registry(config: EngineConfig, registry: Registry) -> Result<Self, EngineError> {
        let store = SnapshotStore::open(&config.repo.path, Identity::from(&config.identity))
            .map_err(|e| EngineError::store("open repository", &e))?;

        let mut internal_dirs = vec![config.workspace.base_dir.clone()];
        if let Some(dir) = config.workspace.registry.parent() {
            internal_dirs.push(dir.to_owned());
        }
        for dir in internal_dirs {
            if let Some(pattern) = exclude_pattern(store.root(), &dir) {
                store
                    .exclude(&pattern)
                    .map_err(|e| EngineError::store("update info/exclude", &e))?;
            }
        }

        let lock_dir = config.workspace.registry.with_extension("locks");
        let locks = KeyedLocks::in_dir(&lock_dir).map_err(|e| EngineError::Internal {
            operation: "create lock directory".to_owned(),
            detail: format!("{}: {e}", lock_dir.display()),
        })?;

        Ok(Self {
            config,
            store,
            registry,
            locks,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Repository root.
    #[must_use]
    pub fn repo_root(&self) -> &Path {
        self.store.root()
    }

    pub(crate) fn lock_workspace(&self, id: &WorkspaceId) -> Result<KeyGuard<'_>, EngineError> {
        self.locks
            .lock(&workspace_key(id.as_str()))
            .map_err(|e| EngineError::Internal {
                operation: format!("lock workspace '{id}'"),
                detail: e.to_string(),
            })
    }

    pub(crate) fn require(&self, id: &WorkspaceId) -> Result<Workspace, EngineError> {
        self.registry
            .get(id)
            .map_err(|e| EngineError::registry("read workspace", &e))?
            .ok_or_else(|| EngineError::WorkspaceNotFound { id: id.clone() })
    }

    pub(crate) fn require_active(&self, id: &WorkspaceId) -> Result<Workspace, EngineError> {
        let ws = self.require(id)?;
        if ws.status != WorkspaceStatus::Active {
            return Err(EngineError::WorkspaceNotActive {
                id: ws.id,
                status: ws.status,
            });
        }
        Ok(ws)
    }

    // -- allocation --

    /// Allocate a workspace for `agent`, rooted at the head of main history
    /// or at the latest commit of `parent`.
    ///
    /// The returned directory's files match `base_point` exactly. On any
    /// materialization failure the branch, directory, and registry row are
    /// removed before the error is returned.
    ///
    /// # Errors
    /// `DuplicateActiveWorkspace`, `ParentNotFound`, `ParentUnusable`,
    /// `AncestryTooDeep`, `DiskCapacityExceeded`, `WorkspaceLimitReached`,
    /// or `WorkspaceAllocationFailed`.
    #[instrument(skip_all, fields(agent = %agent, parent = parent.map(WorkspaceId::as_str)))]
    pub fn create_workspace(
        &self,
        agent: &AgentId,
        parent: Option<&WorkspaceId>,
    ) -> Result<Allocation, EngineError> {
        if let Some(existing) = self
            .registry
            .active_for_agent(agent)
            .map_err(|e| EngineError::registry("create workspace", &e))?
        {
            return Err(EngineError::DuplicateActiveWorkspace {
                agent: agent.clone(),
                existing: existing.id,
            });
        }

        let (parent_id, depth, base_point) = match parent {
            None => {
                let head = self
                    .store
                    .branch_head(&self.config.repo.branch)
                    .map_err(|e| allocation_failed(agent, &e.to_string()))?;
                (None, 0, head)
            }
            Some(pid) => {
                let (depth, head) = self.parent_base(pid)?;
                (Some(pid.clone()), depth, head)
            }
        };

        if let Some(ceiling) = self.config.retention.disk_hard_ceiling_bytes {
            let used = self.total_disk_usage()?;
            if used > ceiling {
                return Err(EngineError::DiskCapacityExceeded {
                    used_bytes: used,
                    ceiling_bytes: ceiling,
                });
            }
        }

        let id = WorkspaceId::generate();
        let now = now_unix_ms();
        let mut ws = Workspace {
            branch: refs::workspace_branch(&id),
            working_directory: self.config.workspace.base_dir.join(id.as_str()),
            id,
            agent_id: agent.clone(),
            parent_id,
            base_point,
            status: WorkspaceStatus::Active,
            ancestry_depth: depth,
            created_at_ms: now,
            updated_at_ms: now,
            disk_bytes_estimate: 0,
            archive_ref: None,
            status_reason: None,
        };

        self.registry
            .reserve_workspace(&ws, self.config.workspace.max_concurrent)
            .map_err(|e| self.reservation_failed(agent, e))?;

        if let Err(e) = self.materialize(&ws) {
            self.rollback_allocation(&ws);
            return Err(allocation_failed(agent, &e.to_string()));
        }

        ws.disk_bytes_estimate = store::disk_usage(&ws.working_directory);
        if let Err(e) = self
            .registry
            .set_disk_estimate(&ws.id, ws.disk_bytes_estimate)
        {
            warn!(workspace = %ws.id, error = %e, "could not record disk estimate");
        }

        info!(
            workspace = %ws.id,
            base = ws.base_point.short(),
            depth = ws.ancestry_depth,
            bytes = ws.disk_bytes_estimate,
            "workspace allocated"
        );
        Ok(Allocation {
            workspace_id: ws.id,
            working_directory: ws.working_directory,
            branch: ws.branch,
            base_point: ws.base_point,
        })
    }

    /// Depth and base point for a child of `pid`.
    fn parent_base(&self, pid: &WorkspaceId) -> Result<(u32, GitOid), EngineError> {
        // Holding the parent's lock keeps a checkpoint from landing halfway
        // through the read of its head.
        let _guard = self.lock_workspace(pid)?;
        let parent = self
            .registry
            .get(pid)
            .map_err(|e| EngineError::registry("read parent workspace", &e))?
            .ok_or_else(|| EngineError::ParentNotFound { parent: pid.clone() })?;
        if !(parent.status == WorkspaceStatus::Active || parent.status.is_merged()) {
            return Err(EngineError::ParentUnusable {
                parent: parent.id,
                status: parent.status,
            });
        }

        let depth = parent.ancestry_depth + 1;
        if depth > self.config.workspace.max_ancestry_depth {
            return Err(EngineError::AncestryTooDeep {
                parent: parent.id,
                depth,
                max: self.config.workspace.max_ancestry_depth,
            });
        }

        let head = self
            .store
            .branch_head(&parent.branch)
            .map_err(|e| EngineError::store("read parent head", &e))?;
        Ok((depth, head))
    }

    fn materialize(&self, ws: &Workspace) -> Result<(), StoreError> {
        self.store.create_branch(&ws.branch, &ws.base_point)?;
        self.store.add_worktree(&ws.working_directory, &ws.branch)?;
        let head = self.store.worktree_head(&ws.working_directory)?;
        if head != ws.base_point {
            return Err(StoreError::MalformedOutput {
                command: "git worktree add".to_owned(),
                detail: format!("worktree HEAD {head} does not match base {}", ws.base_point),
            });
        }
        Ok(())
    }

    fn rollback_allocation(&self, ws: &Workspace) {
        warn!(workspace = %ws.id, "rolling back partial allocation");
        if let Err(e) = self.store.remove_worktree(&ws.working_directory) {
            warn!(workspace = %ws.id, error = %e, "could not remove partial directory");
        }
        if let Err(e) = self.store.delete_branch(&ws.branch) {
            warn!(workspace = %ws.id, error = %e, "could not delete partial branch");
        }
        if let Err(e) = self.registry.remove_workspace(&ws.id) {
            warn!(workspace = %ws.id, error = %e, "could not remove reserved row");
        }
    }

    fn reservation_failed(&self, agent: &AgentId, err: RegistryError) -> EngineError {
        match err {
            RegistryError::DuplicateActive { .. } => {
                match self.registry.active_for_agent(agent) {
                    Ok(Some(existing)) => EngineError::DuplicateActiveWorkspace {
                        agent: agent.clone(),
                        existing: existing.id,
                    },
                    _ => allocation_failed(agent, "a concurrent allocation for this agent won"),
                }
            }
            RegistryError::LimitReached { limit } => EngineError::WorkspaceLimitReached { limit },
            other => EngineError::registry("reserve workspace", &other),
        }
    }

    // -- checkpoints --

    /// Commit everything in the workspace's directory as the next iteration.
    ///
    /// With no `label`, the commit message is
    /// `"[agent <id>] iteration <n> - ready for validation"`.
    ///
    /// # Errors
    /// `WorkspaceNotFound`, `WorkspaceNotActive`, or `ResourceExhausted`
    /// when the disk fills (the branch and index are left as they were).
    #[instrument(skip_all, fields(workspace = %id))]
    pub fn checkpoint(&self, id: &WorkspaceId, label: Option<&str>) -> Result<Commit, EngineError> {
        let _guard = self.lock_workspace(id)?;
        let ws = self.require_active(id)?;
        self.checkpoint_locked(&ws, label, CommitKind::Checkpoint)
    }

    /// Caller holds `ws:<id>` and has checked the workspace is active.
    pub(crate) fn checkpoint_locked(
        &self,
        ws: &Workspace,
        label: Option<&str>,
        kind: CommitKind,
    ) -> Result<Commit, EngineError> {
        let previous = self
            .store
            .worktree_head(&ws.working_directory)
            .map_err(|e| EngineError::store("checkpoint", &e))?;
        let iteration = self
            .registry
            .commits(&ws.id)
            .map_err(|e| EngineError::registry("checkpoint", &e))?
            .last()
            .map_or(1, |c| c.iteration + 1);
        let message = label.map_or_else(
            || default_checkpoint_label(&ws.agent_id, iteration),
            str::to_owned,
        );

        let commit_id = self
            .store
            .commit_all(&ws.working_directory, &message)
            .map_err(|e| EngineError::store("checkpoint", &e))?;

        let recorded = self
            .store
            .files_changed(&commit_id)
            .map_err(|e| EngineError::store("checkpoint", &e))
            .and_then(|files_changed| {
                self.registry
                    .record_commit(&NewCommit {
                        workspace_id: &ws.id,
                        commit_id: &commit_id,
                        kind,
                        message: &message,
                        files_changed,
                        created_at_ms: now_unix_ms(),
                    })
                    .map_err(|e| EngineError::registry("checkpoint", &e))
            });
        let commit = match recorded {
            Ok(commit) => commit,
            Err(err) => {
                warn!(workspace = %ws.id, commit = commit_id.short(), "undoing unrecorded commit");
                if let Err(e) = self.store.reset_soft(&ws.working_directory, &previous) {
                    warn!(workspace = %ws.id, error = %e, "could not undo commit");
                }
                return Err(err);
            }
        };

        let bytes = store::disk_usage(&ws.working_directory);
        if let Err(e) = self.registry.set_disk_estimate(&ws.id, bytes) {
            warn!(workspace = %ws.id, error = %e, "could not record disk estimate");
        }

        info!(
            workspace = %ws.id,
            commit = commit.commit_id.short(),
            iteration = commit.iteration,
            kind = %commit.kind,
            files = commit.files_changed,
            "checkpoint recorded"
        );
        Ok(commit)
    }

    /// Changes between `since` (default: the base point) and the last
    /// checkpoint. Uncommitted edits are not included.
    ///
    /// Cleaned workspaces are read from their archive ref when one exists.
    ///
    /// # Errors
    /// `WorkspaceNotFound`, `InvalidInput` for an unknown `since`, or
    /// `WorkspaceNotActive` when a cleaned workspace kept no history.
    #[instrument(skip_all, fields(workspace = %id))]
    pub fn get_changes(
        &self,
        id: &WorkspaceId,
        since: Option<&str>,
    ) -> Result<ChangeSet, EngineError> {
        let _guard = self.lock_workspace(id)?;
        let ws = self.require(id)?;
        let tip = self.history_tip(&ws)?;
        let from = match since {
            None => ws.base_point.clone(),
            Some(rev) => self
                .store
                .resolve_commit(rev)
                .map_err(|e| EngineError::store("get changes", &e))?
                .ok_or_else(|| EngineError::InvalidInput {
                    detail: format!("'{rev}' is not a commit in this repository"),
                })?,
        };
        self.store
            .change_set(&from, &tip)
            .map_err(|e| EngineError::store("get changes", &e))
    }

    /// The revision holding a workspace's history: its branch, or its
    /// archive ref once cleaned.
    fn history_rev(&self, ws: &Workspace) -> Result<String, EngineError> {
        if ws.status != WorkspaceStatus::Cleaned {
            return Ok(refs::branch_ref(&ws.branch));
        }
        ws.archive_ref
            .clone()
            .ok_or_else(|| EngineError::WorkspaceNotActive {
                id: ws.id.clone(),
                status: ws.status,
            })
    }

    fn history_tip(&self, ws: &Workspace) -> Result<GitOid, EngineError> {
        let rev = self.history_rev(ws)?;
        self.store
            .resolve_commit(&rev)
            .map_err(|e| EngineError::store("read workspace history", &e))?
            .ok_or_else(|| EngineError::Internal {
                operation: "read workspace history".to_owned(),
                detail: format!("{rev} does not exist"),
            })
    }

    // -- abandonment --

    /// Mark a workspace `abandoned`. A no-op once the workspace has left
    /// `active`.
    ///
    /// # Errors
    /// `WorkspaceNotFound`, or `Internal` on registry failure.
    #[instrument(skip_all, fields(workspace = %id))]
    pub fn abandon_workspace(
        &self,
        id: &WorkspaceId,
        reason: Option<&str>,
    ) -> Result<Workspace, EngineError> {
        let _guard = self.lock_workspace(id)?;
        let ws = self.require(id)?;
        if ws.status != WorkspaceStatus::Active {
            return Ok(ws);
        }
        self.finish(&ws, WorkspaceStatus::Abandoned, reason)
    }

    /// Mark a workspace `failed`, first recording an auto-checkpoint when
    /// `workspace.auto_checkpoint_on_error` is on. A no-op once the
    /// workspace has left `active`.
    ///
    /// A failed auto-checkpoint is logged; the status change still happens.
    ///
    /// # Errors
    /// `WorkspaceNotFound`, or `Internal` on registry failure.
    #[instrument(skip_all, fields(workspace = %id))]
    pub fn fail_workspace(
        &self,
        id: &WorkspaceId,
        reason: Option<&str>,
    ) -> Result<Workspace, EngineError> {
        let _guard = self.lock_workspace(id)?;
        let ws = self.require(id)?;
        if ws.status != WorkspaceStatus::Active {
            return Ok(ws);
        }
        if self.config.workspace.auto_checkpoint_on_error {
            let label = format!(
                "[agent {}] auto-checkpoint on failure: {}",
                ws.agent_id,
                reason.unwrap_or("unspecified")
            );
            if let Err(e) = self.checkpoint_locked(&ws, Some(&label), CommitKind::AutoCheckpoint) {
                warn!(workspace = %ws.id, error = %e, "auto-checkpoint failed");
            }
        }
        self.finish(&ws, WorkspaceStatus::Failed, reason)
    }

    fn finish(
        &self,
        ws: &Workspace,
        to: WorkspaceStatus,
        reason: Option<&str>,
    ) -> Result<Workspace, EngineError> {
        self.registry
            .transition(&ws.id, &[WorkspaceStatus::Active], to, reason, now_unix_ms())
            .map_err(|e| EngineError::registry("update workspace status", &e))?;
        info!(workspace = %ws.id, status = %to, reason, "workspace released");
        self.require(&ws.id)
    }

    // -- cleanup --

    /// Delete a finished workspace's directory and archive (or delete) its
    /// branch. Returns the bytes reclaimed.
    ///
    /// Cleaning an already cleaned workspace returns zero bytes.
    ///
    /// # Errors
    /// `WorkspaceStillActive`, `ActiveDescendants`, or `Internal`.
    #[instrument(skip_all, fields(workspace = %id, preserve_history))]
    pub fn cleanup_workspace(
        &self,
        id: &WorkspaceId,
        preserve_history: bool,
    ) -> Result<CleanupResult, EngineError> {
        let _guard = self.lock_workspace(id)?;
        let ws = self.require(id)?;
        match ws.status {
            WorkspaceStatus::Active => {
                return Err(EngineError::WorkspaceStillActive { id: ws.id });
            }
            WorkspaceStatus::Cleaned => {
                return Ok(CleanupResult {
                    workspace_id: ws.id,
                    reclaimed_bytes: 0,
                    history: ws
                        .archive_ref
                        .map_or(HistoryDisposition::Deleted, |reference| {
                            HistoryDisposition::Archived { reference }
                        }),
                });
            }
            _ => {}
        }

        let children = self
            .registry
            .active_children(&ws.id)
            .map_err(|e| EngineError::registry("cleanup", &e))?;
        if !children.is_empty() {
            return Err(EngineError::ActiveDescendants {
                id: ws.id,
                children,
            });
        }

        let reclaimed_bytes = store::disk_usage(&ws.working_directory);
        self.store
            .remove_worktree(&ws.working_directory)
            .map_err(|e| EngineError::store("cleanup", &e))?;

        let history = if preserve_history {
            let reference = refs::archive_ref(&ws.id);
            self.archive(&ws, &reference)?;
            HistoryDisposition::Archived { reference }
        } else {
            self.store
                .delete_branch(&ws.branch)
                .map_err(|e| EngineError::store("cleanup", &e))?;
            HistoryDisposition::Deleted
        };

        let archive = match &history {
            HistoryDisposition::Archived { reference } => Some(reference.as_str()),
            HistoryDisposition::Deleted => None,
        };
        self.registry
            .mark_cleaned(&ws.id, archive, now_unix_ms())
            .map_err(|e| EngineError::registry("cleanup", &e))?;

        info!(workspace = %ws.id, reclaimed_bytes, archived = archive.is_some(), "workspace cleaned");
        Ok(CleanupResult {
            workspace_id: ws.id,
            reclaimed_bytes,
            history,
        })
    }

    fn archive(&self, ws: &Workspace, reference: &str) -> Result<(), EngineError> {
        match self.store.archive_branch(&ws.branch, reference) {
            Ok(_) => Ok(()),
            // An interrupted earlier cleanup may already have moved it.
            Err(StoreError::NotFound { .. })
                if self
                    .store
                    .resolve_commit(reference)
                    .is_ok_and(|tip| tip.is_some()) =>
            {
                Ok(())
            }
            Err(e) => Err(EngineError::store("archive branch", &e)),
        }
    }

    // -- queries --

    /// # Errors
    /// `WorkspaceNotFound`.
    pub fn get_workspace(&self, id: &WorkspaceId) -> Result<Workspace, EngineError> {
        self.require(id)
    }

    /// Workspaces matching `filter`, oldest first.
    ///
    /// # Errors
    /// `Internal` on registry failure.
    pub fn list_workspaces(&self, filter: &WorkspaceFilter) -> Result<Vec<Workspace>, EngineError> {
        self.registry
            .list(filter)
            .map_err(|e| EngineError::registry("list workspaces", &e))
    }

    /// The active workspace owned by `agent`, if any.
    ///
    /// # Errors
    /// `Internal` on registry failure.
    pub fn active_workspace_for(&self, agent: &AgentId) -> Result<Option<Workspace>, EngineError> {
        self.registry
            .active_for_agent(agent)
            .map_err(|e| EngineError::registry("find workspace", &e))
    }

    /// The most recently created workspace owned by `agent`, in any status.
    ///
    /// # Errors
    /// `Internal` on registry failure.
    pub fn latest_workspace_for(&self, agent: &AgentId) -> Result<Option<Workspace>, EngineError> {
        self.registry
            .latest_for_agent(agent)
            .map_err(|e| EngineError::registry("find workspace", &e))
    }

    /// Commits of a workspace in iteration order.
    ///
    /// # Errors
    /// `WorkspaceNotFound`.
    pub fn list_commits(&self, id: &WorkspaceId) -> Result<Vec<Commit>, EngineError> {
        self.require(id)?;
        self.registry
            .commits(id)
            .map_err(|e| EngineError::registry("list commits", &e))
    }

    /// Merge resolution records of a workspace.
    ///
    /// # Errors
    /// `WorkspaceNotFound`.
    pub fn list_resolutions(
        &self,
        id: &WorkspaceId,
    ) -> Result<Vec<MergeConflictResolution>, EngineError> {
        self.require(id)?;
        self.registry
            .resolutions(id)
            .map_err(|e| EngineError::registry("list resolutions", &e))
    }

    /// Contents of `path` at the workspace's last checkpoint, or at its
    /// archived tip once cleaned. `None` if the file does not exist there.
    ///
    /// # Errors
    /// `WorkspaceNotFound`, or `WorkspaceNotActive` when a cleaned workspace
    /// kept no history.
    pub fn read_file(&self, id: &WorkspaceId, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let ws = self.require(id)?;
        let rev = self.history_rev(&ws)?;
        self.store
            .read_file(&rev, path)
            .map_err(|e| EngineError::store("read file", &e))
    }

    /// Sum of disk estimates over all workspaces not yet cleaned.
    ///
    /// # Errors
    /// `Internal` on registry failure.
    pub fn total_disk_usage(&self) -> Result<u64, EngineError> {
        self.registry
            .total_disk_bytes()
            .map_err(|e| EngineError::registry("total disk usage", &e))
    }

    /// Re-measure every uncleaned workspace directory and store the result.
    /// Returns the new total.
    ///
    /// # Errors
    /// `Internal` on registry failure.
    pub fn refresh_disk_estimates(&self) -> Result<u64, EngineError> {
        let workspaces = self.list_workspaces(&WorkspaceFilter::default())?;
        for ws in workspaces
            .iter()
            .filter(|ws| ws.status != WorkspaceStatus::Cleaned)
        {
            let bytes = store::disk_usage(&ws.working_directory);
            if bytes != ws.disk_bytes_estimate {
                self.registry
                    .set_disk_estimate(&ws.id, bytes)
                    .map_err(|e| EngineError::registry("refresh disk estimate", &e))?;
            }
        }
        self.total_disk_usage()
    }
}

fn allocation_failed(agent: &AgentId, reason: &str) -> EngineError {
    EngineError::WorkspaceAllocationFailed {
        agent: agent.clone(),
        reason: reason.to_owned(),
    }
}

/// `info/exclude` pattern for `dir` when it lies inside `root`.
fn exclude_pattern(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    let first = rel.components().next()?;
    Some(format!("/{}/", first.as_os_str().to_string_lossy()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
