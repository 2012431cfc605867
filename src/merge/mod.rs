//! Merge-back of a workspace into its parent or main history.
//!
//! A merge runs in three steps under the target lock:
//!
//! - **plan**: read the flat trees at the base point, the workspace tip, and
//!   the target tip, then resolve every path with [`resolve::plan_merge`].
//!   Contested paths are stamped with the time of the last checkpoint that
//!   touched them on each side.
//! - **apply**: write a two-parent commit (target tip first) and advance the
//!   target branch with compare-and-swap. A moved target re-runs the plan
//!   once before the merge gives up.
//! - **record**: mark the workspace merged, append the merge commit to a
//!   parent workspace's history, and store the resolution record, all in one
//!   registry transaction.
//!
//! # Determinism
//!
//! For fixed trees and timestamps the plan is identical on every run: paths
//! are visited in sorted order and the only inputs are blob identities and
//! checkpoint times.

pub mod resolve;

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::lifecycle::WorkspaceManager;
use crate::locks::{target_key, workspace_key};
use crate::model::records::{ConflictEntry, MergeConflictResolution, MergeStats, Workspace};
use crate::model::types::{CommitKind, GitOid, WorkspaceId, WorkspaceStatus, now_unix_ms};
use crate::registry::{MergeRecord, NewCommit};
use crate::store::StoreError;

use resolve::{FileStamps, MergePlan};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of a completed merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    /// `merged` or `conflict_resolved`.
    pub status: WorkspaceStatus,
    /// `false` when the merge short-circuited to the target tip.
    pub commit_written: bool,
    pub resolution: MergeConflictResolution,
}

/// What a merge would do right now, computed without locks or writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergePreview {
    pub workspace_id: WorkspaceId,
    pub target_branch: String,
    pub conflicts: Vec<ConflictEntry>,
    pub stats: MergeStats,
    /// Paths whose content on the target would change.
    pub files_changed: u32,
    pub would_write_commit: bool,
}

/// Where a workspace merges to.
struct MergeTarget {
    branch: String,
    /// Set when the target is a parent workspace rather than main history.
    parent: Option<Workspace>,
}

/// A plan together with the tips it was computed from.
struct PlannedMerge {
    child_tip: GitOid,
    target_tip: GitOid,
    plan: MergePlan,
    short_circuit: bool,
}

enum ApplyError {
    /// The target branch moved after it was read.
    Moved,
    Engine(EngineError),
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

impl WorkspaceManager {
    /// Merge an active workspace into its parent's branch, or into main
    /// history for a root workspace.
    ///
    /// Conflicts are resolved newest-wins per file; every decision is kept
    /// in the returned resolution record. Merges into the same target are
    /// serialized and wait at most `merge.lock_timeout_ms`.
    ///
    /// # Errors
    /// - `WorkspaceNotFound` / `WorkspaceNotActive`
    /// - `MergeLockTimeout` if the target lock stays busy
    /// - `MergeRaceDetected` if the target moves twice during the merge
    /// - `MergeTargetUnavailable` if the target branch is gone or its
    ///   checkout has edits that block the update
    #[instrument(skip_all, fields(workspace = %id))]
    pub fn merge_to_parent(&self, id: &WorkspaceId) -> Result<MergeResult, EngineError> {
        let started = Instant::now();
        let ws = self.require_active(id)?;
        let target = self.merge_target(&ws)?;

        let timeout = self.config.merge.lock_timeout();
        let _target_guard = self
            .locks
            .acquire(&target_key(&target.branch), Some(timeout))
            .map_err(|e| EngineError::merge_lock(&target.branch, &e))?;
        let mut keys = vec![workspace_key(ws.id.as_str())];
        if let Some(parent) = &target.parent {
            keys.push(workspace_key(parent.id.as_str()));
        }
        keys.sort();
        let _ws_guards = self
            .locks
            .acquire_all(&keys, Some(timeout))
            .map_err(|e| EngineError::merge_lock(&target.branch, &e))?;

        // Re-read under the locks: the workspace may have been merged or
        // released while this call waited.
        let ws = self.require_active(id)?;

        let (planned, resulting) = self.plan_and_apply(&ws, &target.branch, || {})?;

        let status = if planned.plan.conflicts.is_empty() {
            WorkspaceStatus::Merged
        } else {
            WorkspaceStatus::ConflictResolved
        };
        let mut stats = planned.plan.stats;
        stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let now = now_unix_ms();
        let message = merge_message(&ws, &target.branch, &planned.plan);
        let parent_commit = match (&target.parent, planned.short_circuit) {
            (Some(parent), false) => Some(NewCommit {
                workspace_id: &parent.id,
                commit_id: &resulting,
                kind: CommitKind::Merge,
                message: &message,
                files_changed: planned.plan.files_changed,
                created_at_ms: now,
            }),
            _ => None,
        };
        let resolution = self
            .registry
            .finish_merge(&MergeRecord {
                workspace_id: &ws.id,
                status,
                source_branch: &ws.branch,
                target_branch: &target.branch,
                conflicts: &planned.plan.conflicts,
                resulting_commit_id: &resulting,
                stats,
                parent_commit,
                now_ms: now,
            })
            .map_err(|e| {
                if !planned.short_circuit {
                    self.undo_advance(&target.branch, &resulting, &planned.target_tip);
                }
                EngineError::registry("record merge", &e)
            })?;

        info!(
            workspace = %ws.id,
            target = %target.branch,
            commit = resulting.short(),
            conflicts = resolution.conflicts.len(),
            status = %status,
            "workspace merged"
        );
        Ok(MergeResult {
            status,
            commit_written: !planned.short_circuit,
            resolution,
        })
    }

    /// Plan and apply, re-planning once if the target moves in between.
    /// `before_apply` runs after each plan.
    fn plan_and_apply(
        &self,
        ws: &Workspace,
        target_branch: &str,
        mut before_apply: impl FnMut(),
    ) -> Result<(PlannedMerge, GitOid), EngineError> {
        let mut retried = false;
        loop {
            let planned = self.plan_for(ws, target_branch)?;
            before_apply();
            match self.apply(ws, target_branch, &planned) {
                Ok(resulting) => return Ok((planned, resulting)),
                Err(ApplyError::Moved) if !retried => {
                    warn!(workspace = %ws.id, target = %target_branch, "target moved; replanning");
                    retried = true;
                }
                Err(ApplyError::Moved) => {
                    return Err(EngineError::MergeRaceDetected {
                        id: ws.id.clone(),
                        target_branch: target_branch.to_owned(),
                    });
                }
                Err(ApplyError::Engine(e)) => return Err(e),
            }
        }
    }

    /// Move the target back to its pre-merge tip after the merge could not
    /// be recorded.
    fn undo_advance(&self, target_branch: &str, merged: &GitOid, previous: &GitOid) {
        match self.store.rewind_branch(target_branch, merged, previous) {
            Ok(()) => warn!(
                target = %target_branch,
                commit = merged.short(),
                "merge not recorded; target rewound"
            ),
            Err(e) => warn!(
                target = %target_branch,
                commit = merged.short(),
                error = %e,
                "merge not recorded and target could not be rewound"
            ),
        }
    }

    /// Compute what [`Self::merge_to_parent`] would do against the current
    /// target, without taking the merge lock or writing anything.
    ///
    /// # Errors
    /// `WorkspaceNotFound`, `WorkspaceNotActive`, or
    /// `MergeTargetUnavailable`.
    #[instrument(skip_all, fields(workspace = %id))]
    pub fn preview_merge(&self, id: &WorkspaceId) -> Result<MergePreview, EngineError> {
        let ws = self.require_active(id)?;
        let target = self.merge_target(&ws)?;
        let planned = self.plan_for(&ws, &target.branch)?;
        Ok(MergePreview {
            workspace_id: ws.id,
            target_branch: target.branch,
            conflicts: planned.plan.conflicts,
            stats: planned.plan.stats,
            files_changed: planned.plan.files_changed,
            would_write_commit: !planned.short_circuit,
        })
    }

    fn merge_target(&self, ws: &Workspace) -> Result<MergeTarget, EngineError> {
        let Some(pid) = &ws.parent_id else {
            return Ok(MergeTarget {
                branch: self.config.repo.branch.clone(),
                parent: None,
            });
        };
        let parent = self
            .registry
            .get(pid)
            .map_err(|e| EngineError::registry("read parent workspace", &e))?
            .ok_or_else(|| EngineError::MergeTargetUnavailable {
                id: ws.id.clone(),
                reason: format!("parent workspace '{pid}' no longer exists"),
            })?;
        if parent.status == WorkspaceStatus::Cleaned {
            return Err(EngineError::MergeTargetUnavailable {
                id: ws.id.clone(),
                reason: format!("parent workspace '{pid}' has been cleaned up"),
            });
        }
        Ok(MergeTarget {
            branch: parent.branch.clone(),
            parent: Some(parent),
        })
    }

    fn plan_for(&self, ws: &Workspace, target_branch: &str) -> Result<PlannedMerge, EngineError> {
        let store_err = |e: StoreError| EngineError::store("merge", &e);
        let child_tip = self.store.branch_head(&ws.branch).map_err(store_err)?;
        let target_tip = self.store.branch_head(target_branch).map_err(|e| match e {
            StoreError::NotFound { .. } => EngineError::MergeTargetUnavailable {
                id: ws.id.clone(),
                reason: format!("target branch '{target_branch}' does not exist"),
            },
            other => EngineError::store("merge", &other),
        })?;

        let base = self.store.flat_tree(&ws.base_point).map_err(store_err)?;
        let child = self.store.flat_tree(&child_tip).map_err(store_err)?;
        let target = self.store.flat_tree(&target_tip).map_err(store_err)?;

        let mut stamps = BTreeMap::new();
        for path in resolve::contested_paths(&base, &child, &target) {
            let file_stamps = FileStamps {
                child_ms: self.touch_time(&ws.base_point, &child_tip, &path)?,
                parent_ms: self.touch_time(&ws.base_point, &target_tip, &path)?,
            };
            stamps.insert(path, file_stamps);
        }

        let plan = resolve::plan_merge(
            &base,
            &child,
            &target,
            &stamps,
            self.config.merge.tie_break,
        );
        let short_circuit = plan.child_changes == 0 || child == target;
        debug!(
            workspace = %ws.id,
            child_changes = plan.child_changes,
            conflicts = plan.conflicts.len(),
            short_circuit,
            "merge planned"
        );
        Ok(PlannedMerge {
            child_tip,
            target_tip,
            plan,
            short_circuit,
        })
    }

    /// Time of the last commit in `base..tip` that touched `path`.
    ///
    /// Engine checkpoints carry their own millisecond time; anything else
    /// falls back to git committer time.
    fn touch_time(&self, base: &GitOid, tip: &GitOid, path: &str) -> Result<i64, EngineError> {
        let commit = self
            .store
            .last_touch(base, tip, path)
            .map_err(|e| EngineError::store("merge", &e))?
            .unwrap_or_else(|| tip.clone());
        if let Some(ms) = self
            .registry
            .commit_time_ms(&commit)
            .map_err(|e| EngineError::registry("merge", &e))?
        {
            return Ok(ms);
        }
        self.store
            .commit_time_ms(&commit)
            .map_err(|e| EngineError::store("merge", &e))
    }

    /// Write the merge commit and move the target onto it. Returns the
    /// target's resulting tip.
    fn apply(
        &self,
        ws: &Workspace,
        target_branch: &str,
        planned: &PlannedMerge,
    ) -> Result<GitOid, ApplyError> {
        if planned.short_circuit {
            return Ok(planned.target_tip.clone());
        }
        let message = merge_message(ws, target_branch, &planned.plan);
        let commit = self
            .store
            .write_commit(
                &planned.plan.tree,
                &[&planned.target_tip, &planned.child_tip],
                &message,
            )
            .map_err(|e| ApplyError::Engine(EngineError::store("merge", &e)))?;

        match self
            .store
            .advance_branch(target_branch, &planned.target_tip, &commit)
        {
            Ok(()) => Ok(commit),
            Err(StoreError::CasMismatch { .. }) => Err(ApplyError::Moved),
            Err(StoreError::DirtyWorktree { path, .. }) => {
                Err(ApplyError::Engine(EngineError::MergeTargetUnavailable {
                    id: ws.id.clone(),
                    reason: format!(
                        "the checkout of '{target_branch}' at {} has uncommitted edits to merged files; checkpoint or discard them and retry",
                        path.display()
                    ),
                }))
            }
            Err(e) => Err(ApplyError::Engine(EngineError::store("merge", &e))),
        }
    }
}

fn merge_message(ws: &Workspace, target_branch: &str, plan: &MergePlan) -> String {
    let mut message = format!(
        "tandem: merge {} ({}) into {target_branch}",
        ws.id, ws.agent_id
    );
    if !plan.conflicts.is_empty() {
        message.push_str(&format!(
            "\n\n{} conflict(s) resolved newest-wins:",
            plan.conflicts.len()
        ));
        for c in &plan.conflicts {
            message.push_str(&format!("\n  {} <- {}", c.file_path, c.winner.as_str()));
        }
    }
    message
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::records::Side;
    use crate::model::types::AgentId;
    use crate::registry::Registry;
    use crate::store::test_support::{commit_file, git, init_repo};
    use std::fs;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager() -> (TempDir, TempDir, WorkspaceManager) {
        let (repo, _) = init_repo();
        let state = TempDir::new().unwrap();
        let mut config = EngineConfig::for_repo(repo.path());
        config.workspace.base_dir = state.path().join("workspaces");
        let mgr = WorkspaceManager::with_registry(config, Registry::open_in_memory().unwrap())
            .unwrap();
        (repo, state, mgr)
    }

    fn agent(s: &str) -> AgentId {
        AgentId::new(s).unwrap()
    }

    #[test]
    fn clean_merge_into_main_updates_checkout() {
        let (repo, _state, mgr) = manager();
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        fs::write(alloc.working_directory.join("feature.txt"), "done\n").unwrap();
        mgr.checkpoint(&alloc.workspace_id, None).unwrap();

        let result = mgr.merge_to_parent(&alloc.workspace_id).unwrap();
        assert_eq!(result.status, WorkspaceStatus::Merged);
        assert!(result.commit_written);
        assert!(result.resolution.conflicts.is_empty());
        assert_eq!(result.resolution.stats.taken_from_child, 1);
        assert_eq!(
            git(repo.path(), &["rev-parse", "main"]),
            result.resolution.resulting_commit_id.as_str()
        );
        assert_eq!(
            fs::read_to_string(repo.path().join("feature.txt")).unwrap(),
            "done\n"
        );
        let parents = git(
            repo.path(),
            &["rev-list", "--parents", "-n", "1", "main"],
        );
        assert_eq!(parents.split_whitespace().count(), 3);
    }

    #[test]
    fn merge_without_changes_short_circuits() {
        let (repo, _state, mgr) = manager();
        let before = git(repo.path(), &["rev-parse", "main"]);
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        let result = mgr.merge_to_parent(&alloc.workspace_id).unwrap();
        assert!(!result.commit_written);
        assert_eq!(result.status, WorkspaceStatus::Merged);
        assert_eq!(result.resolution.resulting_commit_id.as_str(), before);
        assert_eq!(git(repo.path(), &["rev-parse", "main"]), before);
    }

    #[test]
    fn newer_target_edit_wins_conflict() {
        let (repo, _state, mgr) = manager();
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        fs::write(alloc.working_directory.join("README.md"), "child\n").unwrap();
        mgr.checkpoint(&alloc.workspace_id, None).unwrap();

        // Committer time has second resolution.
        thread::sleep(Duration::from_millis(1100));
        commit_file(repo.path(), "README.md", "main\n");

        let preview = mgr.preview_merge(&alloc.workspace_id).unwrap();
        assert_eq!(preview.conflicts.len(), 1);
        assert_eq!(preview.conflicts[0].winner, Side::Parent);

        let result = mgr.merge_to_parent(&alloc.workspace_id).unwrap();
        assert_eq!(result.status, WorkspaceStatus::ConflictResolved);
        assert_eq!(result.resolution.conflicts, preview.conflicts);
        assert_eq!(
            fs::read_to_string(repo.path().join("README.md")).unwrap(),
            "main\n"
        );
    }

    #[test]
    fn merged_workspace_cannot_merge_again() {
        let (_repo, _state, mgr) = manager();
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        mgr.merge_to_parent(&alloc.workspace_id).unwrap();
        let err = mgr.merge_to_parent(&alloc.workspace_id).unwrap_err();
        assert!(matches!(err, EngineError::WorkspaceNotActive { .. }));
    }

    #[test]
    fn busy_target_times_out() {
        let (_repo, _state, mut mgr) = manager();
        mgr.config.merge.lock_timeout_ms = 20;
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        let _held = mgr.locks.lock(&target_key("main")).unwrap();
        let err = mgr.merge_to_parent(&alloc.workspace_id).unwrap_err();
        assert!(matches!(err, EngineError::MergeLockTimeout { .. }));
        assert_eq!(
            mgr.get_workspace(&alloc.workspace_id).unwrap().status,
            WorkspaceStatus::Active
        );
    }

    #[test]
    fn target_moving_once_is_replanned() {
        let (repo, _state, mgr) = manager();
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        fs::write(alloc.working_directory.join("feature.txt"), "done\n").unwrap();
        mgr.checkpoint(&alloc.workspace_id, None).unwrap();
        let ws = mgr.require_active(&alloc.workspace_id).unwrap();

        let mut plans = 0;
        let (planned, resulting) = mgr
            .plan_and_apply(&ws, "main", || {
                if plans == 0 {
                    commit_file(repo.path(), "upstream.txt", "upstream\n");
                }
                plans += 1;
            })
            .unwrap();

        assert_eq!(plans, 2);
        assert_eq!(git(repo.path(), &["rev-parse", "main"]), resulting.as_str());
        assert_eq!(
            git(repo.path(), &["rev-parse", "main^1"]),
            planned.target_tip.as_str()
        );
        assert!(repo.path().join("upstream.txt").exists());
        assert!(repo.path().join("feature.txt").exists());
    }

    #[test]
    fn target_moving_twice_is_a_race() {
        let (repo, _state, mgr) = manager();
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        fs::write(alloc.working_directory.join("feature.txt"), "done\n").unwrap();
        mgr.checkpoint(&alloc.workspace_id, None).unwrap();
        let ws = mgr.require_active(&alloc.workspace_id).unwrap();

        let mut plans = 0;
        let Err(err) = mgr.plan_and_apply(&ws, "main", || {
            plans += 1;
            commit_file(repo.path(), &format!("upstream-{plans}.txt"), "upstream\n");
        }) else {
            panic!("a target that keeps moving must not merge");
        };

        assert!(matches!(err, EngineError::MergeRaceDetected { .. }), "{err}");
        assert_eq!(plans, 2);
        assert!(!repo.path().join("feature.txt").exists());
        assert_eq!(
            mgr.get_workspace(&alloc.workspace_id).unwrap().status,
            WorkspaceStatus::Active
        );
        assert!(mgr.list_resolutions(&alloc.workspace_id).unwrap().is_empty());

        // Once the target holds still the same workspace merges.
        let result = mgr.merge_to_parent(&alloc.workspace_id).unwrap();
        assert_eq!(result.status, WorkspaceStatus::Merged);
    }

    #[test]
    fn unrecorded_merge_rewinds_target() {
        let (repo, _state, mgr) = manager();
        let alloc = mgr.create_workspace(&agent("a"), None).unwrap();
        fs::write(alloc.working_directory.join("feature.txt"), "done\n").unwrap();
        mgr.checkpoint(&alloc.workspace_id, None).unwrap();
        let before = git(repo.path(), &["rev-parse", "main"]);
        mgr.registry
            .execute_batch(
                "CREATE TRIGGER refuse_resolutions BEFORE INSERT ON merge_conflict_resolutions
                 BEGIN SELECT RAISE(ABORT, 'registry unavailable'); END;",
            )
            .unwrap();

        let err = mgr.merge_to_parent(&alloc.workspace_id).unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }), "{err}");
        assert_eq!(git(repo.path(), &["rev-parse", "main"]), before);
        assert!(!repo.path().join("feature.txt").exists());
        assert_eq!(
            mgr.get_workspace(&alloc.workspace_id).unwrap().status,
            WorkspaceStatus::Active
        );
    }

    #[test]
    fn message_lists_decisions() {
        let ws_id = WorkspaceId::new("ws-1").unwrap();
        let ws = Workspace {
            id: ws_id,
            agent_id: agent("a"),
            parent_id: None,
            working_directory: "/tmp/ws-1".into(),
            branch: "tandem/ws/ws-1".to_owned(),
            base_point: GitOid::new(&"a".repeat(40)).unwrap(),
            status: WorkspaceStatus::Active,
            ancestry_depth: 0,
            created_at_ms: 0,
            updated_at_ms: 0,
            disk_bytes_estimate: 0,
            archive_ref: None,
            status_reason: None,
        };
        let plan = MergePlan {
            tree: crate::store::FlatTree::new(),
            conflicts: vec![ConflictEntry {
                file_path: "x.py".to_owned(),
                winner: Side::Child,
                child_timestamp_ms: 2,
                parent_timestamp_ms: 1,
                tie_broken_by_preference: false,
            }],
            stats: MergeStats::default(),
            child_changes: 1,
            files_changed: 1,
        };
        let message = merge_message(&ws, "main", &plan);
        assert!(message.starts_with("tandem: merge ws-1 (a) into main"));
        assert!(message.contains("x.py <- child"));
    }
}
