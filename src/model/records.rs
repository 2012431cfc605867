//! Persisted records: workspaces, commits, and merge resolutions.
//!
//! These are plain data. The registry owns their storage; the lifecycle
//! manager and the merge engine create them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::{AgentId, CommitKind, GitOid, WorkspaceId, WorkspaceStatus};

/// One workspace allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub agent_id: AgentId,
    /// `None` means the workspace is rooted at the main history branch.
    pub parent_id: Option<WorkspaceId>,
    pub working_directory: PathBuf,
    /// Full branch name in the snapshot store (`tandem/ws/<id>`).
    pub branch: String,
    /// Snapshot the branch was created from. Never changes.
    pub base_point: GitOid,
    pub status: WorkspaceStatus,
    /// 0 for root workspaces, parent depth + 1 otherwise.
    pub ancestry_depth: u32,
    pub created_at_ms: i64,
    /// Time of the last status change.
    pub updated_at_ms: i64,
    pub disk_bytes_estimate: u64,
    /// Archive ref holding the branch after a history-preserving cleanup.
    pub archive_ref: Option<String>,
    pub status_reason: Option<String>,
}

impl Workspace {
    /// Returns `true` if the workspace is rooted at main history.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// An immutable checkpoint of a workspace branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_id: GitOid,
    pub workspace_id: WorkspaceId,
    /// Starts at 1 and increases by exactly 1 per recorded commit.
    pub iteration: u32,
    pub kind: CommitKind,
    pub message: String,
    pub files_changed: u32,
    pub created_at_ms: i64,
}

/// Which side of a merge a resolved file came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The merging workspace.
    Child,
    /// The merge target (parent workspace or main history).
    Parent,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Child => "child",
            Self::Parent => "parent",
        }
    }
}

/// One newest-wins decision for a file both sides changed differently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Repository-relative path, `/`-separated.
    pub file_path: String,
    pub winner: Side,
    pub child_timestamp_ms: i64,
    pub parent_timestamp_ms: i64,
    /// `true` when timestamps were equal and the configured preference decided.
    pub tie_broken_by_preference: bool,
}

/// Counters stored alongside a resolution record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Files whose final version came from the child.
    pub taken_from_child: u32,
    /// Files changed on both sides where the target's version was kept.
    pub kept_from_target: u32,
    /// Files changed on both sides to identical content.
    pub identical: u32,
    pub duration_ms: u64,
}

/// The name recorded for the only resolution strategy.
pub const NEWEST_WINS: &str = "newest_wins";

/// Audit record of one merge attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflictResolution {
    /// Registry row id.
    pub id: i64,
    pub workspace_id: WorkspaceId,
    pub source_branch: String,
    pub target_branch: String,
    pub resolution_strategy: String,
    /// Sorted by path; each conflicting path appears exactly once.
    pub conflicts: Vec<ConflictEntry>,
    pub resulting_commit_id: GitOid,
    pub stats: MergeStats,
    pub created_at_ms: i64,
}

/// Files and line counts changed between two snapshots of a workspace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub insertions: u64,
    pub deletions: u64,
    /// Unified diff text.
    pub patch: String,
}

impl ChangeSet {
    /// Total number of changed paths.
    #[must_use]
    pub fn total(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
