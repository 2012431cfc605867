//! Engine error type.
//!
//! [`EngineError`] is the only error that crosses the engine boundary.
//! Store and registry failures are translated here; their raw types never
//! reach callers. Messages are written for agents: each says what happened
//! and what to do next.

use std::fmt;

use crate::locks::LockError;
use crate::model::types::{AgentId, ValidationError, WorkspaceId, WorkspaceStatus};
use crate::registry::RegistryError;
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// The agent already owns an active workspace.
    DuplicateActiveWorkspace {
        agent: AgentId,
        existing: WorkspaceId,
    },

    /// The requested parent workspace does not exist.
    ParentNotFound { parent: WorkspaceId },

    /// The parent exists but is neither active nor merged.
    ParentUnusable {
        parent: WorkspaceId,
        status: WorkspaceStatus,
    },

    /// The new workspace would exceed the configured ancestry depth.
    AncestryTooDeep {
        parent: WorkspaceId,
        depth: u32,
        max: u32,
    },

    /// Too many workspaces are active.
    WorkspaceLimitReached { limit: usize },

    /// Tracked disk usage is above the hard ceiling.
    DiskCapacityExceeded { used_bytes: u64, ceiling_bytes: u64 },

    /// Materializing the workspace failed; nothing was left behind.
    WorkspaceAllocationFailed { agent: AgentId, reason: String },

    /// No workspace has this id.
    WorkspaceNotFound { id: WorkspaceId },

    /// The operation requires an active workspace.
    WorkspaceNotActive {
        id: WorkspaceId,
        status: WorkspaceStatus,
    },

    /// Cleanup was requested for a workspace that is still active.
    WorkspaceStillActive { id: WorkspaceId },

    /// Cleanup would remove the merge target of active child workspaces.
    ActiveDescendants {
        id: WorkspaceId,
        children: Vec<WorkspaceId>,
    },

    /// The target branch moved underneath the merge twice in a row.
    MergeRaceDetected {
        id: WorkspaceId,
        target_branch: String,
    },

    /// The per-target merge lock could not be acquired in time.
    MergeLockTimeout {
        target_branch: String,
        waited_ms: u64,
    },

    /// The merge target cannot receive changes.
    MergeTargetUnavailable { id: WorkspaceId, reason: String },

    /// The disk filled up during an operation; it was rolled back.
    ResourceExhausted { operation: String, detail: String },

    /// A caller-supplied value failed validation.
    InvalidInput { detail: String },

    /// A file name in the history is not valid UTF-8.
    UnsupportedPath { operation: String, path: String },

    /// An unclassified store or registry failure.
    Internal { operation: String, detail: String },
}

/// The broad class of an [`EngineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Workspace creation was refused or failed; no state was left.
    Allocation,
    /// Caller logic error; retrying unchanged will fail again.
    State,
    /// Merge contention; the caller may retry later.
    Merge,
    /// Disk exhaustion; the operation was rolled back.
    Resource,
    /// Unexpected failure below the engine.
    Internal,
}

impl EngineError {
    /// The category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::DuplicateActiveWorkspace { .. }
            | Self::ParentNotFound { .. }
            | Self::ParentUnusable { .. }
            | Self::AncestryTooDeep { .. }
            | Self::WorkspaceLimitReached { .. }
            | Self::DiskCapacityExceeded { .. }
            | Self::WorkspaceAllocationFailed { .. } => ErrorCategory::Allocation,
            Self::WorkspaceNotFound { .. }
            | Self::WorkspaceNotActive { .. }
            | Self::WorkspaceStillActive { .. }
            | Self::ActiveDescendants { .. }
            | Self::InvalidInput { .. }
            | Self::UnsupportedPath { .. } => ErrorCategory::State,
            Self::MergeRaceDetected { .. }
            | Self::MergeLockTimeout { .. }
            | Self::MergeTargetUnavailable { .. } => ErrorCategory::Merge,
            Self::ResourceExhausted { .. } => ErrorCategory::Resource,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Translate a store failure during `operation`.
    pub(crate) fn store(operation: &str, err: &StoreError) -> Self {
        if let StoreError::NonUtf8Path { path } = err {
            return Self::UnsupportedPath {
                operation: operation.to_owned(),
                path: path.clone(),
            };
        }
        if err.is_disk_full() {
            Self::ResourceExhausted {
                operation: operation.to_owned(),
                detail: err.to_string(),
            }
        } else {
            Self::Internal {
                operation: operation.to_owned(),
                detail: err.to_string(),
            }
        }
    }

    /// Translate a registry failure during `operation`.
    pub(crate) fn registry(operation: &str, err: &RegistryError) -> Self {
        Self::Internal {
            operation: operation.to_owned(),
            detail: err.to_string(),
        }
    }

    /// Translate a failure to take a merge lock.
    pub(crate) fn merge_lock(target_branch: &str, err: &LockError) -> Self {
        match err {
            LockError::Timeout { waited, .. } => Self::MergeLockTimeout {
                target_branch: target_branch.to_owned(),
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            },
            LockError::Io { .. } => Self::Internal {
                operation: "acquire merge lock".to_owned(),
                detail: err.to_string(),
            },
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        Self::InvalidInput {
            detail: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Display: agent-friendly error messages
// ---------------------------------------------------------------------------

impl fmt::Display for EngineError {
    #[allow(clippy::too_many_lines)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateActiveWorkspace { agent, existing } => write!(
                f,
                "agent '{agent}' already owns active workspace '{existing}'.\n  To fix: merge or abandon it first:\n    tandem merge {existing}\n    tandem abandon {existing}"
            ),
            Self::ParentNotFound { parent } => write!(
                f,
                "parent workspace '{parent}' not found.\n  To fix: check available workspaces:\n    tandem list"
            ),
            Self::ParentUnusable { parent, status } => write!(
                f,
                "parent workspace '{parent}' is {status}; only active or merged workspaces can be parents.\n  To fix: create the workspace from main history or from another parent."
            ),
            Self::AncestryTooDeep { parent, depth, max } => write!(
                f,
                "a child of '{parent}' would be at ancestry depth {depth}, above the limit of {max}.\n  To fix: merge '{parent}' back first, or raise workspace.max_ancestry_depth."
            ),
            Self::WorkspaceLimitReached { limit } => write!(
                f,
                "{limit} workspaces are already active.\n  To fix: merge or abandon finished workspaces, or raise workspace.max_concurrent."
            ),
            Self::DiskCapacityExceeded {
                used_bytes,
                ceiling_bytes,
            } => write!(
                f,
                "workspaces use {used_bytes} bytes, above the hard ceiling of {ceiling_bytes} bytes.\n  To fix: reclaim space, then retry:\n    tandem sweep"
            ),
            Self::WorkspaceAllocationFailed { agent, reason } => write!(
                f,
                "could not allocate a workspace for agent '{agent}': {reason}\n  No partial state was left behind. To fix: resolve the cause and retry."
            ),
            Self::WorkspaceNotFound { id } => write!(
                f,
                "workspace '{id}' not found.\n  To fix: check available workspaces:\n    tandem list"
            ),
            Self::WorkspaceNotActive { id, status } => write!(
                f,
                "workspace '{id}' is {status}, not active.\n  To fix: create a new workspace for further work:\n    tandem create --agent <agent>"
            ),
            Self::WorkspaceStillActive { id } => write!(
                f,
                "workspace '{id}' is still active and cannot be cleaned up.\n  To fix: merge or abandon it first:\n    tandem merge {id}\n    tandem abandon {id}"
            ),
            Self::ActiveDescendants { id, children } => {
                write!(
                    f,
                    "workspace '{id}' is the merge target of {} active workspace(s):",
                    children.len()
                )?;
                for child in children {
                    write!(f, "\n  - {child}")?;
                }
                write!(f, "\n  To fix: merge or abandon the children first.")
            }
            Self::MergeRaceDetected { id, target_branch } => write!(
                f,
                "'{target_branch}' moved while '{id}' was being merged, twice in a row.\n  The workspace is unchanged. To fix: retry the merge:\n    tandem merge {id}"
            ),
            Self::MergeLockTimeout {
                target_branch,
                waited_ms,
            } => write!(
                f,
                "timed out after {waited_ms} ms waiting to merge into '{target_branch}'.\n  Another merge into the same target is still running. To fix: retry later."
            ),
            Self::MergeTargetUnavailable { id, reason } => write!(
                f,
                "workspace '{id}' cannot be merged: {reason}"
            ),
            Self::ResourceExhausted { operation, detail } => write!(
                f,
                "{operation} ran out of disk space and was rolled back: {detail}\n  To fix: reclaim space, then retry:\n    tandem sweep"
            ),
            Self::InvalidInput { detail } => write!(f, "invalid input: {detail}"),
            Self::UnsupportedPath { operation, path } => write!(
                f,
                "{operation} refused: the file name \"{path}\" is not valid UTF-8.\n  Nothing was changed. To fix: rename the file to a UTF-8 name and checkpoint again."
            ),
            Self::Internal { operation, detail } => {
                write!(f, "{operation} failed: {detail}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ws(s: &str) -> WorkspaceId {
        WorkspaceId::new(s).unwrap()
    }

    #[test]
    fn categories_follow_taxonomy() {
        let agent = AgentId::new("a").unwrap();
        assert_eq!(
            EngineError::DuplicateActiveWorkspace {
                agent,
                existing: ws("ws-1")
            }
            .category(),
            ErrorCategory::Allocation
        );
        assert_eq!(
            EngineError::WorkspaceStillActive { id: ws("ws-1") }.category(),
            ErrorCategory::State
        );
        assert_eq!(
            EngineError::MergeLockTimeout {
                target_branch: "main".to_owned(),
                waited_ms: 5
            }
            .category(),
            ErrorCategory::Merge
        );
        assert_eq!(
            EngineError::ResourceExhausted {
                operation: "checkpoint".to_owned(),
                detail: String::new()
            }
            .category(),
            ErrorCategory::Resource
        );
    }

    #[test]
    fn store_disk_full_maps_to_resource() {
        let err = StoreError::DiskFull {
            command: "git commit".to_owned(),
            stderr: "No space left on device".to_owned(),
        };
        let mapped = EngineError::store("checkpoint", &err);
        assert_eq!(mapped.category(), ErrorCategory::Resource);

        let other = StoreError::NotFound {
            what: "branch x".to_owned(),
        };
        assert_eq!(
            EngineError::store("merge", &other).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn lock_timeout_carries_wait() {
        let err = EngineError::merge_lock(
            "main",
            &LockError::Timeout {
                key: "target:main".to_owned(),
                waited: Duration::from_millis(250),
            },
        );
        assert!(matches!(
            err,
            EngineError::MergeLockTimeout { waited_ms: 250, .. }
        ));
    }

    #[test]
    fn lock_file_failure_is_internal() {
        let err = EngineError::merge_lock(
            "main",
            &LockError::Io {
                path: "/nonexistent/target%3Amain.lock".into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
        );
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn non_utf8_path_maps_to_unsupported_path() {
        let err = StoreError::NonUtf8Path {
            path: "bad\\xffname.txt".to_owned(),
        };
        let mapped = EngineError::store("merge", &err);
        assert!(matches!(
            &mapped,
            EngineError::UnsupportedPath { operation, path }
                if operation == "merge" && path == "bad\\xffname.txt"
        ));
        assert_eq!(mapped.category(), ErrorCategory::State);
        assert!(mapped.to_string().contains("To fix: rename the file"));
    }

    #[test]
    fn messages_include_fix_guidance() {
        let msg = EngineError::WorkspaceStillActive { id: ws("ws-9") }.to_string();
        assert!(msg.contains("ws-9"));
        assert!(msg.contains("To fix:"));
        assert!(msg.contains("tandem merge ws-9"));

        let msg = EngineError::ActiveDescendants {
            id: ws("ws-p"),
            children: vec![ws("ws-a"), ws("ws-b")],
        }
        .to_string();
        assert!(msg.contains("2 active workspace(s)"));
        assert!(msg.contains("- ws-b"));
    }

    #[test]
    fn validation_errors_become_invalid_input() {
        let err: EngineError = AgentId::new("").unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::State);
        assert!(err.to_string().starts_with("invalid input"));
    }
}
