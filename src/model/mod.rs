//! Data model: identifiers, statuses, and persisted records.

pub mod records;
pub mod types;

pub use records::{
    ChangeSet, Commit, ConflictEntry, MergeConflictResolution, MergeStats, NEWEST_WINS, Side,
    Workspace,
};
pub use types::{
    AgentId, CommitKind, GitOid, ValidationError, WorkspaceId, WorkspaceStatus, now_unix_ms,
};
