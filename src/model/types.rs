//! Core identifier and status types.
//!
//! Foundation types used throughout the engine: snapshot object IDs,
//! workspace and agent identifiers, workspace lifecycle status, and commit
//! kinds. Identifiers are validated newtypes so a malformed value can never
//! reach the registry or the snapshot store.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GitOid
// ---------------------------------------------------------------------------

/// A validated lowercase hex git object ID (40 chars for SHA-1, 64 for SHA-256).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GitOid(String);

impl GitOid {
    /// Create a new `GitOid` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the string is not 40 or 64 lowercase hex characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the inner hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 12 characters, for log lines and CLI output.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.len() != 40 && s.len() != 64 {
            return Err(ValidationError {
                kind: ErrorKind::GitOid,
                value: s.to_owned(),
                reason: format!("expected 40 or 64 hex characters, got {}", s.len()),
            });
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ValidationError {
                kind: ErrorKind::GitOid,
                value: s.to_owned(),
                reason: "must contain only lowercase hex characters (0-9, a-f)".to_owned(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GitOid {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for GitOid {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<GitOid> for String {
    fn from(oid: GitOid) -> Self {
        oid.0
    }
}

// ---------------------------------------------------------------------------
// WorkspaceId
// ---------------------------------------------------------------------------

/// A validated workspace identifier.
///
/// Lowercase alphanumeric with single hyphens, 1–64 characters. Generated
/// identifiers look like `ws-3f9a0c1d22e4b7a8`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// The maximum length of a workspace identifier.
    pub const MAX_LEN: usize = 64;

    /// Create a new `WorkspaceId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty, too long, or contains invalid characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("ws-{:016x}", rand::random::<u64>()))
    }

    /// Return the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let fail = |reason: &str| ValidationError {
            kind: ErrorKind::WorkspaceId,
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        if s.is_empty() {
            return Err(fail("workspace id must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(fail(&format!(
                "workspace id must be at most {} characters, got {}",
                Self::MAX_LEN,
                s.len()
            )));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(fail("workspace id must not start or end with a hyphen"));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(fail(
                "workspace id must contain only lowercase letters (a-z), digits (0-9), and hyphens (-)",
            ));
        }
        if s.contains("--") {
            return Err(fail("workspace id must not contain consecutive hyphens"));
        }
        Ok(())
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkspaceId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkspaceId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<WorkspaceId> for String {
    fn from(id: WorkspaceId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// AgentId
// ---------------------------------------------------------------------------

/// The identifier of an agent that owns workspaces.
///
/// Agent ids come from the scheduler, so the rules are looser than for
/// [`WorkspaceId`]: 1–128 printable characters without whitespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// The maximum length of an agent identifier.
    pub const MAX_LEN: usize = 128;

    /// Create a new `AgentId`, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty, too long, or contains whitespace
    /// or control characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(ValidationError {
                kind: ErrorKind::AgentId,
                value: s.to_owned(),
                reason: format!("agent id must be 1-{} characters", Self::MAX_LEN),
            });
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError {
                kind: ErrorKind::AgentId,
                value: s.to_owned(),
                reason: "agent id must not contain whitespace or control characters".to_owned(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// WorkspaceStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a workspace.
///
/// ```text
/// active ──merge──▶ merged | conflict_resolved ──cleanup──▶ cleaned
///    └──abandon/fail──▶ abandoned | failed ──────cleanup──▶ cleaned
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    /// Allocated and owned by its agent.
    Active,
    /// Merged back into its target with no conflicts.
    Merged,
    /// Merged back; at least one conflict was resolved newest-wins.
    ConflictResolved,
    /// The agent's task was cancelled.
    Abandoned,
    /// The agent failed.
    Failed,
    /// Working directory reclaimed.
    Cleaned,
}

impl WorkspaceStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Active,
        Self::Merged,
        Self::ConflictResolved,
        Self::Abandoned,
        Self::Failed,
        Self::Cleaned,
    ];

    /// Statuses after which only cleanup may act on a workspace.
    pub const TERMINAL: [Self; 4] = [
        Self::Merged,
        Self::ConflictResolved,
        Self::Abandoned,
        Self::Failed,
    ];

    /// Stable lowercase name, as persisted in the registry.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::ConflictResolved => "conflict_resolved",
            Self::Abandoned => "abandoned",
            Self::Failed => "failed",
            Self::Cleaned => "cleaned",
        }
    }

    /// Returns `true` for `merged`, `conflict_resolved`, `abandoned`, `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Merged | Self::ConflictResolved | Self::Abandoned | Self::Failed
        )
    }

    /// Returns `true` for the two successful merge outcomes.
    #[must_use]
    pub const fn is_merged(self) -> bool {
        matches!(self, Self::Merged | Self::ConflictResolved)
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStatus {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError {
                kind: ErrorKind::WorkspaceStatus,
                value: s.to_owned(),
                reason: "expected one of active, merged, conflict_resolved, abandoned, failed, cleaned"
                    .to_owned(),
            })
    }
}

// ---------------------------------------------------------------------------
// CommitKind
// ---------------------------------------------------------------------------

/// Why a commit was written to a workspace branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    /// Requested by the caller (e.g. before validation).
    Checkpoint,
    /// Written automatically when the workspace failed.
    AutoCheckpoint,
    /// A child's merge-back landed on this workspace's branch.
    Merge,
}

impl CommitKind {
    /// Stable lowercase name, as persisted in the registry.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::AutoCheckpoint => "auto_checkpoint",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitKind {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkpoint" => Ok(Self::Checkpoint),
            "auto_checkpoint" => Ok(Self::AutoCheckpoint),
            "merge" => Ok(Self::Merge),
            _ => Err(ValidationError {
                kind: ErrorKind::CommitKind,
                value: s.to_owned(),
                reason: "expected one of checkpoint, auto_checkpoint, merge".to_owned(),
            }),
        }
    }
}

/// Milliseconds since the Unix epoch, from the system clock.
#[must_use]
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// The kind of value that failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A [`GitOid`] validation error.
    GitOid,
    /// A [`WorkspaceId`] validation error.
    WorkspaceId,
    /// An [`AgentId`] validation error.
    AgentId,
    /// An unknown [`WorkspaceStatus`] name.
    WorkspaceStatus,
    /// An unknown [`CommitKind`] name.
    CommitKind,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitOid => write!(f, "GitOid"),
            Self::WorkspaceId => write!(f, "WorkspaceId"),
            Self::AgentId => write!(f, "AgentId"),
            Self::WorkspaceStatus => write!(f, "WorkspaceStatus"),
            Self::CommitKind => write!(f, "CommitKind"),
        }
    }
}

/// A validation error for core identifier types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// What kind of value was being validated.
    pub kind: ErrorKind,
    /// The invalid value.
    pub value: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?} ({})", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_oid_accepts_sha1_and_sha256_lengths() {
        assert!(GitOid::new(&"a".repeat(40)).is_ok());
        assert!(GitOid::new(&"0".repeat(64)).is_ok());
    }

    #[test]
    fn git_oid_rejects_bad_input() {
        assert!(GitOid::new("abc123").is_err());
        assert!(GitOid::new(&"A".repeat(40)).is_err());
        assert!(GitOid::new(&"g".repeat(40)).is_err());
    }

    #[test]
    fn git_oid_short_prefix() {
        let oid = GitOid::new("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(oid.short(), "0123456789ab");
    }

    #[test]
    fn git_oid_serde_roundtrip() {
        let oid = GitOid::new(&"d".repeat(40)).unwrap();
        let json = serde_json::to_string(&oid).unwrap();
        assert_eq!(json, format!("\"{}\"", "d".repeat(40)));
        let back: GitOid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, oid);
        assert!(serde_json::from_str::<GitOid>("\"nope\"").is_err());
    }

    #[test]
    fn generated_workspace_ids_are_valid_and_distinct() {
        let a = WorkspaceId::generate();
        let b = WorkspaceId::generate();
        assert!(WorkspaceId::new(a.as_str()).is_ok());
        assert!(a.as_str().starts_with("ws-"));
        assert_ne!(a, b);
    }

    #[test]
    fn workspace_id_rules() {
        assert!(WorkspaceId::new("ws-1").is_ok());
        assert!(WorkspaceId::new("").is_err());
        assert!(WorkspaceId::new("-ws").is_err());
        assert!(WorkspaceId::new("ws-").is_err());
        assert!(WorkspaceId::new("ws--1").is_err());
        assert!(WorkspaceId::new("WS-1").is_err());
        assert!(WorkspaceId::new("ws/1").is_err());
        assert!(WorkspaceId::new(&"a".repeat(65)).is_err());
    }

    #[test]
    fn agent_id_rules() {
        assert!(AgentId::new("agent-7").is_ok());
        assert!(AgentId::new("Agent_7.worker@host").is_ok());
        assert!(AgentId::new("").is_err());
        assert!(AgentId::new("has space").is_err());
        assert!(AgentId::new("tab\there").is_err());
        assert!(AgentId::new(&"x".repeat(129)).is_err());
    }

    #[test]
    fn status_names_roundtrip() {
        for status in WorkspaceStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkspaceStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<WorkspaceStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!WorkspaceStatus::Active.is_terminal());
        assert!(!WorkspaceStatus::Cleaned.is_terminal());
        for status in WorkspaceStatus::TERMINAL {
            assert!(status.is_terminal());
        }
        assert!(WorkspaceStatus::ConflictResolved.is_merged());
        assert!(!WorkspaceStatus::Failed.is_merged());
    }

    #[test]
    fn commit_kind_names_roundtrip() {
        for kind in [
            CommitKind::Checkpoint,
            CommitKind::AutoCheckpoint,
            CommitKind::Merge,
        ] {
            assert_eq!(kind.as_str().parse::<CommitKind>().unwrap(), kind);
        }
    }

    #[test]
    fn validation_error_display_names_kind() {
        let err = AgentId::new("").unwrap_err();
        assert!(err.to_string().starts_with("invalid AgentId"));
    }
}
