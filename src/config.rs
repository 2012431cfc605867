//! Engine configuration (`tandem.toml`).
//!
//! Defines the typed configuration for the workspace engine: repository
//! location, workspace placement and limits, merge policy, retention windows,
//! and the identity used for every commit the engine writes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::model::types::WorkspaceStatus;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
///
/// Parsed from `tandem.toml`. Missing fields use sensible defaults.
/// Missing file → all defaults (no error).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Repository settings.
    #[serde(default)]
    pub repo: RepoConfig,

    /// Workspace placement and limits.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Merge-back policy.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Retention windows and disk ceilings.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Commit identity.
    #[serde(default)]
    pub identity: IdentityConfig,
}

// ---------------------------------------------------------------------------
// RepoConfig
// ---------------------------------------------------------------------------

/// Repository settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// Repository root (default: `"."`).
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,

    /// The main history branch (default: `"main"`).
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            branch: default_branch(),
        }
    }
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_branch() -> String {
    "main".to_owned()
}

// ---------------------------------------------------------------------------
// WorkspaceConfig
// ---------------------------------------------------------------------------

/// Workspace placement and limits.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Directory holding one working copy per workspace.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// SQLite registry file.
    #[serde(default = "default_registry")]
    pub registry: PathBuf,

    /// Maximum number of simultaneously active workspaces.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of parent hops in a workspace chain.
    #[serde(default = "default_max_ancestry_depth")]
    pub max_ancestry_depth: u32,

    /// Write an automatic checkpoint before marking a workspace failed.
    #[serde(default = "default_auto_checkpoint_on_error")]
    pub auto_checkpoint_on_error: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            registry: default_registry(),
            max_concurrent: default_max_concurrent(),
            max_ancestry_depth: default_max_ancestry_depth(),
            auto_checkpoint_on_error: default_auto_checkpoint_on_error(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".tandem/workspaces")
}

fn default_registry() -> PathBuf {
    PathBuf::from(".tandem/registry.db")
}

const fn default_max_concurrent() -> usize {
    64
}

const fn default_max_ancestry_depth() -> u32 {
    8
}

const fn default_auto_checkpoint_on_error() -> bool {
    true
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Merge-back policy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Which side wins a newest-wins conflict when both timestamps are equal.
    #[serde(default)]
    pub tie_break: TieBreak,

    /// Bounded wait for the per-target merge lock, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl MergeConfig {
    /// The merge lock timeout as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

const fn default_lock_timeout_ms() -> u64 {
    30_000
}

/// Tie-break preference for equal newest-wins timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// The merging workspace wins ties.
    #[default]
    Child,
    /// The merge target keeps its version on ties.
    Target,
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Child => write!(f, "child"),
            Self::Target => write!(f, "target"),
        }
    }
}

// ---------------------------------------------------------------------------
// RetentionConfig
// ---------------------------------------------------------------------------

/// Retention windows per terminal status, disk ceilings, and sweep cadence.
///
/// ```toml
/// [retention]
/// merged_secs = 3600
/// failed_secs = 604800
/// disk_ceiling_bytes = 10_000_000_000
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_merged_secs")]
    pub merged_secs: u64,

    #[serde(default = "default_merged_secs")]
    pub conflict_resolved_secs: u64,

    #[serde(default = "default_abandoned_secs")]
    pub abandoned_secs: u64,

    /// Failed workspaces are kept longest so operators can diagnose them.
    #[serde(default = "default_failed_secs")]
    pub failed_secs: u64,

    /// Soft ceiling: above it the scheduler reclaims the oldest terminal
    /// workspaces early.
    #[serde(default)]
    pub disk_ceiling_bytes: Option<u64>,

    /// Hard ceiling: above it new workspaces are refused.
    #[serde(default)]
    pub disk_hard_ceiling_bytes: Option<u64>,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Archive branches instead of deleting them on cleanup.
    #[serde(default = "default_preserve_history")]
    pub preserve_history: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            merged_secs: default_merged_secs(),
            conflict_resolved_secs: default_merged_secs(),
            abandoned_secs: default_abandoned_secs(),
            failed_secs: default_failed_secs(),
            disk_ceiling_bytes: None,
            disk_hard_ceiling_bytes: None,
            cleanup_interval_secs: default_cleanup_interval_secs(),
            preserve_history: default_preserve_history(),
        }
    }
}

impl RetentionConfig {
    /// Retention window for a status, or `None` if the status is never
    /// eligible for scheduled cleanup.
    #[must_use]
    pub const fn window(&self, status: WorkspaceStatus) -> Option<Duration> {
        let secs = match status {
            WorkspaceStatus::Merged => self.merged_secs,
            WorkspaceStatus::ConflictResolved => self.conflict_resolved_secs,
            WorkspaceStatus::Abandoned => self.abandoned_secs,
            WorkspaceStatus::Failed => self.failed_secs,
            WorkspaceStatus::Active | WorkspaceStatus::Cleaned => return None,
        };
        Some(Duration::from_secs(secs))
    }

    /// The sweep cadence as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

const fn default_merged_secs() -> u64 {
    60 * 60
}

const fn default_abandoned_secs() -> u64 {
    24 * 60 * 60
}

const fn default_failed_secs() -> u64 {
    7 * 24 * 60 * 60
}

const fn default_cleanup_interval_secs() -> u64 {
    300
}

const fn default_preserve_history() -> bool {
    true
}

// ---------------------------------------------------------------------------
// IdentityConfig
// ---------------------------------------------------------------------------

/// Author and committer identity for engine-written commits.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_name")]
    pub name: String,
    #[serde(default = "default_identity_email")]
    pub email: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            email: default_identity_email(),
        }
    }
}

fn default_identity_name() -> String {
    "tandem".to_owned()
}

fn default_identity_email() -> String {
    "tandem@localhost".to_owned()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading an engine configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// Relative paths in the result are resolved against the directory
    /// containing `path`.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).map_err(|mut e| {
                e.path = Some(path.to_owned());
                e
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(dir);
        config.validate().map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })?;
        Ok(config)
    }

    /// Parse configuration from a TOML string. Paths are left as written.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }

    /// Defaults for a repository at `root`, with every path absolute.
    #[must_use]
    pub fn for_repo(root: &Path) -> Self {
        let mut config = Self::default();
        config.resolve_paths(root);
        config
    }

    /// Make `repo.path` absolute against `dir`, then the workspace paths
    /// absolute against `repo.path`.
    pub fn resolve_paths(&mut self, dir: &Path) {
        if self.repo.path.is_relative() {
            self.repo.path = normalize(&dir.join(&self.repo.path));
        }
        let root = self.repo.path.clone();
        for p in [&mut self.workspace.base_dir, &mut self.workspace.registry] {
            if p.is_relative() {
                *p = normalize(&root.join(&*p));
            }
        }
    }

    /// Reject values that parse but cannot work.
    ///
    /// # Errors
    /// Returns `ConfigError` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: &str| ConfigError {
            path: None,
            message: message.to_owned(),
        };
        if self.repo.branch.trim().is_empty() {
            return Err(fail("repo.branch must not be empty"));
        }
        if self.workspace.max_concurrent == 0 {
            return Err(fail("workspace.max_concurrent must be at least 1"));
        }
        if self.retention.cleanup_interval_secs == 0 {
            return Err(fail("retention.cleanup_interval_secs must be at least 1"));
        }
        if let (Some(soft), Some(hard)) = (
            self.retention.disk_ceiling_bytes,
            self.retention.disk_hard_ceiling_bytes,
        ) && soft > hard
        {
            return Err(fail(
                "retention.disk_ceiling_bytes must not exceed retention.disk_hard_ceiling_bytes",
            ));
        }
        Ok(())
    }
}

/// Drop `.` components so paths print cleanly; `..` is kept as written.
fn normalize(path: &Path) -> PathBuf {
    let cleaned: PathBuf = path
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect();
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
