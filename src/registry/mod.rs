//! Workspace registry: durable records of workspaces, commits, and merge
//! resolutions in SQLite.
//!
//! The registry is the only writer of these tables. Multi-row updates run in
//! a single transaction, and the one-active-workspace-per-agent rule is a
//! partial unique index, so concurrent allocation by the same agent is
//! rejected by the database rather than by a check-then-insert race.

mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, params};
use thiserror::Error;
use tracing::debug;

use crate::model::records::{
    Commit, ConflictEntry, MergeConflictResolution, MergeStats, NEWEST_WINS, Workspace,
};
use crate::model::types::{AgentId, CommitKind, GitOid, WorkspaceId, WorkspaceStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The agent already owns an active workspace.
    #[error("agent `{agent_id}` already owns an active workspace")]
    DuplicateActive { agent_id: String },

    /// Reserving another active workspace would exceed the limit.
    #[error("active workspace limit of {limit} reached")]
    LimitReached { limit: usize },

    /// A guarded status update found the workspace in another status.
    #[error("workspace `{id}` is {actual}, not in an expected status")]
    StaleStatus { id: String, actual: String },

    /// A stored row could not be decoded.
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },

    /// The registry directory could not be created.
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn corrupt(table: &'static str, detail: impl ToString) -> RegistryError {
    RegistryError::Corrupt {
        table,
        detail: detail.to_string(),
    }
}

fn is_unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.code == ErrorCode::ConstraintViolation && msg.contains(column)
    )
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Filter for [`Registry::list`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkspaceFilter {
    pub status: Option<WorkspaceStatus>,
    pub agent: Option<AgentId>,
}

/// A commit to append to a workspace's history.
#[derive(Clone, Debug)]
pub struct NewCommit<'a> {
    pub workspace_id: &'a WorkspaceId,
    pub commit_id: &'a GitOid,
    pub kind: CommitKind,
    pub message: &'a str,
    pub files_changed: u32,
    pub created_at_ms: i64,
}

/// Everything persisted when a merge completes.
#[derive(Clone, Debug)]
pub struct MergeRecord<'a> {
    pub workspace_id: &'a WorkspaceId,
    /// `merged` or `conflict_resolved`.
    pub status: WorkspaceStatus,
    pub source_branch: &'a str,
    pub target_branch: &'a str,
    pub conflicts: &'a [ConflictEntry],
    pub resulting_commit_id: &'a GitOid,
    pub stats: MergeStats,
    /// Merge commit to record in the parent workspace's history, if the
    /// target is a workspace and a commit was written.
    pub parent_commit: Option<NewCommit<'a>>,
    pub now_ms: i64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// SQLite-backed workspace registry.
#[derive(Debug)]
pub struct Registry {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

const WORKSPACE_COLUMNS: &str = "id, agent_id, parent_id, working_directory, branch, base_point, \
     status, ancestry_depth, created_at, updated_at, disk_bytes_estimate, archive_ref, status_reason";

const COMMIT_COLUMNS: &str =
    "workspace_id, iteration, commit_id, kind, message, files_changed, created_at";

const RESOLUTION_COLUMNS: &str = "id, workspace_id, source_branch, target_branch, \
     resolution_strategy, conflicts, resulting_commit_id, stats, created_at";

impl Registry {
    /// Open (or create) the registry database at `path`.
    ///
    /// # Errors
    /// Returns an error if the directory or database cannot be created.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn, Some(path.to_owned()))
    }

    /// Open a private in-memory registry.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, RegistryError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!(path = ?path, "registry opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file, or `None` for in-memory registries.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run raw SQL against the registry.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), RegistryError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    // -- workspaces --

    /// Insert a new `active` workspace if the agent has none and fewer than
    /// `max_active` workspaces are active.
    ///
    /// # Errors
    /// [`RegistryError::DuplicateActive`] or [`RegistryError::LimitReached`]
    /// when the reservation is refused.
    pub fn reserve_workspace(&self, ws: &Workspace, max_active: usize) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM workspaces WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        if usize::try_from(active).unwrap_or(usize::MAX) >= max_active {
            return Err(RegistryError::LimitReached { limit: max_active });
        }

        let inserted = tx.execute(
            &format!(
                "INSERT INTO workspaces ({WORKSPACE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                ws.id.as_str(),
                ws.agent_id.as_str(),
                ws.parent_id.as_ref().map(WorkspaceId::as_str),
                ws.working_directory.to_string_lossy().into_owned(),
                ws.branch,
                ws.base_point.as_str(),
                ws.status.as_str(),
                ws.ancestry_depth,
                ws.created_at_ms,
                ws.updated_at_ms,
                to_i64(ws.disk_bytes_estimate),
                ws.archive_ref,
                ws.status_reason,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e, "workspaces.agent_id") => {
                return Err(RegistryError::DuplicateActive {
                    agent_id: ws.agent_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a workspace row and its dependent rows. Used to roll back a
    /// failed allocation.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn remove_workspace(&self, id: &WorkspaceId) -> Result<(), RegistryError> {
        self.conn()
            .execute("DELETE FROM workspaces WHERE id = ?1", [id.as_str()])?;
        Ok(())
    }

    /// Look up a workspace.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable row.
    pub fn get(&self, id: &WorkspaceId) -> Result<Option<Workspace>, RegistryError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
                [id.as_str()],
                RawWorkspace::from_row,
            )
            .optional()?;
        raw.map(RawWorkspace::decode).transpose()
    }

    /// The agent's active workspace, if it has one.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable row.
    pub fn active_for_agent(&self, agent: &AgentId) -> Result<Option<Workspace>, RegistryError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {WORKSPACE_COLUMNS} FROM workspaces \
                     WHERE agent_id = ?1 AND status = 'active'"
                ),
                [agent.as_str()],
                RawWorkspace::from_row,
            )
            .optional()?;
        raw.map(RawWorkspace::decode).transpose()
    }

    /// The agent's most recently created workspace in any status.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable row.
    pub fn latest_for_agent(&self, agent: &AgentId) -> Result<Option<Workspace>, RegistryError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE agent_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                [agent.as_str()],
                RawWorkspace::from_row,
            )
            .optional()?;
        raw.map(RawWorkspace::decode).transpose()
    }

    /// Workspaces matching `filter`, oldest first.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable row.
    pub fn list(&self, filter: &WorkspaceFilter) -> Result<Vec<Workspace>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR agent_id = ?2) \
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map(
            params![
                filter.status.map(WorkspaceStatus::as_str),
                filter.agent.as_ref().map(AgentId::as_str),
            ],
            RawWorkspace::from_row,
        )?;
        rows.map(|r| r.map_err(RegistryError::from).and_then(RawWorkspace::decode))
            .collect()
    }

    /// Terminal (merged, conflict-resolved, abandoned, failed) workspaces,
    /// least recently updated first.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable row.
    pub fn terminal_workspaces(&self) -> Result<Vec<Workspace>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces \
             WHERE status IN ('merged', 'conflict_resolved', 'abandoned', 'failed') \
             ORDER BY updated_at, rowid"
        ))?;
        let rows = stmt.query_map([], RawWorkspace::from_row)?;
        rows.map(|r| r.map_err(RegistryError::from).and_then(RawWorkspace::decode))
            .collect()
    }

    /// Ids of active workspaces whose parent is `id`.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable id.
    pub fn active_children(&self, id: &WorkspaceId) -> Result<Vec<WorkspaceId>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM workspaces WHERE parent_id = ?1 AND status = 'active' ORDER BY id",
        )?;
        let rows = stmt.query_map([id.as_str()], |row| row.get::<_, String>(0))?;
        rows.map(|r| {
            let raw = r?;
            WorkspaceId::new(&raw).map_err(|e| corrupt("workspaces", e))
        })
        .collect()
    }

    /// Move a workspace from one of `from` to `to`.
    ///
    /// Returns `false` (and changes nothing) when the workspace is not in
    /// one of the `from` statuses.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn transition(
        &self,
        id: &WorkspaceId,
        from: &[WorkspaceStatus],
        to: WorkspaceStatus,
        reason: Option<&str>,
        now_ms: i64,
    ) -> Result<bool, RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let Some(current) = current_status(&tx, id)? else {
            return Ok(false);
        };
        if !from.contains(&current) {
            return Ok(false);
        }
        tx.execute(
            "UPDATE workspaces SET status = ?2, status_reason = COALESCE(?3, status_reason), \
             updated_at = ?4 WHERE id = ?1",
            params![id.as_str(), to.as_str(), reason, now_ms],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Mark a non-active workspace `cleaned`, zeroing its disk estimate.
    ///
    /// Returns `false` if the workspace is active or already cleaned.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn mark_cleaned(
        &self,
        id: &WorkspaceId,
        archive_ref: Option<&str>,
        now_ms: i64,
    ) -> Result<bool, RegistryError> {
        let changed = self.conn().execute(
            "UPDATE workspaces SET status = 'cleaned', disk_bytes_estimate = 0, \
             archive_ref = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status NOT IN ('active', 'cleaned')",
            params![id.as_str(), archive_ref, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Store a fresh disk usage estimate.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn set_disk_estimate(&self, id: &WorkspaceId, bytes: u64) -> Result<(), RegistryError> {
        self.conn().execute(
            "UPDATE workspaces SET disk_bytes_estimate = ?2 WHERE id = ?1 AND status != 'cleaned'",
            params![id.as_str(), to_i64(bytes)],
        )?;
        Ok(())
    }

    /// Sum of disk estimates over every workspace that still has a
    /// working directory.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn total_disk_bytes(&self) -> Result<u64, RegistryError> {
        let total: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(disk_bytes_estimate), 0) FROM workspaces \
             WHERE status != 'cleaned'",
            [],
            |row| row.get(0),
        )?;
        Ok(to_u64(total))
    }

    // -- commits --

    /// Append a commit with the next iteration number.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn record_commit(&self, commit: &NewCommit<'_>) -> Result<Commit, RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let recorded = insert_commit(&tx, commit)?;
        tx.commit()?;
        Ok(recorded)
    }

    /// Every commit of a workspace, by iteration.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable row.
    pub fn commits(&self, id: &WorkspaceId) -> Result<Vec<Commit>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM workspace_commits \
             WHERE workspace_id = ?1 ORDER BY iteration"
        ))?;
        let rows = stmt.query_map([id.as_str()], RawCommit::from_row)?;
        rows.map(|r| r.map_err(RegistryError::from).and_then(RawCommit::decode))
            .collect()
    }

    /// Engine-recorded time of a commit: a checkpoint row first, then a
    /// merge resolution that produced it.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn commit_time_ms(&self, commit_id: &GitOid) -> Result<Option<i64>, RegistryError> {
        let conn = self.conn();
        let from_commits: Option<i64> = conn
            .query_row(
                "SELECT MIN(created_at) FROM workspace_commits WHERE commit_id = ?1",
                [commit_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if from_commits.is_some() {
            return Ok(from_commits);
        }
        let from_merges: Option<i64> = conn
            .query_row(
                "SELECT MIN(created_at) FROM merge_conflict_resolutions \
                 WHERE resulting_commit_id = ?1",
                [commit_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(from_merges)
    }

    // -- merges --

    /// Atomically mark the workspace merged, append the parent's merge
    /// commit (if any), and insert the resolution record.
    ///
    /// # Errors
    /// [`RegistryError::StaleStatus`] if the workspace is no longer active.
    pub fn finish_merge(
        &self,
        record: &MergeRecord<'_>,
    ) -> Result<MergeConflictResolution, RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current = current_status(&tx, record.workspace_id)?;
        if current != Some(WorkspaceStatus::Active) {
            return Err(RegistryError::StaleStatus {
                id: record.workspace_id.to_string(),
                actual: current.map_or_else(|| "missing".to_owned(), |s| s.to_string()),
            });
        }
        tx.execute(
            "UPDATE workspaces SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                record.workspace_id.as_str(),
                record.status.as_str(),
                record.now_ms
            ],
        )?;

        if let Some(parent_commit) = &record.parent_commit {
            insert_commit(&tx, parent_commit)?;
        }

        let conflicts_json =
            serde_json::to_string(record.conflicts).map_err(|e| corrupt("resolution", e))?;
        let stats_json =
            serde_json::to_string(&record.stats).map_err(|e| corrupt("resolution", e))?;
        tx.execute(
            "INSERT INTO merge_conflict_resolutions (workspace_id, source_branch, target_branch, \
             resolution_strategy, conflicts, resulting_commit_id, stats, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.workspace_id.as_str(),
                record.source_branch,
                record.target_branch,
                NEWEST_WINS,
                conflicts_json,
                record.resulting_commit_id.as_str(),
                stats_json,
                record.now_ms,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(MergeConflictResolution {
            id,
            workspace_id: record.workspace_id.clone(),
            source_branch: record.source_branch.to_owned(),
            target_branch: record.target_branch.to_owned(),
            resolution_strategy: NEWEST_WINS.to_owned(),
            conflicts: record.conflicts.to_vec(),
            resulting_commit_id: record.resulting_commit_id.clone(),
            stats: record.stats,
            created_at_ms: record.now_ms,
        })
    }

    /// Resolution records of a workspace, oldest first.
    ///
    /// # Errors
    /// Returns an error on SQLite failure or an undecodable row.
    pub fn resolutions(
        &self,
        id: &WorkspaceId,
    ) -> Result<Vec<MergeConflictResolution>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESOLUTION_COLUMNS} FROM merge_conflict_resolutions \
             WHERE workspace_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([id.as_str()], RawResolution::from_row)?;
        rows.map(|r| {
            r.map_err(RegistryError::from)
                .and_then(RawResolution::decode)
        })
        .collect()
    }
}

fn current_status(
    tx: &Transaction<'_>,
    id: &WorkspaceId,
) -> Result<Option<WorkspaceStatus>, RegistryError> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT status FROM workspaces WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| s.parse().map_err(|e| corrupt("workspaces", e)))
        .transpose()
}

fn insert_commit(tx: &Transaction<'_>, commit: &NewCommit<'_>) -> Result<Commit, RegistryError> {
    let iteration: u32 = tx.query_row(
        "SELECT COALESCE(MAX(iteration), 0) + 1 FROM workspace_commits WHERE workspace_id = ?1",
        [commit.workspace_id.as_str()],
        |row| row.get(0),
    )?;
    tx.execute(
        &format!("INSERT INTO workspace_commits ({COMMIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            commit.workspace_id.as_str(),
            iteration,
            commit.commit_id.as_str(),
            commit.kind.as_str(),
            commit.message,
            commit.files_changed,
            commit.created_at_ms,
        ],
    )?;
    Ok(Commit {
        commit_id: commit.commit_id.clone(),
        workspace_id: commit.workspace_id.clone(),
        iteration,
        kind: commit.kind,
        message: commit.message.to_owned(),
        files_changed: commit.files_changed,
        created_at_ms: commit.created_at_ms,
    })
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct RawWorkspace {
    id: String,
    agent_id: String,
    parent_id: Option<String>,
    working_directory: String,
    branch: String,
    base_point: String,
    status: String,
    ancestry_depth: u32,
    created_at: i64,
    updated_at: i64,
    disk_bytes_estimate: i64,
    archive_ref: Option<String>,
    status_reason: Option<String>,
}

impl RawWorkspace {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            parent_id: row.get(2)?,
            working_directory: row.get(3)?,
            branch: row.get(4)?,
            base_point: row.get(5)?,
            status: row.get(6)?,
            ancestry_depth: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            disk_bytes_estimate: row.get(10)?,
            archive_ref: row.get(11)?,
            status_reason: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Workspace, RegistryError> {
        let bad = |e| corrupt("workspaces", e);
        Ok(Workspace {
            id: WorkspaceId::new(&self.id).map_err(bad)?,
            agent_id: AgentId::new(&self.agent_id).map_err(bad)?,
            parent_id: self
                .parent_id
                .as_deref()
                .map(WorkspaceId::new)
                .transpose()
                .map_err(bad)?,
            working_directory: PathBuf::from(self.working_directory),
            branch: self.branch,
            base_point: GitOid::new(&self.base_point).map_err(bad)?,
            status: self.status.parse().map_err(bad)?,
            ancestry_depth: self.ancestry_depth,
            created_at_ms: self.created_at,
            updated_at_ms: self.updated_at,
            disk_bytes_estimate: to_u64(self.disk_bytes_estimate),
            archive_ref: self.archive_ref,
            status_reason: self.status_reason,
        })
    }
}

struct RawCommit {
    workspace_id: String,
    iteration: u32,
    commit_id: String,
    kind: String,
    message: String,
    files_changed: u32,
    created_at: i64,
}

impl RawCommit {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            workspace_id: row.get(0)?,
            iteration: row.get(1)?,
            commit_id: row.get(2)?,
            kind: row.get(3)?,
            message: row.get(4)?,
            files_changed: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<Commit, RegistryError> {
        let bad = |e| corrupt("workspace_commits", e);
        Ok(Commit {
            commit_id: GitOid::new(&self.commit_id).map_err(bad)?,
            workspace_id: WorkspaceId::new(&self.workspace_id).map_err(bad)?,
            iteration: self.iteration,
            kind: self.kind.parse().map_err(bad)?,
            message: self.message,
            files_changed: self.files_changed,
            created_at_ms: self.created_at,
        })
    }
}

struct RawResolution {
    id: i64,
    workspace_id: String,
    source_branch: String,
    target_branch: String,
    resolution_strategy: String,
    conflicts: String,
    resulting_commit_id: String,
    stats: String,
    created_at: i64,
}

impl RawResolution {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            source_branch: row.get(2)?,
            target_branch: row.get(3)?,
            resolution_strategy: row.get(4)?,
            conflicts: row.get(5)?,
            resulting_commit_id: row.get(6)?,
            stats: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<MergeConflictResolution, RegistryError> {
        let table = "merge_conflict_resolutions";
        Ok(MergeConflictResolution {
            id: self.id,
            workspace_id: WorkspaceId::new(&self.workspace_id).map_err(|e| corrupt(table, e))?,
            source_branch: self.source_branch,
            target_branch: self.target_branch,
            resolution_strategy: self.resolution_strategy,
            conflicts: serde_json::from_str(&self.conflicts).map_err(|e| corrupt(table, e))?,
            resulting_commit_id: GitOid::new(&self.resulting_commit_id)
                .map_err(|e| corrupt(table, e))?,
            stats: serde_json::from_str(&self.stats).map_err(|e| corrupt(table, e))?,
            created_at_ms: self.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
