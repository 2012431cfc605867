//! Registry schema. Applied idempotently on every open.

/// Tables, indexes, and immutability triggers.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS workspaces (
    id                  TEXT PRIMARY KEY,
    agent_id            TEXT NOT NULL,
    parent_id           TEXT REFERENCES workspaces(id),
    working_directory   TEXT NOT NULL,
    branch              TEXT NOT NULL UNIQUE,
    base_point          TEXT NOT NULL,
    status              TEXT NOT NULL,
    ancestry_depth      INTEGER NOT NULL,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    disk_bytes_estimate INTEGER NOT NULL DEFAULT 0,
    archive_ref         TEXT,
    status_reason       TEXT
);

-- One active workspace per agent.
CREATE UNIQUE INDEX IF NOT EXISTS idx_workspaces_active_agent
    ON workspaces(agent_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_workspaces_parent ON workspaces(parent_id);
CREATE INDEX IF NOT EXISTS idx_workspaces_status ON workspaces(status, updated_at);

CREATE TRIGGER IF NOT EXISTS workspaces_base_point_immutable
BEFORE UPDATE OF base_point ON workspaces
WHEN NEW.base_point IS NOT OLD.base_point
BEGIN
    SELECT RAISE(ABORT, 'base_point is immutable');
END;

CREATE TABLE IF NOT EXISTS workspace_commits (
    workspace_id  TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    iteration     INTEGER NOT NULL,
    commit_id     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    message       TEXT NOT NULL,
    files_changed INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    PRIMARY KEY (workspace_id, iteration)
);

CREATE INDEX IF NOT EXISTS idx_commits_commit_id ON workspace_commits(commit_id);

CREATE TRIGGER IF NOT EXISTS workspace_commits_immutable
BEFORE UPDATE ON workspace_commits
BEGIN
    SELECT RAISE(ABORT, 'commits are immutable');
END;

CREATE TABLE IF NOT EXISTS merge_conflict_resolutions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id        TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    source_branch       TEXT NOT NULL,
    target_branch       TEXT NOT NULL,
    resolution_strategy TEXT NOT NULL,
    conflicts           TEXT NOT NULL,
    resulting_commit_id TEXT NOT NULL,
    stats               TEXT NOT NULL,
    created_at          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resolutions_workspace
    ON merge_conflict_resolutions(workspace_id);
CREATE INDEX IF NOT EXISTS idx_resolutions_commit
    ON merge_conflict_resolutions(resulting_commit_id);
";
