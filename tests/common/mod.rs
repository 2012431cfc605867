//! Shared harness for tandem integration tests.
//!
//! [`TestEngine`] owns a temporary directory holding a git repository with
//! one commit on `main` (`repo/`), a workspace directory outside it
//! (`workspaces/`), and a registry file (`registry.db`). Everything runs
//! against the real `git` binary and is deleted on drop.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tandem::config::EngineConfig;
use tandem::facade::RuntimeFacade;
use tandem::lifecycle::{Allocation, WorkspaceManager};
use tandem::model::records::Commit;
use tandem::model::types::{AgentId, WorkspaceId};
use tempfile::TempDir;

/// A fixed date for commits whose timestamps must tie.
pub const FIXED_DATE: &str = "2024-01-01T00:00:00+00:00";

pub struct TestEngine {
    _dir: TempDir,
    repo: PathBuf,
    pub manager: Arc<WorkspaceManager>,
}

impl TestEngine {
    /// A repository with `README.md` committed on `main` and default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Like [`TestEngine::new`], letting the test adjust the config first.
    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).expect("failed to create repo dir");

        git_ok(&repo, &["init", "--quiet"]);
        git_ok(&repo, &["config", "user.name", "Test"]);
        git_ok(&repo, &["config", "user.email", "test@localhost"]);
        git_ok(&repo, &["config", "commit.gpgsign", "false"]);
        git_ok(&repo, &["checkout", "--quiet", "-B", "main"]);
        fs::write(repo.join("README.md"), "# test repo\n").expect("failed to write README");
        git_ok(&repo, &["add", "README.md"]);
        git_ok(&repo, &["commit", "--quiet", "-m", "initial commit"]);

        let mut config = EngineConfig::for_repo(&repo);
        config.workspace.base_dir = dir.path().join("workspaces");
        config.workspace.registry = dir.path().join("registry.db");
        adjust(&mut config);

        let manager = WorkspaceManager::open(config).expect("failed to open engine");
        Self {
            _dir: dir,
            repo,
            manager: Arc::new(manager),
        }
    }

    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    #[must_use]
    pub fn facade(&self) -> RuntimeFacade {
        RuntimeFacade::new(Arc::clone(&self.manager))
    }

    /// Allocate a root workspace for `agent`.
    pub fn create(&self, agent: &str) -> Allocation {
        self.manager
            .create_workspace(&agent_id(agent), None)
            .expect("create_workspace failed")
    }

    /// Allocate a workspace for `agent` starting from `parent`.
    pub fn create_child(&self, agent: &str, parent: &WorkspaceId) -> Allocation {
        self.manager
            .create_workspace(&agent_id(agent), Some(parent))
            .expect("create_workspace with parent failed")
    }

    /// Write `content` to `path` inside `ws` and checkpoint.
    pub fn commit_file(&self, ws: &Allocation, path: &str, content: &str) -> Commit {
        write(&ws.working_directory, path, content);
        self.manager
            .checkpoint(&ws.workspace_id, None)
            .expect("checkpoint failed")
    }

    /// Commit `path` on `main` directly in the repository checkout.
    pub fn commit_on_main(&self, path: &str, content: &str) {
        write(&self.repo, path, content);
        git_ok(&self.repo, &["add", "-A"]);
        git_ok(&self.repo, &["commit", "--quiet", "-m", &format!("main: {path}")]);
    }

    /// Content of `path` in the main checkout, if it exists.
    #[must_use]
    pub fn main_file(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.repo.join(path)).ok()
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        git_ok(&self.repo, args)
    }
}

#[must_use]
pub fn agent_id(name: &str) -> AgentId {
    AgentId::new(name).expect("invalid agent id")
}

/// Write a file, creating parent directories.
pub fn write(dir: &Path, path: &str, content: &str) {
    let full = dir.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).expect("failed to create parent dir");
    }
    fs::write(full, content).expect("failed to write file");
}

/// Read a file, or `None` if it does not exist.
#[must_use]
pub fn read(dir: &Path, path: &str) -> Option<String> {
    fs::read_to_string(dir.join(path)).ok()
}

/// Run git in `dir`, panicking on failure. Returns trimmed stdout.
pub fn git_ok(dir: &Path, args: &[&str]) -> String {
    run_git(dir, args, None)
}

/// Stage everything in `dir` and commit with author and committer date
/// pinned to [`FIXED_DATE`], bypassing the engine.
pub fn commit_at_fixed_date(dir: &Path, message: &str) {
    run_git(dir, &["add", "-A"], None);
    run_git(dir, &["commit", "--quiet", "-m", message], Some(FIXED_DATE));
}

fn run_git(dir: &Path, args: &[&str], date: Option<&str>) -> String {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@localhost")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@localhost");
    if let Some(date) = date {
        cmd.env("GIT_AUTHOR_DATE", date).env("GIT_COMMITTER_DATE", date);
    }
    let out = cmd.output().expect("failed to run git");
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_owned()
}
