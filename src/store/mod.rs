//! Snapshot store: branch-backed history on top of the git CLI.
//!
//! Every workspace owns a branch `tandem/ws/<id>` and a linked worktree.
//! The store exposes the primitives the lifecycle manager and the merge
//! engine compose: create a branch at a point, materialize or remove a
//! worktree, commit a worktree's contents, diff two points, build a merge
//! commit, and advance a branch with compare-and-swap.
//!
//! Commands that touch the shared worktree administration area
//! (`git worktree add/remove/prune`) and branch deletion are serialized
//! through a repository-wide mutex; everything else runs concurrently.

pub mod diff;
pub mod refs;
pub mod tree;

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::IdentityConfig;
use crate::model::records::ChangeSet;
use crate::model::types::GitOid;

pub use tree::{FlatTree, TreeEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from snapshot store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A git command exited non-zero.
    #[error("`{command}` failed{}: {stderr}", exit_suffix(.exit_code))]
    GitCommand {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// Git ran out of disk space.
    #[error("`{command}` ran out of disk space: {stderr}")]
    DiskFull { command: String, stderr: String },

    /// A compare-and-swap ref update lost a race.
    #[error("ref `{ref_name}` was modified concurrently")]
    CasMismatch { ref_name: String },

    /// Local edits in a worktree block a fast-forward.
    #[error("worktree {} has local changes that block the update: {stderr}", path.display())]
    DirtyWorktree { path: PathBuf, stderr: String },

    /// Git printed something that is not a valid object ID.
    #[error("invalid OID from {context}: {raw:?}")]
    InvalidOid { context: String, raw: String },

    /// Git output did not have the expected shape.
    #[error("unexpected output from `{command}`: {detail:?}")]
    MalformedOutput { command: String, detail: String },

    /// A path in a tree is not valid UTF-8; `path` is its escaped form.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path { path: String },

    /// A ref, branch, or path does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Spawning git or a filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (exit code {c})")).unwrap_or_default()
}

impl StoreError {
    /// Classify a failed git invocation.
    pub(crate) fn from_output(command: &str, output: &Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.contains("No space left on device") {
            return Self::DiskFull {
                command: command.to_owned(),
                stderr,
            };
        }
        Self::GitCommand {
            command: command.to_owned(),
            stderr,
            exit_code: output.status.code(),
        }
    }

    /// Returns `true` if the failure was caused by exhausted disk space.
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        match self {
            Self::DiskFull { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Git plumbing
// ---------------------------------------------------------------------------

/// A `git` command rooted at `dir` with a stable locale and no prompts.
pub(crate) fn git_command(dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(dir)
        .env("LC_ALL", "C")
        .env("GIT_TERMINAL_PROMPT", "0");
    cmd
}

fn run(dir: &Path, args: &[&str]) -> Result<Output, StoreError> {
    debug!(dir = %dir.display(), args = ?args, "git");
    let output = git_command(dir).args(args).output()?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(StoreError::from_output(
            &format!("git {}", args.join(" ")),
            &output,
        ))
    }
}

fn run_stdout(dir: &Path, args: &[&str]) -> Result<String, StoreError> {
    let output = run(dir, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Returns `true` if `dir` has staged, unstaged, or untracked changes.
fn has_local_changes(dir: &Path) -> Result<bool, StoreError> {
    let output = run(dir, &["status", "--porcelain", "-z", "--untracked-files=normal"])?;
    Ok(!output.stdout.is_empty())
}

fn parse_oid(raw: String, context: &str) -> Result<GitOid, StoreError> {
    GitOid::new(&raw).map_err(|_| StoreError::InvalidOid {
        context: context.to_owned(),
        raw,
    })
}

/// Author/committer identity applied to every commit the store writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    name: String,
    email: String,
}

impl Identity {
    #[must_use]
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.to_owned(),
            email: email.to_owned(),
        }
    }

    pub(crate) fn apply(&self, cmd: &mut Command) {
        cmd.env("GIT_AUTHOR_NAME", &self.name)
            .env("GIT_AUTHOR_EMAIL", &self.email)
            .env("GIT_COMMITTER_NAME", &self.name)
            .env("GIT_COMMITTER_EMAIL", &self.email);
    }
}

impl From<&IdentityConfig> for Identity {
    fn from(config: &IdentityConfig) -> Self {
        Self::new(&config.name, &config.email)
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Git-backed snapshot store for one repository.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    identity: Identity,
    admin: Mutex<()>,
}

impl SnapshotStore {
    /// Open the repository at `root`.
    ///
    /// # Errors
    /// Returns an error if `root` is not inside a git repository.
    pub fn open(root: &Path, identity: Identity) -> Result<Self, StoreError> {
        run(root, &["rev-parse", "--git-dir"])?;
        Ok(Self {
            root: root.to_owned(),
            identity,
            admin: Mutex::new(()),
        })
    }

    /// Repository root the store runs commands in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn admin_lock(&self) -> MutexGuard<'_, ()> {
        self.admin.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- points and branches --

    /// Resolve any revision expression to a commit OID.
    ///
    /// # Errors
    /// Returns an error if git fails for a reason other than an unknown name.
    pub fn resolve_commit(&self, rev: &str) -> Result<Option<GitOid>, StoreError> {
        refs::read_ref(&self.root, &format!("{rev}^{{commit}}"))
    }

    /// Tip of a branch.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if the branch does not exist.
    pub fn branch_head(&self, branch: &str) -> Result<GitOid, StoreError> {
        refs::read_ref(&self.root, &refs::branch_ref(branch))?.ok_or_else(|| {
            StoreError::NotFound {
                what: format!("branch {branch}"),
            }
        })
    }

    /// Create `branch` at `at`. Fails if the branch already exists.
    ///
    /// # Errors
    /// [`StoreError::CasMismatch`] if the branch exists, otherwise git failures.
    pub fn create_branch(&self, branch: &str, at: &GitOid) -> Result<(), StoreError> {
        refs::create_ref(&self.root, &refs::branch_ref(branch), at)
    }

    /// Delete `branch`. Deleting a missing branch is a no-op.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn delete_branch(&self, branch: &str) -> Result<(), StoreError> {
        let _admin = self.admin_lock();
        refs::delete_ref(&self.root, &refs::branch_ref(branch))
    }

    /// Move `branch` into `archive_ref` and return the archived tip.
    ///
    /// # Errors
    /// Returns an error if the branch is missing or a ref update fails.
    pub fn archive_branch(&self, branch: &str, archive_ref: &str) -> Result<GitOid, StoreError> {
        let tip = self.branch_head(branch)?;
        refs::write_ref(&self.root, archive_ref, &tip)?;
        self.delete_branch(branch)?;
        Ok(tip)
    }

    /// Advance `branch` from `expected` to `new`.
    ///
    /// When the branch is checked out in a worktree, the worktree is
    /// fast-forwarded so its files follow the branch; otherwise the ref is
    /// moved with compare-and-swap.
    ///
    /// # Errors
    /// - [`StoreError::CasMismatch`] if the branch is no longer at `expected`.
    /// - [`StoreError::DirtyWorktree`] if local edits block the fast-forward.
    pub fn advance_branch(
        &self,
        branch: &str,
        expected: &GitOid,
        new: &GitOid,
    ) -> Result<(), StoreError> {
        let Some(dir) = self.checked_out_at(branch)? else {
            return refs::write_ref_cas(&self.root, &refs::branch_ref(branch), expected, new);
        };

        let current = self.worktree_head(&dir)?;
        if &current != expected {
            return Err(StoreError::CasMismatch {
                ref_name: refs::branch_ref(branch),
            });
        }

        let output = git_command(&dir)
            .args(["merge", "--ff-only", "--quiet", new.as_str()])
            .output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let blocked_by_files =
            stderr.contains("would be overwritten") || stderr.contains("untracked working tree");
        if blocked_by_files && has_local_changes(&dir)? {
            return Err(StoreError::DirtyWorktree { path: dir, stderr });
        }
        Err(StoreError::from_output(
            &format!("git merge --ff-only {new}"),
            &output,
        ))
    }

    /// Move `branch` back from `expected` to `to`, undoing an advance.
    ///
    /// A checked-out branch is reset with `git reset --keep`, which refuses
    /// rather than discards local edits to the affected files.
    ///
    /// # Errors
    /// - [`StoreError::CasMismatch`] if the branch is no longer at `expected`.
    /// - Any git failure, including a refused `reset --keep`.
    pub fn rewind_branch(
        &self,
        branch: &str,
        expected: &GitOid,
        to: &GitOid,
    ) -> Result<(), StoreError> {
        let Some(dir) = self.checked_out_at(branch)? else {
            return refs::write_ref_cas(&self.root, &refs::branch_ref(branch), expected, to);
        };
        if &self.worktree_head(&dir)? != expected {
            return Err(StoreError::CasMismatch {
                ref_name: refs::branch_ref(branch),
            });
        }
        run(&dir, &["reset", "--keep", "--quiet", to.as_str()])?;
        Ok(())
    }

    /// The worktree directory where `branch` is checked out, if any.
    ///
    /// # Errors
    /// Returns an error if `git worktree list` fails.
    pub fn checked_out_at(&self, branch: &str) -> Result<Option<PathBuf>, StoreError> {
        let listing = run_stdout(&self.root, &["worktree", "list", "--porcelain"])?;
        let wanted = refs::branch_ref(branch);
        let mut current: Option<&str> = None;
        for line in listing.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current = Some(path);
            } else if line.strip_prefix("branch ") == Some(wanted.as_str())
                && let Some(path) = current
            {
                return Ok(Some(PathBuf::from(path)));
            }
        }
        Ok(None)
    }

    // -- worktrees --

    /// Check out `branch` into a new worktree at `dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or git fails.
    pub fn add_worktree(&self, dir: &Path, branch: &str) -> Result<(), StoreError> {
        let _admin = self.admin_lock();
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dir_str = dir.to_string_lossy();
        run(
            &self.root,
            &[
                "-c",
                "core.autocrlf=false",
                "worktree",
                "add",
                "--quiet",
                &dir_str,
                branch,
            ],
        )?;
        Ok(())
    }

    /// Remove the worktree at `dir`, deleting the directory even when git
    /// no longer recognizes it.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be deleted.
    pub fn remove_worktree(&self, dir: &Path) -> Result<(), StoreError> {
        let _admin = self.admin_lock();
        let dir_str = dir.to_string_lossy();
        if let Err(e) = run(&self.root, &["worktree", "remove", "--force", &dir_str]) {
            debug!(error = %e, dir = %dir.display(), "worktree remove failed; deleting directory");
        }
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        if let Err(e) = run(&self.root, &["worktree", "prune"]) {
            warn!(error = %e, "git worktree prune failed");
        }
        Ok(())
    }

    /// Current `HEAD` of a worktree.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn worktree_head(&self, dir: &Path) -> Result<GitOid, StoreError> {
        parse_oid(run_stdout(dir, &["rev-parse", "HEAD"])?, "worktree HEAD")
    }

    /// Commit every change in the worktree at `dir` (including untracked and
    /// deleted files) and return the new commit. Empty commits are allowed.
    ///
    /// On failure the index is reset so the worktree is left as it was.
    ///
    /// # Errors
    /// Returns an error if staging or committing fails.
    pub fn commit_all(&self, dir: &Path, message: &str) -> Result<GitOid, StoreError> {
        let result = self.stage_and_commit(dir, message);
        if result.is_err()
            && let Err(e) = run(dir, &["reset", "--quiet"])
        {
            warn!(error = %e, dir = %dir.display(), "could not unstage after failed commit");
        }
        result
    }

    fn stage_and_commit(&self, dir: &Path, message: &str) -> Result<GitOid, StoreError> {
        run(dir, &["add", "-A"])?;
        let mut cmd = git_command(dir);
        self.identity.apply(&mut cmd);
        let output = cmd
            .args([
                "-c",
                "commit.gpgsign=false",
                "commit",
                "--allow-empty",
                "--no-verify",
                "--quiet",
                "-m",
                message,
            ])
            .output()?;
        if !output.status.success() {
            return Err(StoreError::from_output("git commit --allow-empty", &output));
        }
        self.worktree_head(dir)
    }

    /// Move the worktree's branch back to `to`, keeping files and index.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn reset_soft(&self, dir: &Path, to: &GitOid) -> Result<(), StoreError> {
        run(dir, &["reset", "--soft", "--quiet", to.as_str()])?;
        Ok(())
    }

    // -- reading history --

    /// Number of paths a single-parent commit changed.
    ///
    /// # Errors
    /// Returns an error if git fails, or [`StoreError::NonUtf8Path`] if a
    /// changed path is not valid UTF-8.
    pub fn files_changed(&self, commit: &GitOid) -> Result<u32, StoreError> {
        let output = run(
            &self.root,
            &[
                "diff-tree",
                "--no-commit-id",
                "--name-only",
                "--no-renames",
                "-r",
                "--root",
                "-z",
                commit.as_str(),
            ],
        )?;
        let mut count = 0_u32;
        for raw in output.stdout.split(|b| *b == 0).filter(|p| !p.is_empty()) {
            tree::utf8_path(raw)?;
            count = count.saturating_add(1);
        }
        Ok(count)
    }

    /// Tree OID of a commit.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn tree_of(&self, commit: &GitOid) -> Result<GitOid, StoreError> {
        parse_oid(
            run_stdout(&self.root, &["rev-parse", &format!("{commit}^{{tree}}")])?,
            "commit tree",
        )
    }

    /// Committer time of a commit, in milliseconds.
    ///
    /// # Errors
    /// Returns an error if git fails or prints a non-numeric time.
    pub fn commit_time_ms(&self, commit: &GitOid) -> Result<i64, StoreError> {
        let raw = run_stdout(&self.root, &["show", "-s", "--format=%ct", commit.as_str()])?;
        raw.parse::<i64>()
            .map(|secs| secs.saturating_mul(1000))
            .map_err(|_| StoreError::MalformedOutput {
                command: "git show -s --format=%ct".to_owned(),
                detail: raw,
            })
    }

    /// Every leaf of a commit's tree.
    ///
    /// # Errors
    /// See [`tree::read_flat_tree`].
    pub fn flat_tree(&self, commit: &GitOid) -> Result<FlatTree, StoreError> {
        tree::read_flat_tree(&self.root, commit)
    }

    /// Changes between two points.
    ///
    /// # Errors
    /// See [`diff::change_set`].
    pub fn change_set(&self, from: &GitOid, to: &GitOid) -> Result<ChangeSet, StoreError> {
        diff::change_set(&self.root, from, to)
    }

    /// Most recent commit in `base..tip` touching `path`.
    ///
    /// # Errors
    /// See [`diff::last_touch`].
    pub fn last_touch(
        &self,
        base: &GitOid,
        tip: &GitOid,
        path: &str,
    ) -> Result<Option<GitOid>, StoreError> {
        diff::last_touch(&self.root, base, tip, path)
    }

    /// Contents of `path` at `rev`, or `None` if the path does not exist there.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn read_file(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(blob) = refs::read_ref(&self.root, &format!("{rev}:{path}"))? else {
            return Ok(None);
        };
        let output = run(&self.root, &["cat-file", "blob", blob.as_str()])?;
        Ok(Some(output.stdout))
    }

    // -- writing merge results --

    /// Write a commit whose tree is `flat` and whose parents are `parents`.
    ///
    /// # Errors
    /// Returns an error if tree or commit construction fails.
    pub fn write_commit(
        &self,
        flat: &FlatTree,
        parents: &[&GitOid],
        message: &str,
    ) -> Result<GitOid, StoreError> {
        let tree = tree::build_tree(&self.root, flat)?;
        tree::commit_tree(&self.root, &self.identity, &tree, parents, message)
    }

    /// Add `pattern` to the repository's `info/exclude` if missing.
    ///
    /// # Errors
    /// Returns an error if the exclude file cannot be read or written.
    pub fn exclude(&self, pattern: &str) -> Result<(), StoreError> {
        let common = PathBuf::from(run_stdout(&self.root, &["rev-parse", "--git-common-dir"])?);
        let common = if common.is_absolute() {
            common
        } else {
            self.root.join(common)
        };
        let path = common.join("info").join("exclude");
        let existing = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(pattern);
        updated.push('\n');
        std::fs::write(&path, updated)?;
        Ok(())
    }
}

/// Bytes used by the files under `dir`, excluding its `.git` entry.
///
/// Unreadable entries are skipped; a missing directory counts as zero.
#[must_use]
pub fn disk_usage(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == ".git"))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::Path;
    use std::process::Command;

    use tempfile::TempDir;

    use crate::model::types::GitOid;

    /// Run git in `dir`, panicking on failure; returns trimmed stdout.
    pub fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_owned()
    }

    /// Fresh repo on `main` with one commit containing `README.md`.
    pub fn init_repo() -> (TempDir, GitOid) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        git(root, &["init", "--quiet"]);
        git(root, &["config", "user.name", "Test"]);
        git(root, &["config", "user.email", "test@test.com"]);
        git(root, &["config", "commit.gpgsign", "false"]);
        git(root, &["checkout", "--quiet", "-B", "main"]);
        fs::write(root.join("README.md"), "# Test\n").unwrap();
        let head = commit_all(root, "initial");
        (dir, head)
    }

    /// Stage everything in `dir` and commit it.
    pub fn commit_all(dir: &Path, message: &str) -> GitOid {
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "--quiet", "--allow-empty", "-m", message]);
        GitOid::new(&git(dir, &["rev-parse", "HEAD"])).unwrap()
    }

    /// Write `path` with `content` (creating directories) and commit it.
    pub fn commit_file(dir: &Path, path: &str, content: &str) -> GitOid {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
        commit_all(dir, &format!("write {path}"))
    }
}
