//! Flat tree reading and tree/commit construction from git plumbing.
//!
//! A merge result is described as a [`FlatTree`]: every file path mapped to
//! the `(mode, type, oid)` entry it should have. Entries are always taken
//! verbatim from one side of the merge, so no blob ever needs rewriting.
//! Building the commit is then `git mktree` bottom-up followed by
//! `git commit-tree` with both parents.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;

use super::{Identity, StoreError, git_command};
use crate::model::types::GitOid;

/// One leaf entry of a tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TreeEntry {
    /// Octal mode as git prints it (`100644`, `100755`, `120000`, `160000`).
    pub mode: String,
    /// `blob`, or `commit` for submodule gitlinks.
    pub kind: String,
    pub oid: GitOid,
}

impl TreeEntry {
    /// A regular-file blob entry.
    #[must_use]
    pub fn blob(oid: GitOid) -> Self {
        Self {
            mode: "100644".to_owned(),
            kind: "blob".to_owned(),
            oid,
        }
    }
}

/// Every leaf of a tree, keyed by `/`-separated repository-relative path.
pub type FlatTree = BTreeMap<String, TreeEntry>;

/// Read the flat tree of a commit with `git ls-tree -r -z --full-tree`.
///
/// Paths are taken from the raw `-z` output. A path that is not valid
/// UTF-8 is refused rather than decoded lossily, since the rebuilt tree
/// would otherwise name a file neither side wrote.
///
/// # Errors
/// Returns an error if git fails or prints a line that does not parse, or
/// [`StoreError::NonUtf8Path`] for a path that is not valid UTF-8.
pub fn read_flat_tree(root: &Path, commit: &GitOid) -> Result<FlatTree, StoreError> {
    let output = git_command(root)
        .args(["ls-tree", "-r", "-z", "--full-tree", commit.as_str()])
        .output()?;

    if !output.status.success() {
        return Err(StoreError::from_output(
            &format!("git ls-tree -r -z --full-tree {commit}"),
            &output,
        ));
    }

    let mut tree = FlatTree::new();

    for record in output.stdout.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        // Format: "<mode> <type> <oid>\t<path>"
        let malformed = || StoreError::MalformedOutput {
            command: "git ls-tree".to_owned(),
            detail: record.escape_ascii().to_string(),
        };
        let tab = record.iter().position(|b| *b == b'\t').ok_or_else(malformed)?;
        let meta = std::str::from_utf8(&record[..tab]).map_err(|_| malformed())?;
        let path = utf8_path(&record[tab + 1..])?;
        let mut parts = meta.split_whitespace();
        let (Some(mode), Some(kind), Some(oid)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let oid = GitOid::new(oid).map_err(|_| StoreError::InvalidOid {
            context: "ls-tree entry".to_owned(),
            raw: oid.to_owned(),
        })?;
        tree.insert(
            path.to_owned(),
            TreeEntry {
                mode: mode.to_owned(),
                kind: kind.to_owned(),
                oid,
            },
        );
    }

    Ok(tree)
}

/// Build the tree hierarchy for a flat tree and return the root tree OID.
///
/// `git mktree` builds one level at a time, so directories are written
/// deepest first and their OIDs fed into their parents.
///
/// # Errors
/// Returns an error if any `git mktree` invocation fails.
pub fn build_tree(root: &Path, flat: &FlatTree) -> Result<GitOid, StoreError> {
    // dir → entries ("<mode> <type> <oid>\t<name>") directly inside it.
    let mut levels: BTreeMap<String, Vec<String>> = BTreeMap::new();
    levels.insert(String::new(), Vec::new());

    for (path, entry) in flat {
        let (dir, name) = split_parent(path);
        levels
            .entry(dir.to_owned())
            .or_default()
            .push(format!("{} {} {}\t{name}", entry.mode, entry.kind, entry.oid));

        // Register every ancestor so empty intermediate levels still exist.
        let mut ancestor = dir;
        while !ancestor.is_empty() {
            let (up, _) = split_parent(ancestor);
            levels.entry(up.to_owned()).or_default();
            ancestor = up;
        }
    }

    let mut dirs: Vec<String> = levels.keys().cloned().collect();
    dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

    let mut root_oid = None;
    for dir in dirs {
        let mut entries = levels.remove(&dir).unwrap_or_default();
        entries.sort();
        let oid = run_mktree(root, &entries)?;
        if dir.is_empty() {
            root_oid = Some(oid);
        } else {
            let (parent, name) = split_parent(&dir);
            levels
                .entry(parent.to_owned())
                .or_default()
                .push(format!("040000 tree {oid}\t{name}"));
        }
    }

    root_oid.ok_or_else(|| StoreError::MalformedOutput {
        command: "git mktree".to_owned(),
        detail: "no root tree was produced".to_owned(),
    })
}

/// Create a commit object for `tree` with the given parents.
///
/// # Errors
/// Returns an error if `git commit-tree` fails or prints a malformed OID.
pub fn commit_tree(
    root: &Path,
    identity: &Identity,
    tree: &GitOid,
    parents: &[&GitOid],
    message: &str,
) -> Result<GitOid, StoreError> {
    let mut cmd = git_command(root);
    identity.apply(&mut cmd);
    cmd.args(["commit-tree", tree.as_str()]);
    for parent in parents {
        cmd.args(["-p", parent.as_str()]);
    }
    cmd.args(["-m", message]);
    let output = cmd.output()?;

    if !output.status.success() {
        return Err(StoreError::from_output(
            &format!("git commit-tree {tree}"),
            &output,
        ));
    }

    let raw = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    GitOid::new(&raw).map_err(|_| StoreError::InvalidOid {
        context: "git commit-tree output".to_owned(),
        raw,
    })
}

pub(super) fn run_mktree(root: &Path, entries: &[String]) -> Result<GitOid, StoreError> {
    let mut child = git_command(root)
        .args(["mktree", "-z"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        for entry in entries {
            stdin.write_all(entry.as_bytes())?;
            stdin.write_all(b"\0")?;
        }
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(StoreError::from_output("git mktree -z", &output));
    }

    let raw = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    GitOid::new(&raw).map_err(|_| StoreError::InvalidOid {
        context: "git mktree output".to_owned(),
        raw,
    })
}

/// A raw path from `-z` output as `&str`.
///
/// # Errors
/// [`StoreError::NonUtf8Path`] carrying the escaped bytes.
pub(crate) fn utf8_path(raw: &[u8]) -> Result<&str, StoreError> {
    std::str::from_utf8(raw).map_err(|_| StoreError::NonUtf8Path {
        path: raw.escape_ascii().to_string(),
    })
}

/// `"a/b/c.txt"` → `("a/b", "c.txt")`; `"c.txt"` → `("", "c.txt")`.
fn split_parent(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

fn depth(dir: &str) -> usize {
    if dir.is_empty() {
        0
    } else {
        dir.matches('/').count() + 1
    }
}
