//! Change listing between two snapshots.

use std::path::Path;

use super::{StoreError, git_command};
use crate::model::records::ChangeSet;
use crate::model::types::GitOid;

/// Compute the [`ChangeSet`] between `from` and `to`.
///
/// Renames are reported as a delete plus a create so every path is listed
/// under exactly one bucket.
///
/// # Errors
/// Returns an error if any `git diff` invocation fails.
pub fn change_set(root: &Path, from: &GitOid, to: &GitOid) -> Result<ChangeSet, StoreError> {
    let mut changes = ChangeSet::default();

    let status = diff_output(root, &["--name-status", "-z"], from, to)?;
    let mut tokens = status.split('\0').filter(|t| !t.is_empty());
    while let Some(code) = tokens.next() {
        let path = tokens.next().ok_or_else(|| StoreError::MalformedOutput {
            command: "git diff --name-status".to_owned(),
            detail: format!("status {code:?} without a path"),
        })?;
        match code.chars().next() {
            Some('A') => changes.created.push(path.to_owned()),
            Some('D') => changes.deleted.push(path.to_owned()),
            _ => changes.modified.push(path.to_owned()),
        }
    }

    let numstat = diff_output(root, &["--numstat", "-z"], from, to)?;
    for record in numstat.split('\0').filter(|r| !r.is_empty()) {
        let mut fields = record.splitn(3, '\t');
        let (Some(ins), Some(del)) = (fields.next(), fields.next()) else {
            return Err(StoreError::MalformedOutput {
                command: "git diff --numstat".to_owned(),
                detail: record.to_owned(),
            });
        };
        // Binary files report "-".
        changes.insertions += ins.parse::<u64>().unwrap_or(0);
        changes.deletions += del.parse::<u64>().unwrap_or(0);
    }

    changes.patch = diff_output(root, &["--no-color", "--no-ext-diff"], from, to)?;
    Ok(changes)
}

/// The most recent commit in `base..tip` that touched `path`, if any.
///
/// # Errors
/// Returns an error if `git log` fails or prints a malformed OID.
pub fn last_touch(
    root: &Path,
    base: &GitOid,
    tip: &GitOid,
    path: &str,
) -> Result<Option<GitOid>, StoreError> {
    let range = format!("{base}..{tip}");
    let output = git_command(root)
        .args([
            "--literal-pathspecs",
            "log",
            "-1",
            "--format=%H",
            &range,
            "--",
            path,
        ])
        .output()?;

    if !output.status.success() {
        return Err(StoreError::from_output(
            &format!("git log -1 {range} -- {path}"),
            &output,
        ));
    }

    let raw = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if raw.is_empty() {
        return Ok(None);
    }
    GitOid::new(&raw)
        .map(Some)
        .map_err(|_| StoreError::InvalidOid {
            context: "git log output".to_owned(),
            raw,
        })
}

fn diff_output(
    root: &Path,
    mode: &[&str],
    from: &GitOid,
    to: &GitOid,
) -> Result<String, StoreError> {
    let output = git_command(root)
        .arg("diff")
        .arg("--no-renames")
        .args(mode)
        .args([from.as_str(), to.as_str()])
        .output()?;

    if !output.status.success() {
        return Err(StoreError::from_output(
            &format!("git diff {} {from} {to}", mode.join(" ")),
            &output,
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{commit_all, init_repo};
    use std::fs;

    #[test]
    fn classifies_created_modified_deleted() {
        let (dir, base) = init_repo();
        let root = dir.path();
        fs::write(root.join("old.txt"), "gone\n").unwrap();
        let mid = commit_all(root, "add old");
        fs::remove_file(root.join("old.txt")).unwrap();
        fs::write(root.join("README.md"), "# Test\nmore\n").unwrap();
        fs::write(root.join("new.txt"), "a\nb\n").unwrap();
        let tip = commit_all(root, "change");

        let changes = change_set(root, &mid, &tip).unwrap();
        assert_eq!(changes.created, vec!["new.txt"]);
        assert_eq!(changes.modified, vec!["README.md"]);
        assert_eq!(changes.deleted, vec!["old.txt"]);
        assert_eq!(changes.insertions, 3);
        assert_eq!(changes.deletions, 1);
        assert!(changes.patch.contains("+more"));

        let from_base = change_set(root, &base, &tip).unwrap();
        assert!(from_base.deleted.is_empty());
    }

    #[test]
    fn identical_points_have_no_changes() {
        let (dir, base) = init_repo();
        let changes = change_set(dir.path(), &base, &base).unwrap();
        assert!(changes.is_empty());
        assert!(changes.patch.is_empty());
    }

    #[test]
    fn binary_files_count_zero_lines() {
        let (dir, base) = init_repo();
        fs::write(dir.path().join("blob.bin"), [0u8, 1, 2, 0, 255]).unwrap();
        let tip = commit_all(dir.path(), "binary");
        let changes = change_set(dir.path(), &base, &tip).unwrap();
        assert_eq!(changes.created, vec!["blob.bin"]);
        assert_eq!(changes.insertions, 0);
    }

    #[test]
    fn last_touch_finds_newest_commit_for_path() {
        let (dir, base) = init_repo();
        let root = dir.path();
        fs::write(root.join("x.py"), "1").unwrap();
        let first = commit_all(root, "x1");
        fs::write(root.join("y.py"), "y").unwrap();
        let second = commit_all(root, "y");

        assert_eq!(last_touch(root, &base, &second, "x.py").unwrap(), Some(first));
        assert_eq!(
            last_touch(root, &base, &second, "y.py").unwrap(),
            Some(second.clone())
        );
        assert_eq!(last_touch(root, &second, &second, "x.py").unwrap(), None);
    }

    #[test]
    fn last_touch_treats_glob_characters_literally() {
        let (dir, base) = init_repo();
        let root = dir.path();
        fs::write(root.join("a*.txt"), "star").unwrap();
        let star = commit_all(root, "star");
        fs::write(root.join("ab.txt"), "ab").unwrap();
        let tip = commit_all(root, "ab");
        assert_eq!(last_touch(root, &base, &tip, "a*.txt").unwrap(), Some(star));
    }
}
