//! Ref helpers for workspace branches and the archive namespace.
//!
//! All operations run `git update-ref` (or `git rev-parse`) in the
//! repository root.
//!
//! ```text
//! refs/heads/tandem/ws/<id>        ← live workspace branch
//! refs/tandem/archive/<id>         ← branch preserved by a history-keeping cleanup
//! ```
//!
//! [`write_ref_cas`] is the optimistic-concurrency primitive: git holds the
//! ref lock during the update and rejects it when the current value differs
//! from the expected one, which surfaces as [`StoreError::CasMismatch`].

use std::path::Path;

use super::{StoreError, git_command};
use crate::model::types::{GitOid, WorkspaceId};

/// Prefix of every workspace branch (under `refs/heads/`).
pub const BRANCH_PREFIX: &str = "tandem/ws/";

/// Prefix of archived workspace branches.
pub const ARCHIVE_PREFIX: &str = "refs/tandem/archive/";

/// Short branch name for a workspace, e.g. `tandem/ws/ws-3f9a0c1d22e4b7a8`.
#[must_use]
pub fn workspace_branch(id: &WorkspaceId) -> String {
    format!("{BRANCH_PREFIX}{id}")
}

/// Archive ref for a workspace.
#[must_use]
pub fn archive_ref(id: &WorkspaceId) -> String {
    format!("{ARCHIVE_PREFIX}{id}")
}

/// Full ref name for a short branch name.
#[must_use]
pub fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

/// Read a ref (or any revision expression) and return its OID, or `None`
/// if it does not resolve.
///
/// # Errors
/// Returns an error if git cannot be spawned, fails for a reason other than
/// a missing ref, or prints a malformed OID.
pub fn read_ref(root: &Path, name: &str) -> Result<Option<GitOid>, StoreError> {
    let output = git_command(root)
        .args(["rev-parse", "--verify", "--quiet", name])
        .output()?;

    if output.status.success() {
        let raw = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        let oid = GitOid::new(&raw).map_err(|_| StoreError::InvalidOid {
            context: format!("rev-parse {name}"),
            raw,
        })?;
        return Ok(Some(oid));
    }

    // --verify --quiet exits 1 with empty stderr when the name is unknown.
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if stderr.is_empty() {
        return Ok(None);
    }

    Err(StoreError::GitCommand {
        command: format!("git rev-parse --verify --quiet {name}"),
        stderr,
        exit_code: output.status.code(),
    })
}

/// Write (create or overwrite) a ref unconditionally.
///
/// # Errors
/// Returns an error if git cannot be spawned or exits non-zero.
pub fn write_ref(root: &Path, name: &str, oid: &GitOid) -> Result<(), StoreError> {
    let output = git_command(root)
        .args(["update-ref", name, oid.as_str()])
        .output()?;

    if output.status.success() {
        return Ok(());
    }

    Err(StoreError::GitCommand {
        command: format!("git update-ref {name} {oid}"),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        exit_code: output.status.code(),
    })
}

/// Create a ref that must not already exist.
///
/// # Errors
/// [`StoreError::CasMismatch`] if the ref exists, otherwise git failures.
pub fn create_ref(root: &Path, name: &str, oid: &GitOid) -> Result<(), StoreError> {
    // An empty old value means "must not exist" and works for any hash length.
    update_ref_guarded(root, name, oid, "")
}

/// Atomically move a ref from `old_oid` to `new_oid`.
///
/// # Errors
/// - [`StoreError::CasMismatch`]: the ref was modified concurrently.
/// - [`StoreError::GitCommand`]: other git failure.
pub fn write_ref_cas(
    root: &Path,
    name: &str,
    old_oid: &GitOid,
    new_oid: &GitOid,
) -> Result<(), StoreError> {
    update_ref_guarded(root, name, new_oid, old_oid.as_str())
}

fn update_ref_guarded(
    root: &Path,
    name: &str,
    new_oid: &GitOid,
    old_value: &str,
) -> Result<(), StoreError> {
    let output = git_command(root)
        .args(["update-ref", name, new_oid.as_str(), old_value])
        .output()?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();

    // git prints "cannot lock ref", "is at ... but expected ..." or
    // "reference already exists" when the old-value check fails.
    if stderr.contains("cannot lock ref")
        || stderr.contains("is at")
        || stderr.contains("but expected")
        || stderr.contains("already exists")
    {
        return Err(StoreError::CasMismatch {
            ref_name: name.to_owned(),
        });
    }

    Err(StoreError::GitCommand {
        command: format!("git update-ref {name} {new_oid} {old_value}"),
        stderr,
        exit_code: output.status.code(),
    })
}

/// Delete a ref. Deleting a missing ref is a no-op.
///
/// # Errors
/// Returns an error if git cannot be spawned or exits non-zero.
pub fn delete_ref(root: &Path, name: &str) -> Result<(), StoreError> {
    let output = git_command(root).args(["update-ref", "-d", name]).output()?;

    if output.status.success() {
        return Ok(());
    }

    Err(StoreError::GitCommand {
        command: format!("git update-ref -d {name}"),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        exit_code: output.status.code(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
