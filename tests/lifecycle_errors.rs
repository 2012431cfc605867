//! Integration tests: lifecycle failures leave no partial state.

mod common;

use common::{TestEngine, agent_id, read, write};
use tandem::lifecycle::HistoryDisposition;
use tandem::model::types::{CommitKind, WorkspaceStatus};
use tandem::registry::WorkspaceFilter;
use tandem::{EngineError, ErrorCategory};

#[test]
fn second_active_workspace_for_agent_is_rejected() {
    let engine = TestEngine::new();
    let first = engine.create("alice");
    let err = engine
        .manager
        .create_workspace(&agent_id("alice"), None)
        .unwrap_err();
    match &err {
        EngineError::DuplicateActiveWorkspace { existing, .. } => {
            assert_eq!(existing, &first.workspace_id);
        }
        other => panic!("expected DuplicateActiveWorkspace, got {other}"),
    }
    assert_eq!(err.category(), ErrorCategory::Allocation);

    engine.manager.merge_to_parent(&first.workspace_id).unwrap();
    engine.create("alice");
}

#[test]
fn active_limit_is_enforced() {
    let engine = TestEngine::with_config(|c| c.workspace.max_concurrent = 2);
    engine.create("a");
    engine.create("b");
    let err = engine
        .manager
        .create_workspace(&agent_id("c"), None)
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkspaceLimitReached { limit: 2 }));
}

#[test]
fn failed_materialization_rolls_back() {
    let engine = TestEngine::with_config(|c| {
        // A regular file where the workspace directory should go.
        let blocker = c.workspace.base_dir.clone();
        std::fs::write(&blocker, "not a directory").unwrap();
    });

    let err = engine
        .manager
        .create_workspace(&agent_id("alice"), None)
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkspaceAllocationFailed { .. }));
    assert!(
        engine
            .manager
            .list_workspaces(&WorkspaceFilter::default())
            .unwrap()
            .is_empty()
    );
    assert_eq!(engine.git(&["branch", "--list", "tandem/ws/*"]), "");
}

#[test]
fn hard_disk_ceiling_refuses_new_workspaces() {
    let engine = TestEngine::with_config(|c| c.retention.disk_hard_ceiling_bytes = Some(100));
    let ws = engine.create("alice");
    write(&ws.working_directory, "big.bin", &"x".repeat(1_000));
    engine.manager.checkpoint(&ws.workspace_id, None).unwrap();

    let err = engine
        .manager
        .create_workspace(&agent_id("bob"), None)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::DiskCapacityExceeded {
            ceiling_bytes: 100,
            ..
        }
    ));
}

#[test]
fn finished_workspaces_reject_work() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    engine.manager.merge_to_parent(&ws.workspace_id).unwrap();

    let err = engine
        .manager
        .checkpoint(&ws.workspace_id, None)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::WorkspaceNotActive {
            status: WorkspaceStatus::Merged,
            ..
        }
    ));
    assert_eq!(err.category(), ErrorCategory::State);

    let err = engine
        .manager
        .preview_merge(&ws.workspace_id)
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkspaceNotActive { .. }));
}

#[test]
fn active_workspace_cannot_be_cleaned() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    let err = engine
        .manager
        .cleanup_workspace(&ws.workspace_id, true)
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkspaceStillActive { .. }));
    assert!(ws.working_directory.exists());
}

#[test]
fn abandoned_history_survives_cleanup() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    engine.commit_file(&ws, "notes.md", "last checkpoint\n");
    engine
        .manager
        .abandon_workspace(&ws.workspace_id, Some("task cancelled"))
        .unwrap();

    let estimate = engine
        .manager
        .get_workspace(&ws.workspace_id)
        .unwrap()
        .disk_bytes_estimate;
    let before = engine.manager.total_disk_usage().unwrap();
    let result = engine
        .manager
        .cleanup_workspace(&ws.workspace_id, true)
        .unwrap();
    let after = engine.manager.total_disk_usage().unwrap();

    assert!(!ws.working_directory.exists());
    assert!(estimate > 0);
    assert!(before - after >= estimate);
    assert!(result.reclaimed_bytes > 0);
    let HistoryDisposition::Archived { reference } = result.history else {
        panic!("history should be archived");
    };
    assert_eq!(
        engine.git(&["show", &format!("{reference}:notes.md")]),
        "last checkpoint"
    );
    assert_eq!(
        engine
            .manager
            .read_file(&ws.workspace_id, "notes.md")
            .unwrap()
            .as_deref(),
        Some(&b"last checkpoint\n"[..])
    );

    let changes = engine.manager.get_changes(&ws.workspace_id, None).unwrap();
    assert_eq!(changes.created, vec!["notes.md".to_owned()]);
}

#[test]
fn discarded_history_deletes_branch() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    engine.commit_file(&ws, "notes.md", "gone\n");
    engine
        .manager
        .abandon_workspace(&ws.workspace_id, None)
        .unwrap();
    let result = engine
        .manager
        .cleanup_workspace(&ws.workspace_id, false)
        .unwrap();

    assert_eq!(result.history, HistoryDisposition::Deleted);
    assert_eq!(engine.git(&["branch", "--list", &ws.branch]), "");
    assert!(matches!(
        engine.manager.read_file(&ws.workspace_id, "notes.md"),
        Err(EngineError::WorkspaceNotActive { .. })
    ));
}

#[test]
fn failing_checkpoints_pending_work_first() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    write(&ws.working_directory, "partial.rs", "fn half() {}\n");

    let failed = engine
        .manager
        .fail_workspace(&ws.workspace_id, Some("panic in tests"))
        .unwrap();
    assert_eq!(failed.status, WorkspaceStatus::Failed);

    let commits = engine.manager.list_commits(&ws.workspace_id).unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].kind, CommitKind::AutoCheckpoint);
    assert!(commits[0].message.contains("panic in tests"));
    assert_eq!(
        read(&ws.working_directory, "partial.rs").as_deref(),
        Some("fn half() {}\n")
    );
}

#[test]
fn auto_checkpoint_can_be_disabled() {
    let engine = TestEngine::with_config(|c| c.workspace.auto_checkpoint_on_error = false);
    let ws = engine.create("alice");
    write(&ws.working_directory, "partial.rs", "fn half() {}\n");
    engine
        .manager
        .fail_workspace(&ws.workspace_id, None)
        .unwrap();
    assert!(engine.manager.list_commits(&ws.workspace_id).unwrap().is_empty());
}

#[test]
fn unknown_since_is_invalid_input() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    let err = engine
        .manager
        .get_changes(&ws.workspace_id, Some("does-not-exist"))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }));
}

#[test]
fn changes_since_a_checkpoint() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    let first = engine.commit_file(&ws, "a.txt", "1\n");
    engine.commit_file(&ws, "b.txt", "2\n");

    let changes = engine
        .manager
        .get_changes(&ws.workspace_id, Some(first.commit_id.as_str()))
        .unwrap();
    assert_eq!(changes.created, vec!["b.txt".to_owned()]);
    assert_eq!(changes.total(), 1);
}

#[cfg(unix)]
#[test]
fn non_utf8_file_name_is_refused_at_checkpoint() {
    use std::os::unix::ffi::OsStrExt;

    let engine = TestEngine::new();
    let ws = engine.create("alice");
    let bad = ws
        .working_directory
        .join(std::ffi::OsStr::from_bytes(b"bad\xffname.txt"));
    std::fs::write(&bad, "latin-1\n").unwrap();

    let err = engine.manager.checkpoint(&ws.workspace_id, None).unwrap_err();
    assert!(
        matches!(&err, EngineError::UnsupportedPath { path, .. } if path == "bad\\xffname.txt"),
        "{err}"
    );
    assert_eq!(err.category(), ErrorCategory::State);
    assert!(engine.manager.list_commits(&ws.workspace_id).unwrap().is_empty());
    assert_eq!(
        common::git_ok(&ws.working_directory, &["rev-parse", "HEAD"]),
        ws.base_point.as_str()
    );

    // Renaming the file makes the next checkpoint succeed.
    std::fs::rename(&bad, ws.working_directory.join("good-name.txt")).unwrap();
    let commit = engine.manager.checkpoint(&ws.workspace_id, None).unwrap();
    assert_eq!(commit.iteration, 1);
    assert_eq!(commit.files_changed, 1);
}
