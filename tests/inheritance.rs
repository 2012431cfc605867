//! Integration tests: parent/child workspaces.

mod common;

use common::{TestEngine, agent_id, read, write};
use tandem::EngineError;
use tandem::model::records::Side;
use tandem::model::types::{CommitKind, WorkspaceId, WorkspaceStatus};

#[test]
fn child_matches_parent_latest_checkpoint() {
    let engine = TestEngine::new();
    let parent = engine.create("lead");
    engine.commit_file(&parent, "plan.md", "v1\n");
    let checkpoint = engine.commit_file(&parent, "plan.md", "v2\n");
    write(&parent.working_directory, "scratch.txt", "uncommitted");

    let child = engine.create_child("helper", &parent.workspace_id);
    assert_eq!(child.base_point, checkpoint.commit_id);
    assert_eq!(read(&child.working_directory, "plan.md").as_deref(), Some("v2\n"));
    assert_eq!(read(&child.working_directory, "scratch.txt"), None);

    let ws = engine.manager.get_workspace(&child.workspace_id).unwrap();
    assert_eq!(ws.parent_id.as_ref(), Some(&parent.workspace_id));
    assert_eq!(ws.ancestry_depth, 1);

    let diff = engine
        .git(&["diff", "--stat", checkpoint.commit_id.as_str(), &child.branch]);
    assert!(diff.is_empty(), "child differs from parent checkpoint: {diff}");
}

#[test]
fn child_merges_into_parent_branch_not_main() {
    let engine = TestEngine::new();
    let parent = engine.create("lead");
    let child = engine.create_child("helper", &parent.workspace_id);
    engine.commit_file(&child, "part.txt", "helper work\n");

    let result = engine.manager.merge_to_parent(&child.workspace_id).unwrap();
    assert_eq!(result.status, WorkspaceStatus::Merged);
    assert_eq!(result.resolution.target_branch, parent.branch);

    assert_eq!(
        read(&parent.working_directory, "part.txt").as_deref(),
        Some("helper work\n")
    );
    assert_eq!(engine.main_file("part.txt"), None);

    let parent_commits = engine.manager.list_commits(&parent.workspace_id).unwrap();
    let last = parent_commits.last().unwrap();
    assert_eq!(last.kind, CommitKind::Merge);
    assert_eq!(last.commit_id, result.resolution.resulting_commit_id);

    engine.manager.merge_to_parent(&parent.workspace_id).unwrap();
    assert_eq!(engine.main_file("part.txt").as_deref(), Some("helper work\n"));
}

#[test]
fn newer_parent_checkpoint_wins_conflict() {
    let engine = TestEngine::new();
    let a = engine.create("a");
    engine.commit_file(&a, "x.py", "1");
    let b = engine.create_child("b", &a.workspace_id);
    engine.commit_file(&b, "x.py", "2");
    std::thread::sleep(std::time::Duration::from_millis(10));
    engine.commit_file(&a, "x.py", "3");

    let result = engine.manager.merge_to_parent(&b.workspace_id).unwrap();
    assert_eq!(result.status, WorkspaceStatus::ConflictResolved);
    let conflicts = &result.resolution.conflicts;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].file_path, "x.py");
    assert_eq!(conflicts[0].winner, Side::Parent);
    assert!(conflicts[0].parent_timestamp_ms > conflicts[0].child_timestamp_ms);

    assert_eq!(read(&a.working_directory, "x.py").as_deref(), Some("3"));
    let on_branch = engine.git(&["show", &format!("{}:x.py", a.branch)]);
    assert_eq!(on_branch, "3");
}

#[test]
fn merged_parent_can_still_seed_children() {
    let engine = TestEngine::new();
    let parent = engine.create("lead");
    engine.commit_file(&parent, "base.txt", "shared\n");
    engine.manager.merge_to_parent(&parent.workspace_id).unwrap();

    let child = engine.create_child("helper", &parent.workspace_id);
    assert_eq!(
        read(&child.working_directory, "base.txt").as_deref(),
        Some("shared\n")
    );
}

#[test]
fn unusable_parents_are_rejected() {
    let engine = TestEngine::new();
    let parent = engine.create("lead");
    engine
        .manager
        .abandon_workspace(&parent.workspace_id, None)
        .unwrap();

    let err = engine
        .manager
        .create_workspace(&agent_id("helper"), Some(&parent.workspace_id))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ParentUnusable {
            status: WorkspaceStatus::Abandoned,
            ..
        }
    ));

    let missing = WorkspaceId::new("ws-missing").unwrap();
    let err = engine
        .manager
        .create_workspace(&agent_id("helper"), Some(&missing))
        .unwrap_err();
    assert!(matches!(err, EngineError::ParentNotFound { .. }));
    assert!(
        engine
            .manager
            .active_workspace_for(&agent_id("helper"))
            .unwrap()
            .is_none()
    );
}

#[test]
fn ancestry_depth_is_bounded() {
    let engine = TestEngine::with_config(|c| c.workspace.max_ancestry_depth = 2);
    let root = engine.create("a0");
    let d1 = engine.create_child("a1", &root.workspace_id);
    let d2 = engine.create_child("a2", &d1.workspace_id);

    let err = engine
        .manager
        .create_workspace(&agent_id("a3"), Some(&d2.workspace_id))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AncestryTooDeep {
            depth: 3,
            max: 2,
            ..
        }
    ));
}

#[test]
fn parent_with_active_child_cannot_be_cleaned() {
    let engine = TestEngine::new();
    let parent = engine.create("lead");
    let child = engine.create_child("helper", &parent.workspace_id);
    engine
        .manager
        .abandon_workspace(&parent.workspace_id, None)
        .unwrap();

    let err = engine
        .manager
        .cleanup_workspace(&parent.workspace_id, true)
        .unwrap_err();
    match err {
        EngineError::ActiveDescendants { children, .. } => {
            assert_eq!(children, vec![child.workspace_id.clone()]);
        }
        other => panic!("expected ActiveDescendants, got {other}"),
    }

    // The child can still merge into the abandoned parent's branch.
    engine.commit_file(&child, "late.txt", "still lands\n");
    engine.manager.merge_to_parent(&child.workspace_id).unwrap();
    engine
        .manager
        .cleanup_workspace(&parent.workspace_id, true)
        .unwrap();
}
