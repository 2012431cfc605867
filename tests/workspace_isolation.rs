//! Integration tests: workspace isolation.
//!
//! Edits, creates, and deletes in one workspace are never visible in a
//! sibling, in the main checkout, or in a merge before they are
//! checkpointed.

mod common;

use common::{TestEngine, read, write};
use proptest::prelude::*;

#[test]
fn edit_in_one_workspace_is_invisible_to_sibling() {
    let engine = TestEngine::new();
    let alice = engine.create("alice");
    let bob = engine.create("bob");

    write(&alice.working_directory, "hello.txt", "from alice");
    assert_eq!(read(&bob.working_directory, "hello.txt"), None);
    assert_eq!(engine.main_file("hello.txt"), None);

    engine.commit_file(&alice, "hello.txt", "from alice");
    assert_eq!(read(&bob.working_directory, "hello.txt"), None);
    assert_eq!(engine.main_file("hello.txt"), None);
}

#[test]
fn delete_in_one_workspace_does_not_touch_sibling() {
    let engine = TestEngine::new();
    let alice = engine.create("alice");
    let bob = engine.create("bob");

    std::fs::remove_file(alice.working_directory.join("README.md")).unwrap();
    engine
        .manager
        .checkpoint(&alice.workspace_id, None)
        .unwrap();

    assert_eq!(
        read(&bob.working_directory, "README.md").as_deref(),
        Some("# test repo\n")
    );
}

#[test]
fn workspaces_start_from_main_head() {
    let engine = TestEngine::new();
    engine.commit_on_main("src/lib.rs", "pub fn v2() {}\n");
    let ws = engine.create("alice");

    assert_eq!(ws.base_point.as_str(), engine.git(&["rev-parse", "main"]));
    assert_eq!(
        read(&ws.working_directory, "src/lib.rs").as_deref(),
        Some("pub fn v2() {}\n")
    );
    assert!(
        !ws.working_directory.starts_with(engine.repo()),
        "workspaces live outside the repository checkout"
    );
}

#[test]
fn uncheckpointed_edits_do_not_merge() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    engine.commit_file(&ws, "done.txt", "checkpointed\n");
    write(&ws.working_directory, "draft.txt", "not yet\n");

    engine.manager.merge_to_parent(&ws.workspace_id).unwrap();
    assert_eq!(engine.main_file("done.txt").as_deref(), Some("checkpointed\n"));
    assert_eq!(engine.main_file("draft.txt"), None);
}

#[test]
fn changes_report_only_checkpointed_work() {
    let engine = TestEngine::new();
    let ws = engine.create("alice");
    engine.commit_file(&ws, "a.txt", "one\ntwo\n");
    std::fs::remove_file(ws.working_directory.join("README.md")).unwrap();

    let changes = engine
        .manager
        .get_changes(&ws.workspace_id, None)
        .unwrap();
    assert_eq!(changes.created, vec!["a.txt".to_owned()]);
    assert!(changes.deleted.is_empty());
    assert_eq!(changes.insertions, 2);
    assert!(changes.patch.contains("+one"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn same_path_holds_each_workspaces_own_content(
        path in "[a-z]{1,8}(/[a-z]{1,8})?\\.txt",
        a in "[ -~]{0,64}",
        b in "[ -~]{0,64}",
        checkpoint in any::<bool>(),
    ) {
        let engine = TestEngine::new();
        let alice = engine.create("alice");
        let bob = engine.create("bob");

        write(&alice.working_directory, &path, &a);
        write(&bob.working_directory, &path, &b);
        if checkpoint {
            engine.manager.checkpoint(&alice.workspace_id, None).unwrap();
            engine.manager.checkpoint(&bob.workspace_id, None).unwrap();
        }

        prop_assert_eq!(read(&alice.working_directory, &path), Some(a));
        prop_assert_eq!(read(&bob.working_directory, &path), Some(b));
        prop_assert_eq!(engine.main_file(&path), None);
    }
}
