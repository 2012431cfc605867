//! Newest-wins planning for a two-sided merge.
//!
//! Given the flat trees at the workspace's base point, the workspace tip
//! (child), and the target tip, decide the final entry of every path:
//!
//! 1. Changed only on one side: that side's entry, no conflict.
//! 2. Changed on both sides to the same entry: kept, no conflict.
//! 3. Changed on both sides differently: a conflict. The side whose last
//!    touching checkpoint is newer wins; on equal timestamps the configured
//!    [`TieBreak`] decides and the entry records that the preference was used.
//!
//! A deletion is an entry of `None` and takes part in every rule above.
//!
//! Where one side has a file at `p` and the other has entries under `p/`,
//! the path and everything below it form one unit. The rules apply to the
//! unit as a whole and the winner's file or subtree replaces the loser's,
//! so the result never holds a file and a directory of the same name.
//!
//! Planning is pure: the same inputs always give the same plan, and
//! conflicts come out sorted by path.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::TieBreak;
use crate::model::records::{ConflictEntry, MergeStats, Side};
use crate::store::{FlatTree, TreeEntry};

/// Last-modification times of one contested path on each side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStamps {
    pub child_ms: i64,
    pub parent_ms: i64,
}

/// The resolved result of a merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergePlan {
    /// Final tree of the merge commit.
    pub tree: FlatTree,
    /// One entry per contested path, sorted by path.
    pub conflicts: Vec<ConflictEntry>,
    pub stats: MergeStats,
    /// Paths the workspace changed since its base point.
    pub child_changes: usize,
    /// Paths whose final entry differs from the target tip.
    pub files_changed: u32,
}

impl MergePlan {
    /// Returns `true` if applying the plan leaves the target unchanged.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.files_changed == 0
    }
}

/// Paths whose entry differs between `base` and `side` (adds, modifications,
/// deletions, mode changes).
#[must_use]
pub fn changed_paths(base: &FlatTree, side: &FlatTree) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (path, entry) in side {
        if base.get(path) != Some(entry) {
            changed.insert(path.clone());
        }
    }
    for path in base.keys() {
        if !side.contains_key(path) {
            changed.insert(path.clone());
        }
    }
    changed
}

/// Paths that need a newest-wins decision: paths changed on both sides to
/// different entries, and file/directory units both sides changed
/// differently (listed by the unit's root path).
#[must_use]
pub fn contested_paths(base: &FlatTree, child: &FlatTree, target: &FlatTree) -> Vec<String> {
    let roots = collision_roots(child, target);
    let target_changed = changed_paths(base, target);
    let mut contested: BTreeSet<String> = changed_paths(base, child)
        .into_iter()
        .filter(|p| {
            unit_root(p, &roots).is_none()
                && target_changed.contains(p)
                && child.get(p) != target.get(p)
        })
        .collect();
    for root in roots {
        let before = unit_view(base, &root);
        let ours = unit_view(child, &root);
        let theirs = unit_view(target, &root);
        if ours != before && theirs != before && ours != theirs {
            contested.insert(root);
        }
    }
    contested.into_iter().collect()
}

/// Pick the winner for one contested path.
///
/// Returns the winning side and whether the tie-break preference decided.
#[must_use]
pub fn newest_wins(stamps: FileStamps, tie_break: TieBreak) -> (Side, bool) {
    match stamps.child_ms.cmp(&stamps.parent_ms) {
        std::cmp::Ordering::Greater => (Side::Child, false),
        std::cmp::Ordering::Less => (Side::Parent, false),
        std::cmp::Ordering::Equal => match tie_break {
            TieBreak::Child => (Side::Child, true),
            TieBreak::Target => (Side::Parent, true),
        },
    }
}

/// Plan the merge of `child` into `target`, both descended from `base`.
///
/// `stamps` must hold an entry for every path [`contested_paths`] returns;
/// a missing entry counts as equal timestamps.
#[must_use]
pub fn plan_merge(
    base: &FlatTree,
    child: &FlatTree,
    target: &FlatTree,
    stamps: &BTreeMap<String, FileStamps>,
    tie_break: TieBreak,
) -> MergePlan {
    let child_changed = changed_paths(base, child);
    let target_changed = changed_paths(base, target);
    let roots = collision_roots(child, target);

    let mut tree = target.clone();
    let mut conflicts = Vec::new();
    let mut stats = MergeStats::default();

    for path in &child_changed {
        if unit_root(path, &roots).is_some() {
            continue;
        }
        let ours = child.get(path);
        if target_changed.contains(path) {
            if ours == target.get(path) {
                stats.identical += 1;
                continue;
            }
            if decide(path, stamps, tie_break, &mut conflicts) == Side::Parent {
                stats.kept_from_target += 1;
                continue;
            }
        }
        stats.taken_from_child += 1;
        apply(&mut tree, path, ours);
    }

    for root in &roots {
        let before = unit_view(base, root);
        let ours = unit_view(child, root);
        let theirs = unit_view(target, root);
        if ours == before {
            continue;
        }
        if theirs == before {
            let taken = changed_paths(&before, &ours).len();
            stats.taken_from_child += u32::try_from(taken).unwrap_or(u32::MAX);
            replace_unit(&mut tree, root, ours);
            continue;
        }
        if ours == theirs {
            stats.identical += 1;
            continue;
        }
        if decide(root, stamps, tie_break, &mut conflicts) == Side::Parent {
            stats.kept_from_target += 1;
        } else {
            stats.taken_from_child += 1;
            replace_unit(&mut tree, root, ours);
        }
    }
    conflicts.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    let files_changed = changed_paths(target, &tree).len();
    MergePlan {
        tree,
        conflicts,
        stats,
        child_changes: child_changed.len(),
        files_changed: u32::try_from(files_changed).unwrap_or(u32::MAX),
    }
}

/// Record a conflict on `path` and return the side that won it.
fn decide(
    path: &str,
    stamps: &BTreeMap<String, FileStamps>,
    tie_break: TieBreak,
    conflicts: &mut Vec<ConflictEntry>,
) -> Side {
    let file_stamps = stamps.get(path).copied().unwrap_or_default();
    let (winner, tie_broken_by_preference) = newest_wins(file_stamps, tie_break);
    conflicts.push(ConflictEntry {
        file_path: path.to_owned(),
        winner,
        child_timestamp_ms: file_stamps.child_ms,
        parent_timestamp_ms: file_stamps.parent_ms,
        tie_broken_by_preference,
    });
    winner
}

fn apply(tree: &mut FlatTree, path: &str, entry: Option<&TreeEntry>) {
    match entry {
        Some(e) => {
            tree.insert(path.to_owned(), e.clone());
        }
        None => {
            tree.remove(path);
        }
    }
}

/// Paths that are a file on one side and a directory on the other.
///
/// Roots never nest: the side holding the file at a root has nothing
/// below it, so no deeper path can be a file on one side and a directory
/// on the other.
fn collision_roots(child: &FlatTree, target: &FlatTree) -> BTreeSet<String> {
    let mut roots = BTreeSet::new();
    for (files, other) in [(child, target), (target, child)] {
        for path in files.keys() {
            if has_entries_under(other, path) {
                roots.insert(path.clone());
            }
        }
    }
    roots
}

/// `"a/b/c"` yields `"a"`, then `"a/b"`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

/// The collision root `path` belongs to, if any.
fn unit_root<'a>(path: &str, roots: &'a BTreeSet<String>) -> Option<&'a String> {
    ancestors(path)
        .chain(std::iter::once(path))
        .find_map(|p| roots.get(p))
}

fn has_entries_under(tree: &FlatTree, dir: &str) -> bool {
    let prefix = format!("{dir}/");
    tree.range(prefix.clone()..)
        .next()
        .is_some_and(|(path, _)| path.starts_with(&prefix))
}

/// Entries of `tree` at `root` or below it.
fn unit_view(tree: &FlatTree, root: &str) -> FlatTree {
    let prefix = format!("{root}/");
    let mut view: FlatTree = tree
        .range(prefix.clone()..)
        .take_while(|(path, _)| path.starts_with(&prefix))
        .map(|(path, entry)| (path.clone(), entry.clone()))
        .collect();
    if let Some(entry) = tree.get(root) {
        view.insert(root.to_owned(), entry.clone());
    }
    view
}

fn replace_unit(tree: &mut FlatTree, root: &str, view: FlatTree) {
    let prefix = format!("{root}/");
    tree.retain(|path, _| path != root && !path.starts_with(&prefix));
    tree.extend(view);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
