// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Branch merging for child sessions.
//!
//! Merges are three-way tree merges that explicitly exclude the session
//! file: each branch carries its own `.forge/session.json` conversation
//! history, and merging those would produce spurious conflicts every time.

use std::collections::{BTreeMap, BTreeSet};

use git2::Oid;
use tracing::debug;

use crate::store::{CommitStore, GitError};

/// Path excluded from merged trees.
const SESSION_FILE: &str = ".forge/session.json";

impl CommitStore {
    /// Merge `source` (a commit) into `target_branch`.
    ///
    /// On conflicts the merge is refused with the deduplicated list of
    /// conflicting paths; no commit is produced. On success a merge commit
    /// with two parents is created and the branch ref advanced.
    pub fn merge_commit_into_branch(
        &self,
        source: Oid,
        target_branch: &str,
    ) -> Result<Oid, GitError> {
        let target_head = self.branch_head(target_branch)?;
        let base = self.merge_base(target_head, source)?;

        let merged_tree = {
            let repo = self.lock();
            let ancestor_tree = repo.find_commit(base)?.tree()?;
            let our_tree = repo.find_commit(target_head)?.tree()?;
            let their_tree = repo.find_commit(source)?.tree()?;
            let mut index = repo.merge_trees(&ancestor_tree, &our_tree, &their_tree, None)?;

            if index.has_conflicts() {
                let mut paths = BTreeSet::new();
                for conflict in index.conflicts()? {
                    let conflict = conflict?;
                    for entry in [conflict.ancestor, conflict.our, conflict.their]
                        .into_iter()
                        .flatten()
                    {
                        paths.insert(String::from_utf8_lossy(&entry.path).into_owned());
                    }
                }
                let paths: Vec<String> = paths.into_iter().collect();
                return Err(GitError::MergeConflicts {
                    summary: summarize_conflicts(&paths),
                    paths,
                });
            }

            index.write_tree_to(&repo)?
        };

        // Strip the session file so the target branch keeps its own history.
        let mut deletes = BTreeSet::new();
        deletes.insert(SESSION_FILE.to_string());
        let merged_tree = self.build_tree(Some(merged_tree), &BTreeMap::new(), &deletes)?;

        let message = match self.branch_name_for_commit(source)? {
            Some(branch) => format!("Merge branch '{branch}' into {target_branch}"),
            None => format!(
                "Merge commit {} into {target_branch}",
                short_oid(source)
            ),
        };
        debug!(source = %source, target = target_branch, "merging");
        self.create_commit(
            Some(&format!("refs/heads/{target_branch}")),
            &message,
            merged_tree,
            &[target_head, source],
        )
    }

    /// Quick check whether merging `source` into `target_branch` would be
    /// conflict-free.
    pub fn merge_is_clean(&self, source: Oid, target_branch: &str) -> Result<bool, GitError> {
        let target_head = self.branch_head(target_branch)?;
        let base = match self.merge_base(target_head, source) {
            Ok(oid) => oid,
            // No common ancestor: a merge may work but is risky.
            Err(_) => return Ok(false),
        };
        // Already merged in either direction.
        if base == source || base == target_head {
            return Ok(true);
        }
        let repo = self.lock();
        let ancestor_tree = repo.find_commit(base)?.tree()?;
        let our_tree = repo.find_commit(target_head)?.tree()?;
        let their_tree = repo.find_commit(source)?.tree()?;
        let index = repo.merge_trees(&ancestor_tree, &our_tree, &their_tree, None)?;
        Ok(!index.has_conflicts())
    }

    /// A local branch whose tip is exactly `oid`, if any.
    fn branch_name_for_commit(&self, oid: Oid) -> Result<Option<String>, GitError> {
        for name in self.local_branches()? {
            if self.branch_head(&name)? == oid {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

fn short_oid(oid: Oid) -> String {
    oid.to_string()[..7].to_string()
}

/// First 5 conflicting paths, then a `... (N more)` tail.
fn summarize_conflicts(paths: &[String]) -> String {
    let mut summary = paths.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
    if paths.len() > 5 {
        summary.push_str(&format!(", ... ({} more)", paths.len() - 5));
    }
    summary
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_kind::CommitKind;
    use crate::testutil::{commit_files, test_store};

    #[test]
    fn clean_merge_produces_two_parent_commit() {
        let (_dir, store) = test_store(&[("shared.txt", "base")]);
        let root = store.branch_head("main").unwrap();
        store.create_branch("child", root).unwrap();

        commit_files(&store, "main", &[("ours.txt", "m")], "main work", CommitKind::Major);
        let source =
            commit_files(&store, "child", &[("theirs.txt", "c")], "child work", CommitKind::Major);

        let merge = store.merge_commit_into_branch(source, "main").unwrap();
        let parents = store.commit_parent_ids(merge).unwrap();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[1], source);
        assert_eq!(store.read_blob(merge, "ours.txt").unwrap(), b"m");
        assert_eq!(store.read_blob(merge, "theirs.txt").unwrap(), b"c");
        assert_eq!(store.branch_head("main").unwrap(), merge);
    }

    #[test]
    fn merge_excludes_session_file() {
        // Both branches changed the session file; the merge
        // succeeds and the merged tree does not break the target branch.
        let (_dir, store) = test_store(&[("shared.txt", "base")]);
        let root = store.branch_head("main").unwrap();
        store.create_branch("child", root).unwrap();

        commit_files(
            &store,
            "main",
            &[(".forge/session.json", "\"Y\"")],
            "main session",
            CommitKind::Major,
        );
        let source = commit_files(
            &store,
            "child",
            &[(".forge/session.json", "\"X\""), ("work.txt", "done")],
            "child session",
            CommitKind::Major,
        );

        let merge = store.merge_commit_into_branch(source, "main").unwrap();
        assert_eq!(store.read_blob(merge, "work.txt").unwrap(), b"done");
        // The session file never enters the merged tree.
        assert!(matches!(
            store.read_blob(merge, ".forge/session.json"),
            Err(GitError::FileNotFound(_))
        ));
    }

    #[test]
    fn conflicting_merge_is_refused_with_paths() {
        let (_dir, store) = test_store(&[("f.txt", "base")]);
        let root = store.branch_head("main").unwrap();
        store.create_branch("child", root).unwrap();

        commit_files(&store, "main", &[("f.txt", "ours")], "m", CommitKind::Major);
        let source = commit_files(&store, "child", &[("f.txt", "theirs")], "c", CommitKind::Major);

        let before = store.branch_head("main").unwrap();
        match store.merge_commit_into_branch(source, "main") {
            Err(GitError::MergeConflicts { paths, summary }) => {
                assert_eq!(paths, vec!["f.txt".to_string()]);
                assert_eq!(summary, "f.txt");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // No commit was produced.
        assert_eq!(store.branch_head("main").unwrap(), before);
    }

    #[test]
    fn merge_is_clean_detects_both_cases() {
        let (_dir, store) = test_store(&[("f.txt", "base")]);
        let root = store.branch_head("main").unwrap();
        store.create_branch("clean", root).unwrap();
        store.create_branch("dirty", root).unwrap();

        commit_files(&store, "main", &[("f.txt", "ours")], "m", CommitKind::Major);
        let clean = commit_files(&store, "clean", &[("other.txt", "x")], "c", CommitKind::Major);
        let dirty = commit_files(&store, "dirty", &[("f.txt", "theirs")], "d", CommitKind::Major);

        assert!(store.merge_is_clean(clean, "main").unwrap());
        assert!(!store.merge_is_clean(dirty, "main").unwrap());
    }

    #[test]
    fn conflict_summary_truncates_after_five() {
        let paths: Vec<String> = (1..=7).map(|i| format!("f{i}.txt")).collect();
        assert_eq!(
            summarize_conflicts(&paths),
            "f1.txt, f2.txt, f3.txt, f4.txt, f5.txt, ... (2 more)"
        );
    }
}
