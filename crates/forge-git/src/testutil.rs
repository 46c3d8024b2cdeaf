// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared fixtures for the git-layer tests: a throwaway repository with an
//! initial commit on `main`.

use std::collections::{BTreeMap, BTreeSet};

use git2::Oid;
use tempfile::TempDir;

use crate::commit_kind::CommitKind;
use crate::store::CommitStore;

/// Initialise a repository with `files` committed as "initial" on `main`.
pub(crate) fn test_store(files: &[(&str, &str)]) -> (TempDir, CommitStore) {
    let dir = TempDir::new().expect("tempdir");
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    git2::Repository::init_opts(dir.path(), &opts).expect("init repo");

    let store = CommitStore::open(dir.path()).expect("open store");
    let mut inserts = BTreeMap::new();
    for (path, content) in files {
        let blob = store.create_blob(content.as_bytes()).expect("blob");
        inserts.insert((*path).to_string(), blob);
    }
    let tree = store
        .build_tree(None, &inserts, &BTreeSet::new())
        .expect("tree");
    store
        .create_commit(Some("HEAD"), "initial", tree, &[])
        .expect("initial commit");
    (dir, store)
}

/// Commit `files` on top of the branch head with the given kind.
pub(crate) fn commit_files(
    store: &CommitStore,
    branch: &str,
    files: &[(&str, &str)],
    message: &str,
    kind: CommitKind,
) -> Oid {
    let head = store.branch_head(branch).expect("head");
    let base_tree = store.commit_tree_oid(head).expect("tree oid");
    let mut inserts = BTreeMap::new();
    for (path, content) in files {
        let blob = store.create_blob(content.as_bytes()).expect("blob");
        inserts.insert((*path).to_string(), blob);
    }
    let tree = store
        .build_tree(Some(base_tree), &inserts, &BTreeSet::new())
        .expect("tree");
    store
        .commit_with_kind(branch, tree, message, kind)
        .expect("commit")
}
