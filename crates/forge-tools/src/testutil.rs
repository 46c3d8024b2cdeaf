// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Test fixtures: a throwaway repository with an overlay on `main`.

use std::collections::BTreeSet;
use std::sync::Arc;

use tempfile::TempDir;

use forge_git::{CommitStore, OverlayVfs};

pub(crate) fn test_overlay(files: &[(&str, &str)]) -> (TempDir, OverlayVfs) {
    let dir = TempDir::new().expect("tempdir");
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    git2::Repository::init_opts(dir.path(), &opts).expect("init repo");

    let store = Arc::new(CommitStore::open(dir.path()).expect("open store"));
    let mut inserts = std::collections::BTreeMap::new();
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

    let vfs = OverlayVfs::new(store, "main").expect("overlay");
    (dir, vfs)
}
