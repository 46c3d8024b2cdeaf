// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The layered virtual file system.
//!
//! [`BaseVfs`] is a read-only view of one commit's tree. [`OverlayVfs`]
//! stacks a turn's pending writes and deletions on top of it and commits
//! them atomically as one typed git commit, after which the overlay rebases
//! onto the new head.
//!
//! # Thread ownership
//!
//! The overlay is single-owner at a time. The tool-execution worker calls
//! [`OverlayVfs::claim_thread`] before touching pending edits and
//! [`OverlayVfs::release_thread`] when done; every read, write and listing
//! asserts that the calling thread is the owner (or that nothing is
//! claimed). A violation is a programming error and panics.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::ThreadId;

use git2::Oid;
use tracing::debug;

use crate::commit_kind::CommitKind;
use crate::store::{CommitStore, GitError};

/// Read-only view of a single commit's tree.
#[derive(Clone)]
pub struct BaseVfs {
    store: Arc<CommitStore>,
    commit: Oid,
}

impl BaseVfs {
    pub fn for_branch(store: Arc<CommitStore>, branch: &str) -> Result<Self, GitError> {
        let commit = store.branch_head(branch)?;
        Ok(Self { store, commit })
    }

    pub fn at_commit(store: Arc<CommitStore>, commit: Oid) -> Self {
        Self { store, commit }
    }

    pub fn commit_oid(&self) -> Oid {
        self.commit
    }

    pub fn read_file_bytes(&self, path: &str) -> Result<Vec<u8>, GitError> {
        self.store.read_blob(self.commit, path)
    }

    pub fn read_file(&self, path: &str) -> Result<String, GitError> {
        let bytes = self.read_file_bytes(path)?;
        String::from_utf8(bytes).map_err(|_| GitError::NotUtf8(path.to_string()))
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.store.file_exists(self.commit, path)
    }

    /// All files in the commit, depth-first, submodules skipped.
    pub fn list_all_files(&self) -> Result<Vec<String>, GitError> {
        self.store.list_files(self.commit)
    }

    /// Blob oid (content hash) of a committed file.
    pub fn blob_oid(&self, path: &str) -> Result<Oid, GitError> {
        self.store.blob_oid(self.commit, path)
    }
}

/// Writable overlay that accumulates one turn's changes in memory.
///
/// Reads resolve tombstone → pending → base. Every tool sees the base
/// commit plus all previous tool changes in the turn.
pub struct OverlayVfs {
    store: Arc<CommitStore>,
    branch: String,
    base: BaseVfs,
    pending: BTreeMap<String, String>,
    tombstones: BTreeSet<String>,
    owner: Option<ThreadId>,
}

impl OverlayVfs {
    pub fn new(store: Arc<CommitStore>, branch: impl Into<String>) -> Result<Self, GitError> {
        let branch = branch.into();
        let base = BaseVfs::for_branch(Arc::clone(&store), &branch)?;
        Ok(Self {
            store,
            branch,
            base,
            pending: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            owner: None,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn base(&self) -> &BaseVfs {
        &self.base
    }

    pub fn store(&self) -> &Arc<CommitStore> {
        &self.store
    }

    // ── Thread ownership ─────────────────────────────────────────────────────

    /// Claim the overlay for the calling thread.
    pub fn claim_thread(&mut self) {
        let current = std::thread::current().id();
        if let Some(owner) = self.owner {
            assert!(
                owner == current,
                "overlay already claimed by {owner:?}, claim attempted from {current:?}"
            );
        }
        self.owner = Some(current);
    }

    pub fn release_thread(&mut self) {
        self.owner = None;
    }

    fn assert_owner(&self) {
        if let Some(owner) = self.owner {
            let current = std::thread::current().id();
            assert!(
                owner == current,
                "overlay owned by thread {owner:?}, accessed from {current:?}"
            );
        }
    }

    // ── File access ──────────────────────────────────────────────────────────

    pub fn read_file(&self, path: &str) -> Result<String, GitError> {
        self.assert_owner();
        if self.tombstones.contains(path) {
            return Err(GitError::FileNotFound(path.to_string()));
        }
        if let Some(content) = self.pending.get(path) {
            return Ok(content.clone());
        }
        self.base.read_file(path)
    }

    pub fn write_file(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.assert_owner();
        let path = path.into();
        self.tombstones.remove(&path);
        self.pending.insert(path, content.into());
    }

    pub fn delete_file(&mut self, path: &str) -> Result<(), GitError> {
        self.assert_owner();
        if !self.file_exists(path) {
            return Err(GitError::FileNotFound(path.to_string()));
        }
        self.pending.remove(path);
        self.tombstones.insert(path.to_string());
        Ok(())
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.assert_owner();
        if self.tombstones.contains(path) {
            return false;
        }
        self.pending.contains_key(path) || self.base.file_exists(path)
    }

    /// base files ∪ pending − tombstones, sorted.
    pub fn list_files(&self) -> Result<Vec<String>, GitError> {
        self.assert_owner();
        let mut files: BTreeSet<String> = self.base.list_all_files()?.into_iter().collect();
        files.extend(self.pending.keys().cloned());
        for gone in &self.tombstones {
            files.remove(gone);
        }
        Ok(files.into_iter().collect())
    }

    pub fn pending_changes(&self) -> BTreeMap<String, String> {
        self.assert_owner();
        self.pending.clone()
    }

    pub fn deleted_files(&self) -> BTreeSet<String> {
        self.assert_owner();
        self.tombstones.clone()
    }

    pub fn has_changes(&self) -> bool {
        self.assert_owner();
        !self.pending.is_empty() || !self.tombstones.is_empty()
    }

    pub fn clear_pending(&mut self) {
        self.assert_owner();
        self.pending.clear();
        self.tombstones.clear();
    }

    /// Point the overlay at the current branch head (after a commit made
    /// outside the overlay, e.g. a tool-approval follow-up).
    pub fn rebase(&mut self) -> Result<(), GitError> {
        self.base = BaseVfs::for_branch(Arc::clone(&self.store), &self.branch)?;
        Ok(())
    }

    // ── Commit ───────────────────────────────────────────────────────────────

    /// Commit all pending changes as one typed commit on the branch.
    ///
    /// Whether the branch is checked out and the working directory clean is
    /// decided before any objects are written; if both held, the working
    /// directory is synced to the new head afterwards. The overlay then
    /// rebases onto the new head with empty pending state.
    pub fn commit(&mut self, message: &str, kind: CommitKind) -> Result<Oid, GitError> {
        self.assert_owner();
        if !self.has_changes() {
            return Err(GitError::NothingToCommit);
        }

        let is_checked_out = self.store.checked_out_branch().as_deref() == Some(&self.branch);
        let sync_after = is_checked_out && self.store.workdir_clean();

        let mut inserts = BTreeMap::new();
        for (path, content) in &self.pending {
            let blob = self.store.create_blob(content.as_bytes())?;
            inserts.insert(path.clone(), blob);
        }
        let base_tree = self.store.commit_tree_oid(self.base.commit_oid())?;
        let tree = self
            .store
            .build_tree(Some(base_tree), &inserts, &self.tombstones)?;

        let oid = self.store.commit_with_kind(&self.branch, tree, message, kind)?;
        debug!(branch = %self.branch, commit = %oid, kind = ?kind, "overlay committed");

        if sync_after {
            self.store.sync_workdir(&self.branch)?;
        }

        self.pending.clear();
        self.tombstones.clear();
        self.rebase()?;
        Ok(oid)
    }

    // ── Materialisation ──────────────────────────────────────────────────────

    /// Write every currently-visible file into a fresh directory and return
    /// its root. Used for sandboxed subprocess runs; the caller owns
    /// cleanup.
    pub fn materialize_to_tempdir(&self) -> Result<PathBuf, GitError> {
        self.assert_owner();
        let dir = tempfile::Builder::new()
            .prefix("forge_vfs_")
            .tempdir()?
            .keep();
        for path in self.list_files()? {
            let full = dir.join(&path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Binary files pass through untouched.
            let bytes = match self.pending.get(&path) {
                Some(content) => content.clone().into_bytes(),
                None => self.base.read_file_bytes(&path)?,
            };
            std::fs::write(&full, bytes)?;
        }
        Ok(dir)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_store;

    fn overlay(files: &[(&str, &str)]) -> (tempfile::TempDir, OverlayVfs) {
        let (dir, store) = test_store(files);
        let vfs = OverlayVfs::new(Arc::new(store), "main").unwrap();
        (dir, vfs)
    }

    // ── Read resolution ───────────────────────────────────────────────────────

    #[test]
    fn reads_fall_through_to_base() {
        let (_dir, vfs) = overlay(&[("a.txt", "base")]);
        assert_eq!(vfs.read_file("a.txt").unwrap(), "base");
    }

    #[test]
    fn pending_write_shadows_base() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "base")]);
        vfs.write_file("a.txt", "edited");
        assert_eq!(vfs.read_file("a.txt").unwrap(), "edited");
    }

    #[test]
    fn tombstone_hides_base_file() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "base")]);
        vfs.delete_file("a.txt").unwrap();
        assert!(matches!(
            vfs.read_file("a.txt"),
            Err(GitError::FileNotFound(_))
        ));
        assert!(!vfs.file_exists("a.txt"));
    }

    #[test]
    fn write_clears_tombstone() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "base")]);
        vfs.delete_file("a.txt").unwrap();
        vfs.write_file("a.txt", "resurrected");
        assert_eq!(vfs.read_file("a.txt").unwrap(), "resurrected");
    }

    #[test]
    fn delete_drops_pending_write() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "base")]);
        vfs.write_file("new.txt", "pending");
        vfs.delete_file("new.txt").unwrap();
        assert!(!vfs.file_exists("new.txt"));
        assert!(vfs.pending_changes().is_empty());
        assert!(vfs.deleted_files().contains("new.txt"));
    }

    #[test]
    fn delete_of_missing_file_is_an_error() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "base")]);
        assert!(matches!(
            vfs.delete_file("nope.txt"),
            Err(GitError::FileNotFound(_))
        ));
    }

    #[test]
    fn listing_merges_base_and_pending_minus_tombstones() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "1"), ("b.txt", "2")]);
        vfs.write_file("c.txt", "3");
        vfs.delete_file("b.txt").unwrap();
        assert_eq!(vfs.list_files().unwrap(), vec!["a.txt", "c.txt"]);
    }

    // ── Commit ────────────────────────────────────────────────────────────────

    #[test]
    fn commit_with_nothing_pending_is_rejected() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "1")]);
        assert!(matches!(
            vfs.commit("noop", CommitKind::Major),
            Err(GitError::NothingToCommit)
        ));
    }

    #[test]
    fn commit_writes_changes_and_rebases() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "1")]);
        vfs.write_file("src/new.rs", "fn main() {}");
        vfs.delete_file("a.txt").unwrap();

        let oid = vfs.commit("feat: add main", CommitKind::Major).unwrap();

        // Pending state cleared, base now at the new head.
        assert!(!vfs.has_changes());
        assert_eq!(vfs.base().commit_oid(), oid);
        // The new base serves the committed content.
        assert_eq!(vfs.read_file("src/new.rs").unwrap(), "fn main() {}");
        assert!(!vfs.file_exists("a.txt"));
    }

    #[test]
    fn second_commit_builds_on_first() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "1")]);
        vfs.write_file("one.txt", "1");
        vfs.commit("one", CommitKind::Major).unwrap();
        vfs.write_file("two.txt", "2");
        let second = vfs.commit("two", CommitKind::Major).unwrap();

        assert_eq!(vfs.base().commit_oid(), second);
        assert_eq!(vfs.read_file("one.txt").unwrap(), "1");
        assert_eq!(vfs.read_file("two.txt").unwrap(), "2");
    }

    // ── Materialisation ───────────────────────────────────────────────────────

    #[test]
    fn materialize_writes_visible_files() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "base"), ("drop.txt", "x")]);
        vfs.write_file("sub/dir/new.txt", "pending");
        vfs.delete_file("drop.txt").unwrap();

        let root = vfs.materialize_to_tempdir().unwrap();
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "base");
        assert_eq!(
            std::fs::read_to_string(root.join("sub/dir/new.txt")).unwrap(),
            "pending"
        );
        assert!(!root.join("drop.txt").exists());
        std::fs::remove_dir_all(root).unwrap();
    }

    // ── Thread ownership ──────────────────────────────────────────────────────

    #[test]
    fn unclaimed_overlay_is_usable_from_any_thread() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "1")]);
        vfs.write_file("b.txt", "2");
        let handle = std::thread::spawn(move || {
            // No owner claimed: fine.
            vfs.read_file("b.txt").unwrap()
        });
        assert_eq!(handle.join().unwrap(), "2");
    }

    #[test]
    fn claimed_overlay_panics_on_foreign_thread_access() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "1")]);
        vfs.claim_thread();
        let handle = std::thread::spawn(move || {
            // Owned by the test thread: this must panic.
            let _ = vfs.read_file("a.txt");
        });
        assert!(handle.join().is_err(), "expected ownership panic");
    }

    #[test]
    fn release_then_claim_on_new_thread_works() {
        let (_dir, mut vfs) = overlay(&[("a.txt", "1")]);
        vfs.claim_thread();
        vfs.release_thread();
        let handle = std::thread::spawn(move || {
            vfs.claim_thread();
            let out = vfs.read_file("a.txt").unwrap();
            vfs.release_thread();
            out
        });
        assert_eq!(handle.join().unwrap(), "1");
    }
}
