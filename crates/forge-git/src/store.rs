// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Git object access for the session branches.
//!
//! Everything the rest of the system needs from git goes through
//! [`CommitStore`]: reading blobs out of commits, building trees from
//! in-memory changes, creating typed commits, moving refs and merging.
//! The underlying `git2::Repository` is not `Sync`, so it sits behind a
//! mutex; one process operates a given repository at a time, so there is no
//! cross-process locking.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use git2::{BranchType, Oid, Repository};
use tracing::debug;

use crate::commit_kind::{self, CommitKind, Decision};

const DEFAULT_AUTHOR_NAME: &str = "Forge AI";
const DEFAULT_AUTHOR_EMAIL: &str = "ai@forge.dev";

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("no changes to commit")]
    NothingToCommit,

    #[error("file is not valid UTF-8: {0}")]
    NotUtf8(String),

    #[error("merge has conflicts in: {summary}")]
    MergeConflicts { paths: Vec<String>, summary: String },

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One node of the nested insert map handed to the tree builder.
enum TreeNode {
    Blob(Oid),
    Dir(BTreeMap<String, TreeNode>),
}

pub struct CommitStore {
    repo: Mutex<Repository>,
    author_name: String,
    author_email: String,
}

impl CommitStore {
    /// Discover the repository containing `path` (walking up parents).
    pub fn discover(path: impl AsRef<Path>) -> Result<Self, GitError> {
        Ok(Self::wrap(Repository::discover(path)?))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, GitError> {
        Ok(Self::wrap(Repository::open(path)?))
    }

    fn wrap(repo: Repository) -> Self {
        Self {
            repo: Mutex::new(repo),
            author_name: DEFAULT_AUTHOR_NAME.into(),
            author_email: DEFAULT_AUTHOR_EMAIL.into(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().expect("git repository mutex poisoned")
    }

    // ── Refs and commits ─────────────────────────────────────────────────────

    pub fn branch_head(&self, branch: &str) -> Result<Oid, GitError> {
        let repo = self.lock();
        let branch = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|_| GitError::BranchNotFound(branch.to_string()))?;
        let id = branch.get().peel_to_commit()?.id();
        Ok(id)
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.lock().find_branch(branch, BranchType::Local).is_ok()
    }

    pub fn local_branches(&self) -> Result<Vec<String>, GitError> {
        let repo = self.lock();
        let mut names = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Create a local branch at `target`. Creating an existing branch is a
    /// no-op so session branches can be re-opened.
    pub fn create_branch(&self, branch: &str, target: Oid) -> Result<(), GitError> {
        let repo = self.lock();
        if repo.find_branch(branch, BranchType::Local).is_ok() {
            return Ok(());
        }
        let commit = repo.find_commit(target)?;
        repo.branch(branch, &commit, false)?;
        Ok(())
    }

    /// Force-move a branch ref to `target`.
    pub fn move_ref(&self, branch: &str, target: Oid) -> Result<(), GitError> {
        let repo = self.lock();
        repo.reference(
            &format!("refs/heads/{branch}"),
            target,
            true,
            "forge: move ref",
        )?;
        Ok(())
    }

    pub fn head_oid(&self) -> Result<Oid, GitError> {
        Ok(self.lock().head()?.peel_to_commit()?.id())
    }

    pub fn commit_message(&self, oid: Oid) -> Result<String, GitError> {
        let repo = self.lock();
        let message = repo
            .find_commit(oid)?
            .message()
            .unwrap_or_default()
            .to_string();
        Ok(message)
    }

    pub fn commit_parent_ids(&self, oid: Oid) -> Result<Vec<Oid>, GitError> {
        let repo = self.lock();
        let ids = repo.find_commit(oid)?.parent_ids().collect();
        Ok(ids)
    }

    pub fn commit_tree_oid(&self, oid: Oid) -> Result<Oid, GitError> {
        Ok(self.lock().find_commit(oid)?.tree_id())
    }

    /// Create a commit. When `update_ref` is given the ref is updated to the
    /// new commit (and must currently point at the first parent).
    pub fn create_commit(
        &self,
        update_ref: Option<&str>,
        message: &str,
        tree: Oid,
        parents: &[Oid],
    ) -> Result<Oid, GitError> {
        let repo = self.lock();
        let sig = git2::Signature::now(&self.author_name, &self.author_email)?;
        let tree = repo.find_tree(tree)?;
        let parent_commits: Vec<git2::Commit> = parents
            .iter()
            .map(|p| repo.find_commit(*p))
            .collect::<Result<_, _>>()?;
        let parent_refs: Vec<&git2::Commit> = parent_commits.iter().collect();
        Ok(repo.commit(update_ref, &sig, &sig, message, &tree, &parent_refs)?)
    }

    // ── Blobs and trees ──────────────────────────────────────────────────────

    pub fn create_blob(&self, bytes: &[u8]) -> Result<Oid, GitError> {
        Ok(self.lock().blob(bytes)?)
    }

    /// Read the blob at `path` inside a commit's tree.
    pub fn read_blob(&self, commit: Oid, path: &str) -> Result<Vec<u8>, GitError> {
        let repo = self.lock();
        let tree = repo.find_commit(commit)?.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| GitError::FileNotFound(path.to_string()))?;
        let blob = repo
            .find_blob(entry.id())
            .map_err(|_| GitError::FileNotFound(path.to_string()))?;
        Ok(blob.content().to_vec())
    }

    /// The blob oid (content hash) of a file inside a commit.
    pub fn blob_oid(&self, commit: Oid, path: &str) -> Result<Oid, GitError> {
        let repo = self.lock();
        let tree = repo.find_commit(commit)?.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| GitError::FileNotFound(path.to_string()))?;
        Ok(entry.id())
    }

    pub fn file_exists(&self, commit: Oid, path: &str) -> bool {
        let repo = self.lock();
        repo.find_commit(commit)
            .and_then(|c| c.tree())
            .map(|t| t.get_path(Path::new(path)).is_ok())
            .unwrap_or(false)
    }

    /// All file paths in a commit, depth-first. Submodule entries (tree
    /// entries whose file mode denotes a nested commit) are skipped.
    pub fn list_files(&self, commit: Oid) -> Result<Vec<String>, GitError> {
        let repo = self.lock();
        let tree = repo.find_commit(commit)?.tree()?;
        let mut files = Vec::new();
        walk_tree(&repo, &tree, "", &mut files)?;
        Ok(files)
    }

    /// Build a tree by applying `inserts` (path → blob oid) and `deletes`
    /// (paths) to `base`. Untouched subtrees are reused; subtrees that only
    /// contain deletions are still recursed into so the delete applies.
    pub fn build_tree(
        &self,
        base: Option<Oid>,
        inserts: &BTreeMap<String, Oid>,
        deletes: &BTreeSet<String>,
    ) -> Result<Oid, GitError> {
        let repo = self.lock();
        let base_tree = match base {
            Some(oid) => Some(repo.find_tree(oid)?),
            None => None,
        };
        let nested = nest_inserts(inserts);
        Ok(build_tree_recursive(&repo, base_tree, &nested, deletes, "")?)
    }

    // ── Typed commits ────────────────────────────────────────────────────────

    /// Commit `tree` on `branch` with commit-type handling: follow-ups amend
    /// the previous major commit, consecutive prepares collapse, and a major
    /// commit absorbs any preceding prepare run.
    pub fn commit_with_kind(
        &self,
        branch: &str,
        tree: Oid,
        subject: &str,
        kind: CommitKind,
    ) -> Result<Oid, GitError> {
        let head = self.branch_head(branch)?;
        let head_message = self.commit_message(head)?;
        let (parent_kind, parent_subject) = commit_kind::parse(&head_message);

        match commit_kind::decide(parent_kind, parent_subject, kind, subject) {
            Decision::Emit { message } => {
                debug!(branch, kind = ?kind, "creating commit");
                self.create_commit(
                    Some(&format!("refs/heads/{branch}")),
                    &message,
                    tree,
                    &[head],
                )
            }
            Decision::AmendParent { message } => {
                debug!(branch, kind = ?kind, "amending branch tip");
                let message = message.unwrap_or(head_message);
                let parents = self.commit_parent_ids(head)?;
                let oid = self.create_commit(None, &message, tree, &parents)?;
                self.move_ref(branch, oid)?;
                Ok(oid)
            }
            Decision::AbsorbPrepareRun { message } => {
                let ancestor = self.first_non_prepare_ancestor(head)?;
                debug!(branch, ancestor = %ancestor, "absorbing prepare run into major commit");
                let oid = self.create_commit(None, &message, tree, &[ancestor])?;
                self.move_ref(branch, oid)?;
                Ok(oid)
            }
        }
    }

    /// Walk first parents back past the consecutive `[prepare]` run and
    /// return the first commit that is not a prepare commit.
    fn first_non_prepare_ancestor(&self, from: Oid) -> Result<Oid, GitError> {
        let mut current = from;
        loop {
            let message = self.commit_message(current)?;
            let (kind, _) = commit_kind::parse(&message);
            if kind != CommitKind::Prepare {
                return Ok(current);
            }
            match self.commit_parent_ids(current)?.first() {
                Some(parent) => current = *parent,
                // A prepare commit with no parent terminates the walk.
                None => return Ok(current),
            }
        }
    }

    // ── Working directory ────────────────────────────────────────────────────

    /// The branch the working directory has checked out, if any.
    pub fn checked_out_branch(&self) -> Option<String> {
        let repo = self.lock();
        let head = repo.head().ok()?;
        if head.is_branch() {
            head.shorthand().map(str::to_string)
        } else {
            None
        }
    }

    /// True when the working directory has no uncommitted changes to
    /// tracked files. Bare repositories report false.
    pub fn workdir_clean(&self) -> bool {
        let repo = self.lock();
        if repo.is_bare() {
            return false;
        }
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(false);
        repo.statuses(Some(&mut opts))
            .map(|s| s.is_empty())
            .unwrap_or(false)
    }

    /// Force the working directory to match the branch head. Overwrites
    /// tracked files; only called when the workdir was clean at decision
    /// time.
    pub fn sync_workdir(&self, branch: &str) -> Result<(), GitError> {
        let head = self.branch_head(branch)?;
        let repo = self.lock();
        let object = repo.find_object(head, None)?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_tree(&object, Some(&mut checkout))?;
        Ok(())
    }

    // ── Merging ──────────────────────────────────────────────────────────────

    pub fn merge_base(&self, a: Oid, b: Oid) -> Result<Oid, GitError> {
        Ok(self.lock().merge_base(a, b)?)
    }
}

/// Turn flat `path → blob` inserts into the nested per-directory shape the
/// recursive builder consumes. A blob colliding with a directory prefix is
/// overwritten by the directory (last write wins, as in a filesystem).
fn nest_inserts(inserts: &BTreeMap<String, Oid>) -> BTreeMap<String, TreeNode> {
    let mut root: BTreeMap<String, TreeNode> = BTreeMap::new();
    for (path, oid) in inserts {
        let parts: Vec<&str> = path.split('/').collect();
        let mut current = &mut root;
        for part in &parts[..parts.len() - 1] {
            let node = current
                .entry((*part).to_string())
                .or_insert_with(|| TreeNode::Dir(BTreeMap::new()));
            if matches!(node, TreeNode::Blob(_)) {
                *node = TreeNode::Dir(BTreeMap::new());
            }
            current = match node {
                TreeNode::Dir(children) => children,
                TreeNode::Blob(_) => unreachable!("blob was just replaced by a directory"),
            };
        }
        current.insert(parts[parts.len() - 1].to_string(), TreeNode::Blob(*oid));
    }
    root
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Recursively build one tree level. `deletes` is the full flat deletion
/// set; paths are matched against `prefix`.
fn build_tree_recursive<'r>(
    repo: &'r Repository,
    base: Option<git2::Tree<'r>>,
    changes: &BTreeMap<String, TreeNode>,
    deletes: &BTreeSet<String>,
    prefix: &str,
) -> Result<Oid, git2::Error> {
    let mut builder = repo.treebuilder(base.as_ref())?;

    // Deletions directly at this level, plus subdirectories that must be
    // recursed into purely to apply nested deletions.
    let mut delete_only_subdirs: BTreeSet<String> = BTreeSet::new();
    for delete in deletes {
        let relative = if prefix.is_empty() {
            delete.as_str()
        } else {
            match delete.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
                Some(r) => r,
                None => continue,
            }
        };
        match relative.split_once('/') {
            None => {
                // Removing an entry that does not exist is fine.
                let _ = builder.remove(relative);
            }
            Some((subdir, _)) => {
                if !changes.contains_key(subdir) {
                    delete_only_subdirs.insert(subdir.to_string());
                }
            }
        }
    }

    for subdir in &delete_only_subdirs {
        let subtree = base
            .as_ref()
            .and_then(|t| t.get_name(subdir))
            .and_then(|e| e.to_object(repo).ok())
            .and_then(|o| o.into_tree().ok());
        if let Some(subtree) = subtree {
            let oid = build_tree_recursive(
                repo,
                Some(subtree),
                &BTreeMap::new(),
                deletes,
                &join_path(prefix, subdir),
            )?;
            builder.insert(subdir, oid, 0o040000)?;
        }
    }

    for (name, node) in changes {
        match node {
            TreeNode::Blob(oid) => {
                builder.insert(name, *oid, 0o100644)?;
            }
            TreeNode::Dir(children) => {
                let subtree = base
                    .as_ref()
                    .and_then(|t| t.get_name(name))
                    .and_then(|e| e.to_object(repo).ok())
                    .and_then(|o| o.into_tree().ok());
                let oid = build_tree_recursive(
                    repo,
                    subtree,
                    children,
                    deletes,
                    &join_path(prefix, name),
                )?;
                builder.insert(name, oid, 0o040000)?;
            }
        }
    }

    builder.write()
}

fn walk_tree(
    repo: &Repository,
    tree: &git2::Tree,
    prefix: &str,
    out: &mut Vec<String>,
) -> Result<(), git2::Error> {
    for entry in tree.iter() {
        let name = entry.name().unwrap_or_default();
        let path = join_path(prefix, name);
        // Submodules: the entry's oid points into another repository.
        if entry.filemode() == i32::from(git2::FileMode::Commit) {
            continue;
        }
        match entry.to_object(repo)?.into_tree() {
            Ok(subtree) => walk_tree(repo, &subtree, &path, out)?,
            Err(_) => out.push(path),
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
