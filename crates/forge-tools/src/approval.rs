// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-hash approval for user tools.
//!
//! A tool's identity is the sha-256 of its source bytes. The ledger in
//! `.forge/approved_tools.json` maps tool basename (no extension) to a
//! lowercase hex hash; a tool may run only while its current source hashes
//! to an approved entry. Editing a tool therefore revokes its approval
//! automatically.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use forge_git::OverlayVfs;

/// Ledger path, relative to the branch root.
pub const APPROVED_TOOLS_FILE: &str = ".forge/approved_tools.json";

#[derive(Debug, Default)]
pub struct ApprovalGate {
    approved: BTreeMap<String, String>,
    /// Approvals granted this session, not yet committed.
    pending: BTreeMap<String, String>,
}

/// Lowercase hex sha-256 of the tool source.
pub fn source_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the ledger through the overlay (committed state plus any
    /// pending edit to the ledger itself). A missing file is an empty
    /// ledger.
    pub fn load(&mut self, vfs: &OverlayVfs) {
        self.approved = vfs
            .read_file(APPROVED_TOOLS_FILE)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
    }

    /// Whether the ledger has any entry for this tool name (at any hash).
    pub fn has_entry(&self, name: &str) -> bool {
        self.approved.contains_key(name)
    }

    pub fn is_approved(&self, name: &str, source: &str) -> bool {
        self.approved.get(name).map(String::as_str) == Some(source_hash(source).as_str())
    }

    pub fn approve(&mut self, name: impl Into<String>, source: &str) {
        let name = name.into();
        let hash = source_hash(source);
        self.approved.insert(name.clone(), hash.clone());
        self.pending.insert(name, hash);
    }

    pub fn reject(&mut self, name: &str) {
        self.approved.remove(name);
        self.pending.remove(name);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Names approved this session, for the follow-up commit message.
    pub fn pending_names(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Serialized ledger content for `.forge/approved_tools.json`.
    pub fn ledger_json(&self) -> String {
        serde_json::to_string_pretty(&self.approved).unwrap_or_else(|_| "{}".into())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
