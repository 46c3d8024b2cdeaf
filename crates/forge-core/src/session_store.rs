// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session persistence: the per-branch session record and the on-disk
//! summary cache.

use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use forge_config::SESSION_FILE;
use forge_git::OverlayVfs;
use forge_model::RequestLogEntry;

/// Everything a branch remembers about its session, stored as one pretty
/// JSON document at `.forge/session.json` and written with every turn
/// commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub active_files: Vec<String>,
    #[serde(default)]
    pub request_log_entries: Vec<RequestLogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
    #[serde(default)]
    pub child_sessions: Vec<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yield_message: Option<String>,
}

impl SessionRecord {
    /// Load the session record visible through the overlay, if any.
    pub fn load(vfs: &OverlayVfs) -> Option<Self> {
        let text = vfs.read_file(SESSION_FILE).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Write the record into the overlay (it lands with the next commit).
    pub fn write_to(&self, vfs: &mut OverlayVfs) {
        let text = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".into());
        vfs.write_file(SESSION_FILE, text);
    }
}

/// Content-addressed cache of per-file summaries.
///
/// Keys combine the blob oid (or content hash) with the file path, so
/// identical content reuses entries across branches while a rename still
/// regenerates. One file per entry; writes go through temp + rename and are
/// best-effort.
#[derive(Debug, Clone)]
pub struct SummaryCache {
    dir: PathBuf,
}

impl SummaryCache {
    /// `cache_dir` is typically `~/.cache/forge`; entries land in
    /// `summaries/`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: cache_dir.into().join("summaries"),
        }
    }

    fn key(filepath: &str, content_hash: &str) -> String {
        hex::encode(Sha256::digest(format!("{content_hash}:{filepath}").as_bytes()))
    }

    pub fn get(&self, filepath: &str, content_hash: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.join(Self::key(filepath, content_hash))).ok()
    }

    pub fn put(&self, filepath: &str, content_hash: &str, summary: &str) {
        let result = (|| -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(summary.as_bytes())?;
            tmp.persist(self.dir.join(Self::key(filepath, content_hash)))
                .map_err(|e| e.error)?;
            Ok(())
        })();
        if let Err(e) = result {
            debug!(error = %e, filepath, "failed to write summary cache entry");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
