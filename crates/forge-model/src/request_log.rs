// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Debug log of raw API requests and responses.
//!
//! Each request/response pair is dumped to its own JSON file under the
//! cache dir so a failing generation can be inspected or replayed. Entries
//! are persisted into the session record on commit. Like the cost tracker
//! this is an injected handle, not an ambient global.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestLogEntry {
    pub id: String,
    pub timestamp: String,
    pub model: String,
    pub streaming: bool,
    pub request_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
}

#[derive(Debug)]
pub struct RequestLog {
    dir: PathBuf,
    entries: Mutex<Vec<RequestLogEntry>>,
}

impl RequestLog {
    /// `cache_dir` is typically `~/.cache/forge`; dumps land in a
    /// `requests/` subdirectory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: cache_dir.into().join("requests"),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record an outgoing request. Returns an opaque handle for
    /// [`log_response`](Self::log_response). File writes are best-effort.
    pub fn log_request(&self, payload: &Value, model: &str, streaming: bool) -> usize {
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let request_file = self.dir.join(format!("{timestamp}_{id}_request.json"));
        self.dump(&request_file, payload);

        let entry = RequestLogEntry {
            id,
            timestamp,
            model: model.to_string(),
            streaming,
            request_file: request_file.display().to_string(),
            response_file: None,
            actual_cost: None,
            generation_id: None,
        };
        let mut entries = self.entries.lock().expect("request log poisoned");
        entries.push(entry);
        entries.len() - 1
    }

    pub fn log_response(
        &self,
        handle: usize,
        body: &Value,
        actual_cost: Option<f64>,
        generation_id: Option<String>,
    ) {
        let mut entries = self.entries.lock().expect("request log poisoned");
        let Some(entry) = entries.get_mut(handle) else { return };
        let response_file = self
            .dir
            .join(format!("{}_{}_response.json", entry.timestamp, entry.id));
        entry.response_file = Some(response_file.display().to_string());
        entry.actual_cost = actual_cost;
        entry.generation_id = generation_id;
        drop(entries);
        self.dump(&response_file, body);
    }

    pub fn entries(&self) -> Vec<RequestLogEntry> {
        self.entries.lock().expect("request log poisoned").clone()
    }

    /// Replace the in-memory entries (used when restoring a session).
    /// Entries whose request dump no longer exists on disk are dropped.
    pub fn restore(&self, entries: Vec<RequestLogEntry>) {
        let kept: Vec<RequestLogEntry> = entries
            .into_iter()
            .filter(|e| std::path::Path::new(&e.request_file).exists())
            .collect();
        *self.entries.lock().expect("request log poisoned") = kept;
    }

    pub fn clear(&self) {
        self.entries.lock().expect("request log poisoned").clear();
    }

    fn dump(&self, path: &PathBuf, payload: &Value) {
        let result = (|| -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::write(path, serde_json::to_string_pretty(payload).unwrap_or_default())
        })();
        if let Err(e) = result {
            debug!(error = %e, path = %path.display(), "failed to dump request log file");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_dumped_and_entry_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path());
        let h = log.log_request(&json!({"model": "m"}), "m", true);
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[h].model, "m");
        assert!(entries[h].streaming);
        assert!(std::path::Path::new(&entries[h].request_file).exists());
        assert!(entries[h].response_file.is_none());
    }

    #[test]
    fn response_updates_entry_and_dumps_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path());
        let h = log.log_request(&json!({}), "m", false);
        log.log_response(h, &json!({"ok": true}), Some(0.002), Some("gen_1".into()));
        let entry = &log.entries()[h];
        assert_eq!(entry.actual_cost, Some(0.002));
        assert_eq!(entry.generation_id.as_deref(), Some("gen_1"));
        assert!(std::path::Path::new(entry.response_file.as_ref().unwrap()).exists());
    }

    #[test]
    fn restore_drops_entries_with_missing_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path());
        let h = log.log_request(&json!({}), "m", false);
        let mut entries = log.entries();
        entries.push(RequestLogEntry {
            request_file: "/nonexistent/gone.json".into(),
            ..entries[h].clone()
        });
        log.restore(entries);
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn log_response_with_stale_handle_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path());
        log.log_response(42, &json!({}), None, None); // must not panic
        assert!(log.entries().is_empty());
    }
}
