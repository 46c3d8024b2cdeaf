// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Value};
use tracing::debug;

use crate::{API_KEY_ENV, DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_SUMMARIZATION_MODEL};

/// User settings, stored as one JSON document at
/// `~/.config/forge/settings.json`.
///
/// Unknown keys are preserved verbatim on save so that UI-only settings
/// (editor, theme, keybindings) survive round trips through the core.
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    values: Value,
}

fn default_settings() -> Value {
    json!({
        "llm": {
            "api_key": "",
            "model": DEFAULT_MODEL,
            "base_url": DEFAULT_BASE_URL,
            "summarization_model": DEFAULT_SUMMARIZATION_MODEL,
            "parallel_summarization": 8,
            "summary_token_budget": 10_000,
        },
    })
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_json(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                merge_json(d.entry(k).or_insert(Value::Null), v);
            }
        }
        (dst, src) => *dst = src,
    }
}

impl Settings {
    /// Load settings from the default path (`~/.config/forge/settings.json`).
    pub fn load() -> anyhow::Result<Self> {
        let dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::load_from(dir.join("forge").join("settings.json"))
    }

    /// Load settings from an explicit path. A missing file yields defaults.
    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut values = default_settings();
        if path.is_file() {
            debug!(path = %path.display(), "loading settings");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let loaded: Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_json(&mut values, loaded);
        }
        Ok(Self { path, values })
    }

    /// In-memory settings for tests; never touches the filesystem on load.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from("/nonexistent/forge-settings.json"),
            values: default_settings(),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a setting by dot-separated path (e.g. `"llm.api_key"`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.values;
        for part in path.split('.') {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    fn get_str(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    /// Set a setting by dot-separated path, creating intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) {
        let mut current = &mut self.values;
        let parts: Vec<&str> = path.split('.').collect();
        for part in &parts[..parts.len() - 1] {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            current = current
                .as_object_mut()
                .expect("just ensured object")
                .entry(part.to_string())
                .or_insert(Value::Null);
        }
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current
            .as_object_mut()
            .expect("just ensured object")
            .insert(parts[parts.len() - 1].to_string(), value);
    }

    /// API key, from the environment or the settings file.
    /// The environment wins when both are set.
    pub fn api_key(&self) -> String {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                return key;
            }
        }
        self.get_str("llm.api_key", "")
    }

    pub fn model(&self) -> String {
        self.get_str("llm.model", DEFAULT_MODEL)
    }

    pub fn base_url(&self) -> String {
        self.get_str("llm.base_url", DEFAULT_BASE_URL)
    }

    /// The cheap/fast model used for summaries, commit messages and scout.
    pub fn summarization_model(&self) -> String {
        self.get_str("llm.summarization_model", DEFAULT_SUMMARIZATION_MODEL)
    }

    /// Number of concurrent summary requests. At least 1.
    pub fn parallel_summarization(&self) -> usize {
        self.get("llm.parallel_summarization")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(8)
            .max(1)
    }

    /// Token budget for the summaries document. At least 1000.
    pub fn summary_token_budget(&self) -> usize {
        self.get("llm.summary_token_budget")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(10_000)
            .max(1000)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let s = Settings::load_from("/tmp/forge_no_such_settings_file.json").unwrap();
        assert_eq!(s.model(), DEFAULT_MODEL);
        assert_eq!(s.base_url(), DEFAULT_BASE_URL);
        assert_eq!(s.parallel_summarization(), 8);
    }

    #[test]
    fn get_by_dot_path() {
        let s = Settings::in_memory();
        assert_eq!(
            s.get("llm.summary_token_budget").and_then(Value::as_u64),
            Some(10_000)
        );
        assert!(s.get("llm.no_such_key").is_none());
        assert!(s.get("no.such.path").is_none());
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut s = Settings::in_memory();
        s.set("ui.theme", json!("dark"));
        assert_eq!(s.get("ui.theme").and_then(Value::as_str), Some("dark"));
    }

    #[test]
    fn set_overwrites_existing() {
        let mut s = Settings::in_memory();
        s.set("llm.model", json!("test/model"));
        assert_eq!(s.model(), "test/model");
    }

    #[test]
    fn loaded_file_overrides_defaults_and_preserves_unknown_keys() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "{}",
            json!({
                "llm": { "model": "custom/model" },
                "editor": { "font_size": 14 },
            })
        )
        .unwrap();
        let s = Settings::load_from(f.path()).unwrap();
        assert_eq!(s.model(), "custom/model");
        // Defaults not named in the file survive the merge.
        assert_eq!(s.base_url(), DEFAULT_BASE_URL);
        // UI-only keys pass through untouched.
        assert_eq!(s.get("editor.font_size").and_then(Value::as_u64), Some(14));
    }

    #[test]
    fn parallel_summarization_clamped_to_one() {
        let mut s = Settings::in_memory();
        s.set("llm.parallel_summarization", json!(0));
        assert_eq!(s.parallel_summarization(), 1);
    }

    #[test]
    fn summary_token_budget_clamped_to_minimum() {
        let mut s = Settings::in_memory();
        s.set("llm.summary_token_budget", json!(10));
        assert_eq!(s.summary_token_budget(), 1000);
    }

    #[test]
    fn empty_api_key_falls_back_to_empty_string() {
        let s = Settings::in_memory();
        // No env var in the test environment: settings value (empty) is used.
        if std::env::var(API_KEY_ENV).is_err() {
            assert_eq!(s.api_key(), "");
        }
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = Settings::load_from(&path).unwrap();
        s.set("llm.model", json!("round/trip"));
        s.save().unwrap();
        let reloaded = Settings::load_from(&path).unwrap();
        assert_eq!(reloaded.model(), "round/trip");
    }
}
