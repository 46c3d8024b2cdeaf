// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! USD cost accounting for API usage.
//!
//! Tracks the running session cost plus a per-day total that survives
//! restarts via a small JSON cache (`daily_costs.json`). The tracker is
//! passed around as an injected `Arc` handle; there is no ambient global.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Point-in-time view of accumulated costs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    /// Cost accumulated by this process (USD).
    pub session: f64,
    /// Cost accumulated today across sessions (USD).
    pub daily: f64,
}

#[derive(Debug, Default)]
struct CostState {
    session: f64,
    daily: f64,
    request_count: u64,
}

/// Accumulates request costs and persists the daily total.
#[derive(Debug)]
pub struct CostTracker {
    daily_file: PathBuf,
    state: Mutex<CostState>,
}

impl CostTracker {
    /// `cache_dir` is typically `~/.cache/forge`. Today's total is loaded
    /// from `daily_costs.json` if present.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let daily_file = cache_dir.into().join("daily_costs.json");
        let daily = load_daily(&daily_file, &today());
        Self {
            daily_file,
            state: Mutex::new(CostState { session: 0.0, daily, request_count: 0 }),
        }
    }

    pub fn add_cost(&self, cost: f64) {
        let snapshot = {
            let mut state = self.state.lock().expect("cost tracker poisoned");
            state.session += cost;
            state.daily += cost;
            state.request_count += 1;
            state.daily
        };
        self.save_daily(snapshot);
    }

    pub fn snapshot(&self) -> CostSnapshot {
        let state = self.state.lock().expect("cost tracker poisoned");
        CostSnapshot { session: state.session, daily: state.daily }
    }

    pub fn request_count(&self) -> u64 {
        self.state.lock().expect("cost tracker poisoned").request_count
    }

    /// Persist today's total, pruning entries older than the last 7 days.
    /// Best-effort: write-to-temp then rename; failures are logged and
    /// swallowed (cost tracking must never fail a turn).
    fn save_daily(&self, daily: f64) {
        let mut data: BTreeMap<String, f64> = match std::fs::read_to_string(&self.daily_file) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        data.insert(today(), daily);
        let recent: Vec<String> = data.keys().rev().take(7).cloned().collect();
        data.retain(|k, _| recent.contains(k));

        let result = (|| -> std::io::Result<()> {
            let dir = self
                .daily_file
                .parent()
                .ok_or_else(|| std::io::Error::other("daily cost file has no parent"))?;
            std::fs::create_dir_all(dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(serde_json::to_string_pretty(&data).unwrap_or_default().as_bytes())?;
            tmp.persist(&self.daily_file).map_err(|e| e.error)?;
            Ok(())
        })();
        if let Err(e) = result {
            debug!(error = %e, "failed to persist daily cost cache");
        }
    }
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn load_daily(path: &PathBuf, day: &str) -> f64 {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str::<BTreeMap<String, f64>>(&text)
            .ok()
            .and_then(|m| m.get(day).copied())
            .unwrap_or(0.0),
        Err(_) => 0.0,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let t = CostTracker::new(dir.path());
        let s = t.snapshot();
        assert_eq!(s.session, 0.0);
        assert_eq!(s.daily, 0.0);
        assert_eq!(t.request_count(), 0);
    }

    #[test]
    fn add_cost_accumulates_session_and_daily() {
        let dir = tempfile::tempdir().unwrap();
        let t = CostTracker::new(dir.path());
        t.add_cost(0.01);
        t.add_cost(0.02);
        let s = t.snapshot();
        assert!((s.session - 0.03).abs() < 1e-9);
        assert!((s.daily - 0.03).abs() < 1e-9);
        assert_eq!(t.request_count(), 2);
    }

    #[test]
    fn daily_total_survives_tracker_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = CostTracker::new(dir.path());
            t.add_cost(0.5);
        }
        let t2 = CostTracker::new(dir.path());
        let s = t2.snapshot();
        assert_eq!(s.session, 0.0, "session cost resets per process");
        assert!((s.daily - 0.5).abs() < 1e-9, "daily cost reloaded from cache");
    }

    #[test]
    fn cache_file_pruned_to_seven_days() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("daily_costs.json");
        let mut old: BTreeMap<String, f64> = BTreeMap::new();
        for day in 1..=9 {
            old.insert(format!("2000-01-{day:02}"), 1.0);
        }
        std::fs::write(&file, serde_json::to_string(&old).unwrap()).unwrap();

        let t = CostTracker::new(dir.path());
        t.add_cost(0.1);

        let data: BTreeMap<String, f64> =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(data.len(), 7);
        // Today plus the six most recent historical days remain.
        assert!(data.contains_key(&today()));
        assert!(!data.contains_key("2000-01-01"));
    }

    #[test]
    fn corrupt_cache_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("daily_costs.json"), "not json").unwrap();
        let t = CostTracker::new(dir.path());
        assert_eq!(t.snapshot().daily, 0.0);
        t.add_cost(0.1); // must not panic
    }
}
