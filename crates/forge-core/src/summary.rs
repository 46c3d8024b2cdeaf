// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Repository file summarisation.
//!
//! Seeds the model's codebase map with one-line-or-short-bullet summaries
//! of every source file, generated by the cheap model and cached by content
//! hash. Files are processed breadth-first (shallow paths first) until the
//! token budget is reached; the rest are listed by name only with guidance
//! to use `scout`.

use std::collections::BTreeMap;

use futures::StreamExt;
use regex::Regex;
use sha2::Digest;
use tracing::{debug, warn};

use forge_config::REPO_CONFIG_FILE;
use forge_git::OverlayVfs;
use forge_model::{ApiMessage, LlmClient, Role};

use crate::session_store::SummaryCache;

/// Files larger than this are truncated for the summary prompt.
const MAX_SUMMARY_INPUT_CHARS: usize = 10_000;

/// Estimated tokens for a summary that has not been generated yet.
const UNCACHED_SUMMARY_ESTIMATE: usize = 100;

/// Binary / non-summarizable extensions.
const SKIP_EXTENSIONS: &[&str] = &[
    // Images
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "svg", "webp",
    // Fonts
    "ttf", "otf", "woff", "woff2", "eot",
    // Audio/video
    "mp3", "mp4", "wav", "ogg", "webm", "avi", "mov",
    // Archives
    "zip", "tar", "gz", "bz2", "xz", "7z", "rar",
    // Binaries
    "exe", "dll", "so", "dylib", "bin", "dat",
    // Documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
    // Build artifacts
    "pyc", "pyo", "class", "o", "a",
    // Data files
    "json",
];

// ─── Exclusion patterns ───────────────────────────────────────────────────────

/// gitignore-style matching for summary exclusions.
///
/// - `folder/` matches the folder at any depth (`/folder/` only at the root)
/// - patterns without `/` match the basename (`*.min.js`, `.DS_Store`)
/// - `/path` anchors at the root
/// - `**/` crosses directories and may match the empty prefix
/// - `!negation` is recognised but never matches (handled by the caller)
pub fn matches_pattern(filepath: &str, pattern: &str) -> bool {
    if pattern.is_empty() || filepath.is_empty() || pattern.starts_with('!') {
        return false;
    }

    // Directory patterns.
    if let Some(dir) = pattern.strip_suffix('/') {
        if dir.is_empty() {
            return false;
        }
        if let Some(anchored) = dir.strip_prefix('/') {
            return filepath.starts_with(&format!("{anchored}/"));
        }
        let regex = format!("(^|/){}/", glob_to_regex(dir));
        return Regex::new(&regex)
            .map(|r| r.is_match(filepath))
            .unwrap_or(false);
    }

    // Root-anchored path patterns.
    if let Some(anchored) = pattern.strip_prefix('/') {
        return full_match(anchored, filepath);
    }

    // Bare patterns match the basename anywhere.
    if !pattern.contains('/') {
        let basename = filepath.rsplit('/').next().unwrap_or(filepath);
        return full_match(pattern, basename);
    }

    // Path patterns (possibly with **).
    full_match(pattern, filepath)
}

fn full_match(pattern: &str, text: &str) -> bool {
    Regex::new(&format!("^{}$", glob_to_regex(pattern)))
        .map(|r| r.is_match(text))
        .unwrap_or(false)
}

/// Translate a glob into regex source: `*` stays within one path segment,
/// `**/` crosses directories (matching the empty prefix too), `?` is one
/// character.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

/// Exclusion patterns from `.forge/config.json` (`summary_exclusions`).
pub fn load_exclusion_patterns(vfs: &OverlayVfs) -> Vec<String> {
    vfs.read_file(REPO_CONFIG_FILE)
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .and_then(|config| {
            config["summary_exclusions"].as_array().map(|a| {
                a.iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        })
        .unwrap_or_default()
}

fn should_summarize(filepath: &str, exclusions: &[String]) -> bool {
    if filepath.starts_with(".forge/") {
        return false;
    }
    if let Some(ext) = filepath.rsplit('.').next() {
        if filepath.contains('.') && SKIP_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return false;
        }
    }
    !exclusions.iter().any(|p| matches_pattern(filepath, p))
}

// ─── The engine ───────────────────────────────────────────────────────────────

/// One file the plan wants summarized or listed.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub filepath: String,
    pub content_hash: String,
    pub cached_summary: Option<String>,
}

/// Result of the budget walk over the repository.
#[derive(Debug, Default)]
pub struct SummaryPlan {
    pub file_sizes: BTreeMap<String, usize>,
    pub within_budget: Vec<PlanEntry>,
    pub beyond_budget: Vec<String>,
    /// `(filepath, content_hash, truncated_content)` needing generation.
    pub to_generate: Vec<(String, String, String)>,
}

pub struct SummaryEngine {
    client: LlmClient,
    cache: SummaryCache,
    parallel: usize,
    token_budget: usize,
}

fn estimate_tokens(text: &str) -> usize {
    text.len() / 3
}

impl SummaryEngine {
    pub fn new(client: LlmClient, cache: SummaryCache, parallel: usize, token_budget: usize) -> Self {
        Self {
            client,
            cache,
            parallel: parallel.max(1),
            token_budget,
        }
    }

    /// Walk the repository breadth-first and decide what gets summarized.
    ///
    /// Reads go through the overlay so pending new files are included. Never
    /// touches the network.
    pub fn plan(&self, vfs: &OverlayVfs) -> anyhow::Result<SummaryPlan> {
        let exclusions = load_exclusion_patterns(vfs);
        let mut files: Vec<String> = vfs
            .list_files()?
            .into_iter()
            .filter(|f| should_summarize(f, &exclusions))
            .collect();
        // Breadth-first: shallow paths first, then lexicographic.
        files.sort_by_key(|f| (f.matches('/').count(), f.clone()));

        let mut plan = SummaryPlan::default();
        let mut current_tokens = 0usize;
        let mut cutoff = false;

        for filepath in files {
            let content = match vfs.read_file(&filepath) {
                Ok(c) => c,
                Err(_) => {
                    // Binary file without a known extension: skip entirely.
                    continue;
                }
            };
            plan.file_sizes.insert(filepath.clone(), content.len());

            let content_hash = match vfs.base().blob_oid(&filepath) {
                Ok(oid) => oid.to_string(),
                // Pending (uncommitted) file: hash the content.
                Err(_) => hex::encode(sha2::Sha256::digest(content.as_bytes())),
            };
            let cached = self.cache.get(&filepath, &content_hash);

            if cutoff {
                plan.beyond_budget.push(filepath);
                continue;
            }

            let estimated = match &cached {
                Some(summary) => estimate_tokens(&format!("## {filepath}\n{summary}\n")),
                None => UNCACHED_SUMMARY_ESTIMATE,
            };
            if current_tokens + estimated > self.token_budget {
                cutoff = true;
                plan.beyond_budget.push(filepath);
                continue;
            }
            current_tokens += estimated;

            if cached.is_none() {
                let truncated = truncate_for_prompt(&content);
                plan.to_generate
                    .push((filepath.clone(), content_hash.clone(), truncated));
            }
            plan.within_budget.push(PlanEntry {
                filepath,
                content_hash,
                cached_summary: cached,
            });
        }

        debug!(
            to_generate = plan.to_generate.len(),
            cached = plan.within_budget.len() - plan.to_generate.len(),
            beyond_budget = plan.beyond_budget.len(),
            "summary plan"
        );
        Ok(plan)
    }

    /// Generate the missing summaries through a bounded parallel pool and
    /// cache each result. Returns every summary within budget (cached and
    /// fresh). `on_progress` is called as generations complete.
    pub async fn generate(
        &self,
        plan: &SummaryPlan,
        mut on_progress: impl FnMut(usize, usize, &str),
    ) -> BTreeMap<String, String> {
        let mut summaries: BTreeMap<String, String> = plan
            .within_budget
            .iter()
            .filter_map(|e| {
                e.cached_summary
                    .as_ref()
                    .map(|s| (e.filepath.clone(), s.clone()))
            })
            .collect();

        let total = plan.to_generate.len();
        let mut done = 0usize;
        let mut pool = futures::stream::iter(plan.to_generate.iter().map(
            |(filepath, hash, content)| {
                let client = self.client.clone();
                async move {
                    let summary = fetch_summary(&client, filepath, content).await;
                    (filepath.clone(), hash.clone(), summary)
                }
            },
        ))
        .buffer_unordered(self.parallel);

        while let Some((filepath, hash, summary)) = pool.next().await {
            done += 1;
            on_progress(done, total, &filepath);
            match summary {
                Ok(summary) => {
                    self.cache.put(&filepath, &hash, &summary);
                    summaries.insert(filepath, summary);
                }
                Err(e) => warn!(filepath, error = %e, "summary generation failed"),
            }
        }
        summaries
    }

    /// Summarize one file (used for files created mid-turn). Returns `None`
    /// for files that should not be summarized.
    pub async fn summarize_single_file(
        &self,
        vfs_content: &str,
        filepath: &str,
        exclusions: &[String],
    ) -> anyhow::Result<Option<String>> {
        if !should_summarize(filepath, exclusions) {
            return Ok(None);
        }
        let content_hash = hex::encode(sha2::Sha256::digest(vfs_content.as_bytes()));
        if let Some(cached) = self.cache.get(filepath, &content_hash) {
            return Ok(Some(cached));
        }
        let summary =
            fetch_summary(&self.client, filepath, &truncate_for_prompt(vfs_content)).await?;
        self.cache.put(filepath, &content_hash, &summary);
        Ok(Some(summary))
    }
}

fn truncate_for_prompt(content: &str) -> String {
    if content.chars().count() > MAX_SUMMARY_INPUT_CHARS {
        let mut out: String = content.chars().take(MAX_SUMMARY_INPUT_CHARS).collect();
        out.push_str("\n... (truncated)");
        out
    } else {
        content.to_string()
    }
}

fn build_summary_prompt(filepath: &str, content: &str) -> String {
    format!(
        "Summarize this file's public interfaces for codebase navigation.\n\n\
         File: {filepath}\n\n```\n{content}\n```\n\n\
         First, decide: is this CODE (with importable classes/functions) or \
         DATA (config, docs, markdown, licenses, etc)?\n\n\
         If CODE: list public types/functions/constants as terse bullets \
         (skip private items, under 80 chars each).\n\
         If DATA (including .md files): just output \"—\" (the filename alone \
         is enough context for navigation).\n\n\
         Think about what category this file is, then put ONLY the final \
         bullets or \"—\" inside <summary></summary> tags. Nothing else \
         inside the tags."
    )
}

async fn fetch_summary(
    client: &LlmClient,
    filepath: &str,
    content: &str,
) -> anyhow::Result<String> {
    let prompt = build_summary_prompt(filepath, content);
    let response = client
        .chat_text(&[ApiMessage::text(Role::User, prompt)])
        .await?;
    Ok(extract_summary_section(&response))
}

/// Pull the `<summary>…</summary>` section out of the model response;
/// models that skip the tags get their whole response taken verbatim.
fn extract_summary_section(response: &str) -> String {
    static PATTERN: &str = "(?s)<summary>(.*?)</summary>";
    Regex::new(PATTERN)
        .ok()
        .and_then(|r| r.captures(response))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| response.trim().to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Pattern matching ──────────────────────────────────────────────────────

    #[test]
    fn dir_pattern_matches_files_under_dir() {
        assert!(matches_pattern("node_modules/foo.js", "node_modules/"));
        assert!(matches_pattern("node_modules/bar/baz.js", "node_modules/"));
        assert!(matches_pattern("src/node_modules/foo.js", "node_modules/"));
        assert!(matches_pattern("a/b/node_modules/c/d.js", "node_modules/"));
    }

    #[test]
    fn dir_pattern_requires_whole_segment() {
        assert!(!matches_pattern("node_modules_backup/foo.js", "node_modules/"));
        assert!(!matches_pattern("my_node_modules/foo.js", "node_modules/"));
    }

    #[test]
    fn anchored_dir_pattern_matches_root_only() {
        assert!(matches_pattern("build/output.js", "/build/"));
        assert!(!matches_pattern("src/build/output.js", "/build/"));
    }

    #[test]
    fn extension_pattern_matches_anywhere() {
        assert!(matches_pattern("foo.min.js", "*.min.js"));
        assert!(matches_pattern("src/bar.min.js", "*.min.js"));
        assert!(matches_pattern("a/b/c/baz.min.js", "*.min.js"));
        assert!(!matches_pattern("foo.js", "*.min.js"));
        assert!(!matches_pattern("foo.min.css", "*.min.js"));
    }

    #[test]
    fn exact_filename_matches_at_any_depth() {
        assert!(matches_pattern("package-lock.json", "package-lock.json"));
        assert!(matches_pattern("src/package-lock.json", "package-lock.json"));
    }

    #[test]
    fn anchored_file_matches_root_only() {
        assert!(matches_pattern("README.md", "/README.md"));
        assert!(!matches_pattern("docs/README.md", "/README.md"));
    }

    #[test]
    fn double_star_glob_crosses_directories() {
        assert!(matches_pattern("test/foo.snap", "**/test/*.snap"));
        assert!(matches_pattern("src/test/bar.snap", "**/test/*.snap"));
        assert!(matches_pattern("foo.test.js", "**/*.test.js"));
        assert!(matches_pattern("src/components/Button.test.js", "**/*.test.js"));
    }

    #[test]
    fn path_pattern_with_wildcard_is_anchored_to_folder() {
        assert!(matches_pattern(
            "tests/__snapshots__/foo.snap",
            "tests/__snapshots__/*.snap"
        ));
        assert!(!matches_pattern(
            "other/__snapshots__/foo.snap",
            "tests/__snapshots__/*.snap"
        ));
    }

    #[test]
    fn negation_is_acknowledged_but_never_matches() {
        assert!(!matches_pattern("important.log", "!important.log"));
    }

    #[test]
    fn empty_inputs_never_match() {
        assert!(!matches_pattern("foo.js", ""));
        assert!(!matches_pattern("", "*.js"));
    }

    #[test]
    fn hidden_files_and_directories_match() {
        assert!(matches_pattern(".gitignore", ".gitignore"));
        assert!(matches_pattern("src/.env", ".env"));
        assert!(matches_pattern(".git/config", ".git/"));
        assert!(matches_pattern("src/.cache/foo", ".cache/"));
        assert!(matches_pattern("folder/.DS_Store", ".DS_Store"));
    }

    // ── should_summarize ──────────────────────────────────────────────────────

    #[test]
    fn forge_metadata_is_never_summarized() {
        assert!(!should_summarize(".forge/session.json", &[]));
    }

    #[test]
    fn binary_extensions_are_skipped() {
        assert!(!should_summarize("logo.png", &[]));
        assert!(!should_summarize("data/config.json", &[]));
        assert!(should_summarize("src/main.rs", &[]));
    }

    #[test]
    fn exclusion_patterns_apply() {
        let patterns = vec!["vendor/".to_string()];
        assert!(!should_summarize("vendor/lib.rs", &patterns));
        assert!(should_summarize("src/lib.rs", &patterns));
    }

    #[test]
    fn extensionless_files_are_summarized() {
        assert!(should_summarize("Makefile", &[]));
        assert!(should_summarize("LICENSE", &[]));
    }

    // ── Summary extraction ────────────────────────────────────────────────────

    #[test]
    fn extracts_summary_tags() {
        let response = "Thinking about it...\n<summary>\n- fn main()\n</summary>";
        assert_eq!(extract_summary_section(response), "- fn main()");
    }

    #[test]
    fn extraction_spans_newlines() {
        let response = "<summary>- a\n- b\n- c</summary>";
        assert_eq!(extract_summary_section(response), "- a\n- b\n- c");
    }

    #[test]
    fn missing_tags_take_whole_response() {
        assert_eq!(extract_summary_section("  just text  "), "just text");
    }

    // ── Planning ──────────────────────────────────────────────────────────────

    #[test]
    fn plan_orders_breadth_first() {
        use crate::testutil::test_overlay;
        let (_dir, vfs) = test_overlay(&[
            ("deep/nested/file.rs", "z"),
            ("b.rs", "b"),
            ("a.rs", "a"),
            ("mid/file.rs", "m"),
        ]);
        let engine = engine_for_tests(100_000);
        let plan = engine.plan(&vfs).unwrap();
        let order: Vec<&str> = plan
            .within_budget
            .iter()
            .map(|e| e.filepath.as_str())
            .collect();
        assert_eq!(order, vec!["a.rs", "b.rs", "mid/file.rs", "deep/nested/file.rs"]);
    }

    #[test]
    fn plan_cuts_off_at_token_budget() {
        use crate::testutil::test_overlay;
        let (_dir, vfs) = test_overlay(&[("a.rs", "a"), ("b.rs", "b"), ("c.rs", "c")]);
        // Budget of 150 tokens fits one uncached estimate (100) but not two.
        let engine = engine_for_tests(150);
        let plan = engine.plan(&vfs).unwrap();
        assert_eq!(plan.within_budget.len(), 1);
        assert_eq!(plan.beyond_budget, vec!["b.rs", "c.rs"]);
        // Everything within budget and uncached needs generation.
        assert_eq!(plan.to_generate.len(), 1);
    }

    #[test]
    fn plan_skips_excluded_and_metadata_files() {
        use crate::testutil::test_overlay;
        let (_dir, vfs) = test_overlay(&[
            ("src/main.rs", "fn main() {}"),
            (".forge/session.json", "{}"),
            ("image.png", "not really an image"),
            (
                ".forge/config.json",
                "{\"summary_exclusions\": [\"generated/\"]}",
            ),
            ("generated/out.rs", "x"),
        ]);
        let engine = engine_for_tests(100_000);
        let plan = engine.plan(&vfs).unwrap();
        let files: Vec<&str> = plan
            .within_budget
            .iter()
            .map(|e| e.filepath.as_str())
            .collect();
        assert_eq!(files, vec!["src/main.rs"]);
    }

    #[test]
    fn committed_files_use_blob_oid_as_hash() {
        use crate::testutil::test_overlay;
        let (_dir, mut vfs) = test_overlay(&[("a.rs", "committed")]);
        vfs.write_file("pending.rs", "not committed");
        let engine = engine_for_tests(100_000);
        let plan = engine.plan(&vfs).unwrap();

        let committed = plan
            .within_budget
            .iter()
            .find(|e| e.filepath == "a.rs")
            .unwrap();
        let pending = plan
            .within_budget
            .iter()
            .find(|e| e.filepath == "pending.rs")
            .unwrap();
        // Blob oids are 40 hex chars; sha256 hashes are 64.
        assert_eq!(committed.content_hash.len(), 40);
        assert_eq!(pending.content_hash.len(), 64);
    }

    fn engine_for_tests(budget: usize) -> SummaryEngine {
        use std::sync::Arc;
        let dir = std::env::temp_dir().join("forge-summary-test-cache");
        let costs = Arc::new(forge_model::CostTracker::new(&dir));
        let log = Arc::new(forge_model::RequestLog::new(&dir));
        let client = LlmClient::new("", "test/model", "http://localhost:0", costs, log);
        // Fresh per-test cache dir so entries never leak across tests.
        let cache_dir = tempfile::tempdir().unwrap().keep();
        SummaryEngine::new(client, SummaryCache::new(cache_dir), 2, budget)
    }
}
