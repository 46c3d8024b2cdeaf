// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The prompt state machine.
//!
//! The prompt is an append-only stream of typed blocks with logical
//! deletions. Providers cache prompts by prefix, so the stream is arranged
//! to keep the mutable parts at the tail: when a file changes, its block
//! (and every live file block after it) relocates to the end of the stream
//! instead of being edited in place. Cache invalidation then only reaches
//! back to the first relocated block.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use forge_model::{ApiMessage, ContentPart, CostSnapshot, Role, ToolCallSpec, WireToolCall};

/// Replacement text for an ephemeral tool result after its single showing.
const EPHEMERAL_PLACEHOLDER: &str = "[ephemeral result shown previously]";

const COMPACTED_ARGS: &str = "{\"_compacted\": true}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    System,
    Summaries,
    FileContent,
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
}

/// One block in the prompt stream. Identity is positional and never reused;
/// deletion is a flag.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub content: String,
    pub deleted: bool,
    pub filepath: Option<String>,
    pub origin_tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCallSpec>,
    pub tool_call_id: Option<String>,
    pub user_id: Option<u64>,
    pub ephemeral: bool,
    /// Ephemeral result already rendered once.
    pub consumed: bool,
    /// Synthetic correction messages, excluded from the recap.
    pub system_nudge: bool,
}

impl Block {
    fn new(kind: BlockKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            deleted: false,
            filepath: None,
            origin_tool_call_id: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            user_id: None,
            ephemeral: false,
            consumed: false,
            system_nudge: false,
        }
    }
}

/// Token estimates per bucket. Deliberately coarse: `len(utf8) / 3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStats {
    pub system_tokens: usize,
    pub summaries_tokens: usize,
    pub files_tokens: usize,
    pub conversation_tokens: usize,
    pub file_count: usize,
}

impl ContextStats {
    pub fn total_tokens(&self) -> usize {
        self.system_tokens + self.summaries_tokens + self.files_tokens + self.conversation_tokens
    }
}

pub struct PromptManager {
    blocks: Vec<Block>,
    next_user_id: u64,
    user_id_map: BTreeMap<u64, String>,
}

fn estimate_tokens(text: &str) -> usize {
    text.len() / 3
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        let mut out: String = text.chars().take(limit).collect();
        out.push_str("...");
        out
    } else {
        text.to_string()
    }
}

fn format_file_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

impl PromptManager {
    /// The stream always begins with the system prompt.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let mut blocks = Vec::new();
        blocks.push(Block::new(BlockKind::System, system_prompt));
        Self {
            blocks,
            next_user_id: 1,
            user_id_map: BTreeMap::new(),
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    // ── Append surface ────────────────────────────────────────────────────────

    pub fn append_user_message(&mut self, content: impl Into<String>) {
        self.blocks.push(Block::new(BlockKind::UserMessage, content));
    }

    /// A correction injected by the runner (provider error bodies, pipeline
    /// failures). Carried like a user message but left out of the recap.
    pub fn append_system_nudge(&mut self, content: impl Into<String>) {
        let mut block = Block::new(BlockKind::UserMessage, content);
        block.system_nudge = true;
        self.blocks.push(block);
    }

    pub fn append_assistant_message(&mut self, content: impl Into<String>) {
        self.blocks
            .push(Block::new(BlockKind::AssistantMessage, content));
    }

    /// Record the assistant's tool calls, with any accompanying text.
    pub fn append_tool_call(&mut self, tool_calls: Vec<ToolCallSpec>, content: impl Into<String>) {
        let mut block = Block::new(BlockKind::ToolCall, content);
        block.tool_calls = tool_calls;
        self.blocks.push(block);
    }

    /// Record a tool result and assign it the next integer user id.
    /// The user id → tool_call_id mapping is bijective within the session.
    pub fn append_tool_result(
        &mut self,
        tool_call_id: &str,
        content: impl Into<String>,
        ephemeral: bool,
    ) -> anyhow::Result<u64> {
        if tool_call_id.is_empty() {
            anyhow::bail!("tool_call_id cannot be empty");
        }
        let user_id = self.next_user_id;
        self.next_user_id += 1;
        self.user_id_map.insert(user_id, tool_call_id.to_string());

        let mut block = Block::new(BlockKind::ToolResult, content);
        block.tool_call_id = Some(tool_call_id.to_string());
        block.user_id = Some(user_id);
        block.ephemeral = ephemeral;
        self.blocks.push(block);
        Ok(user_id)
    }

    /// Replace the repository summaries snapshot. At most one summaries
    /// block is live at a time.
    pub fn set_summaries(
        &mut self,
        summaries: &BTreeMap<String, String>,
        file_sizes: Option<&BTreeMap<String, usize>>,
        files_beyond_budget: &[String],
    ) {
        if summaries.is_empty() && files_beyond_budget.is_empty() {
            return;
        }

        if let Some(old) = self
            .blocks
            .iter_mut()
            .find(|b| b.kind == BlockKind::Summaries && !b.deleted)
        {
            old.deleted = true;
        }

        let size_of = |path: &str| file_sizes.and_then(|m| m.get(path).copied());
        let mut doc = String::from(
            "# Repository File Summaries (snapshot from session start)\n\n\
             *These summaries were generated when your session started and won't update. \
             When you work with a file, you'll see its actual current content below.*\n\n",
        );
        for (filepath, summary) in summaries {
            match size_of(filepath) {
                Some(size) => doc.push_str(&format!(
                    "## {filepath} ({})\n{summary}\n",
                    format_file_size(size)
                )),
                None => doc.push_str(&format!("## {filepath}\n{summary}\n")),
            }
        }
        if !files_beyond_budget.is_empty() {
            doc.push_str(
                "\n# Additional Files (use scout to investigate)\n\n\
                 *These files exceeded the summary token budget. \
                 Use the `scout` tool with a question to examine them.*\n\n",
            );
            for filepath in files_beyond_budget {
                match size_of(filepath) {
                    Some(size) => doc.push_str(&format!(
                        "- {filepath} ({})\n",
                        format_file_size(size)
                    )),
                    None => doc.push_str(&format!("- {filepath}\n")),
                }
            }
        }

        self.blocks.push(Block::new(BlockKind::Summaries, doc));
    }

    /// Add (or refresh) one file's content in the stream.
    ///
    /// When the file already has a live block, every live file block from
    /// that point to the end of the stream relocates to the tail (they were
    /// losing their cache position anyway), preserving relative order, with
    /// the target file appended last.
    pub fn append_file_content(
        &mut self,
        filepath: &str,
        content: &str,
        tool_call_id: Option<&str>,
    ) {
        let earliest = self.blocks.iter().position(|b| {
            b.kind == BlockKind::FileContent
                && !b.deleted
                && b.filepath.as_deref() == Some(filepath)
        });

        if let Some(start) = earliest {
            let mut relocated = Vec::new();
            for block in self.blocks[start..].iter_mut() {
                if block.kind == BlockKind::FileContent && !block.deleted {
                    block.deleted = true;
                    relocated.push((
                        block.filepath.clone(),
                        block.content.clone(),
                        block.origin_tool_call_id.clone(),
                    ));
                }
            }
            debug!(
                filepath,
                count = relocated.len(),
                "relocating file blocks for update"
            );
            for (path, text, origin) in relocated {
                if path.as_deref() == Some(filepath) {
                    continue;
                }
                let mut block = Block::new(BlockKind::FileContent, text);
                block.filepath = path;
                block.origin_tool_call_id = origin;
                self.blocks.push(block);
            }
        }

        let header = match tool_call_id {
            Some(id) => format!(
                "[CONTEXT: File contents for {filepath} after tool call {id}. \
                 This is purely informative - showing the result of the tool operation.]"
            ),
            None => format!(
                "[CONTEXT: File contents for {filepath}. \
                 This is purely informative context, not a question.]"
            ),
        };
        let mut block = Block::new(
            BlockKind::FileContent,
            format!("{header}\n\n```\n{content}\n```"),
        );
        block.filepath = Some(filepath.to_string());
        block.origin_tool_call_id = tool_call_id.map(str::to_string);
        self.blocks.push(block);
    }

    pub fn remove_file_content(&mut self, filepath: &str) {
        if let Some(block) = self.blocks.iter_mut().find(|b| {
            b.kind == BlockKind::FileContent
                && !b.deleted
                && b.filepath.as_deref() == Some(filepath)
        }) {
            block.deleted = true;
        }
    }

    /// Files currently in context (live file blocks, stream order).
    pub fn active_files(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|b| b.kind == BlockKind::FileContent && !b.deleted)
            .filter_map(|b| b.filepath.clone())
            .collect()
    }

    /// Last real user message, for commit-message context.
    pub fn last_user_message(&self) -> Option<&str> {
        self.blocks
            .iter()
            .rev()
            .find(|b| b.kind == BlockKind::UserMessage && !b.deleted && !b.system_nudge)
            .map(|b| b.content.as_str())
    }

    /// Drop all conversation blocks, keeping system, summaries and file
    /// content. Resets tool-id tracking.
    pub fn clear_conversation(&mut self) {
        self.blocks.retain(|b| {
            matches!(
                b.kind,
                BlockKind::System | BlockKind::Summaries | BlockKind::FileContent
            )
        });
        self.next_user_id = 1;
        self.user_id_map.clear();
    }

    // ── Tool-call filtering ───────────────────────────────────────────────────

    /// Trim unattempted calls from the most recent live tool-call block.
    ///
    /// When a sequential pipeline aborts on first failure, later calls have
    /// no results; the API requires every tool_use to have a matching
    /// tool_result, so those calls must go before the next request. A block
    /// left with no calls at all is tombstoned.
    pub fn filter_tool_calls(&mut self, executed: &HashSet<String>) {
        if let Some(block) = self
            .blocks
            .iter_mut()
            .rev()
            .find(|b| b.kind == BlockKind::ToolCall && !b.deleted)
        {
            let before = block.tool_calls.len();
            block.tool_calls.retain(|tc| executed.contains(&tc.id));
            let dropped = before - block.tool_calls.len();
            if dropped > 0 {
                debug!(dropped, "filtered unattempted tool calls");
            }
            if block.tool_calls.is_empty() {
                block.deleted = true;
            }
        }
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    /// Rewrite the closed range of blocks between two tool-result user ids.
    ///
    /// The first result in range becomes `[COMPACTED] summary`, later ones
    /// `[COMPACTED - see above]`; tool-call arguments in range become
    /// `{"_compacted": true}`; assistant text in range is truncated. Blocks
    /// outside the range are untouched. Returns the number of compacted
    /// tool results.
    pub fn compact_messages(
        &mut self,
        from_id: &str,
        to_id: &str,
        summary: &str,
    ) -> (usize, Option<String>) {
        let (Ok(from), Ok(to)) = (from_id.parse::<u64>(), to_id.parse::<u64>()) else {
            return (
                0,
                Some(format!(
                    "Invalid IDs: from_id={from_id}, to_id={to_id} (must be integers)"
                )),
            );
        };
        if from > to {
            return (0, Some(format!("from_id ({from}) must be <= to_id ({to})")));
        }

        let mut from_idx = None;
        let mut to_idx = None;
        for (i, block) in self.blocks.iter().enumerate() {
            if block.deleted || block.kind != BlockKind::ToolResult {
                continue;
            }
            match block.user_id {
                Some(id) if id == from => from_idx = Some(i),
                _ => {}
            }
            if block.user_id == Some(to) {
                to_idx = Some(i);
            }
        }
        let Some(from_idx) = from_idx else {
            return (0, Some(format!("from_id {from_id} not found")));
        };
        let Some(to_idx) = to_idx else {
            return (0, Some(format!("to_id {to_id} not found")));
        };

        let mut compacted = 0;
        let mut first_result = true;
        for block in self.blocks[from_idx..=to_idx].iter_mut() {
            if block.deleted {
                continue;
            }
            match block.kind {
                BlockKind::ToolResult => {
                    block.content = if first_result {
                        first_result = false;
                        format!("[COMPACTED] {summary}")
                    } else {
                        "[COMPACTED - see above]".to_string()
                    };
                    compacted += 1;
                }
                BlockKind::ToolCall => {
                    for tc in &mut block.tool_calls {
                        tc.arguments = COMPACTED_ARGS.to_string();
                    }
                    block.content = truncate_chars(&block.content, 100);
                }
                BlockKind::AssistantMessage => {
                    block.content = truncate_chars(&block.content, 100);
                }
                _ => {}
            }
        }
        debug!(from, to, compacted, "compacted tool-result range");
        (compacted, None)
    }

    /// Strip the scratchpad from a `think` call's arguments, keeping its
    /// conclusion (which lives in the result).
    pub fn compact_think_call(&mut self, tool_call_id: &str) -> bool {
        for block in &mut self.blocks {
            if block.deleted || block.kind != BlockKind::ToolCall {
                continue;
            }
            for tc in &mut block.tool_calls {
                if tc.id == tool_call_id && tc.name == "think" {
                    tc.arguments = COMPACTED_ARGS.to_string();
                    return true;
                }
            }
        }
        false
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    /// Conversation-only tokens (user/assistant/tool blocks).
    pub fn estimate_conversation_tokens(&self) -> usize {
        let mut total = 0;
        for block in self.blocks.iter().filter(|b| !b.deleted) {
            if matches!(
                block.kind,
                BlockKind::System | BlockKind::Summaries | BlockKind::FileContent
            ) {
                continue;
            }
            total += estimate_tokens(&block.content);
            if block.kind == BlockKind::ToolCall {
                for tc in &block.tool_calls {
                    total += estimate_tokens(
                        &serde_json::to_string(&WireToolCall::from(tc)).unwrap_or_default(),
                    );
                }
            }
        }
        total
    }

    pub fn context_stats(&self) -> ContextStats {
        let mut stats = ContextStats {
            system_tokens: 0,
            summaries_tokens: 0,
            files_tokens: 0,
            conversation_tokens: 0,
            file_count: 0,
        };
        for block in self.blocks.iter().filter(|b| !b.deleted) {
            let tokens = estimate_tokens(&block.content);
            match block.kind {
                BlockKind::System => stats.system_tokens += tokens,
                BlockKind::Summaries => stats.summaries_tokens += tokens,
                BlockKind::FileContent => {
                    stats.files_tokens += tokens;
                    stats.file_count += 1;
                }
                BlockKind::ToolCall => {
                    stats.conversation_tokens += tokens;
                    for tc in &block.tool_calls {
                        stats.conversation_tokens += estimate_tokens(
                            &serde_json::to_string(&WireToolCall::from(tc)).unwrap_or_default(),
                        );
                    }
                }
                _ => stats.conversation_tokens += tokens,
            }
        }
        stats
    }

    fn context_size_label(total_tokens: usize) -> &'static str {
        match total_tokens {
            0..=19_999 => "small",
            20_000..=34_999 => "moderate",
            35_000..=49_999 => "large",
            50_000..=79_999 => "very large",
            _ => "extremely large - compaction strongly recommended",
        }
    }

    // ── Recap and stats injection ─────────────────────────────────────────────

    fn summarize_tool_call(tc: &ToolCallSpec) -> String {
        let name = &tc.name;
        let Ok(args) = serde_json::from_str::<serde_json::Value>(&tc.arguments) else {
            return format!("{name}(...)");
        };
        if args["_compacted"].as_bool() == Some(true) {
            return format!("{name}([compacted])");
        }
        match name.as_str() {
            "edit" | "write_file" | "delete_file" => {
                format!("{name}({})", args["filepath"].as_str().unwrap_or("?"))
            }
            "update_context" => {
                let add = args["add"].as_array().map(Vec::len).unwrap_or(0);
                let remove = args["remove"].as_array().map(Vec::len).unwrap_or(0);
                let mut parts = Vec::new();
                if add > 0 {
                    parts.push(format!("+{add} files"));
                }
                if remove > 0 {
                    parts.push(format!("-{remove} files"));
                }
                if parts.is_empty() {
                    format!("{name}(no changes)")
                } else {
                    format!("{name}({})", parts.join(", "))
                }
            }
            "grep_open" => {
                let pattern = truncate_chars(args["pattern"].as_str().unwrap_or("?"), 27);
                format!("{name}('{pattern}')")
            }
            "think" => "think(...)".to_string(),
            "compact" => format!(
                "{name}(#{}-#{})",
                args["from_id"].as_str().unwrap_or("?"),
                args["to_id"].as_str().unwrap_or("?")
            ),
            "commit" => {
                let msg = truncate_chars(args["message"].as_str().unwrap_or(""), 37);
                format!("{name}('{msg}')")
            }
            _ => match args.as_object().and_then(|o| o.iter().next()) {
                Some((key, value)) => {
                    let value = match value.as_str() {
                        Some(s) => truncate_chars(s, 27),
                        None => value.to_string(),
                    };
                    format!("{name}({key}={value})")
                }
                None => format!("{name}()"),
            },
        }
    }

    /// Condensed restatement of recent conversation, injected at the tail.
    ///
    /// Covers the last `max_messages` blocks or everything since the last
    /// real user message, whichever includes more, so the current turn is
    /// always complete.
    pub fn format_conversation_recap(&self, max_messages: usize) -> String {
        let conv: Vec<&Block> = self
            .blocks
            .iter()
            .filter(|b| {
                !b.deleted
                    && matches!(
                        b.kind,
                        BlockKind::UserMessage
                            | BlockKind::AssistantMessage
                            | BlockKind::ToolCall
                            | BlockKind::ToolResult
                    )
            })
            .collect();

        let last_user = conv
            .iter()
            .rposition(|b| b.kind == BlockKind::UserMessage && !b.system_nudge)
            .unwrap_or(0);
        let start = last_user.min(conv.len().saturating_sub(max_messages));

        let mut out = String::from("## Conversation Recap\n");
        if start > 0 {
            out.push_str(&format!("*[{start} earlier messages omitted]*\n"));
        }
        for block in &conv[start..] {
            match block.kind {
                BlockKind::UserMessage => {
                    if block.system_nudge {
                        continue;
                    }
                    out.push_str(&format!("**User**: {}\n", block.content.trim()));
                }
                BlockKind::AssistantMessage => {
                    out.push_str(&format!(
                        "**Assistant**: {}\n",
                        truncate_chars(block.content.trim(), 197)
                    ));
                }
                BlockKind::ToolCall => {
                    if block.tool_calls.is_empty() {
                        continue;
                    }
                    if !block.content.trim().is_empty() {
                        out.push_str(&format!(
                            "**Assistant**: {}\n",
                            truncate_chars(block.content.trim(), 97)
                        ));
                    }
                    let summaries: Vec<String> = block
                        .tool_calls
                        .iter()
                        .map(Self::summarize_tool_call)
                        .collect();
                    out.push_str(&format!("  → Tool calls: {}\n", summaries.join(", ")));
                }
                BlockKind::ToolResult => {
                    let user_id = block
                        .user_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "?".into());
                    let status = if block.content.starts_with("[COMPACTED]") {
                        "[compacted]"
                    } else if block.content.contains("\"success\":false")
                        || block.content.contains("\"success\": false")
                        || block.content.contains("\"error\"")
                    {
                        "✗ (error)"
                    } else {
                        "✓"
                    };
                    out.push_str(&format!("  ← Result #{user_id}: {status}\n"));
                }
                _ => {}
            }
        }
        out
    }

    /// Context stats as a compact XML block for the tail of the prompt.
    pub fn format_context_stats_block(&self, costs: &CostSnapshot) -> String {
        let stats = self.context_stats();
        let recap_tokens = estimate_tokens(&self.format_conversation_recap(20));

        fn format_cost(cost: f64) -> String {
            if cost < 0.01 {
                format!("${cost:.4}")
            } else {
                format!("${cost:.2}")
            }
        }
        fn format_k(tokens: usize) -> String {
            format!("{:.1}k", tokens as f64 / 1000.0)
        }

        let mut cost_str = format_cost(costs.session);
        if costs.daily > costs.session {
            cost_str.push_str(&format!(" ({} today)", format_cost(costs.daily)));
        }

        let total = stats.total_tokens();
        format!(
            "<context_stats>\n  \
             <total_tokens>{} ({})</total_tokens>\n  \
             <breakdown>system {}, summaries {}, files {} ({} files), conversation {}</breakdown>\n  \
             <recap_tokens>{}</recap_tokens>\n  \
             <session_cost>{cost_str}</session_cost>\n\
             </context_stats>",
            format_k(total),
            Self::context_size_label(total),
            format_k(stats.system_tokens),
            format_k(stats.summaries_tokens),
            format_k(stats.files_tokens),
            stats.file_count,
            format_k(stats.conversation_tokens),
            format_k(recap_tokens),
        )
    }

    // ── Materialisation ───────────────────────────────────────────────────────

    /// Convert the block stream to API messages.
    ///
    /// The cache anchor (the marker that makes the prefix cacheable) goes on
    /// the last live block that is not a tool call. Consecutive user-role
    /// blocks coalesce into one message, since providers reject adjacent
    /// `user` messages. The recap and stats land as trailing parts with no
    /// cache marker, so they never invalidate cached conversation content.
    ///
    /// Ephemeral tool results render their real content exactly once; this
    /// call marks them consumed.
    pub fn to_messages(&mut self, costs: &CostSnapshot) -> Vec<ApiMessage> {
        let active: Vec<usize> = (0..self.blocks.len())
            .filter(|&i| !self.blocks[i].deleted)
            .collect();
        if active.is_empty() {
            return Vec::new();
        }

        let anchor = active
            .iter()
            .copied()
            .filter(|&i| self.blocks[i].kind != BlockKind::ToolCall)
            .last();

        let mut messages: Vec<ApiMessage> = Vec::new();
        let mut consumed_now: Vec<usize> = Vec::new();
        let mut pos = 0;
        while pos < active.len() {
            let i = active[pos];
            let is_anchor = Some(i) == anchor;
            let block = &self.blocks[i];
            match block.kind {
                BlockKind::System => {
                    messages.push(ApiMessage::with_parts(
                        Role::System,
                        vec![make_part(&block.content, is_anchor)],
                    ));
                    pos += 1;
                }
                BlockKind::Summaries | BlockKind::FileContent | BlockKind::UserMessage => {
                    let mut parts = Vec::new();
                    while pos < active.len() {
                        let j = active[pos];
                        let candidate = &self.blocks[j];
                        if !matches!(
                            candidate.kind,
                            BlockKind::Summaries | BlockKind::FileContent | BlockKind::UserMessage
                        ) {
                            break;
                        }
                        parts.push(make_part(&candidate.content, Some(j) == anchor));
                        pos += 1;
                    }
                    messages.push(ApiMessage::with_parts(Role::User, parts));
                }
                BlockKind::AssistantMessage => {
                    messages.push(ApiMessage::with_parts(
                        Role::Assistant,
                        vec![make_part(&block.content, is_anchor)],
                    ));
                    pos += 1;
                }
                BlockKind::ToolCall => {
                    let calls: Vec<WireToolCall> = block
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            // Think scratchpads never go back to the provider.
                            if tc.name == "think" {
                                WireToolCall::from(&ToolCallSpec {
                                    id: tc.id.clone(),
                                    name: tc.name.clone(),
                                    arguments: COMPACTED_ARGS.to_string(),
                                })
                            } else {
                                WireToolCall::from(tc)
                            }
                        })
                        .collect();
                    let content = if block.content.is_empty() {
                        None
                    } else {
                        Some(block.content.clone())
                    };
                    messages.push(ApiMessage::assistant_tool_calls(calls, content));
                    pos += 1;
                }
                BlockKind::ToolResult => {
                    let user_id = block
                        .user_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "?".into());
                    let body = if block.ephemeral && block.consumed {
                        EPHEMERAL_PLACEHOLDER.to_string()
                    } else {
                        if block.ephemeral {
                            consumed_now.push(i);
                        }
                        block.content.clone()
                    };
                    let content = format!("[tool_call_id: {user_id}]\n{body}");
                    messages.push(ApiMessage::tool_result(
                        block
                            .tool_call_id
                            .clone()
                            .expect("tool result block always carries its call id"),
                        vec![make_part(&content, is_anchor)],
                    ));
                    pos += 1;
                }
            }
        }

        for i in consumed_now {
            self.blocks[i].consumed = true;
        }

        // Trailing recap + stats: always at the very end, never cached.
        let recap = self.format_conversation_recap(20);
        let stats = self.format_context_stats_block(costs);
        let tail = [ContentPart::text(recap), ContentPart::text(stats)];
        match messages.last_mut() {
            Some(last) if last.role == Role::User => last.extend_parts(tail),
            _ => messages.push(ApiMessage::with_parts(Role::User, tail.to_vec())),
        }

        messages
    }
}

fn make_part(text: &str, cached: bool) -> ContentPart {
    if cached {
        ContentPart::text_with_cache(text)
    } else {
        ContentPart::text(text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
