// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The turn orchestrator.
//!
//! One turn: user input → prompt materialisation → streamed model output →
//! inline commands → sequential tool pipeline → reconciliation → repeat
//! until the model stops calling tools → one typed git commit.
//!
//! The coordinator runs on the async task that called
//! [`SessionRunner::send_message`]. Streaming arrives over a channel from
//! the transport worker; tool pipelines run on a blocking worker that
//! claims the overlay's thread ownership for their duration. Everything an
//! observer needs arrives as [`RunnerEvent`]s on the single event queue.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use forge_config::{Settings, SESSION_FILE};
use forge_git::{BaseVfs, CommitKind, CommitStore, OverlayVfs};
use forge_model::{
    CostTracker, LlmClient, RequestLog, ResponseEvent, StreamAccumulator, ToolCallSpec,
};
use forge_tools::{SideEffect, ToolContext, ToolRegistry, ToolResult};

use crate::events::{RunnerEvent, SessionState};
use crate::inline::{parse_inline_commands, InlineCommand};
use crate::prompt::PromptManager;
use crate::prompts::system_prompt;
use crate::session_store::{SessionRecord, SummaryCache};
use crate::summary::{load_exclusion_patterns, SummaryEngine};

/// How often a failed model call is fed back and retried within one turn
/// before the session gives up.
const MAX_TURN_RETRIES: u32 = 5;

/// Outcome of the `done` tool: `Some(question)` waits for input, `None`
/// completes the session.
type DoneOutcome = Option<String>;

pub struct SessionRunner {
    store: Arc<CommitStore>,
    branch: String,
    settings: Arc<Settings>,
    client: LlmClient,
    costs: Arc<CostTracker>,
    request_log: Arc<RequestLog>,
    registry: Arc<ToolRegistry>,
    summary_engine: SummaryEngine,
    prompt: PromptManager,
    /// Taken while a tool pipeline runs on the blocking worker.
    overlay: Option<OverlayVfs>,
    events: mpsc::Sender<RunnerEvent>,
    cancel: Arc<AtomicBool>,

    state: SessionState,
    /// Raw conversation mirror persisted into the session record.
    messages: Vec<Value>,
    active_files: BTreeSet<String>,
    summaries: BTreeMap<String, String>,

    // Per-turn bookkeeping.
    turn_executed_ids: HashSet<String>,
    queued_message: Option<String>,
    pending_file_updates: Vec<(String, Option<String>)>,
    newly_created_files: BTreeSet<String>,
    had_mid_turn_commit: bool,
    turn_done: Option<DoneOutcome>,

    // Child-session bookkeeping.
    parent_session: Option<String>,
    child_sessions: Vec<String>,
    yield_message: Option<String>,
}

impl SessionRunner {
    pub fn new(
        store: Arc<CommitStore>,
        branch: impl Into<String>,
        settings: Arc<Settings>,
        costs: Arc<CostTracker>,
        request_log: Arc<RequestLog>,
        cache_dir: PathBuf,
        events: mpsc::Sender<RunnerEvent>,
    ) -> anyhow::Result<Self> {
        let branch = branch.into();
        let overlay = OverlayVfs::new(Arc::clone(&store), &branch)?;

        let registry = Arc::new(ToolRegistry::with_builtins());
        registry.load_approvals(&overlay);

        let client = LlmClient::new(
            settings.api_key(),
            settings.model(),
            settings.base_url(),
            Arc::clone(&costs),
            Arc::clone(&request_log),
        );
        let summary_engine = SummaryEngine::new(
            client.for_model(settings.summarization_model()),
            SummaryCache::new(&cache_dir),
            settings.parallel_summarization(),
            settings.summary_token_budget(),
        );
        let prompt = PromptManager::new(system_prompt(&registry.inline_tools()));

        let mut runner = Self {
            store,
            branch,
            settings,
            client,
            costs,
            request_log,
            registry,
            summary_engine,
            prompt,
            overlay: Some(overlay),
            events,
            cancel: Arc::new(AtomicBool::new(false)),
            state: SessionState::Idle,
            messages: Vec::new(),
            active_files: BTreeSet::new(),
            summaries: BTreeMap::new(),
            turn_executed_ids: HashSet::new(),
            queued_message: None,
            pending_file_updates: Vec::new(),
            newly_created_files: BTreeSet::new(),
            had_mid_turn_commit: false,
            turn_done: None,
            parent_session: None,
            child_sessions: Vec::new(),
            yield_message: None,
        };
        runner.restore_session();
        Ok(runner)
    }

    /// Pick up where a previous process left off: active files, child
    /// links and the request log come back from the session record. The
    /// prompt stream starts fresh; summaries are regenerated on demand.
    fn restore_session(&mut self) {
        let Some(record) = SessionRecord::load(self.overlay()) else {
            return;
        };
        debug!(branch = %self.branch, "restoring session record");
        self.messages = record.messages;
        self.parent_session = record.parent_session;
        self.child_sessions = record.child_sessions;
        self.yield_message = record.yield_message;
        self.request_log.restore(record.request_log_entries);
        for filepath in record.active_files {
            self.add_active_file(&filepath);
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn active_files(&self) -> &BTreeSet<String> {
        &self.active_files
    }

    pub fn prompt(&self) -> &PromptManager {
        &self.prompt
    }

    fn overlay(&self) -> &OverlayVfs {
        self.overlay.as_ref().expect("overlay is only absent while a tool pipeline runs")
    }

    fn overlay_mut(&mut self) -> &mut OverlayVfs {
        self.overlay.as_mut().expect("overlay is only absent while a tool pipeline runs")
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            let _ = self.events.try_send(RunnerEvent::StateChanged(state));
        }
    }

    async fn emit(&self, event: RunnerEvent) {
        let _ = self.events.send(event).await;
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            api_key: self.settings.api_key(),
            cheap_model: self.settings.summarization_model(),
            base_url: self.settings.base_url(),
        }
    }

    // ── Context management ───────────────────────────────────────────────────

    pub fn add_active_file(&mut self, filepath: &str) {
        if !self.active_files.insert(filepath.to_string()) {
            return;
        }
        if let Ok(content) = self.overlay().read_file(filepath) {
            self.prompt.append_file_content(filepath, &content, None);
        }
        let _ = self.events.try_send(RunnerEvent::ContextChanged {
            active_files: self.active_files.iter().cloned().collect(),
        });
    }

    pub fn remove_active_file(&mut self, filepath: &str) {
        if !self.active_files.remove(filepath) {
            return;
        }
        self.prompt.remove_file_content(filepath);
        let _ = self.events.try_send(RunnerEvent::ContextChanged {
            active_files: self.active_files.iter().cloned().collect(),
        });
    }

    /// A tool changed this file: refresh its block at the stream tail (or
    /// drop it if the file is gone). Files the AI modifies join the active
    /// set so it sees its own changes.
    fn file_was_modified(&mut self, filepath: &str, tool_call_id: Option<&str>) {
        self.active_files.insert(filepath.to_string());
        match self.overlay().read_file(filepath) {
            Ok(content) => {
                self.prompt.append_file_content(filepath, &content, tool_call_id);
            }
            Err(_) => {
                self.prompt.remove_file_content(filepath);
                self.active_files.remove(filepath);
            }
        }
    }

    /// Make sure every active file has a live block and nothing else does.
    /// Updates to already-present files are handled by `file_was_modified`,
    /// which is what keeps the relocation cache-friendly.
    fn sync_prompt_files(&mut self) {
        let in_prompt: BTreeSet<String> = self.prompt.active_files().into_iter().collect();
        let wanted = self.active_files.clone();
        for filepath in wanted.difference(&in_prompt) {
            if let Ok(content) = self.overlay().read_file(filepath) {
                self.prompt.append_file_content(filepath, &content, None);
            }
        }
        for filepath in in_prompt.difference(&wanted) {
            self.prompt.remove_file_content(filepath);
        }
    }

    // ── Summaries ────────────────────────────────────────────────────────────

    /// Generate the repository summaries snapshot and publish it into the
    /// prompt. Also auto-loads repository instruction files.
    pub async fn generate_summaries(&mut self) -> anyhow::Result<()> {
        let plan = self.summary_engine.plan(self.overlay())?;
        let events = self.events.clone();
        let summaries = self
            .summary_engine
            .generate(&plan, |current, total, filepath| {
                let _ = events.try_send(RunnerEvent::SummaryProgress {
                    current,
                    total,
                    filepath: filepath.to_string(),
                });
            })
            .await;
        self.summaries = summaries;
        self.prompt
            .set_summaries(&self.summaries, Some(&plan.file_sizes), &plan.beyond_budget);
        self.emit(RunnerEvent::SummariesReady { count: self.summaries.len() })
            .await;

        for instructions in ["CLAUDE.md", "AGENTS.md"] {
            if self.overlay().file_exists(instructions) {
                self.add_active_file(instructions);
            }
        }
        Ok(())
    }

    async fn summarize_new_files(&mut self) {
        if self.newly_created_files.is_empty() {
            return;
        }
        let exclusions = load_exclusion_patterns(self.overlay());
        let files: Vec<String> = std::mem::take(&mut self.newly_created_files)
            .into_iter()
            .collect();
        let mut changed = false;
        for filepath in files {
            let Ok(content) = self.overlay().read_file(&filepath) else {
                continue;
            };
            match self
                .summary_engine
                .summarize_single_file(&content, &filepath, &exclusions)
                .await
            {
                Ok(Some(summary)) => {
                    self.summaries.insert(filepath, summary);
                    changed = true;
                }
                Ok(None) => {}
                Err(e) => warn!(filepath, error = %e, "summary for new file failed"),
            }
        }
        if changed {
            self.prompt.set_summaries(&self.summaries, None, &[]);
        }
    }

    // ── The turn ─────────────────────────────────────────────────────────────

    /// Send a user message. While a turn is running the message queues and
    /// joins the conversation after the current tool batch.
    pub async fn send_message(&mut self, text: &str) -> anyhow::Result<()> {
        match self.state {
            SessionState::Running => {
                self.queued_message = Some(text.to_string());
                return Ok(());
            }
            SessionState::Idle | SessionState::WaitingInput => {}
            other => anyhow::bail!("session is {}, cannot accept input", other.as_str()),
        }

        self.messages.push(json!({ "role": "user", "content": text }));
        self.prompt.append_user_message(text);
        self.turn_executed_ids.clear();
        self.turn_done = None;
        self.cancel.store(false, Ordering::Relaxed);
        self.set_state(SessionState::Running);

        match self.run_turn().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(SessionState::Error);
                self.emit(RunnerEvent::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Request cancellation. Workers observe the flag at chunk boundaries
    /// and between tool calls; the turn then unwinds without a commit.
    pub fn cancel(&self) {
        if self.state == SessionState::Running {
            self.cancel.store(true, Ordering::Relaxed);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Abandon the turn: pending overlay changes are discarded, incomplete
    /// trailing assistant output dropped, no commit is produced.
    async fn handle_cancel(&mut self) {
        debug!("turn cancelled");
        self.overlay_mut().clear_pending();
        let trailing_assistant = self
            .messages
            .last()
            .map(|m| m["role"] == "assistant")
            .unwrap_or(false);
        if trailing_assistant {
            self.messages.pop();
        }
        self.pending_file_updates.clear();
        self.newly_created_files.clear();
        self.set_state(SessionState::Idle);
        self.emit(RunnerEvent::Error("Cancelled by user".into())).await;
    }

    async fn run_turn(&mut self) -> anyhow::Result<()> {
        let mut retries = 0u32;
        loop {
            if self.cancelled() {
                self.handle_cancel().await;
                return Ok(());
            }
            self.sync_prompt_files();

            let api_messages = self.prompt.to_messages(&self.costs.snapshot());
            let tools = self.registry.api_schemas(self.overlay());

            let mut rx = match self.client.chat_stream(&api_messages, Some(&tools)).await {
                Ok(rx) => rx,
                Err(e) => {
                    retries += 1;
                    if retries > MAX_TURN_RETRIES {
                        anyhow::bail!("model call kept failing: {e}");
                    }
                    warn!(error = %e, retries, "model call failed, feeding error back");
                    self.prompt.append_system_nudge(format!(
                        "**Error from LLM provider:**\n\n```\n{e}\n```"
                    ));
                    continue;
                }
            };

            let mut acc = StreamAccumulator::new();
            let mut stream_error = None;
            while let Some(item) = rx.recv().await {
                if self.cancelled() {
                    self.handle_cancel().await;
                    return Ok(());
                }
                match item {
                    Ok(ResponseEvent::TextDelta(delta)) => {
                        self.emit(RunnerEvent::StreamChunk(delta.clone())).await;
                        acc.push(&ResponseEvent::TextDelta(delta));
                    }
                    Ok(event @ ResponseEvent::ToolCallDelta { .. }) => {
                        if let ResponseEvent::ToolCallDelta { index, id, name, arguments } = &event
                        {
                            self.emit(RunnerEvent::ToolCallDelta {
                                index: *index,
                                id: id.clone(),
                                name: name.clone(),
                                arguments: arguments.clone(),
                            })
                            .await;
                        }
                        acc.push(&event);
                    }
                    Ok(ResponseEvent::Done) => break,
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = stream_error {
                retries += 1;
                if retries > MAX_TURN_RETRIES {
                    anyhow::bail!("model stream kept failing: {e}");
                }
                warn!(error = %e, retries, "stream error, feeding response back");
                self.prompt.append_system_nudge(format!(
                    "**Error from LLM provider:**\n\n```\n{e}\n```"
                ));
                continue;
            }
            retries = 0;

            let (text, tool_calls) = acc.finish();

            // Inline commands run before API tool calls. A failure
            // truncates the assistant text at the failing command and loops
            // back with the error so the model can fix it.
            let inline_names: Vec<String> = self
                .registry
                .inline_tools()
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            let commands = parse_inline_commands(&text, &inline_names);
            if !commands.is_empty() && self.run_inline_pipeline(&text, commands).await? {
                continue;
            }

            if !tool_calls.is_empty() {
                self.prompt.append_tool_call(tool_calls.clone(), text.clone());
                self.messages.push(json!({
                    "role": "assistant",
                    "content": text,
                    "tool_calls": tool_calls
                        .iter()
                        .map(|tc| serde_json::to_value(forge_model::WireToolCall::from(tc)))
                        .collect::<Result<Vec<_>, _>>()?,
                }));

                self.run_tool_pipeline(tool_calls).await?;

                // Unattempted calls must go before the next request.
                self.prompt.filter_tool_calls(&self.turn_executed_ids);

                // Deferred so tool-use/tool-result adjacency stays intact.
                let updates = std::mem::take(&mut self.pending_file_updates);
                for (filepath, tool_call_id) in updates {
                    self.file_was_modified(&filepath, tool_call_id.as_deref());
                }

                if let Some(queued) = self.queued_message.take() {
                    self.messages.push(json!({ "role": "user", "content": queued.clone() }));
                    self.prompt.append_user_message(queued);
                }

                if self.cancelled() {
                    self.handle_cancel().await;
                    return Ok(());
                }
                if let Some(done) = self.turn_done.take() {
                    return self.finish_turn(Some(done)).await;
                }
                continue;
            }

            // No tool calls: the turn ends here.
            if !text.is_empty() {
                self.prompt.append_assistant_message(&text);
                self.messages.push(json!({ "role": "assistant", "content": text }));
            }
            let done = self.turn_done.take();
            return self.finish_turn(done).await;
        }
    }

    /// Post-turn bookkeeping: new-file summaries, the end-of-turn commit,
    /// and the state transition (`done` outcomes override Idle).
    async fn finish_turn(&mut self, done: Option<DoneOutcome>) -> anyhow::Result<()> {
        self.summarize_new_files().await;

        let next_state = match &done {
            Some(Some(question)) => {
                self.yield_message = Some(question.clone());
                SessionState::WaitingInput
            }
            Some(None) => SessionState::Completed,
            // A turn that produced or edited user tools rests blocked until
            // the user resolves the approvals.
            None if !self.unapproved_tools().is_empty() => SessionState::WaitingApproval,
            None => SessionState::Idle,
        };
        // The record carries the state the session will rest in.
        self.state = next_state;

        let commit = self.commit_turn().await?;
        self.emit(RunnerEvent::StateChanged(next_state)).await;
        self.emit(RunnerEvent::TurnFinished { commit }).await;
        Ok(())
    }

    // ── Tool pipelines ───────────────────────────────────────────────────────

    /// Run API tool calls sequentially on the blocking worker, stopping at
    /// the first failure. Results are recorded in execution order; calls
    /// after a failure are never attempted (and get filtered later).
    async fn run_tool_pipeline(&mut self, calls: Vec<ToolCallSpec>) -> anyhow::Result<()> {
        let mut overlay = self.overlay.take().expect("overlay present");
        let registry = Arc::clone(&self.registry);
        let ctx = self.tool_context();
        let events = self.events.clone();
        let cancel = Arc::clone(&self.cancel);

        let (overlay, outcomes) = tokio::task::spawn_blocking(move || {
            overlay.claim_thread();
            let mut outcomes: Vec<(ToolCallSpec, ToolResult)> = Vec::new();
            for call in calls {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                let result = match parse_tool_args(&call.arguments) {
                    Ok(args) => {
                        let _ = events.blocking_send(RunnerEvent::ToolStarted {
                            name: call.name.clone(),
                            args: args.clone(),
                        });
                        registry.execute(&mut overlay, &ctx, &call.name, &args)
                    }
                    Err(e) => ToolResult::failure(format!("invalid tool arguments: {e}")),
                };
                let _ = events.blocking_send(RunnerEvent::ToolFinished {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    success: result.success,
                    message: result.message.clone(),
                });
                let failed = !result.success;
                outcomes.push((call, result));
                if failed {
                    break;
                }
            }
            overlay.release_thread();
            (overlay, outcomes)
        })
        .await
        .expect("tool pipeline worker panicked");
        self.overlay = Some(overlay);

        for (call, result) in outcomes {
            self.turn_executed_ids.insert(call.id.clone());
            let payload = serde_json::to_string(&result)?;
            let ephemeral = result.has_side_effect(SideEffect::EphemeralResult);
            self.prompt.append_tool_result(&call.id, &payload, ephemeral)?;
            self.messages.push(json!({
                "role": "tool",
                "tool_call_id": call.id.clone(),
                "content": payload,
            }));
            self.apply_result_effects(Some(&call.id), &result).await;
        }
        Ok(())
    }

    /// Run inline commands. Returns `true` when the caller should loop back
    /// to the model (a command failed); on success the turn proceeds as if
    /// the text carried no commands.
    async fn run_inline_pipeline(
        &mut self,
        text: &str,
        commands: Vec<InlineCommand>,
    ) -> anyhow::Result<bool> {
        let mut overlay = self.overlay.take().expect("overlay present");
        let registry = Arc::clone(&self.registry);
        let ctx = self.tool_context();
        let events = self.events.clone();
        let cancel = Arc::clone(&self.cancel);

        let (overlay, outcomes) = tokio::task::spawn_blocking(move || {
            overlay.claim_thread();
            let mut outcomes: Vec<(InlineCommand, ToolResult)> = Vec::new();
            for command in commands {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                let _ = events.blocking_send(RunnerEvent::ToolStarted {
                    name: command.tool_name.clone(),
                    args: command.args.clone(),
                });
                let result =
                    registry.execute(&mut overlay, &ctx, &command.tool_name, &command.args);
                let _ = events.blocking_send(RunnerEvent::ToolFinished {
                    tool_call_id: String::new(),
                    name: command.tool_name.clone(),
                    success: result.success,
                    message: result.message.clone(),
                });
                let failed = !result.success;
                outcomes.push((command, result));
                if failed {
                    break;
                }
            }
            overlay.release_thread();
            (overlay, outcomes)
        })
        .await
        .expect("inline pipeline worker panicked");
        self.overlay = Some(overlay);

        let failed = outcomes.last().map(|(_, r)| !r.success).unwrap_or(false);

        if failed {
            let (failed_command, failed_result) = outcomes.last().expect("non-empty");
            // Keep what the model said up to the failing command; the rest
            // was predicated on the command succeeding.
            let truncated = text[..failed_command.end_pos].to_string();
            self.prompt.append_assistant_message(&truncated);
            self.messages
                .push(json!({ "role": "assistant", "content": truncated }));

            for (_, result) in &outcomes[..outcomes.len() - 1] {
                self.apply_result_effects(None, result).await;
            }

            let error = failed_result
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".into());
            let feedback = format!("❌ `{}` failed:\n\n{error}", failed_command.tool_name);
            self.messages.push(json!({ "role": "user", "content": feedback.clone() }));
            self.prompt.append_user_message(feedback);
            return Ok(true);
        }

        let mut lines = Vec::new();
        for (command, result) in &outcomes {
            self.apply_result_effects(None, result).await;
            let note = match command.tool_name.as_str() {
                "run_tests" => result.extra["summary"]
                    .as_str()
                    .unwrap_or("✓ Tests passed")
                    .to_string(),
                "commit" => format!(
                    "✓ commit: {}",
                    result.extra["commit"].as_str().unwrap_or_default()
                ),
                name => format!("✓ {name}"),
            };
            lines.push(note);
        }
        let feedback = format!("Commands executed:\n{}", lines.join("\n"));
        self.messages.push(json!({ "role": "user", "content": feedback.clone() }));
        self.prompt.append_user_message(feedback);
        Ok(false)
    }

    /// Act on a tool result's declared side effects and runner-level
    /// payloads (compaction ranges, context updates, session completion).
    async fn apply_result_effects(&mut self, tool_call_id: Option<&str>, result: &ToolResult) {
        if result.has_side_effect(SideEffect::FilesModified) {
            for filepath in &result.modified_files {
                self.pending_file_updates
                    .push((filepath.clone(), tool_call_id.map(str::to_string)));
            }
        }
        if result.has_side_effect(SideEffect::NewFilesCreated) {
            for filepath in &result.new_files {
                if !self.summaries.contains_key(filepath) {
                    self.newly_created_files.insert(filepath.clone());
                }
            }
        }
        if result.has_side_effect(SideEffect::MidTurnCommit) {
            self.had_mid_turn_commit = true;
            let commit = result.extra["commit"].as_str().unwrap_or_default().to_string();
            self.emit(RunnerEvent::MidTurnCommit { commit }).await;
        }

        if result.success && result.extra["compact"].as_bool() == Some(true) {
            let from = result.extra["from_id"].as_str().unwrap_or_default();
            let to = result.extra["to_id"].as_str().unwrap_or_default();
            let summary = result.extra["summary"].as_str().unwrap_or_default();
            let (count, error) = self.prompt.compact_messages(from, to, summary);
            match error {
                None => debug!(count, "compacted tool results"),
                Some(e) => warn!(error = %e, "compaction request failed"),
            }
        }

        if result.success && result.extra["action"] == json!("update_context") {
            let add: Vec<String> = string_list(&result.extra["add"]);
            let remove: Vec<String> = string_list(&result.extra["remove"]);
            for filepath in add {
                self.add_active_file(&filepath);
            }
            for filepath in remove {
                self.remove_active_file(&filepath);
            }
        }

        if result.success && result.extra["done"].as_bool() == Some(true) {
            let question = result.extra["question"].as_str().map(str::to_string);
            self.yield_message = question
                .clone()
                .or_else(|| result.message.clone());
            self.turn_done = Some(question);
        }

        if !result.success
            && result
                .error
                .as_deref()
                .map(|e| e.contains("is not approved"))
                .unwrap_or(false)
        {
            let tools = self
                .registry
                .unapproved_tools(self.overlay())
                .into_iter()
                .map(|t| t.name)
                .collect();
            self.emit(RunnerEvent::ApprovalNeeded { tools }).await;
        }
    }

    // ── Committing ───────────────────────────────────────────────────────────

    /// Write the session record and land the turn as one typed commit.
    async fn commit_turn(&mut self) -> anyhow::Result<String> {
        let record = SessionRecord {
            messages: self.messages.clone(),
            active_files: self.active_files.iter().cloned().collect(),
            request_log_entries: self.request_log.entries(),
            parent_session: self.parent_session.clone(),
            child_sessions: self.child_sessions.clone(),
            state: self.state.as_str().to_string(),
            yield_message: self.yield_message.clone(),
        };
        record.write_to(self.overlay_mut());

        let pending = self.overlay().pending_changes();
        let deleted = self.overlay().deleted_files();
        let only_session =
            pending.len() == 1 && pending.contains_key(SESSION_FILE) && deleted.is_empty();
        let kind = classify_commit(only_session, self.had_mid_turn_commit);

        let message = if only_session {
            "conversation turn".to_string()
        } else {
            let changed: Vec<String> = pending
                .keys()
                .filter(|p| p.as_str() != SESSION_FILE)
                .cloned()
                .chain(deleted.iter().cloned())
                .collect();
            self.generate_commit_message(&changed).await
        };

        let oid = self.overlay_mut().commit(&message, kind)?;
        self.had_mid_turn_commit = false;
        debug!(commit = %oid, kind = ?kind, "turn committed");
        Ok(oid.to_string())
    }

    /// Ask the cheap model for a commit message; fall back to a plain
    /// summary when the call fails (message generation must never fail the
    /// turn).
    async fn generate_commit_message(&self, changed_files: &[String]) -> String {
        if self.settings.api_key().is_empty() {
            return format!("update {} file(s)", changed_files.len());
        }
        let file_list: String = changed_files
            .iter()
            .map(|f| format!("- {f}\n"))
            .collect();
        let user_context = match self.prompt.last_user_message() {
            Some(msg) => format!("\nUser's request:\n{msg}\n"),
            None => String::new(),
        };
        let prompt = format!(
            "Generate a concise git commit message for these changes.\n\
             {user_context}\n\
             Files changed:\n{file_list}\n\
             Respond with ONLY the commit message, no explanation. Use \
             conventional commit format (e.g., \"feat:\", \"fix:\", \
             \"refactor:\").\nKeep it under 72 characters."
        );
        let cheap = self.client.for_model(self.settings.summarization_model());
        match cheap
            .chat_text(&[forge_model::ApiMessage::text(forge_model::Role::User, prompt)])
            .await
        {
            Ok(message) if !message.trim().is_empty() => {
                message.trim().trim_matches(['"', '\'']).to_string()
            }
            Ok(_) | Err(_) => {
                warn!("commit message generation failed, using fallback");
                format!("update {} file(s)", changed_files.len())
            }
        }
    }

    // ── Approvals ────────────────────────────────────────────────────────────

    /// Names of user tools whose current source is not approved.
    pub fn unapproved_tools(&self) -> Vec<String> {
        self.registry
            .unapproved_tools(self.overlay())
            .into_iter()
            .map(|t| t.name)
            .collect()
    }

    /// Approve tools and record the approval as a follow-up commit so it
    /// travels with the tool edit.
    pub fn approve_tools(&mut self, names: &[String]) -> anyhow::Result<Option<String>> {
        let overlay = self.overlay.as_mut().expect("overlay present");
        for name in names {
            self.registry.approve(overlay, name)?;
        }
        let oid = self.registry.commit_pending_approvals(overlay)?;
        self.leave_waiting_approval();
        Ok(oid.map(|oid| oid.to_string()))
    }

    /// Rejecting resolves the approval question too: the tool stays
    /// blocked, but the session is no longer waiting on the user.
    pub fn reject_tool(&mut self, name: &str) {
        self.registry.reject(name);
        if self.state == SessionState::WaitingApproval {
            self.set_state(SessionState::Idle);
        }
    }

    fn leave_waiting_approval(&mut self) {
        if self.state == SessionState::WaitingApproval && self.unapproved_tools().is_empty() {
            self.set_state(SessionState::Idle);
        }
    }

    // ── Child sessions ───────────────────────────────────────────────────────

    /// Fork a child session branch at the current head with an initial
    /// session record.
    pub fn spawn(&mut self, branch_name: &str) -> anyhow::Result<()> {
        let head = self.store.branch_head(&self.branch)?;
        self.store.create_branch(branch_name, head)?;

        let mut child = OverlayVfs::new(Arc::clone(&self.store), branch_name)?;
        let record = SessionRecord {
            parent_session: Some(self.branch.clone()),
            state: SessionState::Idle.as_str().to_string(),
            ..Default::default()
        };
        record.write_to(&mut child);
        child.commit("session start", CommitKind::Prepare)?;

        if !self.child_sessions.contains(&branch_name.to_string()) {
            self.child_sessions.push(branch_name.to_string());
        }
        Ok(())
    }

    /// Wait for child sessions. Returns `true` immediately when any child
    /// is already completed or waiting for input; otherwise the session
    /// commits its state and suspends in `WaitingChildren`.
    pub async fn wait_for_children(&mut self, branches: &[String]) -> anyhow::Result<bool> {
        for branch in branches {
            if let Some(state) = self.child_state(branch)? {
                if matches!(state, SessionState::Completed | SessionState::WaitingInput) {
                    return Ok(true);
                }
            }
        }
        self.state = SessionState::WaitingChildren;
        self.commit_turn().await?;
        self.emit(RunnerEvent::StateChanged(SessionState::WaitingChildren)).await;
        Ok(false)
    }

    fn child_state(&self, branch: &str) -> anyhow::Result<Option<SessionState>> {
        let base = BaseVfs::for_branch(Arc::clone(&self.store), branch)?;
        let Ok(text) = base.read_file(SESSION_FILE) else {
            return Ok(None);
        };
        let record: SessionRecord = serde_json::from_str(&text)?;
        Ok(SessionState::parse(&record.state))
    }

    /// Append a user message into a child's session record (the child picks
    /// it up when it resumes).
    pub fn resume_child(&self, branch: &str, message: &str) -> anyhow::Result<()> {
        let mut child = OverlayVfs::new(Arc::clone(&self.store), branch)?;
        let mut record = SessionRecord::load(&child).unwrap_or_default();
        record
            .messages
            .push(json!({ "role": "user", "content": message }));
        record.state = SessionState::Idle.as_str().to_string();
        record.write_to(&mut child);
        child.commit("resume with user message", CommitKind::Prepare)?;
        Ok(())
    }

    /// Merge a child branch into this session's branch. The session file is
    /// excluded from the merged tree; conflicts refuse the merge.
    pub fn merge_child(&mut self, branch: &str) -> anyhow::Result<String> {
        let source = self.store.branch_head(branch)?;
        let oid = self.store.merge_commit_into_branch(source, &self.branch)?;
        self.overlay_mut().rebase()?;
        Ok(oid.to_string())
    }
}

/// Commit-type classification for the end-of-turn commit.
///
/// A turn that only touched the session file is bookkeeping: it prepares
/// the next real commit, unless a mid-turn commit already happened, in
/// which case it belongs to that commit as a follow-up.
fn classify_commit(only_session_changed: bool, had_mid_turn_commit: bool) -> CommitKind {
    if only_session_changed && had_mid_turn_commit {
        CommitKind::FollowUp
    } else if only_session_changed {
        CommitKind::Prepare
    } else {
        CommitKind::Major
    }
}

/// Parse tool-call arguments, correcting the common model mistake of
/// double-encoding nested JSON as a string value.
fn parse_tool_args(arguments: &str) -> Result<Value, serde_json::Error> {
    let mut value: Value = if arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(arguments)?
    };
    if let Value::Object(map) = &mut value {
        for (_, v) in map.iter_mut() {
            if let Value::String(s) = v {
                let trimmed = s.trim_start();
                if trimmed.starts_with('[') || trimmed.starts_with('{') {
                    if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                        *v = parsed;
                    }
                }
            }
        }
    }
    Ok(value)
}

fn string_list(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_store;

    fn test_runner(files: &[(&str, &str)]) -> (tempfile::TempDir, SessionRunner, mpsc::Receiver<RunnerEvent>) {
        let (dir, store) = test_store(files);
        let cache = dir.path().join("cache");
        let (tx, rx) = mpsc::channel(256);
        let runner = SessionRunner::new(
            store,
            "main",
            Arc::new(Settings::in_memory()),
            Arc::new(CostTracker::new(&cache)),
            Arc::new(RequestLog::new(&cache)),
            cache,
            tx,
        )
        .unwrap();
        (dir, runner, rx)
    }

    // ── Argument parsing ──────────────────────────────────────────────────────

    #[test]
    fn parse_args_accepts_plain_object() {
        let v = parse_tool_args(r#"{"filepath": "a.rs"}"#).unwrap();
        assert_eq!(v["filepath"], json!("a.rs"));
    }

    #[test]
    fn parse_args_fixes_double_encoded_values() {
        let v = parse_tool_args(r#"{"files": "[\"a.rs\", \"b.rs\"]"}"#).unwrap();
        assert_eq!(v["files"], json!(["a.rs", "b.rs"]));
    }

    #[test]
    fn parse_args_leaves_non_json_strings_alone() {
        let v = parse_tool_args(r#"{"search": "[not json"}"#).unwrap();
        assert_eq!(v["search"], json!("[not json"));
    }

    #[test]
    fn parse_args_empty_is_empty_object() {
        assert_eq!(parse_tool_args("").unwrap(), json!({}));
    }

    #[test]
    fn parse_args_rejects_garbage() {
        assert!(parse_tool_args("definitely not json").is_err());
    }

    // ── Commit classification ─────────────────────────────────────────────────

    #[test]
    fn session_only_turn_is_prepare() {
        assert_eq!(classify_commit(true, false), CommitKind::Prepare);
    }

    #[test]
    fn session_only_after_mid_turn_commit_is_follow_up() {
        assert_eq!(classify_commit(true, true), CommitKind::FollowUp);
    }

    #[test]
    fn real_changes_are_major() {
        assert_eq!(classify_commit(false, false), CommitKind::Major);
        assert_eq!(classify_commit(false, true), CommitKind::Major);
    }

    // ── Context management ────────────────────────────────────────────────────

    #[test]
    fn add_and_remove_active_file_update_prompt() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "fn a() {}")]);
        runner.add_active_file("a.rs");
        assert_eq!(runner.prompt().active_files(), vec!["a.rs"]);
        runner.remove_active_file("a.rs");
        assert!(runner.prompt().active_files().is_empty());
    }

    #[test]
    fn adding_missing_file_tracks_it_without_content() {
        let (_dir, mut runner, _rx) = test_runner(&[]);
        runner.add_active_file("ghost.rs");
        assert!(runner.active_files().contains("ghost.rs"));
        assert!(runner.prompt().active_files().is_empty());
    }

    #[test]
    fn file_was_modified_refreshes_and_removes() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "v1"), ("b.rs", "x")]);
        runner.add_active_file("a.rs");
        runner.overlay_mut().write_file("a.rs", "v2");
        runner.file_was_modified("a.rs", Some("call_1"));
        let blocks = runner.prompt().active_files();
        assert_eq!(blocks, vec!["a.rs"]);

        // Deleting the file drops it from prompt and active set.
        runner.overlay_mut().delete_file("a.rs").unwrap();
        runner.file_was_modified("a.rs", None);
        assert!(runner.prompt().active_files().is_empty());
        assert!(!runner.active_files().contains("a.rs"));
    }

    // ── Turn commit ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn session_only_commit_is_prepare_with_fixed_message() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        let commit = runner.commit_turn().await.unwrap();
        let oid = git2::Oid::from_str(&commit).unwrap();
        let message = runner.store.commit_message(oid).unwrap();
        assert_eq!(message, "[prepare] conversation turn");
        // The session record landed in the commit.
        assert!(runner.store.read_blob(oid, SESSION_FILE).is_ok());
    }

    #[tokio::test]
    async fn consecutive_session_only_turns_collapse() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        let first = runner.commit_turn().await.unwrap();
        runner.messages.push(json!({"role": "user", "content": "more"}));
        let second = runner.commit_turn().await.unwrap();
        assert_ne!(first, second);
        // Both prepares collapsed into one commit on top of the root.
        let oid = git2::Oid::from_str(&second).unwrap();
        let parents = runner.store.commit_parent_ids(oid).unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(
            runner.store.commit_message(parents[0]).unwrap(),
            "initial"
        );
    }

    #[tokio::test]
    async fn mid_turn_commit_flag_produces_follow_up() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        // A mid-turn commit happened (simulated), then only the session
        // record changed.
        runner.overlay_mut().write_file("work.rs", "fn w() {}");
        runner.overlay_mut().commit("feat: work", CommitKind::Major).unwrap();
        runner.had_mid_turn_commit = true;

        let commit = runner.commit_turn().await.unwrap();
        let oid = git2::Oid::from_str(&commit).unwrap();
        // Follow-up amended the major commit: message preserved.
        assert_eq!(runner.store.commit_message(oid).unwrap(), "feat: work");
        assert!(runner.store.read_blob(oid, SESSION_FILE).is_ok());
        assert!(!runner.had_mid_turn_commit);
    }

    // ── Side effects ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn done_result_sets_turn_outcome() {
        let (_dir, mut runner, _rx) = test_runner(&[]);
        let result = ToolResult::ok_with_message("all done")
            .with_extra("done", json!(true))
            .with_extra("question", json!("merge it?"));
        runner.apply_result_effects(Some("id1"), &result).await;
        assert_eq!(runner.turn_done, Some(Some("merge it?".to_string())));
        assert_eq!(runner.yield_message.as_deref(), Some("merge it?"));
    }

    #[tokio::test]
    async fn update_context_result_changes_active_files() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x"), ("b.rs", "y")]);
        runner.add_active_file("b.rs");
        let result = ToolResult::ok()
            .with_extra("action", json!("update_context"))
            .with_extra("add", json!(["a.rs"]))
            .with_extra("remove", json!(["b.rs"]));
        runner.apply_result_effects(Some("id"), &result).await;
        assert!(runner.active_files().contains("a.rs"));
        assert!(!runner.active_files().contains("b.rs"));
    }

    #[tokio::test]
    async fn files_modified_results_are_deferred() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        let result = ToolResult::ok().with_modified_files(vec!["a.rs".into()]);
        runner.apply_result_effects(Some("call_9"), &result).await;
        assert_eq!(
            runner.pending_file_updates,
            vec![("a.rs".to_string(), Some("call_9".to_string()))]
        );
        // Nothing in the prompt yet: reconciliation is deferred.
        assert!(runner.prompt().active_files().is_empty());
    }

    #[tokio::test]
    async fn compact_result_rewrites_prompt_range() {
        let (_dir, mut runner, _rx) = test_runner(&[]);
        runner.prompt.append_tool_call(
            vec![ToolCallSpec { id: "a".into(), name: "t".into(), arguments: "{}".into() }],
            "",
        );
        runner.prompt.append_tool_result("a", "big old result", false).unwrap();

        let result = ToolResult::ok()
            .with_extra("compact", json!(true))
            .with_extra("from_id", json!("1"))
            .with_extra("to_id", json!("1"))
            .with_extra("summary", json!("old work"));
        runner.apply_result_effects(Some("c"), &result).await;

        let compacted = runner
            .prompt()
            .blocks()
            .iter()
            .find(|b| b.kind == crate::prompt::BlockKind::ToolResult)
            .unwrap();
        assert_eq!(compacted.content, "[COMPACTED] old work");
    }

    // ── Child sessions ────────────────────────────────────────────────────────

    #[test]
    fn spawn_creates_branch_with_session_record() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        runner.spawn("forge/session/child").unwrap();

        assert!(runner.store.branch_exists("forge/session/child"));
        assert!(runner.child_sessions.contains(&"forge/session/child".to_string()));

        let head = runner.store.branch_head("forge/session/child").unwrap();
        let record: SessionRecord = serde_json::from_slice(
            &runner.store.read_blob(head, SESSION_FILE).unwrap(),
        )
        .unwrap();
        assert_eq!(record.parent_session.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn wait_returns_immediately_for_ready_child() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        runner.spawn("forge/session/kid").unwrap();
        // Mark the child completed.
        let mut child = OverlayVfs::new(Arc::clone(&runner.store), "forge/session/kid").unwrap();
        let mut record = SessionRecord::load(&child).unwrap();
        record.state = "completed".into();
        record.write_to(&mut child);
        child.commit("child done", CommitKind::Prepare).unwrap();

        let ready = runner
            .wait_for_children(&["forge/session/kid".to_string()])
            .await
            .unwrap();
        assert!(ready);
        assert_ne!(runner.state(), SessionState::WaitingChildren);
    }

    #[tokio::test]
    async fn wait_suspends_when_no_child_is_ready() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        runner.spawn("forge/session/kid").unwrap();
        let ready = runner
            .wait_for_children(&["forge/session/kid".to_string()])
            .await
            .unwrap();
        assert!(!ready);
        assert_eq!(runner.state(), SessionState::WaitingChildren);
        // The suspension was committed with the state recorded.
        let head = runner.store.branch_head("main").unwrap();
        let record: SessionRecord = serde_json::from_slice(
            &runner.store.read_blob(head, SESSION_FILE).unwrap(),
        )
        .unwrap();
        assert_eq!(record.state, "waiting_children");
    }

    #[test]
    fn resume_child_appends_user_message() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        runner.spawn("forge/session/kid").unwrap();
        runner
            .resume_child("forge/session/kid", "please continue")
            .unwrap();

        let head = runner.store.branch_head("forge/session/kid").unwrap();
        let record: SessionRecord = serde_json::from_slice(
            &runner.store.read_blob(head, SESSION_FILE).unwrap(),
        )
        .unwrap();
        assert_eq!(record.messages.last().unwrap()["content"], json!("please continue"));
        assert_eq!(record.state, "idle");
    }

    #[tokio::test]
    async fn merge_child_lands_two_parent_commit() {
        let (_dir, mut runner, _rx) = test_runner(&[("shared.rs", "base")]);
        runner.spawn("forge/session/kid").unwrap();

        // The child does some work.
        let mut child = OverlayVfs::new(Arc::clone(&runner.store), "forge/session/kid").unwrap();
        child.write_file("child.rs", "fn c() {}");
        child.commit("child work", CommitKind::Major).unwrap();

        let merge = runner.merge_child("forge/session/kid").unwrap();
        let oid = git2::Oid::from_str(&merge).unwrap();
        assert_eq!(runner.store.commit_parent_ids(oid).unwrap().len(), 2);
        assert!(runner.store.read_blob(oid, "child.rs").is_ok());
        // The overlay rebased onto the merge.
        assert_eq!(runner.overlay().base().commit_oid(), oid);
    }

    // ── Session restore ───────────────────────────────────────────────────────

    #[test]
    fn restore_brings_back_active_files_and_children() {
        let (dir, store) = test_store(&[("a.rs", "fn a() {}")]);
        // Seed a session record on the branch.
        let mut vfs = OverlayVfs::new(Arc::clone(&store), "main").unwrap();
        let record = SessionRecord {
            active_files: vec!["a.rs".into()],
            child_sessions: vec!["forge/session/kid".into()],
            state: "idle".into(),
            ..Default::default()
        };
        record.write_to(&mut vfs);
        vfs.commit("save session", CommitKind::Prepare).unwrap();

        let cache = dir.path().join("cache");
        let (tx, _rx) = mpsc::channel(64);
        let runner = SessionRunner::new(
            store,
            "main",
            Arc::new(Settings::in_memory()),
            Arc::new(CostTracker::new(&cache)),
            Arc::new(RequestLog::new(&cache)),
            cache,
            tx,
        )
        .unwrap();
        assert!(runner.active_files().contains("a.rs"));
        assert_eq!(runner.prompt().active_files(), vec!["a.rs"]);
        assert_eq!(runner.child_sessions, vec!["forge/session/kid"]);
    }

    // ── Approvals ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn turn_with_unapproved_tool_rests_in_waiting_approval() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        runner.overlay_mut().write_file(
            "tools/helper.sh",
            "#!/bin/sh\n# forge-tool: {\"name\": \"helper\", \"description\": \"h\"}\ncat > /dev/null; printf '{\"success\": true}'\n",
        );
        runner.finish_turn(None).await.unwrap();
        assert_eq!(runner.state(), SessionState::WaitingApproval);
        // The record reflects the resting state.
        let head = runner.store.branch_head("main").unwrap();
        let record: SessionRecord = serde_json::from_slice(
            &runner.store.read_blob(head, SESSION_FILE).unwrap(),
        )
        .unwrap();
        assert_eq!(record.state, "waiting_approval");

        // Approving unblocks and lands a follow-up with the ledger.
        runner.approve_tools(&["helper".to_string()]).unwrap();
        assert_eq!(runner.state(), SessionState::Idle);
        assert!(runner.unapproved_tools().is_empty());
    }

    #[tokio::test]
    async fn rejecting_a_tool_also_unblocks_the_session() {
        let (_dir, mut runner, _rx) = test_runner(&[("a.rs", "x")]);
        runner.overlay_mut().write_file(
            "tools/helper.sh",
            "#!/bin/sh\n# forge-tool: {\"name\": \"helper\", \"description\": \"h\"}\n",
        );
        runner.finish_turn(None).await.unwrap();
        assert_eq!(runner.state(), SessionState::WaitingApproval);

        runner.reject_tool("helper");
        assert_eq!(runner.state(), SessionState::Idle);
        // The tool remains unapproved and cannot run.
        assert_eq!(runner.unapproved_tools(), vec!["helper".to_string()]);
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_discards_overlay_changes() {
        let (_dir, mut runner, mut rx) = test_runner(&[("a.rs", "x")]);
        runner.state = SessionState::Running;
        runner.overlay_mut().write_file("half-done.rs", "oops");
        runner.cancel();
        assert!(runner.cancelled());

        runner.handle_cancel().await;
        assert_eq!(runner.state(), SessionState::Idle);
        assert!(!runner.overlay().has_changes());

        // The cancellation surfaced as an error event.
        let mut saw_cancel = false;
        while let Ok(event) = rx.try_recv() {
            if let RunnerEvent::Error(e) = event {
                saw_cancel = e.contains("Cancelled");
            }
        }
        assert!(saw_cancel);
    }

    #[test]
    fn cancel_outside_running_is_a_no_op() {
        let (_dir, runner, _rx) = test_runner(&[]);
        runner.cancel();
        assert!(!runner.cancelled());
    }
}
