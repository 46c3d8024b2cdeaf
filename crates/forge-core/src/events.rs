// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Session execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not running, ready for input.
    Idle,
    /// Actively processing (streaming or executing tools).
    Running,
    /// Blocked on tool approval.
    WaitingApproval,
    /// The AI asked a question and waits for the answer.
    WaitingInput,
    /// Suspended until a child session becomes ready.
    WaitingChildren,
    /// Session finished.
    Completed,
    /// Unrecoverable error.
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingInput => "waiting_input",
            Self::WaitingChildren => "waiting_children",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "waiting_approval" => Some(Self::WaitingApproval),
            "waiting_input" => Some(Self::WaitingInput),
            "waiting_children" => Some(Self::WaitingChildren),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Events the runner posts onto the single-consumer queue. The UI (or the
/// headless driver) consumes these; no other channel exists between the
/// coordinator and its observers.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// A text chunk streamed from the model.
    StreamChunk(String),
    /// A streaming tool-call delta (arguments arrive as fragments).
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// A tool is about to execute.
    ToolStarted { name: String, args: Value },
    /// A tool finished.
    ToolFinished {
        tool_call_id: String,
        name: String,
        success: bool,
        message: Option<String>,
    },
    /// A commit landed mid-turn; the git graph should refresh.
    MidTurnCommit { commit: String },
    /// Summary generation progress.
    SummaryProgress {
        current: usize,
        total: usize,
        filepath: String,
    },
    /// The repository summaries snapshot is ready.
    SummariesReady { count: usize },
    /// The set of active files changed.
    ContextChanged { active_files: Vec<String> },
    /// The session state machine moved.
    StateChanged(SessionState),
    /// Unapproved tools were encountered; execution is blocked on them.
    ApprovalNeeded { tools: Vec<String> },
    /// The turn completed with this commit.
    TurnFinished { commit: String },
    /// A recoverable error, surfaced for display.
    Error(String),
}
