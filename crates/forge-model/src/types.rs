// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ─── Wire message types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Provider prompt-cache marker. Everything up to and including the part
/// that carries this marker is cacheable as a prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub marker: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self { marker: "ephemeral".into() }
    }
}

/// A single content part inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into(), cache_control: None }
    }

    pub fn text_with_cache(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: Some(CacheControl::ephemeral()),
        }
    }

    pub fn has_cache_marker(&self) -> bool {
        match self {
            Self::Text { cache_control, .. } => cache_control.is_some(),
        }
    }
}

/// Message content – either a plain string (assistant text, tool-call
/// accompaniment) or a list of annotated parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One tool call as the assistant requested it. `arguments` is the raw JSON
/// string, concatenated from stream deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSpec {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: WireFunction,
}

impl From<&ToolCallSpec> for WireToolCall {
    fn from(spec: &ToolCallSpec) -> Self {
        Self {
            id: spec.id.clone(),
            call_type: "function".into(),
            function: WireFunction {
                name: spec.name.clone(),
                arguments: spec.arguments.clone(),
            },
        }
    }
}

/// A single message in the outgoing API payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageBody>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ApiMessage {
    pub fn with_parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            content: Some(MessageBody::Parts(parts)),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageBody::Text(text.into())),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<WireToolCall>, content: Option<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.map(MessageBody::Text),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageBody::Parts(parts)),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Append parts to this message's content, converting plain text to a
    /// parts list first if necessary.
    pub fn extend_parts(&mut self, parts: impl IntoIterator<Item = ContentPart>) {
        let body = self.content.take().unwrap_or(MessageBody::Parts(Vec::new()));
        let mut existing = match body {
            MessageBody::Parts(p) => p,
            MessageBody::Text(t) => vec![ContentPart::text(t)],
        };
        existing.extend(parts);
        self.content = Some(MessageBody::Parts(existing));
    }
}

// ─── Streaming events ─────────────────────────────────────────────────────────

/// A single event decoded from the provider SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// A tool-call delta. `id` and `name` may be empty on continuation
    /// chunks; `arguments` is a fragment to append for this `index`.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// The stream finished normally.
    Done,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates stream deltas into the final assistant text and tool calls.
///
/// Providers interleave chunks for parallel tool calls keyed by `index`;
/// the only mutation a continuation chunk performs is appending to the
/// `arguments` buffer of its index.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    pending: BTreeMap<u32, PendingToolCall>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &ResponseEvent) {
        match event {
            ResponseEvent::TextDelta(delta) => self.text.push_str(delta),
            ResponseEvent::ToolCallDelta { index, id, name, arguments } => {
                let pending = self.pending.entry(*index).or_default();
                if !id.is_empty() {
                    pending.id = id.clone();
                }
                if !name.is_empty() {
                    pending.name = name.clone();
                }
                pending.arguments.push_str(arguments);
            }
            ResponseEvent::Done => {}
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_tool_calls(&self) -> bool {
        self.pending.values().any(|p| !p.name.is_empty())
    }

    /// Finalize into `(text, tool_calls)` ordered by stream index.
    ///
    /// Calls with an empty name cannot be dispatched and are dropped –
    /// keeping them would corrupt the conversation sent back to the API.
    /// An empty id gets a synthetic fallback so the turn can complete.
    pub fn finish(self) -> (String, Vec<ToolCallSpec>) {
        let mut calls = Vec::with_capacity(self.pending.len());
        for (i, (_, pending)) in self.pending.into_iter().enumerate() {
            if pending.name.is_empty() {
                warn!(
                    tool_call_id = %pending.id,
                    "dropping tool call with empty name from model; cannot dispatch"
                );
                continue;
            }
            let id = if pending.id.is_empty() {
                warn!(
                    tool_name = %pending.name,
                    "tool call from model had empty id; generating synthetic id"
                );
                format!("tc_synthetic_{i}")
            } else {
                pending.id
            };
            calls.push(ToolCallSpec {
                id,
                name: pending.name,
                arguments: pending.arguments,
            });
        }
        (self.text, calls)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
