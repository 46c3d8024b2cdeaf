// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use forge_git::OverlayVfs;

/// How the model invokes a tool.
///
/// Inline tools use XML-like tags embedded in assistant text and run before
/// any function-calling tools; API tools use the standard function-calling
/// envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    Api,
    Inline,
}

/// Side effects a tool can declare in its result.
///
/// Tools are functions over the overlay, but some have session-level
/// consequences the orchestrator must act on. Declaring them beats
/// special-casing tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// A commit happened mid-turn; affects the end-of-turn commit type.
    MidTurnCommit,
    /// Files were modified through the overlay. The result carries
    /// `modified_files`.
    FilesModified,
    /// New files were created (summary generation needed). The result
    /// carries `new_files`.
    NewFilesCreated,
    /// The result has display output for the UI (`display_output`).
    HasDisplayOutput,
    /// The result is shown to the model exactly once, then replaced by a
    /// placeholder. For large outputs used for immediate decisions.
    EphemeralResult,
}

/// The result envelope every tool returns.
///
/// Tool-specific payloads (scout answers, compaction ranges) travel in
/// `extra` and serialize at the top level of the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<SideEffect>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_output: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolResult {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_side_effect(mut self, effect: SideEffect) -> Self {
        if !self.side_effects.contains(&effect) {
            self.side_effects.push(effect);
        }
        self
    }

    pub fn with_modified_files(mut self, files: Vec<String>) -> Self {
        self.modified_files = files;
        self.with_side_effect(SideEffect::FilesModified)
    }

    pub fn with_new_files(mut self, files: Vec<String>) -> Self {
        self.new_files = files;
        self.with_side_effect(SideEffect::NewFilesCreated)
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn has_side_effect(&self, effect: SideEffect) -> bool {
        self.side_effects.contains(&effect)
    }
}

/// Session-level context handed to tools that need more than the overlay:
/// the cheap model endpoint for scout-style queries.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub api_key: String,
    pub cheap_model: String,
    pub base_url: String,
}

/// Every built-in tool implements this. User tools go through the
/// subprocess protocol in [`crate::user`] instead.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;
    fn invocation(&self) -> InvocationMode {
        InvocationMode::Api
    }
    /// Override for tools whose inline syntax cannot be derived from the
    /// schema (body payloads, nested tags).
    fn inline_syntax(&self) -> Option<String> {
        None
    }
    /// Execute against the overlay. Failures are expressed through
    /// [`ToolResult::failure`], not panics.
    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, ctx: &ToolContext) -> ToolResult;
}

/// The function-calling schema for one tool, in wire shape.
pub fn api_schema(tool: &dyn Tool) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name(),
            "description": tool.description(),
            "parameters": tool.parameters_schema(),
        }
    })
}

/// Derive the default inline syntax documentation from a tool's schema:
/// scalar parameters become attributes, optional ones bracketed.
pub fn derived_inline_syntax(tool: &dyn Tool) -> String {
    if let Some(custom) = tool.inline_syntax() {
        return custom;
    }
    let schema = tool.parameters_schema();
    let empty = Map::new();
    let props = schema["properties"].as_object().unwrap_or(&empty);
    let required: Vec<&str> = schema["required"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let mut attrs = Vec::new();
    for (name, info) in props {
        let scalar = matches!(
            info["type"].as_str(),
            Some("string" | "boolean" | "integer" | "number")
        );
        if scalar {
            if required.contains(&name.as_str()) {
                attrs.push(format!("{name}=\"...\""));
            } else {
                attrs.push(format!("[{name}=\"...\"]"));
            }
        }
    }
    if attrs.is_empty() {
        format!("<{}/>", tool.name())
    } else {
        format!("<{} {}/>", tool.name(), attrs.join(" "))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
