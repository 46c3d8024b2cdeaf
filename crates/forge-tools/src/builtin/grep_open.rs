// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{SideEffect, Tool, ToolContext, ToolResult};

const MAX_MATCHES: usize = 100;

/// Regex search across every file visible through the overlay.
///
/// The result is ephemeral: it is shown to the model once to decide which
/// files to load, then replaced by a placeholder so large match lists do not
/// linger in context.
pub struct GrepOpenTool;

impl Tool for GrepOpenTool {
    fn name(&self) -> &str {
        "grep_open"
    }

    fn description(&self) -> &str {
        "Search all repository files with a regular expression. Returns \
         matching lines as path:line:text. Use this to find where something \
         lives, then load the relevant files with update_context. The result \
         is shown to you once only."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                }
            },
            "required": ["pattern"],
        })
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(pattern) = args["pattern"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("missing required parameter: pattern");
        };
        let regex = match regex::Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(format!("invalid pattern: {e}")),
        };

        let files = match vfs.list_files() {
            Ok(f) => f,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        let mut matches = Vec::new();
        let mut truncated = false;
        'files: for path in files {
            // Binary files fail UTF-8 decoding and are skipped.
            let Ok(content) = vfs.read_file(&path) else { continue };
            for (lineno, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if matches.len() >= MAX_MATCHES {
                        truncated = true;
                        break 'files;
                    }
                    matches.push(format!("{path}:{}:{}", lineno + 1, line.trim_end()));
                }
            }
        }

        let mut message = if matches.is_empty() {
            format!("No matches for /{pattern}/")
        } else {
            matches.join("\n")
        };
        if truncated {
            message.push_str(&format!("\n... (stopped after {MAX_MATCHES} matches)"));
        }

        ToolResult::ok_with_message(message)
            .with_extra("match_count", json!(matches.len()))
            .with_side_effect(SideEffect::EphemeralResult)
    }
}
