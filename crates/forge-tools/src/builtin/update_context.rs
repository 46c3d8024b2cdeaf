// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{Tool, ToolContext, ToolResult};

/// Add and remove files from the active context in one operation.
///
/// The tool only validates and echoes the request; the session runner
/// applies the context change (it owns the prompt stream).
pub struct UpdateContextTool;

impl Tool for UpdateContextTool {
    fn name(&self) -> &str {
        "update_context"
    }

    fn description(&self) -> &str {
        "Add files to your working context (full content becomes visible) \
         and/or remove files you no longer need. Removing files you are done \
         with keeps the context small."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "add": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "File paths to load into context"
                },
                "remove": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "File paths to drop from context"
                }
            },
        })
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let add: Vec<String> = string_list(&args["add"]);
        let remove: Vec<String> = string_list(&args["remove"]);

        if add.is_empty() && remove.is_empty() {
            return ToolResult::failure("nothing to do: pass add and/or remove");
        }

        let missing: Vec<&String> = add.iter().filter(|f| !vfs.file_exists(f)).collect();
        if !missing.is_empty() {
            return ToolResult::failure(format!(
                "file(s) not found: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        let mut parts = Vec::new();
        if !add.is_empty() {
            parts.push(format!("+{} file(s)", add.len()));
        }
        if !remove.is_empty() {
            parts.push(format!("-{} file(s)", remove.len()));
        }
        ToolResult::ok_with_message(format!("Context updated: {}", parts.join(", ")))
            .with_extra("action", json!("update_context"))
            .with_extra("add", json!(add))
            .with_extra("remove", json!(remove))
    }
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
