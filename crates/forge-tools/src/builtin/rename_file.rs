// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{InvocationMode, Tool, ToolContext, ToolResult};

pub struct RenameFileTool;

impl Tool for RenameFileTool {
    fn name(&self) -> &str {
        "rename_file"
    }

    fn description(&self) -> &str {
        "Rename or move a file. The content is carried over unchanged."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": { "type": "string", "description": "Current path" },
                "to": { "type": "string", "description": "New path" }
            },
            "required": ["from", "to"],
        })
    }

    fn invocation(&self) -> InvocationMode {
        InvocationMode::Inline
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(from) = args["from"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("missing required parameter: from");
        };
        let Some(to) = args["to"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("missing required parameter: to");
        };
        if from == to {
            return ToolResult::failure("from and to are the same path");
        }
        if vfs.file_exists(to) {
            return ToolResult::failure(format!("destination already exists: {to}"));
        }
        let content = match vfs.read_file(from) {
            Ok(c) => c,
            Err(e) => return ToolResult::failure(e.to_string()),
        };
        vfs.write_file(to, content);
        if let Err(e) = vfs.delete_file(from) {
            return ToolResult::failure(e.to_string());
        }
        ToolResult::ok_with_message(format!("Renamed {from} -> {to}"))
            .with_modified_files(vec![from.to_string(), to.to_string()])
            .with_new_files(vec![to.to_string()])
    }
}
