// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{InvocationMode, Tool, ToolContext, ToolResult};

pub struct DeleteFileTool;

impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file from the repository."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filepath": {
                    "type": "string",
                    "description": "Path of the file to delete"
                }
            },
            "required": ["filepath"],
        })
    }

    fn invocation(&self) -> InvocationMode {
        InvocationMode::Inline
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(filepath) = args["filepath"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("missing required parameter: filepath");
        };
        match vfs.delete_file(filepath) {
            Ok(()) => ToolResult::ok_with_message(format!("Deleted {filepath}"))
                .with_modified_files(vec![filepath.to_string()]),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;

    #[test]
    fn deletes_existing_file() {
        let (_dir, mut vfs) = test_overlay(&[("a.txt", "1")]);
        let out = DeleteFileTool.execute(
            &mut vfs,
            &json!({"filepath": "a.txt"}),
            &ToolContext::default(),
        );
        assert!(out.success);
        assert!(!vfs.file_exists("a.txt"));
        assert_eq!(out.modified_files, vec!["a.txt"]);
    }

    #[test]
    fn missing_file_fails() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = DeleteFileTool.execute(
            &mut vfs,
            &json!({"filepath": "ghost.txt"}),
            &ToolContext::default(),
        );
        assert!(!out.success);
        assert!(out.error.unwrap().contains("not found"));
    }
}
