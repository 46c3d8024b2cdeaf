// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{InvocationMode, Tool, ToolContext, ToolResult};

/// Write (or create) one file with full content.
pub struct WriteFileTool;

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write the complete content of a file. Creates the file if it does not \
         exist, including any parent directories. Prefer `edit` for small \
         changes to existing files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filepath": {
                    "type": "string",
                    "description": "Path of the file relative to the repository root"
                },
                "content": {
                    "type": "string",
                    "description": "Full new content of the file"
                }
            },
            "required": ["filepath", "content"],
        })
    }

    fn invocation(&self) -> InvocationMode {
        InvocationMode::Inline
    }

    fn inline_syntax(&self) -> Option<String> {
        Some("<write_file filepath=\"...\">full file content</write_file>".into())
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(filepath) = args["filepath"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("missing required parameter: filepath");
        };
        let Some(content) = args["content"].as_str() else {
            return ToolResult::failure("missing required parameter: content");
        };

        let is_new = !vfs.file_exists(filepath);
        vfs.write_file(filepath, content);

        let result = ToolResult::ok_with_message(format!(
            "Wrote {filepath} ({} bytes)",
            content.len()
        ))
        .with_modified_files(vec![filepath.to_string()]);
        if is_new {
            result.with_new_files(vec![filepath.to_string()])
        } else {
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;
    use crate::tool::SideEffect;

    #[test]
    fn creates_new_file_with_both_side_effects() {
        let (_dir, mut vfs) = test_overlay(&[("a.txt", "1")]);
        let out = WriteFileTool.execute(
            &mut vfs,
            &json!({"filepath": "src/new.rs", "content": "fn main() {}"}),
            &ToolContext::default(),
        );
        assert!(out.success);
        assert!(out.has_side_effect(SideEffect::FilesModified));
        assert!(out.has_side_effect(SideEffect::NewFilesCreated));
        assert_eq!(vfs.read_file("src/new.rs").unwrap(), "fn main() {}");
    }

    #[test]
    fn overwriting_existing_file_is_not_new() {
        let (_dir, mut vfs) = test_overlay(&[("a.txt", "old")]);
        let out = WriteFileTool.execute(
            &mut vfs,
            &json!({"filepath": "a.txt", "content": "new"}),
            &ToolContext::default(),
        );
        assert!(out.success);
        assert!(!out.has_side_effect(SideEffect::NewFilesCreated));
        assert_eq!(out.modified_files, vec!["a.txt"]);
        assert_eq!(vfs.read_file("a.txt").unwrap(), "new");
    }

    #[test]
    fn missing_filepath_fails() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = WriteFileTool.execute(
            &mut vfs,
            &json!({"content": "x"}),
            &ToolContext::default(),
        );
        assert!(!out.success);
        assert!(out.error.unwrap().contains("filepath"));
    }
}
