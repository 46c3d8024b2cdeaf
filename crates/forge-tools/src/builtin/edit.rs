// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{InvocationMode, Tool, ToolContext, ToolResult};

/// Search/replace edit with literal matching.
///
/// The first exact occurrence of `search` is replaced by `replace`. Multiple
/// occurrences are refused so the model cannot silently edit the wrong site.
pub struct EditTool;

impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact text block. The search text must \
         appear in the file exactly once, character for character. Include \
         enough surrounding lines to make the match unique."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filepath": { "type": "string", "description": "File to edit" },
                "search":   { "type": "string", "description": "Exact text to find" },
                "replace":  { "type": "string", "description": "Replacement text" }
            },
            "required": ["filepath", "search", "replace"],
        })
    }

    fn invocation(&self) -> InvocationMode {
        InvocationMode::Inline
    }

    fn inline_syntax(&self) -> Option<String> {
        Some(
            "<edit filepath=\"...\"><search>exact old text</search><replace>new text</replace></edit>"
                .into(),
        )
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(filepath) = args["filepath"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("missing required parameter: filepath");
        };
        let Some(search) = args["search"].as_str() else {
            return ToolResult::failure("missing required parameter: search");
        };
        let Some(replace) = args["replace"].as_str() else {
            return ToolResult::failure("missing required parameter: replace");
        };
        if search.is_empty() {
            return ToolResult::failure("search text must not be empty");
        }

        let content = match vfs.read_file(filepath) {
            Ok(c) => c,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        let occurrences = content.matches(search).count();
        if occurrences == 0 {
            return ToolResult::failure(format!(
                "search text not found in {filepath}. Re-read the file: the \
                 content may have changed since you last saw it."
            ));
        }
        if occurrences > 1 {
            return ToolResult::failure(format!(
                "search text appears {occurrences} times in {filepath}; add \
                 surrounding lines to make it unique."
            ));
        }

        vfs.write_file(filepath, content.replacen(search, replace, 1));
        ToolResult::ok_with_message(format!("Edited {filepath}"))
            .with_modified_files(vec![filepath.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;

    fn run(vfs: &mut OverlayVfs, args: Value) -> ToolResult {
        EditTool.execute(vfs, &args, &ToolContext::default())
    }

    #[test]
    fn replaces_unique_match() {
        let (_dir, mut vfs) = test_overlay(&[("f.rs", "fn a() {\n    old();\n}\n")]);
        let out = run(
            &mut vfs,
            json!({"filepath": "f.rs", "search": "    old();", "replace": "    new();"}),
        );
        assert!(out.success, "{:?}", out.error);
        assert_eq!(vfs.read_file("f.rs").unwrap(), "fn a() {\n    new();\n}\n");
    }

    #[test]
    fn match_is_literal_not_whitespace_insensitive() {
        let (_dir, mut vfs) = test_overlay(&[("f.rs", "    indented();\n")]);
        let out = run(
            &mut vfs,
            json!({"filepath": "f.rs", "search": "indented ();", "replace": "x"}),
        );
        assert!(!out.success);
        assert!(out.error.unwrap().contains("not found"));
    }

    #[test]
    fn ambiguous_match_is_refused() {
        let (_dir, mut vfs) = test_overlay(&[("f.rs", "x();\nx();\n")]);
        let out = run(
            &mut vfs,
            json!({"filepath": "f.rs", "search": "x();", "replace": "y();"}),
        );
        assert!(!out.success);
        assert!(out.error.unwrap().contains("2 times"));
        // File untouched.
        assert_eq!(vfs.read_file("f.rs").unwrap(), "x();\nx();\n");
    }

    #[test]
    fn multiline_search_block() {
        let (_dir, mut vfs) = test_overlay(&[("f.py", "def a():\n    one()\n    two()\n")]);
        let out = run(
            &mut vfs,
            json!({
                "filepath": "f.py",
                "search": "    one()\n    two()",
                "replace": "    merged()",
            }),
        );
        assert!(out.success);
        assert_eq!(vfs.read_file("f.py").unwrap(), "def a():\n    merged()\n");
    }

    #[test]
    fn missing_file_fails() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = run(
            &mut vfs,
            json!({"filepath": "ghost.rs", "search": "a", "replace": "b"}),
        );
        assert!(!out.success);
    }
}
