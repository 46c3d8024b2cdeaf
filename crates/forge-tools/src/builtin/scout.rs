// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Query a smaller/cheaper model with many files at once.
//!
//! Lets the agent examine more files than would fit in its own context:
//! the scout model sees exactly the files passed to it, answers one
//! question, and remembers nothing between calls.

use serde_json::{json, Value};

use forge_git::OverlayVfs;
use forge_model::BlockingLlmClient;

use crate::tool::{Tool, ToolContext, ToolResult};

pub struct ScoutTool;

impl Tool for ScoutTool {
    fn name(&self) -> &str {
        "scout"
    }

    fn description(&self) -> &str {
        "Send many files to a smaller/cheaper model to answer a question or \
         identify relevant files. Use this when you need to examine more \
         files than would be practical to load into your own context. The \
         scout model has no memory between calls and cannot call tools; it \
         only sees the files you pass."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern matching files to send, e.g. 'src/**/*.rs'"
                },
                "files": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Explicit file list (alternative to pattern)"
                },
                "question": {
                    "type": "string",
                    "description": "The question to ask about these files"
                }
            },
            "required": ["question"],
        })
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, ctx: &ToolContext) -> ToolResult {
        let Some(question) = args["question"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("No question specified");
        };
        let pattern = args["pattern"].as_str().unwrap_or_default();
        let mut files: Vec<String> = args["files"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        if !pattern.is_empty() {
            let all = match vfs.list_files() {
                Ok(f) => f,
                Err(e) => return ToolResult::failure(e.to_string()),
            };
            files.extend(all.into_iter().filter(|f| glob_match(pattern, f)));
        }
        files.sort();
        files.dedup();

        if files.is_empty() {
            return ToolResult::failure("No files specified or matched pattern");
        }

        let mut sections = Vec::new();
        let mut errors = Vec::new();
        for path in &files {
            match vfs.read_file(path) {
                Ok(content) => sections.push(format!("=== {path} ===\n{content}")),
                Err(e) => errors.push(e.to_string()),
            }
        }
        if sections.is_empty() {
            return ToolResult::failure(format!(
                "Could not read any files: {}",
                errors.join("; ")
            ));
        }

        if ctx.api_key.is_empty() {
            return ToolResult::failure("No API key configured");
        }

        let prompt = format!(
            "You are a code analysis assistant. You have been given the \
             contents of several files and a question about them.\n\n\
             Answer the question based on the file contents. Be specific - \
             reference file names and line numbers when relevant. If asked \
             to identify relevant files, list them clearly.\n\n\
             FILES:\n{}\n\nQUESTION: {question}",
            sections.join("\n\n")
        );

        let client = BlockingLlmClient::new(&ctx.api_key, &ctx.cheap_model, &ctx.base_url);
        match client.chat(&prompt) {
            Ok(answer) => ToolResult::ok_with_message(answer.clone())
                .with_extra("answer", json!(answer))
                .with_extra("files_examined", json!(sections.len()))
                .with_extra("model", json!(ctx.cheap_model)),
            Err(e) => ToolResult::failure(format!("scout model call failed: {e}")),
        }
    }
}

/// Minimal glob matching for file paths: `*` stays within one path segment,
/// `**/` crosses directories (and matches the empty prefix), `?` is one
/// character.
fn glob_match(pattern: &str, path: &str) -> bool {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` may match nothing at all.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex::Regex::new(&regex)
        .map(|r| r.is_match(path))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;

    #[test]
    fn glob_star_stays_in_segment() {
        assert!(glob_match("src/*.rs", "src/main.rs"));
        assert!(!glob_match("src/*.rs", "src/sub/deep.rs"));
    }

    #[test]
    fn glob_double_star_crosses_directories() {
        assert!(glob_match("src/**/*.rs", "src/a/b/c.rs"));
        assert!(glob_match("src/**/*.rs", "src/top.rs"));
        assert!(!glob_match("src/**/*.rs", "other/x.rs"));
    }

    #[test]
    fn glob_literal_dots_are_escaped() {
        assert!(!glob_match("*.rs", "mainxrs"));
        assert!(glob_match("*.rs", "main.rs"));
    }

    #[test]
    fn missing_question_fails() {
        let (_dir, mut vfs) = test_overlay(&[("a.rs", "x")]);
        let out = ScoutTool.execute(
            &mut vfs,
            &json!({"pattern": "*.rs"}),
            &ToolContext::default(),
        );
        assert!(!out.success);
    }

    #[test]
    fn no_matching_files_fails() {
        let (_dir, mut vfs) = test_overlay(&[("a.rs", "x")]);
        let out = ScoutTool.execute(
            &mut vfs,
            &json!({"pattern": "*.py", "question": "what?"}),
            &ToolContext::default(),
        );
        assert!(!out.success);
        assert!(out.error.unwrap().contains("No files"));
    }

    #[test]
    fn missing_api_key_fails_before_any_network_call() {
        let (_dir, mut vfs) = test_overlay(&[("a.rs", "x")]);
        let out = ScoutTool.execute(
            &mut vfs,
            &json!({"files": ["a.rs"], "question": "what?"}),
            &ToolContext::default(),
        );
        assert!(!out.success);
        assert!(out.error.unwrap().contains("API key"));
    }
}
