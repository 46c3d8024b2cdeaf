// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{Tool, ToolContext, ToolResult};

/// Extended-reasoning scratchpad.
///
/// The value of the tool is in *writing* the scratchpad; only the
/// conclusion is kept. The scratchpad argument is stripped from the prompt
/// stream when messages are materialized, so it is never sent back to the
/// provider in later turns.
pub struct ThinkTool;

impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Work through a hard problem in a scratchpad, then state a \
         conclusion. Use this before non-obvious design decisions or tricky \
         edits. Only the conclusion remains visible afterwards; write the \
         scratchpad freely."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "scratchpad": {
                    "type": "string",
                    "description": "Free-form reasoning; discarded after this call"
                },
                "conclusion": {
                    "type": "string",
                    "description": "The decision or answer you arrived at"
                }
            },
            "required": ["scratchpad", "conclusion"],
        })
    }

    fn execute(&self, _vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(conclusion) = args["conclusion"].as_str().filter(|s| !s.is_empty()) else {
            return ToolResult::failure("missing required parameter: conclusion");
        };
        ToolResult::ok_with_message(conclusion.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;

    #[test]
    fn returns_only_the_conclusion() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = ThinkTool.execute(
            &mut vfs,
            &json!({"scratchpad": "lots of reasoning...", "conclusion": "use a BTreeMap"}),
            &ToolContext::default(),
        );
        assert!(out.success);
        assert_eq!(out.message.as_deref(), Some("use a BTreeMap"));
        // The scratchpad is not echoed anywhere in the result.
        let text = serde_json::to_string(&out).unwrap();
        assert!(!text.contains("lots of reasoning"));
    }

    #[test]
    fn empty_conclusion_fails() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = ThinkTool.execute(
            &mut vfs,
            &json!({"scratchpad": "x", "conclusion": ""}),
            &ToolContext::default(),
        );
        assert!(!out.success);
    }
}
