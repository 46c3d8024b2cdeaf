// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{Tool, ToolContext, ToolResult};

/// Replace a range of old tool results with a summary.
///
/// The tool validates and echoes the range; the session runner performs the
/// rewrite on the prompt stream (which the tool cannot reach).
pub struct CompactTool;

impl Tool for CompactTool {
    fn name(&self) -> &str {
        "compact"
    }

    fn description(&self) -> &str {
        "Compact a range of earlier tool results into a short summary to \
         free context space. Reference results by the integer ids shown in \
         [tool_call_id: N] prefixes. Compact ranges you no longer need \
         verbatim; the summary should preserve what mattered."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from_id": {
                    "type": "string",
                    "description": "First tool result id to compact (inclusive)"
                },
                "to_id": {
                    "type": "string",
                    "description": "Last tool result id to compact (inclusive)"
                },
                "summary": {
                    "type": "string",
                    "description": "What those results amounted to"
                }
            },
            "required": ["from_id", "to_id", "summary"],
        })
    }

    fn execute(&self, _vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let from_id = args["from_id"].as_str().unwrap_or_default();
        let to_id = args["to_id"].as_str().unwrap_or_default();
        let summary = args["summary"].as_str().unwrap_or_default();
        if from_id.is_empty() || to_id.is_empty() {
            return ToolResult::failure("from_id and to_id are required");
        }
        if summary.is_empty() {
            return ToolResult::failure("summary must not be empty");
        }
        ToolResult::ok_with_message(format!("Compacting results #{from_id}-#{to_id}"))
            .with_extra("compact", json!(true))
            .with_extra("from_id", json!(from_id))
            .with_extra("to_id", json!(to_id))
            .with_extra("summary", json!(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;

    #[test]
    fn echoes_range_for_the_runner() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = CompactTool.execute(
            &mut vfs,
            &json!({"from_id": "2", "to_id": "5", "summary": "wrote files"}),
            &ToolContext::default(),
        );
        assert!(out.success);
        assert_eq!(out.extra["compact"], json!(true));
        assert_eq!(out.extra["from_id"], json!("2"));
        assert_eq!(out.extra["to_id"], json!("5"));
        assert_eq!(out.extra["summary"], json!("wrote files"));
    }

    #[test]
    fn missing_range_fails() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = CompactTool.execute(
            &mut vfs,
            &json!({"summary": "s"}),
            &ToolContext::default(),
        );
        assert!(!out.success);
    }
}
