// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::OverlayVfs;

use crate::tool::{Tool, ToolContext, ToolResult};

/// Finish the session, optionally asking the user a question.
///
/// With a question the session yields and waits for input; without one it
/// completes. The runner reacts to the `done` marker in the result.
pub struct DoneTool;

impl Tool for DoneTool {
    fn name(&self) -> &str {
        "done"
    }

    fn description(&self) -> &str {
        "Signal that you are finished with the task. Pass a question if you \
         need an answer from the user before continuing; otherwise the \
         session completes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Closing summary shown to the user"
                },
                "question": {
                    "type": "string",
                    "description": "Question to ask; the session waits for the answer"
                }
            },
        })
    }

    fn execute(&self, _vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let message = args["message"].as_str().unwrap_or_default();
        let question = args["question"].as_str().filter(|s| !s.is_empty());

        let mut result = ToolResult::ok_with_message(if message.is_empty() {
            "Done.".to_string()
        } else {
            message.to_string()
        })
        .with_extra("done", json!(true));
        if let Some(question) = question {
            result = result.with_extra("question", json!(question));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;

    #[test]
    fn done_without_question_completes() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = DoneTool.execute(
            &mut vfs,
            &json!({"message": "all wired up"}),
            &ToolContext::default(),
        );
        assert!(out.success);
        assert_eq!(out.extra["done"], json!(true));
        assert!(out.extra.get("question").is_none());
    }

    #[test]
    fn done_with_question_carries_it() {
        let (_dir, mut vfs) = test_overlay(&[]);
        let out = DoneTool.execute(
            &mut vfs,
            &json!({"question": "keep the old API?"}),
            &ToolContext::default(),
        );
        assert_eq!(out.extra["question"], json!("keep the old API?"));
    }
}
