// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use forge_git::{CommitKind, OverlayVfs};

use crate::tool::{InvocationMode, SideEffect, Tool, ToolContext, ToolResult};

/// Commit pending overlay changes mid-turn.
///
/// Lets the model land one atomic commit per logical change instead of one
/// big commit at the end of the turn. The overlay rebases onto the new head
/// so later tools in the same turn see the committed state.
pub struct CommitTool;

impl Tool for CommitTool {
    fn name(&self) -> &str {
        "commit"
    }

    fn description(&self) -> &str {
        "Commit pending changes mid-turn with a descriptive message. Use \
         this to create atomic commits for each logical change rather than \
         one big commit at the end. After commit, you can continue making \
         more changes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Commit message describing the change"
                }
            },
            "required": ["message"],
        })
    }

    fn invocation(&self) -> InvocationMode {
        InvocationMode::Inline
    }

    fn execute(&self, vfs: &mut OverlayVfs, args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(message) = args["message"].as_str().map(str::trim).filter(|s| !s.is_empty())
        else {
            return ToolResult::failure("message must be a non-empty string");
        };

        let pending = vfs.pending_changes().len();
        let deleted = vfs.deleted_files().len();
        if pending == 0 && deleted == 0 {
            return ToolResult::failure("No pending changes to commit");
        }

        let oid = match vfs.commit(message, CommitKind::Major) {
            Ok(oid) => oid,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        let mut summary = Vec::new();
        if pending > 0 {
            summary.push(format!("{pending} file(s) modified/created"));
        }
        if deleted > 0 {
            summary.push(format!("{deleted} file(s) deleted"));
        }

        ToolResult::ok_with_message(format!("Committed: {}", summary.join(", ")))
            .with_extra("commit", json!(oid.to_string()[..12].to_string()))
            .with_side_effect(SideEffect::MidTurnCommit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_overlay;
    use std::sync::Arc;

    #[test]
    fn commits_pending_changes_and_rebases() {
        let (_dir, mut vfs) = test_overlay(&[("a.txt", "1")]);
        let store = Arc::clone(vfs.store());
        vfs.write_file("b.txt", "2");

        let out = CommitTool.execute(
            &mut vfs,
            &json!({"message": "add b"}),
            &ToolContext::default(),
        );
        assert!(out.success, "{:?}", out.error);
        assert!(out.has_side_effect(SideEffect::MidTurnCommit));
        assert!(!vfs.has_changes());

        let head = store.branch_head("main").unwrap();
        assert_eq!(store.commit_message(head).unwrap(), "add b");
        assert_eq!(store.read_blob(head, "b.txt").unwrap(), b"2");
    }

    #[test]
    fn nothing_pending_fails() {
        let (_dir, mut vfs) = test_overlay(&[("a.txt", "1")]);
        let out = CommitTool.execute(
            &mut vfs,
            &json!({"message": "noop"}),
            &ToolContext::default(),
        );
        assert!(!out.success);
        assert!(out.error.unwrap().contains("No pending changes"));
    }

    #[test]
    fn blank_message_fails() {
        let (_dir, mut vfs) = test_overlay(&[("a.txt", "1")]);
        vfs.write_file("b.txt", "2");
        let out = CommitTool.execute(&mut vfs, &json!({"message": "  "}), &ToolContext::default());
        assert!(!out.success);
    }
}
