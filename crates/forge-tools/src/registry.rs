// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Central registry of built-in and user tools.
//!
//! Built-ins are compiled in and always approved. User tools are discovered
//! through the overlay on every call so a tool created in the current turn
//! is immediately visible; they execute only when their current source hash
//! matches an approved ledger entry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use forge_git::{CommitKind, Oid, OverlayVfs};

use crate::approval::{ApprovalGate, APPROVED_TOOLS_FILE};
use crate::tool::{api_schema, derived_inline_syntax, InvocationMode, Tool, ToolContext, ToolResult};
use crate::user::{self, UserTool};

/// A user tool awaiting approval.
#[derive(Debug, Clone)]
pub struct UnapprovedTool {
    pub name: String,
    pub source: String,
    /// True when the ledger has never seen this tool name.
    pub is_new: bool,
}

pub struct ToolRegistry {
    builtins: BTreeMap<String, Arc<dyn Tool>>,
    gate: Mutex<ApprovalGate>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            builtins: BTreeMap::new(),
            gate: Mutex::new(ApprovalGate::new()),
        }
    }

    /// Registry with the standard built-in tool set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for tool in crate::builtin::all() {
            registry.register(tool);
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.builtins.insert(tool.name().to_string(), tool);
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    /// Reload the approval ledger through the overlay.
    pub fn load_approvals(&self, vfs: &OverlayVfs) {
        self.gate.lock().expect("approval gate poisoned").load(vfs);
    }

    /// Function-calling schemas for every built-in API tool plus every
    /// approved user API tool.
    pub fn api_schemas(&self, vfs: &OverlayVfs) -> Vec<Value> {
        let mut schemas: Vec<Value> = self
            .builtins
            .values()
            .filter(|t| t.invocation() == InvocationMode::Api)
            .map(|t| api_schema(t.as_ref()))
            .collect();
        let gate = self.gate.lock().expect("approval gate poisoned");
        for tool in user::discover(vfs) {
            if tool.schema.invocation != InvocationMode::Api {
                continue;
            }
            if !gate.is_approved(&tool.schema.name, &tool.source) {
                continue;
            }
            schemas.push(serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.schema.name,
                    "description": tool.schema.description,
                    "parameters": tool.schema.parameters,
                }
            }));
        }
        schemas
    }

    /// Names of tools invoked through inline XML syntax, with their syntax
    /// documentation (for the system prompt and the inline parser).
    pub fn inline_tools(&self) -> Vec<(String, String)> {
        self.builtins
            .values()
            .filter(|t| t.invocation() == InvocationMode::Inline)
            .map(|t| (t.name().to_string(), derived_inline_syntax(t.as_ref())))
            .collect()
    }

    /// Execute one tool against the overlay. Unknown tools and unapproved
    /// user tools yield failure results, not errors: the model sees the
    /// refusal and can react.
    pub fn execute(
        &self,
        vfs: &mut OverlayVfs,
        ctx: &ToolContext,
        name: &str,
        args: &Value,
    ) -> ToolResult {
        if let Some(tool) = self.builtins.get(name) {
            return tool.execute(vfs, args, ctx);
        }

        let Some(tool) = find_user_tool(vfs, name) else {
            return ToolResult::failure(format!("unknown tool: {name}"));
        };
        {
            let gate = self.gate.lock().expect("approval gate poisoned");
            if !gate.is_approved(name, &tool.source) {
                warn!(tool = name, "blocked execution of unapproved tool");
                return ToolResult::failure(format!(
                    "Tool {name} is not approved. Cannot execute."
                ));
            }
        }
        user::execute(vfs, &tool, args)
    }

    /// User tools whose current source is not approved.
    pub fn unapproved_tools(&self, vfs: &OverlayVfs) -> Vec<UnapprovedTool> {
        let gate = self.gate.lock().expect("approval gate poisoned");
        user::discover(vfs)
            .into_iter()
            .filter(|t| !self.builtins.contains_key(&t.schema.name))
            .filter(|t| !gate.is_approved(&t.schema.name, &t.source))
            .map(|t| UnapprovedTool {
                is_new: !gate.has_entry(&t.schema.name),
                name: t.schema.name,
                source: t.source,
            })
            .collect()
    }

    /// Record an approval of the tool's current source.
    pub fn approve(&self, vfs: &OverlayVfs, name: &str) -> anyhow::Result<()> {
        let tool = find_user_tool(vfs, name)
            .ok_or_else(|| anyhow::anyhow!("tool not found: {name}"))?;
        self.gate
            .lock()
            .expect("approval gate poisoned")
            .approve(name, &tool.source);
        Ok(())
    }

    pub fn reject(&self, name: &str) {
        self.gate.lock().expect("approval gate poisoned").reject(name);
    }

    /// Commit pending approvals as a `[follow-up]` commit so the approval
    /// travels with the tool edit as one logical unit. Returns the new head
    /// when anything was committed.
    pub fn commit_pending_approvals(
        &self,
        vfs: &mut OverlayVfs,
    ) -> anyhow::Result<Option<Oid>> {
        let (ledger, names) = {
            let gate = self.gate.lock().expect("approval gate poisoned");
            if !gate.has_pending() {
                return Ok(None);
            }
            (gate.ledger_json(), gate.pending_names())
        };

        let store = Arc::clone(vfs.store());
        let branch = vfs.branch().to_string();
        let head = store.branch_head(&branch)?;
        let blob = store.create_blob(ledger.as_bytes())?;
        let mut inserts = BTreeMap::new();
        inserts.insert(APPROVED_TOOLS_FILE.to_string(), blob);
        let tree = store.build_tree(
            Some(store.commit_tree_oid(head)?),
            &inserts,
            &Default::default(),
        )?;
        let message = format!("approve tools: {}", names.join(", "));
        let oid = store.commit_with_kind(&branch, tree, &message, CommitKind::FollowUp)?;

        self.gate.lock().expect("approval gate poisoned").clear_pending();
        vfs.rebase()?;
        Ok(Some(oid))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn find_user_tool(vfs: &OverlayVfs, name: &str) -> Option<UserTool> {
    user::discover(vfs).into_iter().find(|t| t.schema.name == name)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
