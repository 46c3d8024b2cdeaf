// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! User-defined tools.
//!
//! A user tool is one executable script under `tools/`, visible through the
//! overlay so a tool written this turn is discoverable before commit. The
//! script declares its schema in a leading comment header:
//!
//! ```text
//! #!/usr/bin/env python3
//! # forge-tool: {"name": "count_lines", "description": "...",
//! #   "parameters": {"type": "object", "properties": {}}}
//! ```
//!
//! Execution materialises the overlay into a temp directory, runs the
//! script there with the JSON arguments on stdin, parses the result
//! envelope from stdout, and writes changed files back into the overlay.

use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::Value;
use tracing::{debug, warn};

use forge_git::OverlayVfs;

use crate::tool::{InvocationMode, ToolResult};

/// Directory holding user tools, relative to the branch root.
pub const TOOLS_DIR: &str = "tools";

const SCHEMA_MARKER: &str = "forge-tool:";

#[derive(Debug, Clone)]
pub struct UserToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub invocation: InvocationMode,
}

/// A discovered user tool: its overlay path, source and parsed schema.
#[derive(Debug, Clone)]
pub struct UserTool {
    pub path: String,
    pub source: String,
    pub schema: UserToolSchema,
}

/// Tool basename (no extension) from its path under `tools/`.
pub fn tool_name_from_path(path: &str) -> Option<String> {
    let file = path.strip_prefix(&format!("{TOOLS_DIR}/"))?;
    if file.contains('/') {
        return None; // no nested tool directories
    }
    let name = file.split_once('.').map(|(stem, _)| stem).unwrap_or(file);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Parse the `forge-tool:` JSON header out of a script's leading comment
/// block. The JSON object may continue across several `#` lines; trailing
/// comment text after the object is ignored.
pub fn parse_tool_header(source: &str) -> Option<UserToolSchema> {
    let mut collecting = false;
    let mut joined = String::new();
    for line in source.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') {
            if collecting {
                break;
            }
            // Allow the shebang and blank-free header region only.
            if trimmed.is_empty() {
                continue;
            }
            break;
        }
        let body = trimmed.trim_start_matches('#').trim_start();
        if collecting {
            joined.push('\n');
            joined.push_str(body);
        } else if let Some(rest) = body.strip_prefix(SCHEMA_MARKER) {
            collecting = true;
            joined.push_str(rest.trim_start());
        }
    }
    if joined.is_empty() {
        return None;
    }

    // Parse the first JSON value and ignore any trailing comment text.
    let mut stream = serde_json::Deserializer::from_str(&joined).into_iter::<Value>();
    let value = stream.next()?.ok()?;

    let name = value["name"].as_str()?.to_string();
    let invocation = match value["invocation"].as_str() {
        Some("inline") => InvocationMode::Inline,
        _ => InvocationMode::Api,
    };
    Some(UserToolSchema {
        name,
        description: value["description"].as_str().unwrap_or_default().to_string(),
        parameters: value
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} })),
        invocation,
    })
}

/// All user tools visible through the overlay.
pub fn discover(vfs: &OverlayVfs) -> Vec<UserTool> {
    let Ok(files) = vfs.list_files() else {
        return Vec::new();
    };
    let mut tools = Vec::new();
    for path in files {
        if tool_name_from_path(&path).is_none() {
            continue;
        }
        let Ok(source) = vfs.read_file(&path) else {
            continue;
        };
        match parse_tool_header(&source) {
            Some(schema) => tools.push(UserTool { path, source, schema }),
            None => debug!(path, "file under tools/ has no forge-tool header, skipping"),
        }
    }
    tools
}

/// Execute a user tool: sandbox the overlay into a temp directory, run the
/// script there, and reconcile file changes back into the overlay.
pub fn execute(vfs: &mut OverlayVfs, tool: &UserTool, args: &Value) -> ToolResult {
    if !tool.source.starts_with("#!") {
        return ToolResult::failure(format!(
            "tool {} has no interpreter line (#!...)",
            tool.schema.name
        ));
    }

    let root = match vfs.materialize_to_tempdir() {
        Ok(root) => root,
        Err(e) => return ToolResult::failure(format!("materialize failed: {e}")),
    };

    let result = run_script(&root, &tool.path, args);

    // Write changed text files back so the turn's overlay sees what the
    // tool did. Only files the overlay already lists are reconciled.
    if result.success {
        if let Ok(files) = vfs.list_files() {
            for rel in files {
                let on_disk = root.join(&rel);
                let Ok(new_content) = std::fs::read_to_string(&on_disk) else {
                    continue;
                };
                if vfs.read_file(&rel).map(|old| old != new_content).unwrap_or(false) {
                    vfs.write_file(rel, new_content);
                }
            }
        }
    }

    if let Err(e) = std::fs::remove_dir_all(&root) {
        warn!(error = %e, "failed to clean up tool sandbox");
    }
    result
}

fn run_script(root: &std::path::Path, rel_path: &str, args: &Value) -> ToolResult {
    let script = root.join(rel_path);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755));
    }

    let spawned = Command::new(&script)
        .current_dir(root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => return ToolResult::failure(format!("failed to launch tool: {e}")),
    };

    if let Some(stdin) = child.stdin.take() {
        let mut stdin = stdin;
        let _ = stdin.write_all(args.to_string().as_bytes());
    }

    let output = match child.wait_with_output() {
        Ok(o) => o,
        Err(e) => return ToolResult::failure(format!("tool did not finish: {e}")),
    };

    if !output.status.success() {
        return ToolResult::failure(format!(
            "tool exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match serde_json::from_str::<ToolResult>(stdout.trim()) {
        Ok(result) => result,
        Err(e) => ToolResult::failure(format!("tool produced invalid result envelope: {e}")),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
