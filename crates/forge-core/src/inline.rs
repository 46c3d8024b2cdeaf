// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Inline tool invocation: XML-like tags embedded in assistant text.
//!
//! Inline commands run after streaming ends and before any API tool calls.
//! Three syntaxes:
//!
//! - self-closing with scalar attributes: `<run_tests pattern="foo"/>`
//! - body payload: `<write_file filepath="x.rs">content</write_file>`
//! - the edit form: `<edit filepath="…"><search>…</search><replace>…</replace></edit>`
//!
//! Only registered inline tool names are recognised; anything else in the
//! text (code samples, HTML) passes through untouched.

use regex::Regex;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct InlineCommand {
    pub tool_name: String,
    pub args: Value,
    /// Byte offset just past the closing tag, so the assistant text can be
    /// truncated at the failing command.
    pub end_pos: usize,
}

/// Parse all inline commands out of assistant text, in document order.
pub fn parse_inline_commands(text: &str, tool_names: &[String]) -> Vec<InlineCommand> {
    let mut commands: Vec<(usize, InlineCommand)> = Vec::new();

    // The edit form, with nested search/replace tags.
    if tool_names.iter().any(|n| n == "edit") {
        let edit_re = Regex::new(
            r#"(?s)<edit\s+filepath="([^"]*)"\s*>\s*<search>(.*?)</search>\s*<replace>(.*?)</replace>\s*</edit>"#,
        )
        .expect("static regex");
        for caps in edit_re.captures_iter(text) {
            let all = caps.get(0).expect("whole match");
            commands.push((
                all.start(),
                InlineCommand {
                    tool_name: "edit".into(),
                    args: json!({
                        "filepath": &caps[1],
                        "search": strip_payload_newlines(&caps[2]),
                        "replace": strip_payload_newlines(&caps[3]),
                    }),
                    end_pos: all.end(),
                },
            ));
        }
    }

    // Self-closing and body forms for every other inline tool.
    let tag_re = Regex::new(
        r#"<([a-zA-Z_][a-zA-Z0-9_]*)((?:\s+[a-zA-Z_][a-zA-Z0-9_]*="[^"]*")*)\s*(/>|>)"#,
    )
    .expect("static regex");
    for caps in tag_re.captures_iter(text) {
        let name = &caps[1];
        if name == "edit" || !tool_names.iter().any(|n| n == name) {
            continue;
        }
        let open = caps.get(0).expect("whole match");
        let mut args = parse_attrs(&caps[2]);

        if &caps[3] == "/>" {
            commands.push((
                open.start(),
                InlineCommand {
                    tool_name: name.to_string(),
                    args: Value::Object(args),
                    end_pos: open.end(),
                },
            ));
            continue;
        }

        // Body form: take everything to the matching closing tag.
        let close_tag = format!("</{name}>");
        let Some(rel) = text[open.end()..].find(&close_tag) else {
            continue; // unterminated tag: not a command
        };
        let body_start = open.end();
        let body = strip_payload_newlines(&text[body_start..body_start + rel]);
        args.insert("content".to_string(), json!(body));
        commands.push((
            open.start(),
            InlineCommand {
                tool_name: name.to_string(),
                args: Value::Object(args),
                end_pos: body_start + rel + close_tag.len(),
            },
        ));
    }

    commands.sort_by_key(|(start, _)| *start);
    commands.into_iter().map(|(_, c)| c).collect()
}

fn parse_attrs(attrs: &str) -> Map<String, Value> {
    let attr_re =
        Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_]*)="([^"]*)""#).expect("static regex");
    let mut map = Map::new();
    for caps in attr_re.captures_iter(attrs) {
        map.insert(caps[1].to_string(), attr_value(&caps[2]));
    }
    map
}

/// Scalar attribute coercion so `verbose="true"` reads as a boolean and
/// numeric attributes as numbers.
fn attr_value(raw: &str) -> Value {
    match raw {
        "true" => json!(true),
        "false" => json!(false),
        _ => match raw.parse::<i64>() {
            Ok(n) => json!(n),
            Err(_) => json!(raw),
        },
    }
}

/// Tag payloads conventionally start right after the opening tag's newline
/// and end right before the closing tag's; strip exactly one of each.
fn strip_payload_newlines(payload: &str) -> String {
    let payload = payload.strip_prefix('\n').unwrap_or(payload);
    let payload = payload.strip_suffix('\n').unwrap_or(payload);
    payload.to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
