// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod settings;

pub use settings::Settings;

/// Model used for summarization, commit messages and scout queries when the
/// user has not configured one. The cheap/fast model for everything except
/// the main agentic flow.
pub const DEFAULT_SUMMARIZATION_MODEL: &str = "anthropic/claude-3.5-haiku";

/// Default main model for the agentic loop.
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

/// Default API base URL (OpenAI-compatible).
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Environment variable consulted for the API key. When both the settings
/// file and the environment provide a key, the environment wins.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Session metadata file, relative to the branch root.
pub const SESSION_FILE: &str = ".forge/session.json";

/// Approved-tools ledger, relative to the branch root.
pub const APPROVED_TOOLS_FILE: &str = ".forge/approved_tools.json";

/// Per-repository configuration, relative to the branch root.
pub const REPO_CONFIG_FILE: &str = ".forge/config.json";
