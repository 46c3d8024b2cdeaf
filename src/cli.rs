// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

/// Headless driver for forge sessions.
///
/// Runs one AI turn (or a conversation from stdin) against a session branch
/// of the repository. The richer interactive surfaces attach to the same
/// core through the event queue.
#[derive(Parser, Debug)]
#[command(name = "forge", version, about = "AI coding agent working a git repository")]
pub struct Cli {
    /// Repository path. Discovered from the working directory when omitted.
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Session branch. Created from HEAD if it does not exist yet.
    #[arg(long, default_value = "forge/session/main")]
    pub branch: String,

    /// Settings file override (default: ~/.config/forge/settings.json).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Skip repository summary generation (faster startup, weaker map).
    #[arg(long)]
    pub no_summaries: bool,

    /// Verbose logging to stderr (or set FORGE_LOG).
    #[arg(long, short)]
    pub verbose: bool,

    /// The instruction for the AI. Read from stdin when omitted.
    pub prompt: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_branch_is_session_main() {
        let cli = Cli::parse_from(["forge", "do", "the", "thing"]);
        assert_eq!(cli.branch, "forge/session/main");
        assert_eq!(cli.prompt, vec!["do", "the", "thing"]);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from([
            "forge",
            "--repo",
            "/tmp/repo",
            "--branch",
            "forge/session/fix",
            "--no-summaries",
            "-v",
        ]);
        assert_eq!(cli.repo.as_deref(), Some(std::path::Path::new("/tmp/repo")));
        assert_eq!(cli.branch, "forge/session/fix");
        assert!(cli.no_summaries);
        assert!(cli.verbose);
        assert!(cli.prompt.is_empty());
    }
}
