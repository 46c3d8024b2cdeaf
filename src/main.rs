// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use forge_config::Settings;
use forge_core::{RunnerEvent, SessionRunner};
use forge_git::CommitStore;
use forge_model::{CostTracker, RequestLog};

/// Exit codes: 0 success, 2 repository discovery failure, 1 anything else.
const EXIT_NO_REPO: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("forge: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("FORGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Arc::new(match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    });

    let repo_root = cli.repo.clone().unwrap_or_else(|| PathBuf::from("."));
    let store = match CommitStore::discover(&repo_root) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("forge: no git repository at {}: {e}", repo_root.display());
            return Ok(ExitCode::from(EXIT_NO_REPO));
        }
    };

    // A fresh session branch forks off the current HEAD.
    if !store.branch_exists(&cli.branch) {
        let head = store.head_oid()?;
        store.create_branch(&cli.branch, head)?;
        eprintln!("forge: created session branch {} at {head}", cli.branch);
    }

    let prompt_text = read_prompt(&cli)?;
    if prompt_text.trim().is_empty() {
        anyhow::bail!("no prompt given (pass it as arguments or on stdin)");
    }

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("forge");
    let costs = Arc::new(CostTracker::new(&cache_dir));
    let request_log = Arc::new(RequestLog::new(&cache_dir));

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = events_rx.recv().await {
            match event {
                RunnerEvent::StreamChunk(chunk) => {
                    let _ = write!(stdout, "{chunk}");
                    let _ = stdout.flush();
                }
                RunnerEvent::ToolStarted { name, .. } => {
                    eprintln!("⚙ {name}");
                }
                RunnerEvent::ToolFinished { name, success, message, .. } => {
                    let mark = if success { "✓" } else { "✗" };
                    eprintln!("{mark} {name}: {}", message.unwrap_or_default());
                }
                RunnerEvent::SummaryProgress { current, total, filepath } => {
                    eprintln!("📚 summarizing {filepath} ({current}/{total})");
                }
                RunnerEvent::SummariesReady { count } => {
                    eprintln!("📚 {count} file summaries ready");
                }
                RunnerEvent::MidTurnCommit { commit } => {
                    eprintln!("⎇ committed {commit}");
                }
                RunnerEvent::ApprovalNeeded { tools } => {
                    eprintln!("⚠ unapproved tools: {} (approve in the UI)", tools.join(", "));
                }
                RunnerEvent::TurnFinished { commit } => {
                    println!();
                    eprintln!("⎇ turn committed as {commit}");
                }
                RunnerEvent::Error(e) => eprintln!("forge: {e}"),
                _ => {}
            }
        }
    });

    let mut runner = SessionRunner::new(
        Arc::clone(&store),
        &cli.branch,
        settings,
        costs,
        request_log,
        cache_dir,
        events_tx,
    )?;

    if !cli.no_summaries {
        runner.generate_summaries().await?;
    }

    let result = runner.send_message(&prompt_text).await;
    drop(runner);
    let _ = printer.await;

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("forge: {e:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_prompt(cli: &Cli) -> anyhow::Result<String> {
    if !cli.prompt.is_empty() {
        return Ok(cli.prompt.join(" "));
    }
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut text = String::new();
    stdin.lock().read_to_string(&mut text)?;
    Ok(text)
}
