// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Commit-type tokens and the amend/absorb state machine.
//!
//! Commit subjects may begin with one of the literal tokens `[prepare] ` or
//! `[follow-up] `; anything else is a major commit. The tokens drive how a
//! new commit folds into the branch tip:
//!
//! - `Prepare` on a `Prepare` parent amends the parent, concatenating the
//!   messages, so a run of bookkeeping commits stays one commit.
//! - `FollowUp` amends the previous major commit in place (new tree, same
//!   message, same parents).
//! - `Major` absorbs any immediately preceding `Prepare` run into itself.

const PREPARE_PREFIX: &str = "[prepare] ";
const FOLLOW_UP_PREFIX: &str = "[follow-up] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Major,
    Prepare,
    FollowUp,
}

/// What to do with a requested commit given the current branch tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Create a new commit with this (already formatted) message.
    Emit { message: String },
    /// Rewrite the parent: same parents, new tree. `message` of `None`
    /// keeps the parent's message.
    AmendParent { message: Option<String> },
    /// Drop the consecutive `[prepare]` run below the tip and emit one
    /// major commit with this message in its place.
    AbsorbPrepareRun { message: String },
}

/// Parse the commit-type token off a commit message.
/// Unknown or missing prefix means [`CommitKind::Major`].
pub fn parse(message: &str) -> (CommitKind, &str) {
    if let Some(rest) = message.strip_prefix(PREPARE_PREFIX) {
        (CommitKind::Prepare, rest)
    } else if let Some(rest) = message.strip_prefix(FOLLOW_UP_PREFIX) {
        (CommitKind::FollowUp, rest)
    } else {
        (CommitKind::Major, message)
    }
}

/// Attach the commit-type token to a subject. Major commits carry none.
pub fn format(kind: CommitKind, subject: &str) -> String {
    match kind {
        CommitKind::Major => subject.to_string(),
        CommitKind::Prepare => format!("{PREPARE_PREFIX}{subject}"),
        CommitKind::FollowUp => format!("{FOLLOW_UP_PREFIX}{subject}"),
    }
}

/// Decide how a requested commit lands given the parent commit at the tip.
///
/// `parent_subject` is the parent's message with its token already stripped.
pub fn decide(
    parent: CommitKind,
    parent_subject: &str,
    requested: CommitKind,
    subject: &str,
) -> Decision {
    match (requested, parent) {
        (CommitKind::FollowUp, CommitKind::Major) => Decision::AmendParent { message: None },
        (CommitKind::Prepare, CommitKind::Prepare) => Decision::AmendParent {
            message: Some(format(
                CommitKind::Prepare,
                &format!("{parent_subject}\n{subject}"),
            )),
        },
        (CommitKind::Major, CommitKind::Prepare) => Decision::AbsorbPrepareRun {
            message: subject.to_string(),
        },
        // FollowUp onto a Prepare tip is an edge case with no major commit
        // to amend; it lands as a fresh commit.
        _ => Decision::Emit {
            message: format(requested, subject),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_prepare() {
        assert_eq!(parse("[prepare] save state"), (CommitKind::Prepare, "save state"));
    }

    #[test]
    fn parse_recognizes_follow_up() {
        assert_eq!(
            parse("[follow-up] approve tools"),
            (CommitKind::FollowUp, "approve tools")
        );
    }

    #[test]
    fn parse_defaults_to_major() {
        assert_eq!(parse("fix: the bug"), (CommitKind::Major, "fix: the bug"));
        // Unknown bracketed prefixes are not interpreted.
        assert_eq!(parse("[wip] thing"), (CommitKind::Major, "[wip] thing"));
    }

    #[test]
    fn format_parse_round_trip() {
        for kind in [CommitKind::Major, CommitKind::Prepare, CommitKind::FollowUp] {
            let subject = "do the thing";
            assert_eq!(parse(&format(kind, subject)), (kind, subject));
        }
    }

    #[test]
    fn follow_up_on_major_amends_keeping_message() {
        assert_eq!(
            decide(CommitKind::Major, "feat: x", CommitKind::FollowUp, "approve"),
            Decision::AmendParent { message: None }
        );
    }

    #[test]
    fn prepare_on_prepare_concatenates_messages() {
        assert_eq!(
            decide(CommitKind::Prepare, "turn one", CommitKind::Prepare, "turn two"),
            Decision::AmendParent {
                message: Some("[prepare] turn one\nturn two".into())
            }
        );
    }

    #[test]
    fn major_on_prepare_absorbs_the_run() {
        assert_eq!(
            decide(CommitKind::Prepare, "turn one", CommitKind::Major, "feat: y"),
            Decision::AbsorbPrepareRun { message: "feat: y".into() }
        );
    }

    #[test]
    fn major_on_major_emits_plain_commit() {
        assert_eq!(
            decide(CommitKind::Major, "old", CommitKind::Major, "new"),
            Decision::Emit { message: "new".into() }
        );
    }

    #[test]
    fn prepare_on_major_emits_prefixed_commit() {
        assert_eq!(
            decide(CommitKind::Major, "old", CommitKind::Prepare, "bookkeeping"),
            Decision::Emit { message: "[prepare] bookkeeping".into() }
        );
    }

    #[test]
    fn follow_up_on_prepare_falls_back_to_emit() {
        assert_eq!(
            decide(CommitKind::Prepare, "p", CommitKind::FollowUp, "f"),
            Decision::Emit { message: "[follow-up] f".into() }
        );
    }
}
