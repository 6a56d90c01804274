//! Summarizer (external collaborator, interface only — spec §4.6).
//!
//! The real one-shot summarizer process is out of scope (spec §1); this
//! module owns the seam the engine calls through, plus the fallback and
//! replay-section guarantees the engine itself is responsible for
//! regardless of which summarizer implementation is plugged in.

use crate::redact::{redact, truncate_chars};
use crate::supervisor::SummaryInput;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

const FALLBACK_EXCERPT_CHARS: usize = 1200;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, input: &SummaryInput) -> Result<String>;
}

/// Used when `SUMMARIZER_ENABLED=false`, or as the seam's own fallback —
/// never the engine's only summarizer in a real deployment, but a
/// reasonable default for a standalone engine binary (spec §1: the real
/// summarizer is a pluggable external collaborator).
pub struct PassthroughSummarizer;

#[async_trait]
impl Summarizer for PassthroughSummarizer {
    async fn summarize(&self, input: &SummaryInput) -> Result<String> {
        Ok(fallback_excerpt(input))
    }
}

fn fallback_excerpt(input: &SummaryInput) -> String {
    let mut text = truncate_chars(&redact(&input.raw_text), FALLBACK_EXCERPT_CHARS);
    if !input.tool_summary.is_empty() {
        text.push_str("\n\nTools used:\n");
        for line in &input.tool_summary {
            text.push_str("- ");
            text.push_str(line);
            text.push('\n');
        }
    }
    text
}

/// Appends an explicit replay section if `replay_actions` is non-empty and
/// the summary doesn't already carry one — the engine's own guarantee
/// regardless of what a plugged-in summarizer chose to do (spec §4.6 (c)).
fn ensure_replay_section(mut summary: String, replay_actions: &[String]) -> String {
    if replay_actions.is_empty() || summary.contains("Replay") {
        return summary;
    }
    summary.push_str("\n\nReplay (ran under elevated permissions after approval):\n");
    for line in replay_actions {
        summary.push_str("- ");
        summary.push_str(line);
        summary.push('\n');
    }
    summary
}

/// Called by the engine on every successful completion. Redacts nothing
/// itself — the caller is expected to have already produced a
/// fully-redacted `input` (spec §4.6 (a)) — tolerates a failing or slow
/// summarizer by falling back to a redacted excerpt (spec §4.6 (b)), and
/// guarantees a replay section is present when there were replay actions
/// (spec §4.6 (c)).
pub async fn summarize_with_fallback(
    summarizer: &dyn Summarizer,
    input: &SummaryInput,
    timeout: Duration,
    enabled: bool,
) -> String {
    if !enabled {
        return ensure_replay_section(fallback_excerpt(input), &input.replay_actions);
    }

    let summary = match tokio::time::timeout(timeout, summarizer.summarize(input)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(err = %e, "summarizer failed, falling back to raw excerpt");
            fallback_excerpt(input)
        }
        Err(_) => {
            tracing::warn!("summarizer timed out, falling back to raw excerpt");
            fallback_excerpt(input)
        }
    };

    ensure_replay_section(summary, &input.replay_actions)
}
