//! Completion and blocking markers in agent output.

use regex::Regex;
use std::sync::OnceLock;

/// Primary completion tag the agent is asked to print.
pub const COMPLETION_TAG: &str = "<promise>COMPLETE</promise>";

/// Every string accepted as a completion signal, primary tag first.
pub const COMPLETION_MARKERS: &[&str] = &[
    COMPLETION_TAG,
    "<promise>DONE</promise>",
    "TASK_COMPLETE",
    "[TASK COMPLETE]",
];

/// Blocking tag shape, with a free-text reason.
pub const BLOCKING_TAG_EXAMPLE: &str = "<promise>BLOCKED: reason</promise>";

/// Prefix put on `ExecutionResult::error` when the agent blocks itself.
pub const BLOCKED_PREFIX: &str = "BLOCKED:";

fn blocking_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<promise>\s*BLOCKED:\s*(.*?)\s*</promise>").ok())
        .as_ref()
}

/// First completion marker found in `text`.
#[must_use]
pub fn detect_completion(text: &str) -> Option<&'static str> {
    COMPLETION_MARKERS.iter().copied().find(|m| text.contains(m))
}

/// Reason carried by a blocking tag, if present.
#[must_use]
pub fn detect_blocking(text: &str) -> Option<String> {
    let reason = blocking_regex()?.captures(text)?.get(1)?.as_str().trim();
    Some(if reason.is_empty() {
        "no reason given".to_string()
    } else {
        reason.to_string()
    })
}
