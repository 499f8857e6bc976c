//! Quality gates run before commits and pushes.
//!
//! - [`validator`] - Runs configured shell commands as ordered gates
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │  CommandValidator  │  implements QualityGate
//! │                    │
//! │  - pre_commit()    │──► ["cargo fmt --check", "cargo test", ...]
//! │  - pre_push()      │──► ["cargo clippy -- -D warnings", ...]
//! └─────────┬──────────┘
//!           │ ValidationSummary
//!           ▼
//!     format_report()  ──►  next prompt / logs
//! ```
//!
//! A gate never returns an error: spawn failures and timeouts are recorded as
//! failed [`CommandResult`]s so the execution loop can treat every outcome the
//! same way.

pub mod validator;

pub use validator::CommandValidator;

use async_trait::async_trait;
use std::time::Duration;

/// Output kept per command in reports.
const REPORT_TAIL_LINES: usize = 40;

/// When a set of checks runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationPhase {
    PreCommit,
    PrePush,
}

impl std::fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreCommit => write!(f, "pre-commit"),
            Self::PrePush => write!(f, "pre-push"),
        }
    }
}

/// Outcome of one check command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    pub passed: bool,
    /// `None` when the command never produced an exit status.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    /// A passing result with no output.
    pub fn pass(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            passed: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    /// A failing result with the given stderr.
    pub fn fail(command: impl Into<String>, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            passed: false,
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
            timed_out: false,
        }
    }
}

/// Outcome of one validation phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSummary {
    pub phase: ValidationPhase,
    pub passed: bool,
    pub results: Vec<CommandResult>,
    pub total_duration: Duration,
}

impl ValidationSummary {
    /// Build a summary; passes only if every command passed.
    #[must_use]
    pub fn from_results(phase: ValidationPhase, results: Vec<CommandResult>) -> Self {
        let passed = results.iter().all(|r| r.passed);
        let total_duration = results.iter().map(|r| r.duration).sum();
        Self {
            phase,
            passed,
            results,
            total_duration,
        }
    }

    /// An empty, passing summary.
    #[must_use]
    pub fn empty(phase: ValidationPhase) -> Self {
        Self::from_results(phase, Vec::new())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommandResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Runs quality checks for a project.
#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Checks that must pass before a commit.
    async fn pre_commit(&self) -> ValidationSummary;

    /// Checks that must pass before a push.
    async fn pre_push(&self) -> ValidationSummary;
}

/// Render a summary for prompt feedback and logs.
///
/// Failed commands include the tail of their output.
#[must_use]
pub fn format_report(summary: &ValidationSummary) -> String {
    let mut out = format!(
        "## Validation {} ({})\n\n",
        if summary.passed { "passed" } else { "FAILED" },
        summary.phase
    );

    for result in &summary.results {
        let status = if result.passed {
            "PASS".to_string()
        } else if result.timed_out {
            "TIMEOUT".to_string()
        } else {
            match result.exit_code {
                Some(code) => format!("FAIL (exit {code})"),
                None => "FAIL".to_string(),
            }
        };
        out.push_str(&format!(
            "- `{}`: {} in {:.1}s\n",
            result.command,
            status,
            result.duration.as_secs_f64()
        ));
    }

    for failure in summary.failures() {
        let combined = [failure.stdout.trim(), failure.stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if combined.is_empty() {
            continue;
        }
        out.push_str(&format!("\n### Output of `{}`\n\n```\n", failure.command));
        out.push_str(&tail_lines(&combined, REPORT_TAIL_LINES));
        out.push_str("\n```\n");
    }

    out
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
