//! Status sections persisted into task files.
//!
//! The executor records every terminal outcome inside a delimited block at the
//! end of the task file. The block is machine-readable so a BLOCKED task can be
//! resumed later:
//!
//! ```markdown
//! <!-- tasksmith:status -->
//! ## Status: BLOCKED
//!
//! ### Execution Log
//! - Started: 2026-03-01T09:00:00Z
//! - Blocked: 2026-03-01T09:40:00Z
//! - Iterations: 10
//!
//! ### Blocking Issue
//! Max iterations (10) reached without completion
//!
//! ### Files Modified
//! - `src/api/health.rs`
//!
//! ### Resume Attempt History
//! - 2026-03-02T10:00:00Z: resumed at iteration 10
//!
//! ### Resume
//! Run `tasksmith run --resume tasks/health.md` to continue from iteration 10.
//! <!-- /tasksmith:status -->
//! ```
//!
//! Timestamps are RFC 3339 at second precision so rendering and parsing
//! round-trip exactly.

use crate::error::{Result, TaskError};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

pub const STATUS_START: &str = "<!-- tasksmith:status -->";
pub const STATUS_END: &str = "<!-- /tasksmith:status -->";

/// Current time truncated to whole seconds.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Terminal marker written into the status heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusMarker {
    Blocked,
    Completed,
    Failed,
}

impl StatusMarker {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "BLOCKED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Directory name terminal tasks are moved into.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "BLOCKED" => Some(Self::Blocked),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatusMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// What happened at a point in a task's resume history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    BlockedAgain,
    Completed,
}

impl ResumeOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Resumed => "resumed",
            Self::BlockedAgain => "blocked again",
            Self::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "resumed" => Some(Self::Resumed),
            "blocked again" => Some(Self::BlockedAgain),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeAttempt {
    pub at: DateTime<Utc>,
    pub outcome: ResumeOutcome,
    pub iteration: u32,
}

impl ResumeAttempt {
    #[must_use]
    pub fn new(outcome: ResumeOutcome, iteration: u32) -> Self {
        Self {
            at: now(),
            outcome,
            iteration,
        }
    }
}

/// Snapshot of a blocked task, enough to resume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedStatus {
    pub previous_iteration: u32,
    pub files_modified: Vec<PathBuf>,
    pub blocking_issue: String,
    pub started_at: DateTime<Utc>,
    pub blocked_at: DateTime<Utc>,
    pub attempt_history: Vec<ResumeAttempt>,
}

impl BlockedStatus {
    /// Timestamp of the latest `resumed` entry.
    #[must_use]
    pub fn last_resumed_at(&self) -> Option<DateTime<Utc>> {
        self.attempt_history
            .iter()
            .rev()
            .find(|a| a.outcome == ResumeOutcome::Resumed)
            .map(|a| a.at)
    }

    #[must_use]
    pub fn resume_count(&self) -> usize {
        self.attempt_history
            .iter()
            .filter(|a| a.outcome == ResumeOutcome::Resumed)
            .count()
    }
}

/// Summary of a task that completed after being blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHistory {
    pub originally_blocked_at: DateTime<Utc>,
    pub blocked_iteration: u32,
    pub blocking_issue: String,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub completed_iteration: u32,
    pub resume_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub iterations: u32,
    pub files_modified: Vec<PathBuf>,
    pub history: Option<ExecutionHistory>,
    pub attempt_history: Vec<ResumeAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub started_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub iterations: u32,
    pub error: String,
    pub files_modified: Vec<PathBuf>,
}

/// One status block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    Blocked(BlockedStatus),
    Completed(CompletionRecord),
    Failed(FailureRecord),
}

impl StatusReport {
    #[must_use]
    pub fn marker(&self) -> StatusMarker {
        match self {
            Self::Blocked(_) => StatusMarker::Blocked,
            Self::Completed(_) => StatusMarker::Completed,
            Self::Failed(_) => StatusMarker::Failed,
        }
    }

    /// Render the delimited block. `task_path` feeds the resume hint.
    #[must_use]
    pub fn render(&self, task_path: &Path) -> String {
        let mut out = String::new();
        out.push_str(STATUS_START);
        out.push('\n');
        out.push_str(&format!("## Status: {}\n", self.marker()));

        match self {
            Self::Blocked(b) => {
                out.push_str("\n### Execution Log\n");
                out.push_str(&format!("- Started: {}\n", fmt_ts(&b.started_at)));
                out.push_str(&format!("- Blocked: {}\n", fmt_ts(&b.blocked_at)));
                out.push_str(&format!("- Iterations: {}\n", b.previous_iteration));
                out.push_str("\n### Blocking Issue\n");
                out.push_str(b.blocking_issue.trim());
                out.push('\n');
                render_files(&mut out, &b.files_modified);
                render_attempts(&mut out, &b.attempt_history);
                out.push_str("\n### Resume\n");
                out.push_str(&format!(
                    "Run `tasksmith run --resume {}` to continue from iteration {}.\n",
                    task_path.display(),
                    b.previous_iteration
                ));
            }
            Self::Completed(c) => {
                out.push_str("\n### Execution Log\n");
                out.push_str(&format!("- Started: {}\n", fmt_ts(&c.started_at)));
                out.push_str(&format!("- Completed: {}\n", fmt_ts(&c.completed_at)));
                out.push_str(&format!("- Iterations: {}\n", c.iterations));
                render_files(&mut out, &c.files_modified);
                if let Some(h) = &c.history {
                    out.push_str("\n### Execution History\n");
                    out.push_str(&format!(
                        "- Originally blocked: {} at iteration {}\n",
                        fmt_ts(&h.originally_blocked_at),
                        h.blocked_iteration
                    ));
                    out.push_str(&format!(
                        "- Blocking issue: {}\n",
                        single_line(&h.blocking_issue)
                    ));
                    if let Some(resumed) = h.resumed_at {
                        out.push_str(&format!("- Resumed: {}\n", fmt_ts(&resumed)));
                    }
                    out.push_str(&format!(
                        "- Completed: {} at iteration {}\n",
                        fmt_ts(&h.completed_at),
                        h.completed_iteration
                    ));
                    out.push_str(&format!("- Resume attempts: {}\n", h.resume_attempts));
                }
                render_attempts(&mut out, &c.attempt_history);
            }
            Self::Failed(f) => {
                out.push_str("\n### Execution Log\n");
                out.push_str(&format!("- Started: {}\n", fmt_ts(&f.started_at)));
                out.push_str(&format!("- Failed: {}\n", fmt_ts(&f.failed_at)));
                out.push_str(&format!("- Iterations: {}\n", f.iterations));
                out.push_str("\n### Error\n");
                out.push_str(f.error.trim());
                out.push('\n');
                render_files(&mut out, &f.files_modified);
            }
        }

        out.push_str(STATUS_END);
        out.push('\n');
        out
    }
}

fn render_files(out: &mut String, files: &[PathBuf]) {
    out.push_str("\n### Files Modified\n");
    if files.is_empty() {
        out.push_str("- (none)\n");
    }
    for file in files {
        out.push_str(&format!("- `{}`\n", file.display()));
    }
}

fn render_attempts(out: &mut String, attempts: &[ResumeAttempt]) {
    if attempts.is_empty() {
        return;
    }
    out.push_str("\n### Resume Attempt History\n");
    for a in attempts {
        out.push_str(&format!(
            "- {}: {} at iteration {}\n",
            fmt_ts(&a.at),
            a.outcome.as_str(),
            a.iteration
        ));
    }
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Block manipulation
// ============================================================================

/// Byte range of the status block (markers included), if present.
fn block_range(content: &str) -> Option<(usize, usize)> {
    let start = content.find(STATUS_START)?;
    let end = content[start..]
        .find(STATUS_END)
        .map(|i| start + i + STATUS_END.len())
        .unwrap_or(content.len());
    Some((start, end))
}

/// Task markdown without its status block.
#[must_use]
pub fn strip_status_block(content: &str) -> String {
    match block_range(content) {
        Some((start, end)) => {
            let mut out = content[..start].trim_end().to_string();
            let rest = content[end..].trim();
            if !rest.is_empty() {
                out.push_str("\n\n");
                out.push_str(rest);
            }
            out.push('\n');
            out
        }
        None => content.to_string(),
    }
}

/// Replace any existing status block with `block`, appended at the end.
#[must_use]
pub fn replace_status_block(content: &str, block: &str) -> String {
    let mut out = strip_status_block(content).trim_end().to_string();
    out.push_str("\n\n");
    out.push_str(block.trim_end());
    out.push('\n');
    out
}

/// Marker of the current status block, if any.
#[must_use]
pub fn current_marker(content: &str) -> Option<StatusMarker> {
    let (start, end) = block_range(content)?;
    content[start..end]
        .lines()
        .find_map(|l| l.trim().strip_prefix("## Status:"))
        .and_then(StatusMarker::parse)
}

fn attempt_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^- (\S+): (resumed|blocked again|completed) at iteration (\d+)$").ok()
    })
    .as_ref()
}

/// Split a block into `### Heading` → body lines.
fn subsections(block: &str) -> Vec<(String, Vec<&str>)> {
    let mut out: Vec<(String, Vec<&str>)> = Vec::new();
    for line in block.lines() {
        if let Some(h) = line.strip_prefix("### ") {
            out.push((h.trim().to_string(), Vec::new()));
        } else if line.trim() == STATUS_END {
            break;
        } else if let Some((_, body)) = out.last_mut() {
            body.push(line);
        }
    }
    out
}

fn log_field<'a>(lines: &[&'a str], name: &str) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|l| l.trim().strip_prefix("- ")?.strip_prefix(name)?.strip_prefix(':'))
        .map(str::trim)
}

/// Parse the BLOCKED section of a task file.
///
/// Returns `Ok(None)` if the file has no status block or it is not BLOCKED.
///
/// # Errors
///
/// Returns [`TaskError::TaskParse`] if a BLOCKED block is malformed.
pub fn parse_blocked_status(path: &Path, content: &str) -> Result<Option<BlockedStatus>> {
    if current_marker(content) != Some(StatusMarker::Blocked) {
        return Ok(None);
    }
    let Some((start, end)) = block_range(content) else {
        return Ok(None);
    };
    let sections = subsections(&content[start..end]);
    let find = |name: &str| {
        sections
            .iter()
            .find(|(h, _)| h == name)
            .map(|(_, body)| body.clone())
    };
    let bad = |reason: &str| TaskError::task_parse(path, format!("malformed BLOCKED section: {reason}"));

    let log = find("Execution Log").ok_or_else(|| bad("missing Execution Log"))?;
    let started_at = log_field(&log, "Started")
        .and_then(parse_ts)
        .ok_or_else(|| bad("bad Started timestamp"))?;
    let blocked_at = log_field(&log, "Blocked")
        .and_then(parse_ts)
        .ok_or_else(|| bad("bad Blocked timestamp"))?;
    let previous_iteration = log_field(&log, "Iterations")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad("bad Iterations count"))?;

    let blocking_issue = find("Blocking Issue")
        .map(|body| body.join("\n").trim().to_string())
        .unwrap_or_default();

    let files_modified = find("Files Modified")
        .unwrap_or_default()
        .iter()
        .filter_map(|l| {
            let item = l.trim().strip_prefix("- ")?.trim();
            if item == "(none)" {
                None
            } else {
                Some(PathBuf::from(item.trim_matches('`')))
            }
        })
        .collect();

    let mut attempt_history = Vec::new();
    for line in find("Resume Attempt History").unwrap_or_default() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let caps = attempt_regex()
            .and_then(|re| re.captures(line))
            .ok_or_else(|| bad("bad resume attempt line"))?;
        let at = parse_ts(&caps[1]).ok_or_else(|| bad("bad resume attempt timestamp"))?;
        let outcome = ResumeOutcome::parse(&caps[2]).ok_or_else(|| bad("bad resume outcome"))?;
        let iteration = caps[3]
            .parse()
            .map_err(|_| bad("bad resume attempt iteration"))?;
        attempt_history.push(ResumeAttempt {
            at,
            outcome,
            iteration,
        });
    }

    Ok(Some(BlockedStatus {
        previous_iteration,
        files_modified,
        blocking_issue,
        started_at,
        blocked_at,
        attempt_history,
    }))
}

// ============================================================================
// File operations
// ============================================================================

/// Read a task file and parse its BLOCKED section.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the section is malformed.
pub async fn load_blocked_status(path: &Path) -> Result<Option<BlockedStatus>> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_blocked_status(path, &content)
}

/// Write `report` into the task file, replacing any previous block.
///
/// # Errors
///
/// Returns an IO error if the file cannot be read or written.
pub async fn write_status(path: &Path, report: &StatusReport) -> Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let updated = replace_status_block(&content, &report.render(path));
    tokio::fs::write(path, updated).await?;
    debug!(task = %path.display(), status = %report.marker(), "Persisted task status");
    Ok(())
}

/// Where a task with `marker` is moved to: `<dir>/<status>/<file>`.
#[must_use]
pub fn status_destination(path: &Path, marker: StatusMarker) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    Some(dir.join(marker.dir_name()).join(file_name))
}

/// Move a task file into its status directory. Returns the new path.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the rename fails.
pub async fn move_to_status_dir(path: &Path, marker: StatusMarker) -> Result<PathBuf> {
    let dest = status_destination(path, marker)
        .ok_or_else(|| TaskError::task_parse(path, "task path has no file name"))?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(path, &dest).await?;
    debug!(from = %path.display(), to = %dest.display(), "Moved task file");
    Ok(dest)
}
