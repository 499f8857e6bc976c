//! PostFlight: turn a loop outcome into persisted status and a result.
//!
//! Every side effect here is best-effort. A failed write, rename, push or
//! notification is logged and the run result stays as computed.

use super::iteration::LoopOutcome;
use super::preflight::Prepared;
use super::state::{RunState, RunStatus, TerminationReason};
use super::tokens::TokenSummary;
use crate::error::{ErrorCode, TaskError};
use crate::notify::Notification;
use crate::task::status::now;
use crate::task::{
    move_to_status_dir, write_status, BlockedStatus, CompletionRecord, ExecutionHistory,
    FailureRecord, ResumeAttempt, ResumeOutcome, StatusReport,
};
use crate::vcs::VcsOperations;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Final, immutable result of one task run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorResult {
    pub success: bool,
    pub status: RunStatus,
    pub iterations: u32,
    pub files_modified: Vec<PathBuf>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub blocked_reason: Option<String>,
    pub task_path: PathBuf,
    /// Where the task file ended up after a terminal move.
    pub final_path: Option<PathBuf>,
    pub termination: Option<TerminationReason>,
    pub token_usage: Option<TokenSummary>,
    /// Process exit code a CLI should report for this run.
    pub exit_code: i32,
}

impl ExecutorResult {
    /// Result for a run that never got past PreFlight.
    #[must_use]
    pub fn preflight_failure(task_path: &Path, state: &RunState, error: &TaskError) -> Self {
        Self {
            success: false,
            status: RunStatus::Failed,
            iterations: state.iteration,
            files_modified: state.files_modified.clone(),
            error: Some(error.to_string()),
            error_code: None,
            blocked_reason: None,
            task_path: task_path.to_path_buf(),
            final_path: None,
            termination: None,
            token_usage: None,
            exit_code: error.exit_code(),
        }
    }

    /// Synthetic failure for a task whose execution never returned a result.
    #[must_use]
    pub fn crashed(task_path: &Path, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: RunStatus::Failed,
            iterations: 0,
            files_modified: Vec::new(),
            error: Some(message.into()),
            error_code: None,
            blocked_reason: None,
            task_path: task_path.to_path_buf(),
            final_path: None,
            termination: None,
            token_usage: None,
            exit_code: 1,
        }
    }
}

/// Inputs PostFlight reads but does not own.
pub struct PostFlight<'a> {
    pub project_dir: &'a Path,
    pub task_path: &'a Path,
    pub prepared: &'a Prepared,
    pub vcs: &'a dyn VcsOperations,
    pub dry_run: bool,
}

impl PostFlight<'_> {
    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(self.project_dir).unwrap_or(path)
    }

    fn blocked_reason(&self, outcome: &LoopOutcome, state: &RunState) -> Option<String> {
        let execution = &self.prepared.config.execution;
        match outcome.termination {
            TerminationReason::Blocked => outcome.blocked_reason.clone(),
            TerminationReason::MaxIterations => Some(format!(
                "Max iterations ({}) reached without completion",
                execution.max_iterations
            )),
            TerminationReason::MaxFailures => Some(format!(
                "Max consecutive failures ({}) reached: {}",
                execution.max_consecutive_failures,
                state.last_error.as_deref().unwrap_or("unknown error")
            )),
            _ => None,
        }
    }

    fn started_at(&self, state: &RunState) -> chrono::DateTime<chrono::Utc> {
        match self.prepared.blocked_status {
            Some(ref blocked) => blocked.started_at,
            None => state.started_at.unwrap_or_else(now),
        }
    }

    fn status_report(&self, state: &RunState, reason: Option<&str>) -> Option<StatusReport> {
        let completed_at = state.completed_at.unwrap_or_else(now);
        let previous = self.prepared.blocked_status.as_ref();
        let mut attempts = previous
            .map(|b| b.attempt_history.clone())
            .unwrap_or_default();

        match state.status {
            RunStatus::Blocked => {
                if previous.is_some() {
                    attempts.push(ResumeAttempt::new(ResumeOutcome::BlockedAgain, state.iteration));
                }
                Some(StatusReport::Blocked(BlockedStatus {
                    previous_iteration: state.iteration,
                    files_modified: state.files_modified.clone(),
                    blocking_issue: reason.unwrap_or("Blocked").to_string(),
                    started_at: self.started_at(state),
                    blocked_at: completed_at,
                    attempt_history: attempts,
                }))
            }
            RunStatus::Completed => {
                let history = previous.map(|b| ExecutionHistory {
                    originally_blocked_at: b.blocked_at,
                    blocked_iteration: b.previous_iteration,
                    blocking_issue: b.blocking_issue.clone(),
                    resumed_at: b.last_resumed_at(),
                    completed_at,
                    completed_iteration: state.iteration,
                    resume_attempts: b.resume_count(),
                });
                if previous.is_some() {
                    attempts.push(ResumeAttempt::new(ResumeOutcome::Completed, state.iteration));
                }
                Some(StatusReport::Completed(CompletionRecord {
                    started_at: self.started_at(state),
                    completed_at,
                    iterations: state.iteration,
                    files_modified: state.files_modified.clone(),
                    history,
                    attempt_history: attempts,
                }))
            }
            RunStatus::Failed => Some(StatusReport::Failed(FailureRecord {
                started_at: self.started_at(state),
                failed_at: completed_at,
                iterations: state.iteration,
                error: state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
                files_modified: state.files_modified.clone(),
            })),
            _ => None,
        }
    }

    /// Write the status block, then move completed and failed tasks aside.
    async fn persist(&self, report: &StatusReport) -> Option<PathBuf> {
        if let Err(e) = write_status(self.task_path, report).await {
            warn!(task = %self.task_path.display(), error = %e, "Failed to persist task status");
            return None;
        }
        if matches!(report, StatusReport::Blocked(_)) {
            return None;
        }

        let dest = match move_to_status_dir(self.task_path, report.marker()).await {
            Ok(dest) => dest,
            Err(e) => {
                warn!(task = %self.task_path.display(), error = %e, "Failed to move task file");
                return None;
            }
        };
        if let Err(e) = self
            .vcs
            .stage_rename(self.relative(self.task_path), self.relative(&dest))
            .await
        {
            warn!(to = %dest.display(), error = %e, "Failed to stage task move");
        }
        Some(dest)
    }

    async fn push(&self) {
        let config = &self.prepared.config;
        let checks = self.prepared.quality.pre_push().await;
        if !checks.passed {
            warn!(
                failures = checks.failures().count(),
                "Pre-push checks failed; not pushing"
            );
            return;
        }
        let refspec = format!(
            "HEAD:refs/heads/{}{}",
            config.git.branch_prefix,
            self.prepared.context.task.slug()
        );
        match self.vcs.push(&config.git.remote, &refspec).await {
            Ok(()) => info!(remote = %config.git.remote, %refspec, "Pushed"),
            Err(e) => warn!(remote = %config.git.remote, error = %e, "Push failed"),
        }
    }
}

/// Interpret the loop outcome, persist it and build the result.
pub async fn finish(post: PostFlight<'_>, state: &mut RunState, outcome: LoopOutcome) -> ExecutorResult {
    let blocked_reason = post.blocked_reason(&outcome, state);

    state.status = match outcome.termination {
        TerminationReason::Completed => RunStatus::Completed,
        TerminationReason::Blocked
        | TerminationReason::MaxIterations
        | TerminationReason::MaxFailures => RunStatus::Blocked,
        TerminationReason::Aborted => RunStatus::Failed,
        TerminationReason::DryRun => RunStatus::Idle,
    };
    state.completed_at = Some(now());
    if let Some(ref reason) = blocked_reason {
        state.last_error = Some(reason.clone());
    }

    let mut final_path = None;
    if !post.dry_run {
        if let Some(report) = post.status_report(state, blocked_reason.as_deref()) {
            final_path = post.persist(&report).await;
        }
        if state.status == RunStatus::Completed && post.prepared.config.permissions.auto_push {
            post.push().await;
        }
    } else if let Some(ref prompt) = outcome.dry_run_prompt {
        debug!(chars = prompt.len(), "Dry run prompt:\n{prompt}");
    }

    let token_usage = TokenSummary::new(
        post.prepared.breakdown.clone(),
        state.token_usage,
        &post.prepared.config.cost,
    );
    let success = matches!(
        outcome.termination,
        TerminationReason::Completed | TerminationReason::DryRun
    );
    let error = match state.status {
        RunStatus::Failed => state.last_error.clone(),
        _ => None,
    };

    let result = ExecutorResult {
        success,
        status: state.status,
        iterations: state.iteration,
        files_modified: state.files_modified.clone(),
        error,
        error_code: outcome.error_code,
        blocked_reason,
        task_path: post.task_path.to_path_buf(),
        final_path,
        termination: Some(outcome.termination),
        token_usage: Some(token_usage),
        exit_code: if success { 0 } else { 1 },
    };

    info!(
        task = %post.task_path.display(),
        status = %result.status,
        termination = %outcome.termination,
        iterations = result.iterations,
        files = result.files_modified.len(),
        tokens = state.token_usage.total(),
        "Task finished"
    );

    if !post.dry_run {
        if let Some(notification) = Notification::from_result(&result) {
            post.prepared.notifier.notify(&notification).await;
        }
    }
    result
}
