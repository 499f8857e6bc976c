//! The execution loop.
//!
//! Each pass runs prompt → provider → scope check → validation → commit →
//! completion check. The loop guard is
//! `iteration < limit && consecutive_failures < max && status == running`.
//! `iteration` is incremented once at the top of every pass, before any side
//! effect; `consecutive_failures` is incremented by at most one failure mode per
//! pass and reset only by a pass that reaches the commit step.
//!
//! In-scope files from a pass that fails validation or the scope check stay
//! pending and go into the next successful commit. On resume `iteration`
//! continues from the blocked pass, so `limit` is offset by that start.

use super::prompt::{build_continuation_prompt, build_full_prompt};
use super::state::{IterationState, RunState, RunStatus, TerminationReason};
use super::ExecutorCallbacks;
use crate::config::RunnerConfig;
use crate::context::LoadedContext;
use crate::error::{ErrorCode, FailurePolicy};
use crate::provider::{
    AgentProvider, ConversationState, ExecuteOptions, ExecutionResult, ProviderError,
};
use crate::quality::{format_report, QualityGate};
use crate::scope::{FileChange, ScopeAction, ScopeGuard};
use crate::vcs::VcsOperations;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub termination: TerminationReason,
    /// Agent-supplied reason for an explicit block.
    pub blocked_reason: Option<String>,
    /// Code of the failure that aborted the loop.
    pub error_code: Option<ErrorCode>,
    /// The prompt a dry run would have sent.
    pub dry_run_prompt: Option<String>,
}

impl LoopOutcome {
    fn new(termination: TerminationReason) -> Self {
        Self {
            termination,
            blocked_reason: None,
            error_code: None,
            dry_run_prompt: None,
        }
    }
}

/// What the rest of a pass should do after a step.
enum Step {
    Proceed,
    /// Failure already accounted for; start the next pass.
    NextPass,
    Stop(LoopOutcome),
}

pub struct ExecutionLoop<'a> {
    pub config: &'a RunnerConfig,
    pub context: &'a LoadedContext,
    pub provider: &'a dyn AgentProvider,
    pub quality: &'a dyn QualityGate,
    pub vcs: &'a dyn VcsOperations,
    pub guard: &'a mut ScopeGuard,
    pub callbacks: &'a ExecutorCallbacks,
    pub skip_permissions: bool,
    pub dry_run: bool,
    /// Absolute bound on `RunState::iteration`. A resumed run starts from the
    /// blocked iteration, so this is that iteration plus `max_iterations` and
    /// the final count may exceed `max_iterations`.
    pub iteration_limit: u32,
    pub pause: watch::Receiver<bool>,
    pub snapshot: &'a Mutex<RunState>,
}

impl ExecutionLoop<'_> {
    /// Drive passes until a stop condition or a guard fails.
    pub async fn run(mut self, state: &mut RunState, iter: &mut IterationState) -> LoopOutcome {
        let max_failures = self.config.execution.max_consecutive_failures;
        state.status = RunStatus::Running;
        self.publish(state);

        while state.iteration < self.iteration_limit
            && iter.consecutive_failures < max_failures
            && state.status == RunStatus::Running
        {
            self.wait_while_paused(state).await;

            state.iteration += 1;
            let n = state.iteration;
            info!(iteration = n, task = %self.context.task.path.display(), "Starting iteration");
            self.callbacks.phase("starting", n, state.files_modified.len());
            self.publish(state);

            match self.pass(state, iter).await {
                Step::Proceed | Step::NextPass => {}
                Step::Stop(outcome) => {
                    state.add_files(std::mem::take(&mut iter.pending_files));
                    self.publish(state);
                    return outcome;
                }
            }
            self.publish(state);
        }

        state.add_files(std::mem::take(&mut iter.pending_files));
        let termination = if iter.consecutive_failures >= max_failures {
            TerminationReason::MaxFailures
        } else {
            TerminationReason::MaxIterations
        };
        info!(
            iteration = state.iteration,
            failures = iter.consecutive_failures,
            %termination,
            "Loop budget exhausted"
        );
        LoopOutcome::new(termination)
    }

    async fn pass(&mut self, state: &mut RunState, iter: &mut IterationState) -> Step {
        let n = state.iteration;

        let continuing = n > 1
            && self.config.execution.session_continuation
            && iter.conversation.is_some();
        let prompt = self.prompt(continuing, iter);

        if self.dry_run {
            info!(iteration = n, chars = prompt.len(), "Dry run: provider not invoked");
            let mut outcome = LoopOutcome::new(TerminationReason::DryRun);
            outcome.dry_run_prompt = Some(prompt);
            return Step::Stop(outcome);
        }

        self.callbacks.phase("executing", n, 0);
        let had_conversation = iter.conversation.is_some();
        let mut result = self.invoke(&prompt, continuing, iter).await;

        if continuing
            && !result.success
            && !result.iteration_complete
            && result.blocking_reason().is_none()
        {
            warn!(iteration = n, error = ?result.error, "Continuation failed; retrying with full prompt");
            iter.conversation = None;
            let full = self.prompt(false, iter);
            result = self.invoke(&full, false, iter).await;
        }

        // Carried forward whatever the outcome.
        if !result.output.trim().is_empty() {
            iter.previous_output = Some(result.output.clone());
        }
        iter.conversation = match result.conversation_state.clone() {
            Some(handle) => Some(handle),
            None if had_conversation => Some(ConversationState::continue_anyway()),
            None => None,
        };
        if let Some(usage) = result.token_usage {
            state.token_usage += usage;
        }

        if result.is_pure_failure() {
            return self.handle_provider_failure(&result, state, iter).await;
        }

        let mut changed = result.files_changed.clone();
        match self.check_scope(&mut changed, &result, state, iter).await {
            Step::Proceed => {}
            other => return other,
        }

        let current: Vec<PathBuf> = changed.iter().map(|c| c.path.clone()).collect();
        if let Some(reason) = result.blocking_reason() {
            state.add_files(iter.with_pending(&current));
            iter.pending_files.clear();
            return self.stop_blocked(reason, state);
        }

        self.callbacks.phase("validating", n, changed.len());
        let summary = self.quality.pre_commit().await;
        let passed = summary.passed;
        let report = format_report(&summary);
        state.validation_results.push(summary);
        if !passed {
            if result.iteration_complete {
                info!(iteration = n, "Completion signaled but validation failed; reporting back");
            } else {
                debug!(iteration = n, "Validation failed");
            }
            iter.last_validation_error = Some(report);
            iter.remember(current);
            self.count_failure(state, iter, ErrorCode::ValidationFailed, "Validation failed");
            return Step::NextPass;
        }
        iter.last_validation_error = None;

        let paths = iter.with_pending(&current);
        if self.config.permissions.auto_commit && !paths.is_empty() {
            self.callbacks.phase("committing", n, paths.len());
            let message = format!(
                "{}{}",
                self.config.git.commit_prefix,
                self.context.task.short_goal(self.config.git.max_goal_chars)
            );
            match self.vcs.commit(&message, &paths).await {
                Ok(hash) => debug!(iteration = n, commit = %hash, files = paths.len(), "Committed"),
                Err(e) => {
                    state.add_files(paths.iter().cloned());
                    iter.remember(paths);
                    let message = format!("Commit failed: {e}");
                    self.count_failure(state, iter, ErrorCode::CommitFailed, &message);
                    return Step::NextPass;
                }
            }
        }
        state.add_files(paths);
        iter.pending_files.clear();

        iter.consecutive_failures = 0;
        state.last_error = None;
        if let Some(ref on_iteration) = self.callbacks.on_iteration {
            on_iteration(&*state);
        }

        if result.iteration_complete {
            info!(
                iteration = n,
                signal = result.completion_signal.as_deref().unwrap_or_default(),
                "Task completed"
            );
            state.status = RunStatus::Completed;
            return Step::Stop(LoopOutcome::new(TerminationReason::Completed));
        }
        Step::Proceed
    }

    fn prompt(&self, continuing: bool, iter: &IterationState) -> String {
        let feedback = iter.last_validation_error.as_deref();
        if continuing {
            build_continuation_prompt(iter.previous_output.as_deref(), feedback)
        } else {
            build_full_prompt(self.context, iter.blocked_status.as_ref(), feedback)
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self.config.execution.timeout_per_iteration_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    async fn invoke(
        &self,
        prompt: &str,
        continuing: bool,
        iter: &IterationState,
    ) -> ExecutionResult {
        let timeout = self.timeout();
        let options = ExecuteOptions {
            timeout,
            skip_permissions: self.skip_permissions,
            continue_session: continuing,
            conversation: if continuing {
                iter.conversation.clone()
            } else {
                None
            },
            on_output: self.callbacks.on_output.clone(),
            trim: self.config.execution.conversation.clone(),
        };

        let call = self.provider.execute(prompt, &options);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs(), "Provider call timed out");
                    ExecutionResult::failed(&ProviderError::Timeout { timeout: limit })
                }
            },
            None => call.await,
        }
    }

    async fn handle_provider_failure(
        &self,
        result: &ExecutionResult,
        state: &mut RunState,
        iter: &mut IterationState,
    ) -> Step {
        if let Some(reason) = result.blocking_reason() {
            return self.stop_blocked(reason, state);
        }

        let code = result.error_code.unwrap_or(ErrorCode::Unknown);
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "Provider failed".to_string());

        match code.policy() {
            FailurePolicy::Abort => self.abort(code, message, state),
            FailurePolicy::RetryUncounted => {
                state.last_error = Some(message);
                let backoff = self.config.execution.rate_limit_backoff_secs;
                warn!(code = %code, backoff_secs = backoff, "Provider throttled; not counted as a failure");
                if backoff > 0 {
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
                Step::NextPass
            }
            FailurePolicy::RetryCounted => {
                self.count_failure(state, iter, code, &message);
                Step::NextPass
            }
        }
    }

    async fn check_scope(
        &mut self,
        changed: &mut Vec<FileChange>,
        result: &ExecutionResult,
        state: &mut RunState,
        iter: &mut IterationState,
    ) -> Step {
        if changed.is_empty() {
            return Step::Proceed;
        }
        let n = state.iteration;
        self.callbacks.phase("scope", n, changed.len());
        let decision = self.guard.validate(changed);

        match decision.action {
            ScopeAction::Allow => Step::Proceed,
            ScopeAction::Block => {
                warn!(iteration = n, files = ?decision.files, reason = %decision.reason, "Scope violation");
                if let Step::Stop(outcome) = self.revert(&decision.files, state).await {
                    return Step::Stop(outcome);
                }
                iter.forget(&decision.files);
                changed.retain(|c| !decision.files.contains(&c.path));
                if result.iteration_complete || result.blocking_reason().is_some() {
                    info!(iteration = n, "Violations reverted; keeping the rest of the pass");
                    return Step::Proceed;
                }
                iter.last_validation_error = Some(format!(
                    "## Scope violation\n\n{}\n\nReverted:\n{}",
                    decision.reason,
                    bullet_list(&decision.files)
                ));
                iter.remember(changed.iter().map(|c| c.path.clone()));
                let code = decision.code.unwrap_or(ErrorCode::OutsideAllowed);
                self.count_failure(state, iter, code, &decision.reason);
                Step::NextPass
            }
            ScopeAction::AskUser => {
                let approved = match self.callbacks.on_ask_user {
                    Some(ref ask) => ask(decision.reason.clone(), decision.files.clone()).await,
                    None => false,
                };
                if approved {
                    info!(iteration = n, files = decision.files.len(), "Out-of-scope files approved");
                    self.guard.approve(decision.files.iter().cloned());
                    return Step::Proceed;
                }
                warn!(iteration = n, files = ?decision.files, "Out-of-scope files denied");
                if let Step::Stop(outcome) = self.revert(&decision.files, state).await {
                    return Step::Stop(outcome);
                }
                iter.forget(&decision.files);
                changed.retain(|c| !decision.files.contains(&c.path));
                iter.remember(changed.iter().map(|c| c.path.clone()));
                self.count_failure(state, iter, ErrorCode::UserDenied, &decision.reason);
                Step::NextPass
            }
        }
    }

    async fn revert(&self, files: &[PathBuf], state: &mut RunState) -> Step {
        match self.vcs.revert_files(files).await {
            Ok(()) => Step::Proceed,
            Err(e) => self.abort(
                ErrorCode::RevertFailed,
                format!("Failed to revert out-of-scope files: {e}"),
                state,
            ),
        }
    }

    fn count_failure(
        &self,
        state: &mut RunState,
        iter: &mut IterationState,
        code: ErrorCode,
        message: &str,
    ) {
        iter.consecutive_failures += 1;
        state.last_error = Some(message.to_string());
        warn!(
            iteration = state.iteration,
            code = %code,
            failures = iter.consecutive_failures,
            "Pass failed: {message}"
        );
    }

    fn abort(&self, code: ErrorCode, message: String, state: &mut RunState) -> Step {
        warn!(code = %code, "Aborting: {message}");
        state.status = RunStatus::Failed;
        state.last_error = Some(message);
        let mut outcome = LoopOutcome::new(TerminationReason::Aborted);
        outcome.error_code = Some(code);
        Step::Stop(outcome)
    }

    fn stop_blocked(&self, reason: &str, state: &mut RunState) -> Step {
        info!(iteration = state.iteration, reason, "Agent reported it is blocked");
        state.status = RunStatus::Blocked;
        state.last_error = Some(reason.to_string());
        let mut outcome = LoopOutcome::new(TerminationReason::Blocked);
        outcome.blocked_reason = Some(reason.to_string());
        Step::Stop(outcome)
    }

    async fn wait_while_paused(&mut self, state: &mut RunState) {
        if !*self.pause.borrow() {
            return;
        }
        info!(iteration = state.iteration, "Paused");
        state.status = RunStatus::Paused;
        self.publish(state);
        if self.pause.wait_for(|paused| !*paused).await.is_err() {
            debug!("Pause channel closed; continuing");
        }
        state.status = RunStatus::Running;
        self.publish(state);
        info!(iteration = state.iteration, "Resumed");
    }

    fn publish(&self, state: &RunState) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
    }
}

fn bullet_list(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| format!("- {}", f.display()))
        .collect::<Vec<_>>()
        .join("\n")
}
