//! Mock implementations of the collaborator traits.
//!
//! These mocks provide controllable test doubles for the agent, version
//! control, quality checks, context loading and notifications, enabling
//! deterministic executor and coordinator tests.

use crate::context::{ContextLoader, LoadedContext};
use crate::notify::{Notification, Notifier};
use crate::provider::{AgentProvider, ExecuteOptions, ExecutionResult};
use crate::quality::{CommandResult, QualityGate, ValidationPhase, ValidationSummary};
use crate::scope::FileChange;
use crate::task::{strip_status_block, TaskSpec};
use crate::vcs::VcsOperations;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Agent provider
// ============================================================================

/// What a [`ScriptedProvider`] saw on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub prompt: String,
    pub continue_session: bool,
    pub had_conversation: bool,
}

/// Replays queued results in order, then repeats a fallback.
///
/// # Example
///
/// ```rust,ignore
/// let provider = ScriptedProvider::new()
///     .then(ExecutionResult::from_output("working".into(), vec![]))
///     .then(ExecutionResult::from_output("<promise>COMPLETE</promise>".into(), vec![]));
/// ```
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ExecutionResult>>,
    fallback: ExecutionResult,
    delay: Option<Duration>,
    available: bool,
    calls: Mutex<Vec<ProviderCall>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ExecutionResult::from_output("Still working.".into(), Vec::new()),
            delay: None,
            available: true,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next result.
    #[must_use]
    pub fn then(self, result: ExecutionResult) -> Self {
        lock(&self.script).push_back(result);
        self
    }

    /// Result returned once the script is exhausted.
    #[must_use]
    pub fn with_fallback(mut self, result: ExecutionResult) -> Self {
        self.fallback = result;
        self
    }

    /// Sleep before answering each call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> ExecutionResult {
        lock(&self.calls).push(ProviderCall {
            prompt: prompt.to_string(),
            continue_session: options.continue_session,
            had_conversation: options.conversation.is_some(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

// ============================================================================
// Version control
// ============================================================================

#[derive(Debug, Default)]
struct VcsLog {
    changed: Vec<FileChange>,
    commits: Vec<(String, Vec<PathBuf>)>,
    reverted: Vec<PathBuf>,
    pushes: Vec<(String, String)>,
    renames: Vec<(PathBuf, PathBuf)>,
}

/// In-memory version control that records every call.
#[derive(Debug, Default)]
pub struct MockVcs {
    log: Mutex<VcsLog>,
    commit_error: Option<String>,
    revert_error: Option<String>,
    push_error: Option<String>,
}

impl MockVcs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Files reported by `changed_files`.
    #[must_use]
    pub fn with_changed_files(self, files: Vec<FileChange>) -> Self {
        lock(&self.log).changed = files;
        self
    }

    #[must_use]
    pub fn with_commit_error(mut self, error: &str) -> Self {
        self.commit_error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn with_revert_error(mut self, error: &str) -> Self {
        self.revert_error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn with_push_error(mut self, error: &str) -> Self {
        self.push_error = Some(error.to_string());
        self
    }

    /// `(message, files)` for every commit made.
    pub fn commits(&self) -> Vec<(String, Vec<PathBuf>)> {
        lock(&self.log).commits.clone()
    }

    pub fn reverted(&self) -> Vec<PathBuf> {
        lock(&self.log).reverted.clone()
    }

    /// `(remote, refspec)` for every push.
    pub fn pushes(&self) -> Vec<(String, String)> {
        lock(&self.log).pushes.clone()
    }

    pub fn renames(&self) -> Vec<(PathBuf, PathBuf)> {
        lock(&self.log).renames.clone()
    }
}

#[async_trait]
impl VcsOperations for MockVcs {
    async fn changed_files(&self) -> Result<Vec<FileChange>> {
        Ok(lock(&self.log).changed.clone())
    }

    async fn add(&self, _files: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    async fn commit(&self, message: &str, files: &[PathBuf]) -> Result<String> {
        if let Some(ref error) = self.commit_error {
            bail!("{error}");
        }
        let mut log = lock(&self.log);
        log.changed.retain(|c| !files.contains(&c.path));
        log.commits.push((message.to_string(), files.to_vec()));
        Ok(format!("mock{:04}", log.commits.len()))
    }

    async fn revert_files(&self, files: &[PathBuf]) -> Result<()> {
        if let Some(ref error) = self.revert_error {
            bail!("{error}");
        }
        let mut log = lock(&self.log);
        log.changed.retain(|c| !files.contains(&c.path));
        log.reverted.extend(files.iter().cloned());
        Ok(())
    }

    async fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        if let Some(ref error) = self.push_error {
            bail!("{error}");
        }
        lock(&self.log)
            .pushes
            .push((remote.to_string(), refspec.to_string()));
        Ok(())
    }

    async fn stage_rename(&self, from: &Path, to: &Path) -> Result<()> {
        lock(&self.log)
            .renames
            .push((from.to_path_buf(), to.to_path_buf()));
        Ok(())
    }
}

// ============================================================================
// Quality checks
// ============================================================================

/// Pre-commit outcomes replayed in order; passes once the queue is empty.
#[derive(Debug, Default)]
pub struct MockQualityChecker {
    pre_commit: Mutex<VecDeque<bool>>,
    pre_push_passes: bool,
    pre_commit_calls: AtomicU32,
    pre_push_calls: AtomicU32,
}

impl MockQualityChecker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pre_push_passes: true,
            ..Self::default()
        }
    }

    /// Queue pre-commit outcomes.
    #[must_use]
    pub fn with_pre_commit_results(self, results: &[bool]) -> Self {
        lock(&self.pre_commit).extend(results.iter().copied());
        self
    }

    #[must_use]
    pub fn with_pre_push_failure(mut self) -> Self {
        self.pre_push_passes = false;
        self
    }

    pub fn pre_commit_calls(&self) -> u32 {
        self.pre_commit_calls.load(Ordering::SeqCst)
    }

    pub fn pre_push_calls(&self) -> u32 {
        self.pre_push_calls.load(Ordering::SeqCst)
    }

    fn summary(phase: ValidationPhase, passed: bool) -> ValidationSummary {
        let result = if passed {
            CommandResult::pass("mock check")
        } else {
            CommandResult::fail("mock check", Some(1), "mock check failed: 2 tests failing")
        };
        ValidationSummary::from_results(phase, vec![result])
    }
}

#[async_trait]
impl QualityGate for MockQualityChecker {
    async fn pre_commit(&self) -> ValidationSummary {
        self.pre_commit_calls.fetch_add(1, Ordering::SeqCst);
        let passed = lock(&self.pre_commit).pop_front().unwrap_or(true);
        Self::summary(ValidationPhase::PreCommit, passed)
    }

    async fn pre_push(&self) -> ValidationSummary {
        self.pre_push_calls.fetch_add(1, Ordering::SeqCst);
        Self::summary(ValidationPhase::PrePush, self.pre_push_passes)
    }
}

// ============================================================================
// Context loading
// ============================================================================

/// Parses the task file on every load and attaches fixed extras.
#[derive(Debug, Clone, Default)]
pub struct StaticContextLoader {
    project_identity: Option<String>,
    error: Option<String>,
}

impl StaticContextLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_project_identity(mut self, identity: &str) -> Self {
        self.project_identity = Some(identity.to_string());
        self
    }

    /// Fail every load with `error`.
    #[must_use]
    pub fn failing(error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ContextLoader for StaticContextLoader {
    async fn load(&self, task_path: &Path) -> Result<LoadedContext> {
        if let Some(ref error) = self.error {
            bail!("{error}");
        }
        let raw = tokio::fs::read_to_string(task_path).await?;
        let task = TaskSpec::parse(task_path, &raw)?;
        Ok(LoadedContext {
            project_identity: self.project_identity.clone(),
            role: None,
            task_markdown: strip_status_block(&raw),
            task,
            plan: None,
            skills: Vec::new(),
        })
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.received).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        lock(&self.received).push(notification.clone());
    }
}
