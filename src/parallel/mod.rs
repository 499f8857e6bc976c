//! Parallel coordinator.
//!
//! Runs many tasks against one working tree:
//!
//! 1. Parse every task's allowed scope.
//! 2. [`dependency`] finds pairs whose scopes may overlap.
//! 3. [`waves`] groups tasks so no wave holds a declared conflict.
//! 4. Each wave runs on a bounded pool; [`conflicts`] tracks who touched what.
//! 5. Tasks that hit a runtime conflict and did not succeed are re-run alone, once.

pub mod conflicts;
pub mod dependency;
pub mod waves;

pub use conflicts::{FileOwnership, RuntimeConflict};
pub use dependency::{detect_dependencies, patterns_overlap, Dependency, TaskScope};
pub use waves::partition_waves;

use crate::config::STATE_DIR;
use crate::error::{Result, TaskError};
use crate::executor::{
    ExecutorCallbacks, ExecutorDependencies, ExecutorOptions, ExecutorResult, IterationCallback,
    RunState, RunStatus, TaskExecutor,
};
use crate::task::TaskSpec;
use anyhow::anyhow;
use async_trait::async_trait;
use fs2::FileExt;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Runs a single task. The coordinator owns no executor state itself.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run `task_path` to a result, calling `on_iteration` after each committing pass.
    async fn run_task(&self, task_path: &Path, on_iteration: IterationCallback) -> ExecutorResult;
}

/// A fresh [`TaskExecutor`] per task.
#[derive(Clone)]
pub struct ExecutorRunner {
    project_dir: PathBuf,
    raw_config: toml::Table,
    deps: ExecutorDependencies,
    options: ExecutorOptions,
    callbacks: ExecutorCallbacks,
}

impl ExecutorRunner {
    #[must_use]
    pub fn new(
        project_dir: impl Into<PathBuf>,
        raw_config: toml::Table,
        deps: ExecutorDependencies,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            raw_config,
            deps,
            options: ExecutorOptions::default(),
            callbacks: ExecutorCallbacks::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Callbacks for every task. `on_iteration` is wrapped, not replaced.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: ExecutorCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[async_trait]
impl TaskRunner for ExecutorRunner {
    async fn run_task(&self, task_path: &Path, on_iteration: IterationCallback) -> ExecutorResult {
        let mut callbacks = self.callbacks.clone();
        let outer = callbacks.on_iteration.take();
        callbacks.on_iteration = Some(Arc::new(move |state: &RunState| {
            on_iteration(state);
            if let Some(ref outer) = outer {
                outer(state);
            }
        }));
        TaskExecutor::new(&self.project_dir, self.raw_config.clone(), self.deps.clone())
            .with_options(self.options.clone())
            .with_callbacks(callbacks)
            .run(task_path)
            .await
    }
}

/// Aggregate outcome of a coordinated run.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelExecutionResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    /// One result per task, in input order.
    pub results: Vec<ExecutorResult>,
    pub dependencies: Vec<Dependency>,
    pub conflicts: Vec<RuntimeConflict>,
    pub waves: Vec<Vec<PathBuf>>,
    pub total_iterations: u32,
    /// Union of every task's modified files, first-seen order.
    pub files_modified: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl ParallelExecutionResult {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

/// Holds `.tasksmith/run.lock` for the life of a run.
struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    fn acquire(project_dir: &Path) -> Result<Self> {
        let dir = project_dir.join(STATE_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("run.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            TaskError::Other(anyhow!(
                "Another tasksmith run holds {}; wait for it to finish",
                path.display()
            ))
        })?;
        debug!(lock = %path.display(), "Acquired run lock");
        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}

pub struct ParallelCoordinator {
    project_dir: PathBuf,
    runner: Arc<dyn TaskRunner>,
    concurrency: usize,
}

impl ParallelCoordinator {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            project_dir: project_dir.into(),
            runner,
            concurrency: crate::config::ParallelConfig::default().concurrency,
        }
    }

    /// Tasks in flight at once within a wave. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Static scopes for `task_paths`, plus failed results for unparseable tasks.
    async fn load_scopes(
        &self,
        task_paths: &[PathBuf],
    ) -> (Vec<TaskScope>, HashMap<PathBuf, ExecutorResult>) {
        let mut scopes = Vec::new();
        let mut failed = HashMap::new();
        for path in task_paths {
            match TaskSpec::load(&self.resolve(path)).await {
                Ok(spec) => scopes.push(TaskScope::new(path.clone(), spec.allowed)),
                Err(e) => {
                    warn!(task = %path.display(), error = %e, "Skipping unparseable task");
                    let mut result = ExecutorResult::crashed(path, e.to_string());
                    result.exit_code = e.exit_code();
                    failed.insert(path.clone(), result);
                }
            }
        }
        (scopes, failed)
    }

    /// Move a task that PostFlight filed under a status directory back to
    /// where it was scheduled from.
    async fn restore_task_file(&self, task: &Path, previous: &ExecutorResult) -> Result<()> {
        let original = self.resolve(task);
        let Some(moved) = previous.final_path.as_deref() else {
            return Ok(());
        };
        if moved == original || original.exists() {
            return Ok(());
        }
        tokio::fs::rename(moved, &original)
            .await
            .map_err(|e| TaskError::Other(anyhow!("Failed to move {} back: {e}", moved.display())))?;
        debug!(from = %moved.display(), to = %original.display(), "Restored task file for retry");
        Ok(())
    }

    fn ownership_callback(ownership: &Arc<FileOwnership>, task: &Path) -> IterationCallback {
        let ownership = ownership.clone();
        let task = task.to_path_buf();
        Arc::new(move |state: &RunState| {
            ownership.record(&task, &state.files_modified);
        })
    }

    /// Run one task on its own tokio task so a panic becomes a failed result.
    async fn run_one(
        runner: Arc<dyn TaskRunner>,
        path: PathBuf,
        on_iteration: IterationCallback,
    ) -> (PathBuf, ExecutorResult) {
        let task = path.clone();
        let handle = tokio::spawn(async move { runner.run_task(&task, on_iteration).await });
        match handle.await {
            Ok(result) => (path, result),
            Err(e) => {
                warn!(task = %path.display(), error = %e, "Task execution did not return");
                let result = ExecutorResult::crashed(&path, format!("Task execution failed: {e}"));
                (path, result)
            }
        }
    }

    async fn run_wave(
        &self,
        wave: &[PathBuf],
        ownership: &Arc<FileOwnership>,
    ) -> Vec<(PathBuf, ExecutorResult)> {
        stream::iter(wave.iter().cloned())
            .map(|path| {
                let callback = Self::ownership_callback(ownership, &path);
                Self::run_one(self.runner.clone(), path, callback)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// Run every task and aggregate the results.
    ///
    /// # Errors
    ///
    /// Fails only when the run lock cannot be taken. Task failures are part of
    /// the returned result.
    pub async fn run(&self, task_paths: &[PathBuf]) -> Result<ParallelExecutionResult> {
        let started = Instant::now();
        let _lock = RunLock::acquire(&self.project_dir)?;

        let (scopes, mut results) = self.load_scopes(task_paths).await;
        let dependencies = detect_dependencies(&scopes);
        let scheduled: Vec<PathBuf> = scopes.iter().map(|s| s.path.clone()).collect();
        let waves = partition_waves(&scheduled, &dependencies);
        info!(
            tasks = task_paths.len(),
            dependencies = dependencies.len(),
            waves = waves.len(),
            concurrency = self.concurrency,
            "Starting coordinated run"
        );

        let ownership = Arc::new(FileOwnership::new());
        for (n, wave) in waves.iter().enumerate() {
            ownership.reset();
            info!(wave = n + 1, tasks = wave.len(), "Starting wave");
            for (path, result) in self.run_wave(wave, &ownership).await {
                results.insert(path, result);
            }

            for task in ownership.flagged() {
                let Some(previous) = results.get(&task) else {
                    continue;
                };
                if previous.success {
                    continue;
                }
                if let Err(e) = self.restore_task_file(&task, previous).await {
                    warn!(task = %task.display(), error = %e, "Cannot restore task file; not re-running");
                    continue;
                }
                info!(task = %task.display(), "Re-running task after runtime conflict");
                let callback = Self::ownership_callback(&ownership, &task);
                let (path, result) = Self::run_one(self.runner.clone(), task, callback).await;
                results.insert(path, result);
            }
        }

        let ordered: Vec<ExecutorResult> = task_paths
            .iter()
            .filter_map(|p| results.remove(p))
            .collect();
        let outcome = aggregate(
            ordered,
            dependencies,
            ownership.conflicts(),
            waves,
            started.elapsed().as_millis() as u64,
        );
        info!(
            total = outcome.total,
            succeeded = outcome.succeeded,
            blocked = outcome.blocked,
            failed = outcome.failed,
            conflicts = outcome.conflicts.len(),
            iterations = outcome.total_iterations,
            files = outcome.files_modified.len(),
            "Coordinated run finished"
        );
        Ok(outcome)
    }
}

fn aggregate(
    results: Vec<ExecutorResult>,
    dependencies: Vec<Dependency>,
    conflicts: Vec<RuntimeConflict>,
    waves: Vec<Vec<PathBuf>>,
    duration_ms: u64,
) -> ParallelExecutionResult {
    let succeeded = results.iter().filter(|r| r.success).count();
    let blocked = results
        .iter()
        .filter(|r| !r.success && r.status == RunStatus::Blocked)
        .count();
    let total = results.len();

    let files_modified = {
        let mut seen = HashSet::new();
        results
            .iter()
            .flat_map(|r| r.files_modified.iter())
            .filter(|f| seen.insert(*f))
            .cloned()
            .collect()
    };

    ParallelExecutionResult {
        total,
        succeeded,
        failed: total - succeeded - blocked,
        blocked,
        total_iterations: results.iter().map(|r| r.iterations).sum(),
        results,
        dependencies,
        conflicts,
        waves,
        files_modified,
        duration_ms,
    }
}

#[cfg(test)]
mod tests;
