//! Single-task executor.
//!
//! A run is three fixed stages sharing one [`RunState`]:
//!
//! 1. [`preflight`] resolves config, loads context, restores resume state and
//!    builds the scope guard, validator and provider.
//! 2. [`iteration`] drives the agent pass by pass.
//! 3. [`postflight`] interprets the termination, persists status and reports.
//!
//! PreFlight failures end the run as `failed` without retries. The loop never
//! returns an error; every pass failure is absorbed by its category policy.

pub mod iteration;
pub mod postflight;
pub mod preflight;
pub mod prompt;
pub mod state;
pub mod tokens;

pub use iteration::{ExecutionLoop, LoopOutcome};
pub use postflight::ExecutorResult;
pub use preflight::Prepared;
pub use state::{IterationState, RunState, RunStatus, TerminationReason};
pub use tokens::TokenSummary;

use crate::context::ContextLoader;
use crate::notify::{Notification, Notifier};
use crate::provider::{AgentProvider, OutputCallback};
use crate::quality::QualityGate;
use crate::task::status::now;
use crate::vcs::{GitVcs, VcsOperations};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

/// Called after every committing pass with a state snapshot.
pub type IterationCallback = Arc<dyn Fn(&RunState) + Send + Sync>;

/// Called as a pass moves through its phases: `(phase, iteration, files)`.
pub type PhaseCallback = Arc<dyn Fn(&str, u32, usize) + Send + Sync>;

/// Asked whether out-of-scope files may be kept: `(reason, files)`.
pub type AskUserCallback =
    Arc<dyn Fn(String, Vec<PathBuf>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Environment lookup used for `${NAME}` substitution.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExecutorCallbacks {
    pub on_iteration: Option<IterationCallback>,
    pub on_phase: Option<PhaseCallback>,
    /// Absent means every request is denied.
    pub on_ask_user: Option<AskUserCallback>,
    pub on_output: Option<OutputCallback>,
}

impl ExecutorCallbacks {
    pub(crate) fn phase(&self, name: &str, iteration: u32, files: usize) {
        if let Some(ref on_phase) = self.on_phase {
            on_phase(name, iteration, files);
        }
    }
}

/// Collaborators for a run.
///
/// `None` fields are built in PreFlight from the resolved config.
#[derive(Clone)]
pub struct ExecutorDependencies {
    pub vcs: Arc<dyn VcsOperations>,
    pub context_loader: Option<Arc<dyn ContextLoader>>,
    pub provider: Option<Arc<dyn AgentProvider>>,
    pub quality: Option<Arc<dyn QualityGate>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub env: EnvLookup,
}

impl ExecutorDependencies {
    /// Git in `project_dir`, everything else from config.
    #[must_use]
    pub fn real(project_dir: &Path) -> Self {
        Self {
            vcs: Arc::new(GitVcs::new(project_dir)),
            context_loader: None,
            provider: None,
            quality: None,
            notifier: None,
            env: Arc::new(|name: &str| std::env::var(name).ok()),
        }
    }

    #[must_use]
    pub fn with_vcs(mut self, vcs: Arc<dyn VcsOperations>) -> Self {
        self.vcs = vcs;
        self
    }

    #[must_use]
    pub fn with_context_loader(mut self, loader: Arc<dyn ContextLoader>) -> Self {
        self.context_loader = Some(loader);
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn AgentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: Arc<dyn QualityGate>) -> Self {
        self.quality = Some(quality);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }
}

/// Values that win over the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub max_iterations: Option<u32>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Continue a task with a BLOCKED section.
    pub resume: bool,
    /// Build the first prompt and stop without calling the provider.
    pub dry_run: bool,
    pub overrides: ConfigOverrides,
}

/// Runs one task from PreFlight to PostFlight.
pub struct TaskExecutor {
    project_dir: PathBuf,
    raw_config: toml::Table,
    options: ExecutorOptions,
    deps: ExecutorDependencies,
    callbacks: ExecutorCallbacks,
    pause: watch::Sender<bool>,
    snapshot: Arc<Mutex<RunState>>,
}

impl TaskExecutor {
    /// `raw_config` is the merged, unresolved config table.
    #[must_use]
    pub fn new(
        project_dir: impl Into<PathBuf>,
        raw_config: toml::Table,
        deps: ExecutorDependencies,
    ) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            project_dir: project_dir.into(),
            raw_config,
            options: ExecutorOptions::default(),
            deps,
            callbacks: ExecutorCallbacks::default(),
            pause,
            snapshot: Arc::new(Mutex::new(RunState::new())),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: ExecutorCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Ask the loop to wait before its next pass. Returns false unless running.
    pub fn pause(&self) -> bool {
        if self.get_state().status != RunStatus::Running {
            return false;
        }
        self.pause.send_replace(true);
        info!("Pause requested");
        true
    }

    /// Let a paused loop continue. Returns false unless running or paused.
    pub fn resume(&self) -> bool {
        if !matches!(
            self.get_state().status,
            RunStatus::Running | RunStatus::Paused
        ) {
            return false;
        }
        self.pause.send_replace(false);
        info!("Resume requested");
        true
    }

    /// Copy of the most recently published state.
    #[must_use]
    pub fn get_state(&self) -> RunState {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, state: &RunState) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
    }

    fn resolve_task_path(&self, task_path: &Path) -> PathBuf {
        if task_path.is_absolute() {
            task_path.to_path_buf()
        } else {
            self.project_dir.join(task_path)
        }
    }

    /// Run a task to a terminal result. Never panics on collaborator errors.
    pub async fn run(&self, task_path: &Path) -> ExecutorResult {
        let run_id = Uuid::new_v4();
        let task_path = self.resolve_task_path(task_path);
        info!(task = %task_path.display(), run = %run_id, resume = self.options.resume, "Starting task");

        let mut state = RunState::new();
        state.status = RunStatus::Running;
        state.started_at = Some(now());
        self.pause.send_replace(false);
        self.publish(&state);

        let prepared = match preflight::prepare(
            &self.project_dir,
            &self.raw_config,
            &task_path,
            &self.options,
            &self.deps,
        )
        .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(task = %task_path.display(), error = %e, "PreFlight failed");
                state.status = RunStatus::Failed;
                state.completed_at = Some(now());
                state.last_error = Some(e.to_string());
                self.publish(&state);
                let result = ExecutorResult::preflight_failure(&task_path, &state, &e);
                if let (Some(notifier), Some(notification)) =
                    (self.deps.notifier.as_ref(), Notification::from_result(&result))
                {
                    notifier.notify(&notification).await;
                }
                return result;
            }
        };

        state.iteration = prepared.start_iteration;
        state.context_tokens = prepared.context_tokens;
        state.add_files(prepared.files_modified.iter().cloned());
        self.publish(&state);

        let mut iteration = IterationState::resuming(prepared.blocked_status.clone());
        let mut guard = prepared.guard.clone();
        let outcome = ExecutionLoop {
            config: &prepared.config,
            context: &prepared.context,
            provider: prepared.provider.as_ref(),
            quality: prepared.quality.as_ref(),
            vcs: self.deps.vcs.as_ref(),
            guard: &mut guard,
            callbacks: &self.callbacks,
            skip_permissions: prepared.skip_permissions,
            dry_run: self.options.dry_run,
            iteration_limit: prepared.start_iteration + prepared.config.execution.max_iterations,
            pause: self.pause.subscribe(),
            snapshot: &self.snapshot,
        }
        .run(&mut state, &mut iteration)
        .await;

        let result = postflight::finish(
            postflight::PostFlight {
                project_dir: &self.project_dir,
                task_path: &task_path,
                prepared: &prepared,
                vcs: self.deps.vcs.as_ref(),
                dry_run: self.options.dry_run,
            },
            &mut state,
            outcome,
        )
        .await;
        self.publish(&state);
        result
    }
}
