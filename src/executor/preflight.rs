//! PreFlight: everything that must succeed before the first pass.

use super::tokens::context_breakdown;
use super::{ConfigOverrides, ExecutorDependencies, ExecutorOptions};
use crate::config::{resolve, scan_for_secrets, RunnerConfig, SecretWarning};
use crate::context::{ContextLoader, FileContextLoader, LoadedContext};
use crate::error::{Result, TaskError};
use crate::notify::{notifier_from_config, Notifier};
use crate::provider::{create_provider, AgentProvider};
use crate::quality::{CommandValidator, QualityGate};
use crate::scope::ScopeGuard;
use crate::task::{
    load_blocked_status, write_status, BlockedStatus, ResumeAttempt, ResumeOutcome, StatusReport,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output of PreFlight, shared read-only by the loop and PostFlight.
pub struct Prepared {
    pub config: RunnerConfig,
    pub context: LoadedContext,
    /// Snapshot including the resume attempt recorded by this run.
    pub blocked_status: Option<BlockedStatus>,
    pub start_iteration: u32,
    pub files_modified: Vec<PathBuf>,
    pub breakdown: BTreeMap<String, u64>,
    pub context_tokens: u64,
    pub skip_permissions: bool,
    pub warn_unattended: bool,
    pub secret_warnings: Vec<SecretWarning>,
    pub guard: ScopeGuard,
    pub quality: Arc<dyn QualityGate>,
    pub provider: Arc<dyn AgentProvider>,
    pub notifier: Arc<dyn Notifier>,
}

impl Prepared {
    #[must_use]
    pub fn is_resume(&self) -> bool {
        self.blocked_status.is_some()
    }
}

fn apply_overrides(config: &mut RunnerConfig, overrides: &ConfigOverrides) {
    if let Some(max) = overrides.max_iterations {
        config.execution.max_iterations = max;
    }
    if let Some(concurrency) = overrides.concurrency {
        config.parallel.concurrency = concurrency;
    }
}

/// Run the PreFlight steps in order.
///
/// # Errors
///
/// Returns the first failure: config resolution, context loading, a resume of
/// a task that is not blocked, or provider/scope construction.
pub async fn prepare(
    project_dir: &Path,
    raw_config: &toml::Table,
    task_path: &Path,
    options: &ExecutorOptions,
    deps: &ExecutorDependencies,
) -> Result<Prepared> {
    // 1. Config
    let resolved = resolve(raw_config, &*deps.env)?;
    let secret_warnings = scan_for_secrets(&resolved);
    let mut config = resolved.config;
    apply_overrides(&mut config, &options.overrides);
    config.validate()?;

    // 2. Secrets
    for warning in &secret_warnings {
        warn!(key = %warning.key, "{warning}");
    }

    // 3. Context
    let loader: Arc<dyn ContextLoader> = match deps.context_loader {
        Some(ref loader) => loader.clone(),
        None => Arc::new(FileContextLoader::new(project_dir, config.paths.clone())),
    };
    let context = loader.load(task_path).await?;

    // 4. Resume
    let (blocked_status, start_iteration, files_modified) = if options.resume {
        let mut blocked = load_blocked_status(task_path)
            .await?
            .ok_or_else(|| TaskError::NotBlocked {
                path: task_path.to_path_buf(),
            })?;
        blocked.attempt_history.push(ResumeAttempt::new(
            ResumeOutcome::Resumed,
            blocked.previous_iteration,
        ));
        if !options.dry_run {
            if let Err(e) = write_status(task_path, &StatusReport::Blocked(blocked.clone())).await {
                warn!(task = %task_path.display(), error = %e, "Failed to record resume attempt");
            }
        }
        info!(
            task = %task_path.display(),
            iteration = blocked.previous_iteration,
            attempts = blocked.resume_count(),
            "Resuming blocked task"
        );
        let start = blocked.previous_iteration;
        let files = blocked.files_modified.clone();
        (Some(blocked), start, files)
    } else {
        (None, 0, Vec::new())
    };

    // 5. Context size
    let breakdown = context_breakdown(&context);
    let context_tokens = breakdown.values().sum();
    debug!(context_tokens, ?breakdown, "Estimated context size");

    // 6. Permissions
    let skip_permissions = config.security.skip_permissions;
    let warn_unattended = skip_permissions && config.security.warn_unattended;
    if warn_unattended {
        warn!("Agent permission prompts are disabled; the agent runs unattended");
    }

    // 7. Collaborators
    let guard = ScopeGuard::new(
        &context.task.allowed,
        &context.task.forbidden,
        config.permissions.scope_enforcement,
    )?;
    let quality: Arc<dyn QualityGate> = match deps.quality {
        Some(ref quality) => quality.clone(),
        None => Arc::new(CommandValidator::new(project_dir, &config.validation)),
    };
    let provider = match deps.provider {
        Some(ref provider) => provider.clone(),
        None => create_provider(&config.provider, project_dir, deps.vcs.clone())?,
    };
    if !options.dry_run && !provider.is_available().await {
        warn!(provider = provider.name(), "Provider does not look available");
    }
    let notifier = match deps.notifier {
        Some(ref notifier) => notifier.clone(),
        None => notifier_from_config(&config.notifications),
    };

    Ok(Prepared {
        config,
        context,
        blocked_status,
        start_iteration,
        files_modified,
        breakdown,
        context_tokens,
        skip_permissions,
        warn_unattended,
        secret_warnings,
        guard,
        quality,
        provider,
        notifier,
    })
}
