//! Configuration management for tasksmith.
//!
//! Configuration is read from `tasksmith.toml` in the project directory,
//! layered over an optional user-level file, then resolved (environment
//! substitution) into a typed [`RunnerConfig`].

pub mod resolution;
pub mod validation;

pub use resolution::{resolve, ConfigLoader, ResolvedConfig};
pub use validation::{scan_for_secrets, SecretWarning};

use crate::error::{Result, TaskError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Project config file name.
pub const CONFIG_FILE: &str = "tasksmith.toml";

/// Directory used for tasksmith's own state inside a project.
pub const STATE_DIR: &str = ".tasksmith";

/// Fully resolved runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub provider: ProviderConfig,
    pub execution: ExecutionConfig,
    pub permissions: PermissionsConfig,
    pub validation: ValidationConfig,
    pub git: GitConfig,
    pub security: SecurityConfig,
    pub notifications: NotificationConfig,
    pub cost: CostConfig,
    pub parallel: ParallelConfig,
    pub paths: PathsConfig,
}

impl RunnerConfig {
    /// Parse and resolve a TOML document using the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML, references an
    /// unset variable, or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let resolved = resolve(&table, &|name| std::env::var(name).ok())?;
        Ok(resolved.config)
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_iterations == 0 {
            return Err(TaskError::config("execution.max_iterations must be at least 1"));
        }
        if self.execution.max_consecutive_failures == 0 {
            return Err(TaskError::config(
                "execution.max_consecutive_failures must be at least 1",
            ));
        }
        if self.parallel.concurrency == 0 {
            return Err(TaskError::config("parallel.concurrency must be at least 1"));
        }
        if self.provider.kind == ProviderKind::Http && self.provider.base_url.is_none() {
            return Err(TaskError::config("provider.base_url is required for the http provider"));
        }
        Ok(())
    }

    /// Path of the project-level config file.
    #[must_use]
    pub fn project_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_FILE)
    }

    /// Path of the user-level config file, if a config dir exists.
    #[must_use]
    pub fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tasksmith").join("config.toml"))
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Which provider backend to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// The `claude` CLI as a subprocess.
    #[default]
    ClaudeCli,
    /// An OpenAI-compatible chat completions endpoint.
    Http,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClaudeCli => write!(f, "claude-cli"),
            Self::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub model: String,
    /// Executable for the CLI provider.
    pub command: String,
    pub base_url: Option<String>,
    pub api_key_env: String,
    /// Inline key. Prefer `api_key_env`; literal values trigger a secret warning.
    pub api_key: Option<String>,
    pub max_output_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::ClaudeCli,
            model: "sonnet".to_string(),
            command: "claude".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            max_output_tokens: 8192,
        }
    }
}

// ============================================================================
// Execution limits
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_iterations: u32,
    pub max_consecutive_failures: u32,
    /// Per-pass provider deadline; 0 disables the race.
    pub timeout_per_iteration_secs: u64,
    pub session_continuation: bool,
    pub rate_limit_backoff_secs: u64,
    pub conversation: ConversationTrimConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_consecutive_failures: 3,
            timeout_per_iteration_secs: 1800,
            session_continuation: true,
            rate_limit_backoff_secs: 30,
            conversation: ConversationTrimConfig::default(),
        }
    }
}

/// Limits applied to conversation history carried between passes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConversationTrimConfig {
    pub max_messages: usize,
    pub max_chars: usize,
}

impl Default for ConversationTrimConfig {
    fn default() -> Self {
        Self {
            max_messages: 40,
            max_chars: 200_000,
        }
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// How the scope guard treats paths matched by neither list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    #[default]
    Strict,
    Ask,
    Permissive,
}

impl std::fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Ask => write!(f, "ask"),
            Self::Permissive => write!(f, "permissive"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PermissionsConfig {
    pub scope_enforcement: ScopeMode,
    pub auto_commit: bool,
    pub auto_push: bool,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            scope_enforcement: ScopeMode::Strict,
            auto_commit: true,
            auto_push: false,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub pre_commit: Vec<String>,
    pub pre_push: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            pre_commit: Vec::new(),
            pre_push: Vec::new(),
            command_timeout_secs: 600,
        }
    }
}

// ============================================================================
// Git
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitConfig {
    pub commit_prefix: String,
    pub branch_prefix: String,
    pub remote: String,
    pub max_goal_chars: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_prefix: "tasksmith: ".to_string(),
            branch_prefix: "tasksmith/".to_string(),
            remote: "origin".to_string(),
            max_goal_chars: 72,
        }
    }
}

// ============================================================================
// Security
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Run the agent without interactive permission prompts.
    pub skip_permissions: bool,
    /// Warn when running unattended with permissions bypassed.
    pub warn_unattended: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            skip_permissions: false,
            warn_unattended: true,
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Run outcomes a notifier can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyEvent {
    Completed,
    Blocked,
    Failed,
}

impl std::fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Blocked => write!(f, "blocked"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub command: Option<String>,
    pub events: Vec<NotifyEvent>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            command: None,
            events: vec![NotifyEvent::Completed, NotifyEvent::Blocked, NotifyEvent::Failed],
        }
    }
}

// ============================================================================
// Cost, parallelism, paths
// ============================================================================

/// Flat per-million-token rates used for cost estimates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParallelConfig {
    pub concurrency: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { concurrency: 3 }
    }
}

/// Where the file-based context loader looks for its inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub project_file: PathBuf,
    pub roles_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub plan_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_file: PathBuf::from(".tasksmith/PROJECT.md"),
            roles_dir: PathBuf::from(".tasksmith/roles"),
            skills_dir: PathBuf::from(".tasksmith/skills"),
            plan_file: PathBuf::from(".tasksmith/PLAN.md"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.execution.max_iterations, 10);
        assert_eq!(config.execution.max_consecutive_failures, 3);
        assert!(config.execution.session_continuation);
        assert_eq!(config.permissions.scope_enforcement, ScopeMode::Strict);
        assert!(config.permissions.auto_commit);
        assert!(!config.permissions.auto_push);
        assert_eq!(config.provider.kind, ProviderKind::ClaudeCli);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str_partial() {
        let config = RunnerConfig::from_toml_str(
            r#"
            [execution]
            max_iterations = 4

            [permissions]
            scope_enforcement = "ask"

            [validation]
            pre_commit = ["cargo test"]
            "#,
        )
        .unwrap();
        assert_eq!(config.execution.max_iterations, 4);
        assert_eq!(config.execution.max_consecutive_failures, 3);
        assert_eq!(config.permissions.scope_enforcement, ScopeMode::Ask);
        assert_eq!(config.validation.pre_commit, vec!["cargo test".to_string()]);
    }

    #[test]
    fn test_provider_type_rename() {
        let config = RunnerConfig::from_toml_str(
            r#"
            [provider]
            type = "http"
            base_url = "https://api.example.com/v1"
            model = "gpt-4o"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Http);
        assert_eq!(config.provider.model, "gpt-4o");
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let mut config = RunnerConfig::default();
        config.execution.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_http_needs_base_url() {
        let mut config = RunnerConfig::default();
        config.provider.kind = ProviderKind::Http;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_unknown_scope_mode_rejected() {
        let result = RunnerConfig::from_toml_str(
            r#"
            [permissions]
            scope_enforcement = "yolo"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_notify_events_default_to_all() {
        let config = NotificationConfig::default();
        assert_eq!(config.events.len(), 3);
        assert!(!config.enabled);
    }
}
