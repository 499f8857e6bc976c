//! Error types and the failure taxonomy.
//!
//! Two layers live here:
//!
//! - [`TaskError`] is the error type returned across the public API
//!   (config resolution, task parsing, PreFlight failures).
//! - [`ErrorCode`] / [`ErrorCategory`] classify per-pass failures inside the
//!   execution loop. Every code maps to exactly one [`FailurePolicy`] through an
//!   exhaustive `match`, so adding a code forces a policy decision.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tasksmith operations
#[derive(Error, Debug)]
pub enum TaskError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load or resolve configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// A `${NAME}` / `$NAME` reference had no value in the environment
    #[error("Environment variable '{name}' referenced by '{key}' is not set")]
    MissingVariable { name: String, key: String },

    // =========================================================================
    // Task Errors
    // =========================================================================
    /// Task markdown could not be parsed
    #[error("Invalid task file {path}: {reason}")]
    TaskParse { path: PathBuf, reason: String },

    /// Resume requested for a task without a BLOCKED section
    #[error("Cannot resume {path}: task is not blocked")]
    NotBlocked { path: PathBuf },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Provider could not be constructed
    #[error("Provider error: {message}")]
    Provider { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML parse error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a task parse error
    pub fn task_parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::TaskParse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a provider error
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    /// Configuration problems are never worth retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::MissingVariable { .. }
                | Self::TaskParse { .. }
                | Self::NotBlocked { .. }
                | Self::Toml(_)
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::MissingVariable { .. } | Self::Toml(_) => 7,
            Self::TaskParse { .. } => 6,
            Self::NotBlocked { .. } => 5,
            Self::Git { .. } => 4,
            Self::Provider { .. } => 3,
            _ => 1,
        }
    }
}

/// Type alias for tasksmith results
pub type Result<T> = std::result::Result<T, TaskError>;

// =============================================================================
// Failure taxonomy
// =============================================================================

/// Coarse failure category reported alongside every per-pass failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Permission,
    Timeout,
    Provider,
    Git,
    Scope,
    Validation,
    Uncategorized,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Provider => "provider",
            Self::Git => "git",
            Self::Scope => "scope",
            Self::Validation => "validation",
            Self::Uncategorized => "uncategorized",
        };
        f.write_str(s)
    }
}

/// What the execution loop does with a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the loop, status becomes `failed`.
    Abort,
    /// Try again next pass without touching the failure counter.
    RetryUncounted,
    /// Increment the consecutive-failure counter and try again.
    RetryCounted,
}

/// Fine-grained failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConfigInvalid,
    PermissionDenied,
    Timeout,
    RateLimited,
    ProviderUnavailable,
    ProviderCrashed,
    ProviderApiError,
    RevertFailed,
    CommitFailed,
    PushFailed,
    UserDenied,
    ForbiddenPath,
    OutsideAllowed,
    ValidationFailed,
    Unknown,
}

impl ErrorCode {
    /// Category this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigInvalid => ErrorCategory::Config,
            Self::PermissionDenied => ErrorCategory::Permission,
            Self::Timeout => ErrorCategory::Timeout,
            Self::RateLimited
            | Self::ProviderUnavailable
            | Self::ProviderCrashed
            | Self::ProviderApiError => ErrorCategory::Provider,
            Self::RevertFailed | Self::CommitFailed | Self::PushFailed => ErrorCategory::Git,
            Self::UserDenied | Self::ForbiddenPath | Self::OutsideAllowed => ErrorCategory::Scope,
            Self::ValidationFailed => ErrorCategory::Validation,
            Self::Unknown => ErrorCategory::Uncategorized,
        }
    }

    /// Loop policy for this code.
    #[must_use]
    pub fn policy(&self) -> FailurePolicy {
        match self {
            Self::ConfigInvalid
            | Self::PermissionDenied
            | Self::ProviderUnavailable
            | Self::RevertFailed
            | Self::UserDenied => FailurePolicy::Abort,
            Self::RateLimited => FailurePolicy::RetryUncounted,
            Self::Timeout
            | Self::ProviderCrashed
            | Self::ProviderApiError
            | Self::CommitFailed
            | Self::PushFailed
            | Self::ForbiddenPath
            | Self::OutsideAllowed
            | Self::ValidationFailed
            | Self::Unknown => FailurePolicy::RetryCounted,
        }
    }

    /// Stable snake_case identifier, used in logs and persisted sections.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config_invalid",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ProviderCrashed => "provider_crashed",
            Self::ProviderApiError => "provider_api_error",
            Self::RevertFailed => "revert_failed",
            Self::CommitFailed => "commit_failed",
            Self::PushFailed => "push_failed",
            Self::UserDenied => "user_denied",
            Self::ForbiddenPath => "forbidden_path",
            Self::OutsideAllowed => "outside_allowed",
            Self::ValidationFailed => "validation_failed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
