//! Agent provider adapters.
//!
//! A provider runs one prompt against an external coding agent and reports
//! what happened as an [`ExecutionResult`]. The execution loop never sees a
//! transport error: every failure is classified into an [`ErrorCode`] inside
//! the result.
//!
//! - [`claude`] - Claude Code CLI subprocess with stream-json output
//! - [`http`] - OpenAI-compatible chat endpoint
//! - [`markers`] - Completion / blocking marker vocabulary
//! - [`classify`] - Failure classification
//! - [`diff`] - Working-tree snapshots for file-change detection

pub mod claude;
pub mod classify;
pub mod diff;
pub mod http;
pub mod markers;

pub use claude::{ClaudeCliProvider, ClaudeSession};
pub use classify::ProviderError;
pub use diff::WorkingTreeSnapshot;
pub use http::{trim_history, ChatMessage, HttpConversation, HttpProvider};
pub use markers::{detect_blocking, detect_completion, BLOCKED_PREFIX, COMPLETION_MARKERS};

use crate::config::{ConversationTrimConfig, ProviderConfig, ProviderKind};
use crate::error::{ErrorCategory, ErrorCode, Result, TaskError};
use crate::scope::FileChange;
use crate::vcs::VcsOperations;
use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Streaming output sink.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Tokens reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Opaque continuation handle.
///
/// Only the adapter that produced a handle knows its shape; the loop stores it
/// and hands it back. An empty handle is the "continue anyway" sentinel used
/// when a conversation existed but the adapter returned nothing to resume.
#[derive(Clone)]
pub struct ConversationState {
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl ConversationState {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Some(Arc::new(value)),
        }
    }

    #[must_use]
    pub fn continue_anyway() -> Self {
        Self { inner: None }
    }

    #[must_use]
    pub fn is_continue_anyway(&self) -> bool {
        self.inner.is_none()
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_deref()?.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.inner.is_some() {
            write!(f, "ConversationState(..)")
        } else {
            write!(f, "ConversationState(continue-anyway)")
        }
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Passed to adapters that enforce their own deadline. The loop always
    /// races the call against this as well.
    pub timeout: Option<Duration>,
    pub skip_permissions: bool,
    pub continue_session: bool,
    pub conversation: Option<ConversationState>,
    pub on_output: Option<OutputCallback>,
    pub trim: ConversationTrimConfig,
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("timeout", &self.timeout)
            .field("skip_permissions", &self.skip_permissions)
            .field("continue_session", &self.continue_session)
            .field("conversation", &self.conversation)
            .field("on_output", &self.on_output.is_some())
            .field("trim", &self.trim)
            .finish()
    }
}

/// Outcome of one provider call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub error_code: Option<ErrorCode>,
    pub files_changed: Vec<FileChange>,
    pub iteration_complete: bool,
    pub completion_signal: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub conversation_state: Option<ConversationState>,
}

impl ExecutionResult {
    /// Build a result from agent output, detecting completion and blocking.
    ///
    /// A blocking tag wins over any completion marker in the same output.
    #[must_use]
    pub fn from_output(output: String, files_changed: Vec<FileChange>) -> Self {
        if let Some(reason) = detect_blocking(&output) {
            return Self {
                success: false,
                error: Some(format!("{BLOCKED_PREFIX} {reason}")),
                output,
                files_changed,
                ..Self::default()
            };
        }
        let completion_signal = detect_completion(&output).map(str::to_string);
        Self {
            success: true,
            iteration_complete: completion_signal.is_some(),
            completion_signal,
            output,
            files_changed,
            ..Self::default()
        }
    }

    /// A classified failure.
    #[must_use]
    pub fn failed(error: &ProviderError) -> Self {
        let code = error.code();
        Self {
            success: false,
            error: Some(error.to_string()),
            error_category: Some(code.category()),
            error_code: Some(code),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_files(mut self, files_changed: Vec<FileChange>) -> Self {
        self.files_changed = files_changed;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: String) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_token_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.token_usage = usage;
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, state: Option<ConversationState>) -> Self {
        self.conversation_state = state;
        self
    }

    /// Nothing happened except an error.
    #[must_use]
    pub fn is_pure_failure(&self) -> bool {
        !self.success
            && !self.iteration_complete
            && self.files_changed.is_empty()
            && self.error.is_some()
    }

    /// Reason from a blocking tag, if the agent blocked itself.
    #[must_use]
    pub fn blocking_reason(&self) -> Option<&str> {
        self.error
            .as_deref()?
            .strip_prefix(BLOCKED_PREFIX)
            .map(str::trim)
    }
}

/// An external coding agent.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the backend can be reached at all.
    async fn is_available(&self) -> bool;

    /// Run one prompt. Never fails: errors are classified into the result.
    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> ExecutionResult;
}

/// Build the provider selected by `provider.type`.
///
/// # Errors
///
/// Returns a provider error when the selected backend is missing required
/// settings.
pub fn create_provider(
    config: &ProviderConfig,
    project_dir: &Path,
    vcs: Arc<dyn VcsOperations>,
) -> Result<Arc<dyn AgentProvider>> {
    match config.kind {
        ProviderKind::ClaudeCli => Ok(Arc::new(ClaudeCliProvider::new(
            project_dir,
            &config.command,
            &config.model,
            vcs,
        ))),
        ProviderKind::Http => {
            let base_url = config
                .base_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| TaskError::provider("http provider requires provider.base_url"))?;
            let api_key = config
                .api_key
                .clone()
                .or_else(|| std::env::var(&config.api_key_env).ok());
            Ok(Arc::new(
                HttpProvider::new(project_dir, base_url, &config.model, vcs)
                    .with_api_key(api_key)
                    .with_max_output_tokens(config.max_output_tokens),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVcs;

    #[test]
    fn test_from_output_detects_completion() {
        let result = ExecutionResult::from_output("done <promise>COMPLETE</promise>".into(), vec![]);
        assert!(result.success);
        assert!(result.iteration_complete);
        assert_eq!(
            result.completion_signal.as_deref(),
            Some("<promise>COMPLETE</promise>")
        );
    }

    #[test]
    fn test_from_output_without_marker() {
        let result = ExecutionResult::from_output("working".into(), vec![]);
        assert!(result.success);
        assert!(!result.iteration_complete);
        assert!(result.completion_signal.is_none());
    }

    #[test]
    fn test_blocking_beats_completion() {
        let result = ExecutionResult::from_output(
            "<promise>BLOCKED: missing schema</promise> <promise>COMPLETE</promise>".into(),
            vec![],
        );
        assert!(!result.success);
        assert!(!result.iteration_complete);
        assert!(result.is_pure_failure());
        assert_eq!(result.blocking_reason(), Some("missing schema"));
        assert!(result.error_code.is_none());
    }

    #[test]
    fn test_failed_carries_code_and_category() {
        let result = ExecutionResult::failed(&ProviderError::Timeout {
            timeout: Duration::from_secs(1),
        });
        assert_eq!(result.error_code, Some(ErrorCode::Timeout));
        assert_eq!(result.error_category, Some(ErrorCategory::Timeout));
        assert!(result.is_pure_failure());
        assert!(result.blocking_reason().is_none());
    }

    #[test]
    fn test_failure_with_files_is_not_pure() {
        let result = ExecutionResult::failed(&ProviderError::Crashed { signal: 9 })
            .with_files(vec![FileChange::modified("src/a.rs")]);
        assert!(!result.is_pure_failure());
    }

    #[test]
    fn test_conversation_state_downcast() {
        let state = ConversationState::new(ClaudeSession("abc".into()));
        assert_eq!(
            state.downcast_ref::<ClaudeSession>(),
            Some(&ClaudeSession("abc".into()))
        );
        assert!(state.downcast_ref::<String>().is_none());
        assert!(!state.is_continue_anyway());
        assert!(ConversationState::continue_anyway().is_continue_anyway());
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(10, 5);
        total += TokenUsage::new(1, 2);
        assert_eq!(total, TokenUsage::new(11, 7));
        assert_eq!(total.total(), 18);
    }

    #[test]
    fn test_factory_selects_backend() {
        let vcs: Arc<dyn VcsOperations> = Arc::new(MockVcs::new());
        let claude = create_provider(&ProviderConfig::default(), Path::new("."), vcs.clone())
            .unwrap();
        assert_eq!(claude.name(), "claude-cli");

        let http_config = ProviderConfig {
            kind: ProviderKind::Http,
            base_url: Some("http://localhost:8080/v1".into()),
            ..ProviderConfig::default()
        };
        let http = create_provider(&http_config, Path::new("."), vcs.clone()).unwrap();
        assert_eq!(http.name(), "http");
    }

    #[test]
    fn test_factory_rejects_http_without_url() {
        let vcs: Arc<dyn VcsOperations> = Arc::new(MockVcs::new());
        let config = ProviderConfig {
            kind: ProviderKind::Http,
            base_url: None,
            ..ProviderConfig::default()
        };
        assert!(create_provider(&config, Path::new("."), vcs).is_err());
    }
}
