//! OpenAI-compatible chat completions provider.
//!
//! Requests go through a `curl` subprocess. The continuation handle is the
//! message history itself, trimmed from the oldest non-system message.

use super::{
    AgentProvider, ConversationState, ExecuteOptions, ExecutionResult, ProviderError, TokenUsage,
    WorkingTreeSnapshot,
};
use crate::config::ConversationTrimConfig;
use crate::scope::FileChange;
use crate::vcs::VcsOperations;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are an autonomous coding agent. Work only inside the task's \
allowed scope and report completion with the requested marker.";

/// curl exit code for an elapsed `--max-time`.
const CURL_TIMEOUT_EXIT: i32 = 28;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// Continuation handle for [`HttpProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpConversation {
    pub messages: Vec<ChatMessage>,
}

/// Drop the oldest non-system messages until both limits hold.
///
/// The newest message is always kept. A zero limit is ignored. Returns the
/// number of messages removed.
pub fn trim_history(messages: &mut Vec<ChatMessage>, trim: &ConversationTrimConfig) -> usize {
    let mut removed = 0;
    loop {
        let chars: usize = messages.iter().map(|m| m.content.len()).sum();
        let over = (trim.max_messages > 0 && messages.len() > trim.max_messages)
            || (trim.max_chars > 0 && chars > trim.max_chars);
        if !over || messages.iter().filter(|m| !m.is_system()).count() <= 1 {
            return removed;
        }
        match messages.iter().position(|m| !m.is_system()) {
            Some(idx) => {
                messages.remove(idx);
                removed += 1;
            }
            None => return removed,
        }
    }
}

/// Split curl's `body\nstatus` output and extract the reply.
///
/// # Errors
///
/// Returns a classified error for non-2xx statuses, an `error` object in the
/// body, or a body without a reply.
pub fn parse_response(raw: &str) -> Result<(String, Option<TokenUsage>), ProviderError> {
    let (body, status) = match raw.rsplit_once('\n') {
        Some((body, code)) => (body, code.trim().parse::<u16>().unwrap_or(0)),
        None => (raw, 0),
    };

    if !(200..300).contains(&status) {
        return Err(ProviderError::from_http_status(status, body));
    }

    let json: Value = serde_json::from_str(body).map_err(|e| ProviderError::ServerError {
        message: format!("Invalid JSON response: {e}"),
    })?;

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        return Err(ProviderError::from_stderr(message, i32::from(status)));
    }

    let content = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::ServerError {
            message: "Response has no message content".into(),
        })?
        .to_string();

    let usage = json.get("usage").map(|u| {
        TokenUsage::new(
            u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        )
    });

    Ok((content, usage))
}

pub struct HttpProvider {
    project_dir: PathBuf,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_output_tokens: u32,
    vcs: Arc<dyn VcsOperations>,
}

impl HttpProvider {
    #[must_use]
    pub fn new(
        project_dir: &Path,
        base_url: &str,
        model: &str,
        vcs: Arc<dyn VcsOperations>,
    ) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: None,
            max_output_tokens: 8192,
            vcs,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    #[must_use]
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// JSON request body for a message history.
    #[must_use]
    pub fn request_body(&self, messages: &[ChatMessage]) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_output_tokens,
        })
    }

    async fn request(
        &self,
        messages: &[ChatMessage],
        timeout: Option<Duration>,
    ) -> Result<(String, Option<TokenUsage>), ProviderError> {
        let body = self.request_body(messages).to_string();
        let mut cmd = Command::new("curl");
        cmd.args(["-s", "-S", "-X", "POST", self.endpoint().as_str()])
            .args(["-H", "Content-Type: application/json"])
            .args(["--data-binary", "@-", "-w", "\n%{http_code}"]);
        if let Some(ref key) = self.api_key {
            cmd.arg("-H").arg(format!("Authorization: Bearer {key}"));
        }
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            cmd.arg("--max-time").arg(timeout.as_secs().max(1).to_string());
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::from_spawn("curl", &e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|e| ProviderError::ConnectionError {
                    message: format!("Failed to write request body: {e}"),
                })?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::ConnectionError {
                message: format!("curl did not finish: {e}"),
            })?;

        match output.status.code() {
            Some(0) => {}
            Some(CURL_TIMEOUT_EXIT) => {
                return Err(ProviderError::Timeout {
                    timeout: timeout.unwrap_or_default(),
                })
            }
            _ => {
                return Err(ProviderError::ConnectionError {
                    message: format!(
                        "HTTP request failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                })
            }
        }

        parse_response(&String::from_utf8_lossy(&output.stdout))
    }

    async fn snapshot(&self) -> Option<WorkingTreeSnapshot> {
        WorkingTreeSnapshot::capture(self.vcs.as_ref(), &self.project_dir)
            .await
            .map_err(|e| warn!(error = %e, "Could not snapshot working tree"))
            .ok()
    }

    async fn diff_since(&self, before: Option<&WorkingTreeSnapshot>) -> Vec<FileChange> {
        match (before, self.snapshot().await) {
            (Some(before), Some(after)) => before.changes_since(&after),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl AgentProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn is_available(&self) -> bool {
        which::which("curl").is_ok()
    }

    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> ExecutionResult {
        let history = options
            .conversation
            .as_ref()
            .and_then(|c| c.downcast_ref::<HttpConversation>())
            .filter(|_| options.continue_session);
        let mut messages = match history {
            Some(conversation) => conversation.messages.clone(),
            None => vec![ChatMessage::system(SYSTEM_PROMPT)],
        };
        messages.push(ChatMessage::user(prompt));
        let trimmed = trim_history(&mut messages, &options.trim);
        if trimmed > 0 {
            debug!(trimmed, remaining = messages.len(), "Trimmed conversation history");
        }

        let before = self.snapshot().await;
        match self.request(&messages, options.timeout).await {
            Ok((content, usage)) => {
                if let Some(ref on_output) = options.on_output {
                    on_output(&content);
                }
                messages.push(ChatMessage::assistant(content.clone()));
                let files = self.diff_since(before.as_ref()).await;
                ExecutionResult::from_output(content, files)
                    .with_token_usage(usage)
                    .with_conversation(Some(ConversationState::new(HttpConversation { messages })))
            }
            Err(err) => {
                warn!(error = %err, endpoint = %self.endpoint(), "HTTP provider call failed");
                let files = self.diff_since(before.as_ref()).await;
                ExecutionResult::failed(&err).with_files(files)
            }
        }
    }
}
