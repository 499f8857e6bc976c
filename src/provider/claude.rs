//! Claude Code CLI provider.
//!
//! Runs `claude -p --output-format stream-json` with the prompt on stdin and
//! reads one JSON event per stdout line:
//!
//! ```text
//! {"type":"system","subtype":"init","session_id":"..."}
//! {"type":"assistant","message":{"content":[{"type":"text",...},{"type":"tool_use",...}]}}
//! {"type":"result","is_error":false,"result":"...","usage":{...}}
//! ```
//!
//! File-editing tool calls give native change reporting; when none are seen the
//! working tree is diffed instead.

use super::{
    AgentProvider, ConversationState, ExecuteOptions, ExecutionResult, ProviderError, TokenUsage,
    WorkingTreeSnapshot,
};
use crate::scope::FileChange;
use crate::vcs::VcsOperations;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Tools whose `input` names a file the agent wrote.
const FILE_TOOLS: &[(&str, &str)] = &[
    ("Write", "file_path"),
    ("Edit", "file_path"),
    ("MultiEdit", "file_path"),
    ("NotebookEdit", "notebook_path"),
];

/// Continuation handle: the CLI session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeSession(pub String);

pub struct ClaudeCliProvider {
    project_dir: PathBuf,
    command: String,
    model: String,
    vcs: Arc<dyn VcsOperations>,
}

impl ClaudeCliProvider {
    #[must_use]
    pub fn new(
        project_dir: &Path,
        command: &str,
        model: &str,
        vcs: Arc<dyn VcsOperations>,
    ) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            command: command.to_string(),
            model: model.to_string(),
            vcs,
        }
    }

    /// CLI arguments for one call.
    #[must_use]
    pub fn build_args(&self, options: &ExecuteOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--model",
            self.model.as_str(),
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        if options.skip_permissions {
            args.push("--dangerously-skip-permissions".into());
        }

        if options.continue_session {
            match options
                .conversation
                .as_ref()
                .and_then(|c| c.downcast_ref::<ClaudeSession>())
            {
                Some(ClaudeSession(id)) => {
                    args.push("--resume".into());
                    args.push(id.clone());
                }
                None => args.push("--continue".into()),
            }
        }
        args
    }

    async fn snapshot(&self) -> Option<WorkingTreeSnapshot> {
        match WorkingTreeSnapshot::capture(self.vcs.as_ref(), &self.project_dir).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "Could not snapshot working tree");
                None
            }
        }
    }

    async fn diff_since(&self, before: Option<&WorkingTreeSnapshot>) -> Vec<FileChange> {
        let Some(before) = before else {
            return Vec::new();
        };
        match self.snapshot().await {
            Some(after) => before.changes_since(&after),
            None => Vec::new(),
        }
    }

    async fn run(
        &self,
        prompt: &str,
        options: &ExecuteOptions,
    ) -> Result<(StreamState, ExitStatus, String), ProviderError> {
        let args = self.build_args(options);
        debug!(command = %self.command, ?args, "Spawning agent CLI");

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::from_spawn(&self.command, &e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::ConnectionError {
                    message: format!("Failed to write prompt to stdin: {e}"),
                })?;
            drop(stdin);
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut state = StreamState::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(chunk) = state.ingest(&line) {
                    if let Some(ref on_output) = options.on_output {
                        on_output(&chunk);
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| ProviderError::ConnectionError {
            message: format!("Failed to wait for agent process: {e}"),
        })?;
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Ok((state, status, stderr))
    }

    fn relative(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        path.strip_prefix(&self.project_dir)
            .unwrap_or(path)
            .to_path_buf()
    }
}

#[async_trait]
impl AgentProvider for ClaudeCliProvider {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn is_available(&self) -> bool {
        which::which(&self.command).is_ok()
    }

    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> ExecutionResult {
        let before = self.snapshot().await;

        let (state, status, stderr) = match self.run(prompt, options).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "Agent CLI call failed");
                let files = self.diff_since(before.as_ref()).await;
                return ExecutionResult::failed(&err).with_files(files);
            }
        };

        let files = if state.touched.is_empty() {
            self.diff_since(before.as_ref()).await
        } else {
            state
                .touched
                .iter()
                .map(|p| self.relative(p))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(FileChange::modified)
                .collect()
        };
        let conversation = state
            .session_id
            .clone()
            .map(|id| ConversationState::new(ClaudeSession(id)));
        let output = state.output();

        if !status.success() {
            let detail = if stderr.trim().is_empty() { &output } else { &stderr };
            let err = ProviderError::from_exit(detail, &status);
            warn!(error = %err, "Agent CLI exited with failure");
            return ExecutionResult::failed(&err)
                .with_output(output)
                .with_files(files)
                .with_token_usage(state.usage)
                .with_conversation(conversation);
        }

        if state.is_error {
            let err = ProviderError::from_stderr(&output, 1);
            return ExecutionResult::failed(&err)
                .with_output(output)
                .with_files(files)
                .with_token_usage(state.usage)
                .with_conversation(conversation);
        }

        ExecutionResult::from_output(output, files)
            .with_token_usage(state.usage)
            .with_conversation(conversation)
    }
}

/// Accumulated view of a stream-json event sequence.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamState {
    pub session_id: Option<String>,
    pub text: String,
    pub result: Option<String>,
    pub is_error: bool,
    pub usage: Option<TokenUsage>,
    /// Raw file paths named by file-editing tools.
    pub touched: BTreeSet<String>,
}

impl StreamState {
    /// Fold one stdout line in. Returns the text chunk to stream, if any.
    pub fn ingest(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            self.text.push_str(line);
            self.text.push('\n');
            return Some(format!("{line}\n"));
        };

        if let Some(id) = event.get("session_id").and_then(Value::as_str) {
            self.session_id = Some(id.to_string());
        }

        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let blocks = event
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut chunk = String::new();
                for block in &blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                chunk.push_str(text);
                                chunk.push('\n');
                            }
                        }
                        Some("tool_use") => self.record_tool(block),
                        _ => {}
                    }
                }
                if chunk.is_empty() {
                    None
                } else {
                    self.text.push_str(&chunk);
                    Some(chunk)
                }
            }
            Some("result") => {
                self.is_error = event
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.result = event
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(usage) = event.get("usage") {
                    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
                    self.usage = Some(TokenUsage::new(
                        field("input_tokens")
                            + field("cache_read_input_tokens")
                            + field("cache_creation_input_tokens"),
                        field("output_tokens"),
                    ));
                }
                None
            }
            _ => None,
        }
    }

    fn record_tool(&mut self, block: &Value) {
        let Some(name) = block.get("name").and_then(Value::as_str) else {
            return;
        };
        let Some((_, key)) = FILE_TOOLS.iter().find(|(tool, _)| *tool == name) else {
            return;
        };
        if let Some(path) = block.pointer(&format!("/input/{key}")).and_then(Value::as_str) {
            self.touched.insert(path.to_string());
        }
    }

    /// Final text: the result payload when present, else streamed text.
    #[must_use]
    pub fn output(&self) -> String {
        match self.result {
            Some(ref result) if !result.trim().is_empty() => {
                if self.text.contains(result.as_str()) {
                    self.text.clone()
                } else {
                    format!("{}{result}", self.text)
                }
            }
            _ => self.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testing::MockVcs;
    use tempfile::TempDir;

    fn provider(dir: &Path, command: &str) -> ClaudeCliProvider {
        ClaudeCliProvider::new(dir, command, "sonnet", Arc::new(MockVcs::new()))
    }

    // =========================================================================
    // Argument building
    // =========================================================================

    #[test]
    fn test_args_fresh_call() {
        let p = provider(Path::new("."), "claude");
        let args = p.build_args(&ExecuteOptions::default());
        assert_eq!(
            args,
            vec!["-p", "--output-format", "stream-json", "--verbose", "--model", "sonnet"]
        );
    }

    #[test]
    fn test_args_resume_with_session() {
        let p = provider(Path::new("."), "claude");
        let options = ExecuteOptions {
            continue_session: true,
            skip_permissions: true,
            conversation: Some(ConversationState::new(ClaudeSession("s-42".into()))),
            ..ExecuteOptions::default()
        };
        let args = p.build_args(&options);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        let pos = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[pos + 1], "s-42");
    }

    #[test]
    fn test_args_continue_anyway() {
        let p = provider(Path::new("."), "claude");
        let options = ExecuteOptions {
            continue_session: true,
            conversation: Some(ConversationState::continue_anyway()),
            ..ExecuteOptions::default()
        };
        let args = p.build_args(&options);
        assert!(args.contains(&"--continue".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
    }

    // =========================================================================
    // Stream parsing
    // =========================================================================

    #[test]
    fn test_stream_collects_session_text_and_tools() {
        let mut state = StreamState::default();
        state.ingest(r#"{"type":"system","subtype":"init","session_id":"abc"}"#);
        let chunk = state.ingest(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Adding route"},{"type":"tool_use","name":"Edit","input":{"file_path":"src/api/mod.rs"}},{"type":"tool_use","name":"Read","input":{"file_path":"README.md"}}]}}"#,
        );
        state.ingest(
            r#"{"type":"result","is_error":false,"result":"<promise>COMPLETE</promise>","usage":{"input_tokens":100,"cache_read_input_tokens":20,"output_tokens":7}}"#,
        );

        assert_eq!(chunk.as_deref(), Some("Adding route\n"));
        assert_eq!(state.session_id.as_deref(), Some("abc"));
        assert_eq!(
            state.touched.iter().collect::<Vec<_>>(),
            vec!["src/api/mod.rs"]
        );
        assert_eq!(state.usage, Some(TokenUsage::new(120, 7)));
        assert!(state.output().contains("<promise>COMPLETE</promise>"));
        assert!(!state.is_error);
    }

    #[test]
    fn test_stream_passes_through_non_json() {
        let mut state = StreamState::default();
        assert_eq!(state.ingest("plain text").as_deref(), Some("plain text\n"));
        assert_eq!(state.output(), "plain text\n");
    }

    #[test]
    fn test_stream_error_result() {
        let mut state = StreamState::default();
        state.ingest(r#"{"type":"result","is_error":true,"result":"API Error: 529 overloaded"}"#);
        assert!(state.is_error);
    }

    // =========================================================================
    // Subprocess execution
    // =========================================================================

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reports_tool_files_and_completion() {
        let temp = TempDir::new().unwrap();
        let command = script(
            temp.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"src/api/health.rs"}}]}}'
echo '{"type":"result","is_error":false,"result":"done <promise>COMPLETE</promise>","usage":{"input_tokens":12,"output_tokens":3}}'"#,
        );
        let p = provider(temp.path(), &command);

        let result = p.execute("build it", &ExecuteOptions::default()).await;
        assert!(result.success);
        assert!(result.iteration_complete);
        assert_eq!(result.files_changed, vec![FileChange::modified("src/api/health.rs")]);
        assert_eq!(result.token_usage, Some(TokenUsage::new(12, 3)));
        let session = result.conversation_state.unwrap();
        assert_eq!(
            session.downcast_ref::<ClaudeSession>(),
            Some(&ClaudeSession("sess-1".into()))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_classifies_stderr() {
        let temp = TempDir::new().unwrap();
        let command = script(temp.path(), "echo 'Error: rate limit exceeded' >&2\nexit 1");
        let p = provider(temp.path(), &command);

        let result = p.execute("x", &ExecuteOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::RateLimited));
        assert!(result.is_pure_failure());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let p = provider(temp.path(), "tasksmith-no-such-agent-binary");
        assert!(!p.is_available().await);
        let result = p.execute("x", &ExecuteOptions::default()).await;
        assert_eq!(result.error_code, Some(ErrorCode::ProviderUnavailable));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_callback_receives_text() {
        use std::sync::Mutex;
        let temp = TempDir::new().unwrap();
        let command = script(
            temp.path(),
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}'"#,
        );
        let p = provider(temp.path(), &command);
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let options = ExecuteOptions {
            on_output: Some(Arc::new(move |chunk: &str| {
                sink.lock().unwrap().push_str(chunk);
            })),
            ..ExecuteOptions::default()
        };
        let result = p.execute("x", &options).await;
        assert!(result.success);
        assert_eq!(seen.lock().unwrap().as_str(), "hello\n");
    }
}
