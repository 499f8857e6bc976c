//! Best-effort run notifications.
//!
//! Notifiers never fail a run: every transport error is logged and dropped.

use crate::config::{NotificationConfig, NotifyEvent};
use crate::executor::{ExecutorResult, RunStatus};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Payload sent for a finished task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event: NotifyEvent,
    pub task: PathBuf,
    pub iterations: u32,
    pub files_modified: usize,
    pub message: String,
}

impl Notification {
    /// Notification for a finished run. Non-terminal results produce none.
    #[must_use]
    pub fn from_result(result: &ExecutorResult) -> Option<Self> {
        let event = match result.status {
            RunStatus::Completed => NotifyEvent::Completed,
            RunStatus::Blocked => NotifyEvent::Blocked,
            RunStatus::Failed => NotifyEvent::Failed,
            RunStatus::Idle | RunStatus::Running | RunStatus::Paused => return None,
        };
        let message = match event {
            NotifyEvent::Completed => format!("Completed in {} iteration(s)", result.iterations),
            NotifyEvent::Blocked => result
                .blocked_reason
                .clone()
                .unwrap_or_else(|| "Blocked".to_string()),
            NotifyEvent::Failed => result
                .error
                .clone()
                .unwrap_or_else(|| "Failed".to_string()),
        };
        Some(Self {
            event,
            task: result.task_path.clone(),
            iterations: result.iterations,
            files_modified: result.files_modified.len(),
            message,
        })
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Implementations swallow their own errors.
    async fn notify(&self, notification: &Notification);
}

/// Drops every notification.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: &Notification) {}
}

/// POSTs the JSON payload through `curl`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    events: Vec<NotifyEvent>,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: impl Into<String>, events: Vec<NotifyEvent>) -> Self {
        Self {
            url: url.into(),
            events,
        }
    }

    async fn post(&self, body: &str) -> anyhow::Result<()> {
        let mut child = Command::new("curl")
            .args([
                "-s",
                "-f",
                "-X",
                "POST",
                "-H",
                "Content-Type: application/json",
                "--max-time",
                "10",
                "--data-binary",
                "@-",
                self.url.as_str(),
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "webhook returned failure: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) {
        if !self.events.contains(&notification.event) {
            return;
        }
        let body = match serde_json::to_string(notification) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize notification");
                return;
            }
        };
        match self.post(&body).await {
            Ok(()) => debug!(event = %notification.event, "Webhook notification sent"),
            Err(e) => warn!(error = %e, "Webhook notification failed"),
        }
    }
}

/// Runs a shell command with `TASKSMITH_*` variables set.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
    events: Vec<NotifyEvent>,
}

impl CommandNotifier {
    #[must_use]
    pub fn new(command: impl Into<String>, events: Vec<NotifyEvent>) -> Self {
        Self {
            command: command.into(),
            events,
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, notification: &Notification) {
        if !self.events.contains(&notification.event) {
            return;
        }
        let result = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("TASKSMITH_EVENT", notification.event.to_string())
            .env("TASKSMITH_TASK", &notification.task)
            .env("TASKSMITH_ITERATIONS", notification.iterations.to_string())
            .env("TASKSMITH_FILES_MODIFIED", notification.files_modified.to_string())
            .env("TASKSMITH_MESSAGE", &notification.message)
            .stdin(Stdio::null())
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!(event = %notification.event, "Notification command ran");
            }
            Ok(output) => warn!(
                exit_code = ?output.status.code(),
                "Notification command failed"
            ),
            Err(e) => warn!(error = %e, "Failed to run notification command"),
        }
    }
}

/// Fans a notification out to several notifiers.
#[derive(Clone, Default)]
pub struct CompositeNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, notification: &Notification) {
        for notifier in &self.inner {
            notifier.notify(notification).await;
        }
    }
}

/// Build the notifier described by config.
#[must_use]
pub fn notifier_from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    if !config.enabled {
        return Arc::new(NoopNotifier);
    }
    let mut inner: Vec<Arc<dyn Notifier>> = Vec::new();
    if let Some(ref url) = config.webhook_url {
        inner.push(Arc::new(WebhookNotifier::new(url, config.events.clone())));
    }
    if let Some(ref command) = config.command {
        inner.push(Arc::new(CommandNotifier::new(command, config.events.clone())));
    }
    match inner.len() {
        0 => Arc::new(NoopNotifier),
        1 => inner.remove(0),
        _ => Arc::new(CompositeNotifier { inner }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn notification(event: NotifyEvent) -> Notification {
        Notification {
            event,
            task: PathBuf::from("tasks/x.md"),
            iterations: 3,
            files_modified: 2,
            message: "done".into(),
        }
    }

    #[tokio::test]
    async fn test_command_notifier_sets_env() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let notifier = CommandNotifier::new(
            format!(
                "echo \"$TASKSMITH_EVENT $TASKSMITH_TASK $TASKSMITH_ITERATIONS\" > {}",
                out.display()
            ),
            vec![NotifyEvent::Completed],
        );
        notifier.notify(&notification(NotifyEvent::Completed)).await;
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "completed tasks/x.md 3");
    }

    #[tokio::test]
    async fn test_command_notifier_filters_events() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let notifier = CommandNotifier::new(
            format!("touch {}", out.display()),
            vec![NotifyEvent::Failed],
        );
        notifier.notify(&notification(NotifyEvent::Completed)).await;
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_failing_command_does_not_panic() {
        let notifier = CommandNotifier::new("exit 7", vec![NotifyEvent::Blocked]);
        notifier.notify(&notification(NotifyEvent::Blocked)).await;
    }

    #[test]
    fn test_notification_serializes_event_lowercase() {
        let json = serde_json::to_string(&notification(NotifyEvent::Blocked)).unwrap();
        assert!(json.contains("\"event\":\"blocked\""));
    }

    #[test]
    fn test_from_result_maps_status() {
        let mut result = ExecutorResult::crashed(std::path::Path::new("tasks/x.md"), "boom");
        let failed = Notification::from_result(&result).unwrap();
        assert_eq!(failed.event, NotifyEvent::Failed);
        assert_eq!(failed.message, "boom");

        result.status = RunStatus::Blocked;
        result.blocked_reason = Some("Max iterations (3) reached without completion".into());
        let blocked = Notification::from_result(&result).unwrap();
        assert_eq!(blocked.event, NotifyEvent::Blocked);
        assert!(blocked.message.starts_with("Max iterations"));

        result.status = RunStatus::Idle;
        assert!(Notification::from_result(&result).is_none());
    }

    #[tokio::test]
    async fn test_disabled_config_is_noop() {
        let config = NotificationConfig {
            command: Some("exit 1".into()),
            ..NotificationConfig::default()
        };
        let notifier = notifier_from_config(&config);
        notifier.notify(&notification(NotifyEvent::Failed)).await;
    }
}
