//! Shell-command quality gate.

use super::{CommandResult, QualityGate, ValidationPhase, ValidationSummary};
use crate::config::ValidationConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs each configured command through `sh -c` in the project directory.
///
/// Commands run in order and all of them run even after a failure, so the
/// report shows every broken check at once.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    project_dir: PathBuf,
    pre_commit: Vec<String>,
    pre_push: Vec<String>,
    timeout: Duration,
}

impl CommandValidator {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, config: &ValidationConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            pre_commit: config.pre_commit.clone(),
            pre_push: config.pre_push.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    /// Override the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_phase(&self, phase: ValidationPhase, commands: &[String]) -> ValidationSummary {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = self.run_command(command).await;
            if !result.passed {
                warn!(%phase, command = %command, exit_code = ?result.exit_code, "Quality check failed");
            }
            results.push(result);
        }
        let summary = ValidationSummary::from_results(phase, results);
        debug!(
            %phase,
            passed = summary.passed,
            commands = summary.results.len(),
            "Validation phase finished"
        );
        summary
    }

    async fn run_command(&self, command: &str) -> CommandResult {
        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let mut result =
                    CommandResult::fail(command, None, format!("Failed to spawn: {e}"));
                result.duration = started.elapsed();
                return result;
            }
        };

        let output = if self.timeout.is_zero() {
            child.wait_with_output().await
        } else {
            match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    let mut result = CommandResult::fail(
                        command,
                        None,
                        format!("Timed out after {}s", self.timeout.as_secs()),
                    );
                    result.timed_out = true;
                    result.duration = started.elapsed();
                    return result;
                }
            }
        };

        match output {
            Ok(output) => CommandResult {
                command: command.to_string(),
                passed: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: started.elapsed(),
                timed_out: false,
            },
            Err(e) => {
                let mut result = CommandResult::fail(command, None, format!("Failed to wait: {e}"));
                result.duration = started.elapsed();
                result
            }
        }
    }
}

#[async_trait]
impl QualityGate for CommandValidator {
    async fn pre_commit(&self) -> ValidationSummary {
        self.run_phase(ValidationPhase::PreCommit, &self.pre_commit).await
    }

    async fn pre_push(&self) -> ValidationSummary {
        self.run_phase(ValidationPhase::PrePush, &self.pre_push).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn validator(dir: &TempDir, pre_commit: &[&str]) -> CommandValidator {
        let config = ValidationConfig {
            pre_commit: pre_commit.iter().map(|s| s.to_string()).collect(),
            pre_push: Vec::new(),
            command_timeout_secs: 30,
        };
        CommandValidator::new(dir.path(), &config)
    }

    #[tokio::test]
    async fn test_no_commands_passes() {
        let temp = TempDir::new().unwrap();
        let summary = validator(&temp, &[]).pre_commit().await;
        assert!(summary.passed);
        assert!(summary.results.is_empty());
    }

    #[tokio::test]
    async fn test_all_commands_pass() {
        let temp = TempDir::new().unwrap();
        let summary = validator(&temp, &["true", "echo ok"]).pre_commit().await;
        assert!(summary.passed);
        assert_eq!(summary.results.len(), 2);
        assert!(summary.results[1].stdout.contains("ok"));
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let temp = TempDir::new().unwrap();
        let summary = validator(&temp, &["echo broken >&2; exit 3", "true"])
            .pre_commit()
            .await;
        assert!(!summary.passed);
        assert_eq!(summary.results[0].exit_code, Some(3));
        assert!(summary.results[0].stderr.contains("broken"));
        // later commands still run
        assert!(summary.results[1].passed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let temp = TempDir::new().unwrap();
        let summary = validator(&temp, &["sleep 5"])
            .with_timeout(Duration::from_millis(100))
            .pre_commit()
            .await;
        assert!(!summary.passed);
        assert!(summary.results[0].timed_out);
    }

    #[tokio::test]
    async fn test_runs_in_project_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "x").unwrap();
        let summary = validator(&temp, &["test -f marker.txt"]).pre_commit().await;
        assert!(summary.passed);
    }
}
