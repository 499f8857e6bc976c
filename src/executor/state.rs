//! Run state owned by one task execution.

use crate::provider::{ConversationState, TokenUsage};
use crate::quality::ValidationSummary;
use crate::task::BlockedStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Blocked,
    Failed,
}

impl RunStatus {
    /// Completed, blocked and failed runs never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Blocked | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why the execution loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    /// The agent printed a blocking tag.
    Blocked,
    MaxIterations,
    MaxFailures,
    DryRun,
    /// A failure whose policy is abort.
    Aborted,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::MaxIterations => "max_iterations",
            Self::MaxFailures => "max_failures",
            Self::DryRun => "dry_run",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Mutable state of one task run, threaded through PreFlight, the loop and
/// PostFlight. Never shared between tasks.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub status: RunStatus,
    pub iteration: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Ordered, without duplicates.
    pub files_modified: Vec<PathBuf>,
    pub validation_results: Vec<ValidationSummary>,
    pub token_usage: TokenUsage,
    pub context_tokens: u64,
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append paths not already recorded, keeping first-seen order.
    pub fn add_files<I>(&mut self, files: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for file in files {
            if !self.files_modified.contains(&file) {
                self.files_modified.push(file);
            }
        }
    }
}

/// Loop-local state for a single execution loop call.
#[derive(Debug, Clone, Default)]
pub struct IterationState {
    pub consecutive_failures: u32,
    /// Report fed into the next prompt after a failed check.
    pub last_validation_error: Option<String>,
    pub previous_output: Option<String>,
    pub conversation: Option<ConversationState>,
    pub blocked_status: Option<BlockedStatus>,
    /// In-scope changes from failed passes, not yet committed.
    pub pending_files: Vec<PathBuf>,
}

impl IterationState {
    #[must_use]
    pub fn resuming(blocked_status: Option<BlockedStatus>) -> Self {
        Self {
            blocked_status,
            ..Self::default()
        }
    }

    pub fn remember<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in paths {
            if !self.pending_files.contains(&path) {
                self.pending_files.push(path);
            }
        }
    }

    /// Drop files that were reverted to their committed state.
    pub fn forget(&mut self, reverted: &[PathBuf]) {
        self.pending_files.retain(|p| !reverted.contains(p));
    }

    /// Pending files followed by `current`, without duplicates.
    #[must_use]
    pub fn with_pending(&self, current: &[PathBuf]) -> Vec<PathBuf> {
        let mut paths = self.pending_files.clone();
        for path in current {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_files_merge_and_forget() {
        let mut iter = IterationState::default();
        iter.remember(vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")]);
        iter.remember(vec![PathBuf::from("a.rs")]);
        iter.forget(&[PathBuf::from("b.rs")]);
        assert_eq!(iter.pending_files, vec![PathBuf::from("a.rs")]);

        let merged = iter.with_pending(&[PathBuf::from("c.rs"), PathBuf::from("a.rs")]);
        assert_eq!(merged, vec![PathBuf::from("a.rs"), PathBuf::from("c.rs")]);
    }

    #[test]
    fn test_add_files_deduplicates_in_order() {
        let mut state = RunState::new();
        state.add_files(vec![PathBuf::from("b.rs"), PathBuf::from("a.rs")]);
        state.add_files(vec![PathBuf::from("a.rs"), PathBuf::from("c.rs")]);
        assert_eq!(
            state.files_modified,
            vec![
                PathBuf::from("b.rs"),
                PathBuf::from("a.rs"),
                PathBuf::from("c.rs")
            ]
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Blocked.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunStatus::Blocked).unwrap(), "\"blocked\"");
        assert_eq!(
            serde_json::to_string(&TerminationReason::MaxIterations).unwrap(),
            "\"max_iterations\""
        );
    }
}
