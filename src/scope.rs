//! Scope guard: classifies proposed file changes against a task's scope.
//!
//! A task declares allowed and forbidden glob patterns. For every batch of
//! changes the guard answers with a single [`ScopeDecision`]:
//!
//! | Path is...                     | strict | ask      | permissive      |
//! |--------------------------------|--------|----------|-----------------|
//! | forbidden                      | BLOCK  | BLOCK    | BLOCK           |
//! | allowed, not forbidden         | ALLOW  | ALLOW    | ALLOW           |
//! | neither                        | BLOCK  | ASK_USER | ALLOW + warning |
//!
//! Any BLOCK in the batch blocks the whole batch; ASK_USER wins only when
//! nothing is blocked. Files approved through [`ScopeGuard::approve`] count as
//! allowed for the rest of the run, but never override a forbidden match.

use crate::config::ScopeMode;
use crate::error::{ErrorCode, Result, TaskError};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Kind of change the agent made to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// A single proposed change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileChange {
    pub path: PathBuf,
    pub change_type: ChangeType,
}

impl FileChange {
    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            change_type: ChangeType::Modified,
        }
    }
}

/// Verdict for a batch of changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeAction {
    Allow,
    AskUser,
    Block,
}

impl std::fmt::Display for ScopeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::AskUser => write!(f, "ASK_USER"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// Result of [`ScopeGuard::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDecision {
    pub action: ScopeAction,
    pub reason: String,
    /// Files the action applies to: blocked files for BLOCK, files needing
    /// approval for ASK_USER, every checked file for ALLOW.
    pub files: Vec<PathBuf>,
    /// Failure code when the batch is blocked.
    pub code: Option<ErrorCode>,
}

impl ScopeDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.action == ScopeAction::Allow
    }
}

/// Per-file classification before batch escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileVerdict {
    Allowed,
    Forbidden,
    Outside,
}

/// Enforces a task's allow/forbid patterns.
#[derive(Debug, Clone)]
pub struct ScopeGuard {
    mode: ScopeMode,
    allowed: GlobSet,
    forbidden: GlobSet,
    allowed_patterns: Vec<String>,
    forbidden_patterns: Vec<String>,
    approved: BTreeSet<PathBuf>,
}

impl ScopeGuard {
    /// Build a guard from raw glob patterns.
    ///
    /// A pattern without glob metacharacters also matches everything below it,
    /// so `src/api` behaves like `src/api/**`.
    ///
    /// # Errors
    ///
    /// Returns a config error if a pattern is not a valid glob.
    pub fn new(allowed: &[String], forbidden: &[String], mode: ScopeMode) -> Result<Self> {
        Ok(Self {
            mode,
            allowed: build_set(allowed)?,
            forbidden: build_set(forbidden)?,
            allowed_patterns: allowed.to_vec(),
            forbidden_patterns: forbidden.to_vec(),
            approved: BTreeSet::new(),
        })
    }

    #[must_use]
    pub fn mode(&self) -> ScopeMode {
        self.mode
    }

    #[must_use]
    pub fn allowed_patterns(&self) -> &[String] {
        &self.allowed_patterns
    }

    #[must_use]
    pub fn forbidden_patterns(&self) -> &[String] {
        &self.forbidden_patterns
    }

    /// Classify a batch of changes.
    #[must_use]
    pub fn validate(&self, changes: &[FileChange]) -> ScopeDecision {
        let mut forbidden = Vec::new();
        let mut outside = Vec::new();
        let mut all = Vec::with_capacity(changes.len());

        for change in changes {
            let path = normalize(&change.path);
            match self.classify(&path) {
                FileVerdict::Allowed => {}
                FileVerdict::Forbidden => forbidden.push(path.clone()),
                FileVerdict::Outside => outside.push(path.clone()),
            }
            all.push(path);
        }

        if !forbidden.is_empty() {
            let mut files = forbidden;
            let mut reason = format!("Modified forbidden path(s): {}", join_paths(&files));
            // Outside files ride along with the block unless permissive.
            if self.mode != ScopeMode::Permissive && !outside.is_empty() {
                reason.push_str(&format!(
                    "; outside allowed scope: {}",
                    join_paths(&outside)
                ));
                files.extend(outside);
            }
            return ScopeDecision {
                action: ScopeAction::Block,
                reason,
                files,
                code: Some(ErrorCode::ForbiddenPath),
            };
        }

        if outside.is_empty() {
            return ScopeDecision {
                action: ScopeAction::Allow,
                reason: "All changes within allowed scope".to_string(),
                files: all,
                code: None,
            };
        }

        match self.mode {
            ScopeMode::Strict => ScopeDecision {
                action: ScopeAction::Block,
                reason: format!("Modified path(s) outside allowed scope: {}", join_paths(&outside)),
                files: outside,
                code: Some(ErrorCode::OutsideAllowed),
            },
            ScopeMode::Ask => ScopeDecision {
                action: ScopeAction::AskUser,
                reason: format!(
                    "Approval needed for path(s) outside allowed scope: {}",
                    join_paths(&outside)
                ),
                files: outside,
                code: None,
            },
            ScopeMode::Permissive => {
                warn!(
                    files = %join_paths(&outside),
                    "Changes outside allowed scope accepted in permissive mode"
                );
                ScopeDecision {
                    action: ScopeAction::Allow,
                    reason: format!(
                        "Allowed with warning, outside allowed scope: {}",
                        join_paths(&outside)
                    ),
                    files: all,
                    code: None,
                }
            }
        }
    }

    /// Whitelist files for the rest of the run. Idempotent.
    pub fn approve<I, P>(&mut self, files: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for file in files {
            self.approved.insert(normalize(file.as_ref()));
        }
    }

    #[must_use]
    pub fn approved(&self) -> &BTreeSet<PathBuf> {
        &self.approved
    }

    fn classify(&self, path: &Path) -> FileVerdict {
        if self.forbidden.is_match(path) {
            FileVerdict::Forbidden
        } else if self.allowed.is_match(path) || self.approved.contains(path) {
            FileVerdict::Allowed
        } else {
            FileVerdict::Outside
        }
    }
}

/// True if the pattern contains glob metacharacters.
#[must_use]
pub fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Strip `./` prefixes and trailing slashes from a pattern or path string.
#[must_use]
pub fn normalize_pattern(pattern: &str) -> String {
    let mut p = pattern.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/').to_string()
}

fn normalize(path: &Path) -> PathBuf {
    PathBuf::from(normalize_pattern(&path.to_string_lossy()))
}

fn build_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for raw in patterns {
        let pattern = normalize_pattern(raw);
        if pattern.is_empty() {
            continue;
        }
        builder.add(compile(&pattern)?);
        if !has_glob_meta(&pattern) {
            builder.add(compile(&format!("{pattern}/**"))?);
        }
    }
    builder
        .build()
        .map_err(|e| TaskError::config(format!("Invalid scope patterns: {e}")))
}

fn compile(pattern: &str) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| TaskError::config(format!("Invalid glob '{pattern}': {e}")))
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
