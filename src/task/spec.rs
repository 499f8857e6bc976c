//! Task markdown parsing.
//!
//! A task file looks like:
//!
//! ```markdown
//! # Task: Add health endpoint
//!
//! ## Goal
//! Add a /health endpoint
//!
//! ## Task Type
//! feature
//!
//! ## Scope
//! ### Allowed
//! - `src/api/**`
//! ### Forbidden
//! - `src/api/secrets.rs`
//!
//! ## Requirements
//! - ...
//!
//! ## Definition of Done
//! - ...
//! ```
//!
//! Anything inside the status block is ignored here; see [`super::status`].

use super::status::strip_status_block;
use crate::error::{Result, TaskError};
use std::path::{Path, PathBuf};

/// The static part of a task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub path: PathBuf,
    pub title: String,
    pub goal: String,
    pub task_type: String,
    pub allowed: Vec<String>,
    pub forbidden: Vec<String>,
    pub requirements: String,
    pub definition_of_done: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Goal,
    TaskType,
    Scope,
    Allowed,
    Forbidden,
    Requirements,
    DefinitionOfDone,
    Other,
}

impl TaskSpec {
    /// Read and parse a task file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or
    /// [`TaskError::TaskParse`] if a required section is missing.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(path, &content)
    }

    /// Parse task markdown.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskParse`] naming the first missing section.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let body = strip_status_block(content);

        let mut title = None;
        let mut section = Section::Preamble;
        let mut seen = Vec::new();
        let mut goal = String::new();
        let mut task_type = String::new();
        let mut allowed = Vec::new();
        let mut forbidden = Vec::new();
        let mut requirements = String::new();
        let mut dod = String::new();
        let mut in_fence = false;

        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("```") {
                in_fence = !in_fence;
            }

            if !in_fence {
                if let Some(heading) = trimmed.strip_prefix("### ") {
                    if matches!(section, Section::Scope | Section::Allowed | Section::Forbidden) {
                        section = match heading.trim().to_ascii_lowercase().as_str() {
                            "allowed" => Section::Allowed,
                            "forbidden" => Section::Forbidden,
                            _ => Section::Scope,
                        };
                        seen.push(section);
                        continue;
                    }
                } else if let Some(heading) = trimmed.strip_prefix("## ") {
                    section = classify_heading(heading);
                    seen.push(section);
                    continue;
                } else if let Some(heading) = trimmed.strip_prefix("# ") {
                    if title.is_none() {
                        title = Some(
                            heading
                                .trim()
                                .trim_start_matches("Task:")
                                .trim()
                                .to_string(),
                        );
                        continue;
                    }
                }
            }

            match section {
                Section::Goal => push_line(&mut goal, line),
                Section::TaskType => push_line(&mut task_type, line),
                Section::Allowed => allowed.extend(list_item(trimmed)),
                Section::Forbidden => forbidden.extend(list_item(trimmed)),
                Section::Requirements => push_line(&mut requirements, line),
                Section::DefinitionOfDone => push_line(&mut dod, line),
                Section::Preamble | Section::Scope | Section::Other => {}
            }
        }

        for (required, name) in [
            (Section::Goal, "Goal"),
            (Section::TaskType, "Task Type"),
            (Section::Scope, "Scope"),
            (Section::Requirements, "Requirements"),
            (Section::DefinitionOfDone, "Definition of Done"),
        ] {
            if !seen.contains(&required) {
                return Err(TaskError::task_parse(
                    path,
                    format!("missing required section '## {name}'"),
                ));
            }
        }

        let goal = goal.trim().to_string();
        if goal.is_empty() {
            return Err(TaskError::task_parse(path, "'## Goal' is empty"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            title: title.unwrap_or_else(|| goal.lines().next().unwrap_or_default().to_string()),
            goal,
            task_type: task_type.trim().to_ascii_lowercase(),
            allowed,
            forbidden,
            requirements: requirements.trim().to_string(),
            definition_of_done: dod.trim().to_string(),
        })
    }

    /// File stem used in branch names and logs.
    #[must_use]
    pub fn slug(&self) -> String {
        slugify(
            &self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| self.title.clone()),
        )
    }

    /// First line of the goal, cut to `max_chars` characters.
    #[must_use]
    pub fn short_goal(&self, max_chars: usize) -> String {
        let first = self.goal.lines().next().unwrap_or_default().trim();
        if first.chars().count() <= max_chars {
            return first.to_string();
        }
        let cut: String = first.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut.trim_end())
    }
}

fn classify_heading(heading: &str) -> Section {
    match heading.trim().to_ascii_lowercase().as_str() {
        "goal" => Section::Goal,
        "task type" => Section::TaskType,
        "scope" => Section::Scope,
        "requirements" => Section::Requirements,
        "definition of done" => Section::DefinitionOfDone,
        _ => Section::Other,
    }
}

fn push_line(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
}

/// Extract a path pattern from a `- item` / `* item` line, stripping backticks.
fn list_item(line: &str) -> Option<String> {
    let item = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))?
        .trim()
        .trim_matches('`')
        .trim();
    if item.is_empty() || item.eq_ignore_ascii_case("(none)") {
        None
    } else {
        Some(item.to_string())
    }
}

/// Lowercase, alphanumerics and dashes only.
#[must_use]
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}
