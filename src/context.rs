//! Context loading for a task run.
//!
//! The executor treats [`LoadedContext`] as opaque input to prompt building. The
//! default [`FileContextLoader`] reads it from well-known files in the project:
//!
//! ```text
//! .tasksmith/PROJECT.md          project identity
//! .tasksmith/roles/<type>.md     persona for the task type
//! .tasksmith/PLAN.md             optional plan
//! .tasksmith/skills/**/*.md      skill bundles
//! <task file>                    the task itself (required)
//! ```

use crate::config::PathsConfig;
use crate::task::{strip_status_block, TaskSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A named skill bundle included in full prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub content: String,
}

/// Everything the prompt builder needs to know about a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedContext {
    pub project_identity: Option<String>,
    pub role: Option<String>,
    /// Task markdown without its status block.
    pub task_markdown: String,
    pub task: TaskSpec,
    pub plan: Option<String>,
    pub skills: Vec<Skill>,
}

/// Loads the context for a task path.
#[async_trait]
pub trait ContextLoader: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the task file cannot be read or parsed.
    async fn load(&self, task_path: &Path) -> Result<LoadedContext>;
}

/// Reads context from files under the project directory.
#[derive(Debug, Clone)]
pub struct FileContextLoader {
    project_dir: PathBuf,
    paths: PathsConfig,
}

impl FileContextLoader {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, paths: PathsConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            paths,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    fn load_skills(&self) -> Vec<Skill> {
        let dir = self.resolve(&self.paths.skills_dir);
        if !dir.is_dir() {
            return Vec::new();
        }
        let mut skills: Vec<Skill> = WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
            .filter_map(|e| {
                let content = std::fs::read_to_string(e.path()).ok()?;
                let name = e
                    .path()
                    .strip_prefix(&dir)
                    .unwrap_or(e.path())
                    .with_extension("")
                    .to_string_lossy()
                    .to_string();
                Some(Skill { name, content })
            })
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }
}

async fn read_optional(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if !content.trim().is_empty() => Some(content),
        _ => None,
    }
}

#[async_trait]
impl ContextLoader for FileContextLoader {
    async fn load(&self, task_path: &Path) -> Result<LoadedContext> {
        let task_file = self.resolve(task_path);
        let raw = tokio::fs::read_to_string(&task_file)
            .await
            .with_context(|| format!("Failed to read task file {}", task_file.display()))?;
        let task = TaskSpec::parse(task_path, &raw)?;

        let project_identity = read_optional(&self.resolve(&self.paths.project_file)).await;
        let role_file = self
            .resolve(&self.paths.roles_dir)
            .join(format!("{}.md", task.task_type));
        let role = read_optional(&role_file).await;
        let plan = read_optional(&self.resolve(&self.paths.plan_file)).await;
        let skills = self.load_skills();

        debug!(
            task = %task_path.display(),
            has_identity = project_identity.is_some(),
            has_role = role.is_some(),
            has_plan = plan.is_some(),
            skills = skills.len(),
            "Loaded task context"
        );

        Ok(LoadedContext {
            project_identity,
            role,
            task_markdown: strip_status_block(&raw),
            task,
            plan,
            skills,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFixture;

    #[tokio::test]
    async fn test_loads_task_only() {
        let fixture = TestFixture::minimal_project();
        let loader = FileContextLoader::new(fixture.path(), PathsConfig::default());
        let ctx = loader.load(Path::new("tasks/sample.md")).await.unwrap();
        assert_eq!(ctx.task.task_type, "feature");
        assert!(ctx.project_identity.is_none());
        assert!(ctx.role.is_none());
        assert!(ctx.skills.is_empty());
    }

    #[tokio::test]
    async fn test_loads_optional_files() {
        let fixture = TestFixture::minimal_project();
        fixture.write_file(".tasksmith/PROJECT.md", "Acme API").unwrap();
        fixture.write_file(".tasksmith/roles/feature.md", "You build features").unwrap();
        fixture.write_file(".tasksmith/PLAN.md", "1. health").unwrap();
        fixture.write_file(".tasksmith/skills/rust/errors.md", "Use thiserror").unwrap();
        fixture.write_file(".tasksmith/skills/api.md", "REST rules").unwrap();
        fixture.write_file(".tasksmith/skills/notes.txt", "ignored").unwrap();

        let loader = FileContextLoader::new(fixture.path(), PathsConfig::default());
        let ctx = loader.load(Path::new("tasks/sample.md")).await.unwrap();
        assert_eq!(ctx.project_identity.as_deref(), Some("Acme API"));
        assert_eq!(ctx.role.as_deref(), Some("You build features"));
        assert_eq!(ctx.plan.as_deref(), Some("1. health"));
        let names: Vec<_> = ctx.skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "rust/errors"]);
    }

    #[tokio::test]
    async fn test_missing_task_is_error() {
        let fixture = TestFixture::minimal_project();
        let loader = FileContextLoader::new(fixture.path(), PathsConfig::default());
        assert!(loader.load(Path::new("tasks/nope.md")).await.is_err());
    }

    #[tokio::test]
    async fn test_status_block_stripped_from_markdown() {
        let fixture = TestFixture::minimal_project();
        let mut content = fixture.read_file("tasks/sample.md").unwrap();
        content.push_str("\n<!-- tasksmith:status -->\n## Status: FAILED\n<!-- /tasksmith:status -->\n");
        fixture.write_file("tasks/sample.md", &content).unwrap();

        let loader = FileContextLoader::new(fixture.path(), PathsConfig::default());
        let ctx = loader.load(Path::new("tasks/sample.md")).await.unwrap();
        assert!(!ctx.task_markdown.contains("Status: FAILED"));
    }
}
