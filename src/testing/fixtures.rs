//! Test fixtures for creating reproducible project directories.
//!
//! Provides a throwaway git repository holding a sample task file.

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// A temporary project directory.
///
/// Automatically cleans up when dropped.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = TestFixture::with_git_repo();
/// assert!(fixture.path().join("tasks/sample.md").exists());
/// ```
pub struct TestFixture {
    temp_dir: TempDir,
    is_git_repo: bool,
}

impl TestFixture {
    /// A project with a README and one task file, no git.
    ///
    /// # Panics
    ///
    /// Panics if temporary directory creation fails.
    #[must_use]
    pub fn minimal_project() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let fixture = Self {
            temp_dir,
            is_git_repo: false,
        };
        fixture
            .write_file("README.md", "# Fixture\n")
            .expect("Failed to write README.md");
        fixture
            .write_file("tasks/sample.md", Self::sample_task_content())
            .expect("Failed to write sample task");
        fixture
    }

    /// A minimal project committed into a fresh git repository.
    ///
    /// # Panics
    ///
    /// Panics if git initialization fails.
    #[must_use]
    pub fn with_git_repo() -> Self {
        let mut fixture = Self::minimal_project();

        fixture.git(&["init", "-q"]);
        fixture.git(&["config", "user.email", "test@example.com"]);
        fixture.git(&["config", "user.name", "Test User"]);
        fixture.git(&["config", "commit.gpgsign", "false"]);
        fixture.git(&["add", "."]);
        fixture.git(&["commit", "-q", "-m", "Initial commit"]);

        fixture.is_git_repo = true;
        fixture
    }

    fn git(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.temp_dir.path())
            .output()
            .expect("Failed to run git");
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// Get the path to the fixture directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Get the path as a PathBuf (owned).
    #[must_use]
    pub fn path_buf(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Check if this is a git repository.
    #[must_use]
    pub fn is_git_repo(&self) -> bool {
        self.is_git_repo && self.temp_dir.path().join(".git").exists()
    }

    /// Write a file to the fixture directory, creating parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_file(&self, relative_path: &str, content: &str) -> std::io::Result<()> {
        let path = self.temp_dir.path().join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    /// Read a file from the fixture directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_file(&self, relative_path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.temp_dir.path().join(relative_path))
    }

    /// Commit everything in the working tree.
    ///
    /// # Panics
    ///
    /// Panics if not a git repo or the commit fails.
    pub fn make_commit(&self, message: &str) {
        assert!(self.is_git_repo, "Not a git repository");
        self.git(&["add", "."]);
        self.git(&["commit", "-q", "--allow-empty", "-m", message]);
    }

    /// Number of commits reachable from HEAD.
    ///
    /// # Panics
    ///
    /// Panics if not a git repo.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        assert!(self.is_git_repo, "Not a git repository");
        let output = Command::new("git")
            .args(["rev-list", "--count", "HEAD"])
            .current_dir(self.temp_dir.path())
            .output()
            .expect("Failed to count commits");
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .unwrap_or(0)
    }

    /// Task markdown with the given allowed patterns.
    #[must_use]
    pub fn task_content(goal: &str, allowed: &[&str], forbidden: &[&str]) -> String {
        let list = |items: &[&str]| {
            items
                .iter()
                .map(|i| format!("- `{i}`"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "# Task: {goal}\n\n## Goal\n{goal}\n\n## Task Type\nfeature\n\n## Scope\n\n### Allowed\n{}\n\n### Forbidden\n{}\n\n## Requirements\n- Keep the public API stable\n\n## Definition of Done\n- Tests pass\n",
            list(allowed),
            list(forbidden)
        )
    }

    fn sample_task_content() -> &'static str {
        r#"# Task: Add health endpoint

## Goal
Add a /health endpoint that reports service status

## Task Type
feature

## Scope

### Allowed
- `src/api/**`
- `tests/api/**`

### Forbidden
- `src/api/secrets.rs`
- `Cargo.lock`

## Requirements
- Return 200 with a JSON body
- Include the build version

## Definition of Done
- Endpoint responds in tests
- No new warnings
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_project_has_task() {
        let fixture = TestFixture::minimal_project();
        assert!(fixture.path().join("tasks/sample.md").exists());
        assert!(!fixture.is_git_repo());
    }

    #[test]
    fn test_with_git_repo_initializes_git() {
        let fixture = TestFixture::with_git_repo();
        assert!(fixture.is_git_repo());
        assert_eq!(fixture.commit_count(), 1);
    }

    #[test]
    fn test_write_file_creates_directories() {
        let fixture = TestFixture::minimal_project();
        fixture.write_file("src/nested/file.rs", "// nested").unwrap();
        assert_eq!(fixture.read_file("src/nested/file.rs").unwrap(), "// nested");
    }

    #[test]
    fn test_make_commit() {
        let fixture = TestFixture::with_git_repo();
        fixture.write_file("new_file.txt", "content").unwrap();
        fixture.make_commit("Add new file");
        assert_eq!(fixture.commit_count(), 2);
    }

    #[test]
    fn test_task_content_lists_patterns() {
        let content = TestFixture::task_content("Do it", &["src/a/**"], &[]);
        assert!(content.contains("- `src/a/**`"));
        assert!(content.contains("## Definition of Done"));
    }
}
