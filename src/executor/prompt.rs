//! Prompt construction for full and continuation passes.

use crate::context::LoadedContext;
use crate::provider::markers::{BLOCKING_TAG_EXAMPLE, COMPLETION_TAG};
use crate::task::BlockedStatus;

/// Characters of previous output carried into a continuation prompt.
const PREVIOUS_OUTPUT_CHARS: usize = 4000;

/// Everything the agent needs on a first pass or after losing its session.
#[must_use]
pub fn build_full_prompt(
    context: &LoadedContext,
    blocked: Option<&BlockedStatus>,
    feedback: Option<&str>,
) -> String {
    let mut sections = Vec::new();

    if let Some(ref identity) = context.project_identity {
        sections.push(format!("# Project\n\n{}", identity.trim()));
    }
    if let Some(ref role) = context.role {
        sections.push(format!("# Role\n\n{}", role.trim()));
    }
    sections.push(format!("# Task\n\n{}", context.task_markdown.trim()));
    if let Some(ref plan) = context.plan {
        sections.push(format!("# Plan\n\n{}", plan.trim()));
    }
    if !context.skills.is_empty() {
        let skills = context
            .skills
            .iter()
            .map(|s| format!("## {}\n\n{}", s.name, s.content.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        sections.push(format!("# Skills\n\n{skills}"));
    }
    if let Some(blocked) = blocked {
        sections.push(resume_section(blocked));
    }
    if let Some(feedback) = feedback {
        sections.push(format!("# Feedback From Last Pass\n\n{}", feedback.trim()));
    }
    sections.push(rules_section(context));

    sections.join("\n\n") + "\n"
}

/// Short prompt for a pass that continues an existing session.
#[must_use]
pub fn build_continuation_prompt(previous_output: Option<&str>, feedback: Option<&str>) -> String {
    let mut out = String::from("Continue working on the task.\n");
    if let Some(previous) = previous_output.filter(|p| !p.trim().is_empty()) {
        out.push_str("\n## Your Previous Output\n\n");
        out.push_str(tail(previous.trim(), PREVIOUS_OUTPUT_CHARS));
        out.push('\n');
    }
    if let Some(feedback) = feedback {
        out.push_str("\n## Fix These Problems First\n\n");
        out.push_str(feedback.trim());
        out.push('\n');
    }
    out.push_str(&format!(
        "\nWhen every item in the Definition of Done holds, print {COMPLETION_TAG}. \
         If you cannot proceed, print {BLOCKING_TAG_EXAMPLE}.\n"
    ));
    out
}

fn resume_section(blocked: &BlockedStatus) -> String {
    let mut out = format!(
        "# Resuming A Blocked Task\n\nThis task was blocked at iteration {}.\n\nBlocking issue:\n{}\n",
        blocked.previous_iteration,
        blocked.blocking_issue.trim()
    );
    if !blocked.files_modified.is_empty() {
        out.push_str("\nFiles already modified:\n");
        for file in &blocked.files_modified {
            out.push_str(&format!("- {}\n", file.display()));
        }
    }
    out.push_str("\nCheck whether the issue has been resolved before continuing.");
    out
}

fn rules_section(context: &LoadedContext) -> String {
    let list = |patterns: &[String]| {
        if patterns.is_empty() {
            "- (none)".to_string()
        } else {
            patterns
                .iter()
                .map(|p| format!("- `{p}`"))
                .collect::<Vec<_>>()
                .join("\n")
        }
    };
    format!(
        "# Rules\n\n\
         Only modify files matching:\n{}\n\n\
         Never modify:\n{}\n\n\
         Changes outside this scope are reverted. Quality checks run after every pass and \
         failures are reported back to you.\n\n\
         When every item in the Definition of Done holds, print {COMPLETION_TAG} on its own line.\n\
         If you cannot proceed without outside help, print {BLOCKING_TAG_EXAMPLE} with the reason.",
        list(&context.task.allowed),
        list(&context.task.forbidden)
    )
}

/// Last `max_chars` characters of `text`, on a char boundary.
fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use crate::testing::TestFixture;
    use chrono::Utc;
    use std::path::{Path, PathBuf};

    fn context() -> LoadedContext {
        let markdown = TestFixture::task_content("Add login", &["src/auth/**"], &["src/db/**"]);
        LoadedContext {
            project_identity: Some("Acme".into()),
            role: Some("Backend engineer".into()),
            task: TaskSpec::parse(Path::new("tasks/login.md"), &markdown).unwrap(),
            task_markdown: markdown,
            plan: None,
            skills: Vec::new(),
        }
    }

    #[test]
    fn test_full_prompt_sections() {
        let prompt = build_full_prompt(&context(), None, None);
        assert!(prompt.starts_with("# Project\n\nAcme"));
        assert!(prompt.contains("# Role\n\nBackend engineer"));
        assert!(prompt.contains("## Goal\nAdd login"));
        assert!(prompt.contains("- `src/auth/**`"));
        assert!(prompt.contains("- `src/db/**`"));
        assert!(prompt.contains(COMPLETION_TAG));
        assert!(!prompt.contains("# Plan"));
        assert!(!prompt.contains("Resuming"));
    }

    #[test]
    fn test_full_prompt_with_resume_and_feedback() {
        let blocked = BlockedStatus {
            previous_iteration: 7,
            files_modified: vec![PathBuf::from("src/auth/mod.rs")],
            blocking_issue: "Missing OAuth secret".into(),
            started_at: Utc::now(),
            blocked_at: Utc::now(),
            attempt_history: Vec::new(),
        };
        let prompt = build_full_prompt(&context(), Some(&blocked), Some("cargo test failed"));
        assert!(prompt.contains("blocked at iteration 7"));
        assert!(prompt.contains("Missing OAuth secret"));
        assert!(prompt.contains("- src/auth/mod.rs"));
        assert!(prompt.contains("# Feedback From Last Pass\n\ncargo test failed"));
    }

    #[test]
    fn test_continuation_prompt_is_light() {
        let prompt = build_continuation_prompt(Some("did step 1"), Some("lint failed"));
        assert!(prompt.starts_with("Continue working on the task."));
        assert!(prompt.contains("did step 1"));
        assert!(prompt.contains("lint failed"));
        assert!(!prompt.contains("# Task"));
    }

    #[test]
    fn test_continuation_prompt_keeps_output_tail() {
        let long = format!("{}END", "é".repeat(5000));
        let prompt = build_continuation_prompt(Some(&long), None);
        assert!(prompt.contains("END"));
        assert!(prompt.len() < long.len());
    }
}
