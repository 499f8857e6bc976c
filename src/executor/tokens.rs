//! Context token estimates and the final usage summary.

use crate::config::CostConfig;
use crate::context::LoadedContext;
use crate::provider::TokenUsage;
use serde::Serialize;
use std::collections::BTreeMap;

/// Rough token count: four characters per token, rounded up.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimated tokens for each part of a full prompt's context.
#[must_use]
pub fn context_breakdown(context: &LoadedContext) -> BTreeMap<String, u64> {
    let mut parts = BTreeMap::new();
    let mut put = |name: &str, text: Option<&str>| {
        if let Some(text) = text {
            parts.insert(name.to_string(), estimate_tokens(text));
        }
    };
    put("project", context.project_identity.as_deref());
    put("role", context.role.as_deref());
    put("task", Some(&context.task_markdown));
    put("plan", context.plan.as_deref());
    if !context.skills.is_empty() {
        let skills: u64 = context
            .skills
            .iter()
            .map(|s| estimate_tokens(&s.content))
            .sum();
        parts.insert("skills".to_string(), skills);
    }
    parts
}

/// Token usage attached to an executor result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenSummary {
    /// Estimated size of the static context.
    pub context: u64,
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub cost_usd: f64,
    pub breakdown: BTreeMap<String, u64>,
}

impl TokenSummary {
    /// Combine the context estimate with accumulated provider usage.
    ///
    /// Cost is a flat per-million-token rate on reported input and output.
    #[must_use]
    pub fn new(breakdown: BTreeMap<String, u64>, usage: TokenUsage, cost: &CostConfig) -> Self {
        let context = breakdown.values().sum();
        let cost_usd = (usage.input_tokens as f64 * cost.input_per_million
            + usage.output_tokens as f64 * cost.output_per_million)
            / 1_000_000.0;
        Self {
            context,
            input: usage.input_tokens,
            output: usage.output_tokens,
            total: usage.total(),
            cost_usd,
            breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Skill;
    use crate::task::TaskSpec;
    use std::path::Path;

    fn context() -> LoadedContext {
        let markdown = crate::testing::TestFixture::task_content("Ship it", &["src/**"], &[]);
        LoadedContext {
            project_identity: Some("a".repeat(40)),
            role: None,
            task: TaskSpec::parse(Path::new("t.md"), &markdown).unwrap(),
            task_markdown: markdown,
            plan: None,
            skills: vec![
                Skill {
                    name: "one".into(),
                    content: "x".repeat(8),
                },
                Skill {
                    name: "two".into(),
                    content: "y".repeat(5),
                },
            ],
        }
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_breakdown_skips_missing_parts() {
        let parts = context_breakdown(&context());
        assert_eq!(parts.get("project"), Some(&10));
        assert_eq!(parts.get("skills"), Some(&4));
        assert!(parts.contains_key("task"));
        assert!(!parts.contains_key("role"));
        assert!(!parts.contains_key("plan"));
    }

    #[test]
    fn test_summary_cost() {
        let mut breakdown = BTreeMap::new();
        breakdown.insert("task".to_string(), 100);
        let summary = TokenSummary::new(
            breakdown,
            TokenUsage::new(1_000_000, 100_000),
            &CostConfig {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
        );
        assert_eq!(summary.context, 100);
        assert_eq!(summary.total, 1_100_000);
        assert!((summary.cost_usd - 4.5).abs() < 1e-9);
    }
}
