//! Static dependency detection between tasks.
//!
//! Two tasks conflict when any pair of their allowed patterns may cover the
//! same path. The check is an approximation: literal prefixes are compared in
//! both directions, then each pattern is matched as a glob against the other.
//! It can report overlaps that no real file hits, and miss overlaps hidden
//! behind leading wildcards with different suffixes.

use crate::scope::{has_glob_meta, normalize_pattern};
use globset::{Glob, GlobMatcher};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Allowed patterns of one task, parsed up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskScope {
    pub path: PathBuf,
    pub allowed: Vec<String>,
}

impl TaskScope {
    pub fn new(path: impl Into<PathBuf>, allowed: Vec<String>) -> Self {
        Self {
            path: path.into(),
            allowed,
        }
    }
}

/// `task` must not run alongside `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub task: PathBuf,
    pub depends_on: PathBuf,
    /// The pair of patterns that overlapped: `(task's, depends_on's)`.
    pub patterns: (String, String),
}

struct Pattern {
    raw: String,
    prefix: PathBuf,
    matcher: Option<GlobMatcher>,
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        let raw = normalize_pattern(raw);
        let matcher = Glob::new(&raw).ok().map(|g| g.compile_matcher());
        Self {
            prefix: literal_prefix(&raw),
            matcher,
            raw,
        }
    }

    fn overlaps(&self, other: &Pattern) -> bool {
        if self.prefix.starts_with(&other.prefix) || other.prefix.starts_with(&self.prefix) {
            return true;
        }
        let hits = |m: &Option<GlobMatcher>, raw: &str| {
            m.as_ref().is_some_and(|m| m.is_match(Path::new(raw)))
        };
        hits(&self.matcher, &other.raw) || hits(&other.matcher, &self.raw)
    }
}

/// Leading path components that contain no glob metacharacters.
///
/// `src/api/**` gives `src/api`, `**/*.rs` gives the empty path, which is a
/// prefix of everything.
#[must_use]
pub fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in pattern.split('/') {
        if component.is_empty() || has_glob_meta(component) {
            break;
        }
        prefix.push(component);
    }
    prefix
}

/// Whether two allowed patterns may cover a common path.
#[must_use]
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    Pattern::parse(a).overlaps(&Pattern::parse(b))
}

/// Edges between every pair of tasks whose allowed scopes overlap.
///
/// Each edge points from the later task in input order to the earlier one.
#[must_use]
pub fn detect_dependencies(tasks: &[TaskScope]) -> Vec<Dependency> {
    let parsed: Vec<Vec<Pattern>> = tasks
        .iter()
        .map(|t| t.allowed.iter().map(|p| Pattern::parse(p)).collect())
        .collect();

    let mut deps = Vec::new();
    for (j, later) in parsed.iter().enumerate() {
        for (i, earlier) in parsed.iter().enumerate().take(j) {
            let hit = later
                .iter()
                .find_map(|a| earlier.iter().find(|b| a.overlaps(b)).map(|b| (a, b)));
            if let Some((a, b)) = hit {
                deps.push(Dependency {
                    task: tasks[j].path.clone(),
                    depends_on: tasks[i].path.clone(),
                    patterns: (a.raw.clone(), b.raw.clone()),
                });
            }
        }
    }
    deps
}
