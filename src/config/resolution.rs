//! Config layering and environment substitution.
//!
//! Raw configuration is a [`toml::Table`] assembled from up to two layers:
//!
//! ```text
//! ~/.config/tasksmith/config.toml   (user, optional)
//!            │  merged key-by-key, project wins
//!            ▼
//! <project>/tasksmith.toml          (project, optional)
//!            │
//!            ▼
//!      resolve()  ──  ${NAME} / $NAME substitution  ──►  RunnerConfig
//! ```

use super::RunnerConfig;
use crate::error::{Result, TaskError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Output of [`resolve`]: the typed config plus what substitution touched.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: RunnerConfig,
    /// The table after substitution.
    pub table: toml::Table,
    /// Dotted keys whose value came (at least partly) from the environment.
    pub substituted_keys: BTreeSet<String>,
}

/// Substitute environment references in every string value and deserialize.
///
/// `$$` produces a literal `$`. A `$` not followed by a name or `{` is kept
/// as-is.
///
/// # Errors
///
/// Returns [`TaskError::MissingVariable`] for the first unset reference, or a
/// config error if the substituted table does not deserialize or validate.
pub fn resolve(
    raw: &toml::Table,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let mut substituted_keys = BTreeSet::new();
    let table = resolve_table(raw, "", env, &mut substituted_keys)?;

    let config: RunnerConfig = toml::Value::Table(table.clone())
        .try_into()
        .map_err(|e: toml::de::Error| TaskError::config(e.to_string()))?;
    config.validate()?;

    debug!(
        substituted = substituted_keys.len(),
        "Resolved configuration"
    );

    Ok(ResolvedConfig {
        config,
        table,
        substituted_keys,
    })
}

fn resolve_table(
    table: &toml::Table,
    prefix: &str,
    env: &dyn Fn(&str) -> Option<String>,
    substituted: &mut BTreeSet<String>,
) -> Result<toml::Table> {
    let mut out = toml::Table::new();
    for (key, value) in table {
        let path = join_key(prefix, key);
        out.insert(key.clone(), resolve_value(value, &path, env, substituted)?);
    }
    Ok(out)
}

fn resolve_value(
    value: &toml::Value,
    path: &str,
    env: &dyn Fn(&str) -> Option<String>,
    substituted: &mut BTreeSet<String>,
) -> Result<toml::Value> {
    Ok(match value {
        toml::Value::String(s) => {
            let (resolved, changed) = substitute(s, path, env)?;
            if changed {
                substituted.insert(path.to_string());
            }
            toml::Value::String(resolved)
        }
        toml::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(resolve_value(item, &format!("{path}[{i}]"), env, substituted)?);
            }
            toml::Value::Array(out)
        }
        toml::Value::Table(t) => toml::Value::Table(resolve_table(t, path, env, substituted)?),
        other => other.clone(),
    })
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Expand `${NAME}`, `$NAME` and `$$` in one string.
///
/// Returns the expanded string and whether any variable was substituted.
///
/// # Errors
///
/// Returns [`TaskError::MissingVariable`] when a referenced name is unset.
pub fn substitute(
    input: &str,
    key: &str,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<(String, bool)> {
    let mut out = String::with_capacity(input.len());
    let mut changed = false;
    let mut chars = input.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().map(|&(_, next)| next) {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                let rest = &input[i + 2..];
                let Some(end) = rest.find('}') else {
                    return Err(TaskError::config(format!(
                        "Unterminated variable reference in '{key}'"
                    )));
                };
                let name = &rest[..end];
                if !is_var_name(name) {
                    return Err(TaskError::config(format!(
                        "Invalid variable name '{name}' in '{key}'"
                    )));
                }
                out.push_str(&lookup(name, key, env)?);
                changed = true;
                // skip '{', the name and '}'
                for _ in 0..name.chars().count() + 2 {
                    chars.next();
                }
            }
            Some(next) if next == '_' || next.is_ascii_alphabetic() => {
                let rest = &input[i + 1..];
                let len = rest
                    .find(|ch: char| !(ch == '_' || ch.is_ascii_alphanumeric()))
                    .unwrap_or(rest.len());
                let name = &rest[..len];
                out.push_str(&lookup(name, key, env)?);
                changed = true;
                for _ in 0..len {
                    chars.next();
                }
            }
            _ => out.push('$'),
        }
    }

    Ok((out, changed))
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn lookup(name: &str, key: &str, env: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    env(name).ok_or_else(|| TaskError::MissingVariable {
        name: name.to_string(),
        key: key.to_string(),
    })
}

// ============================================================================
// Layered loading
// ============================================================================

/// Loads and merges raw config layers.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    user_path: Option<PathBuf>,
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader using the platform user config dir.
    #[must_use]
    pub fn new() -> Self {
        Self {
            user_path: RunnerConfig::user_path(),
            explicit_path: None,
        }
    }

    /// Skip the user-level layer.
    #[must_use]
    pub fn without_user_layer(mut self) -> Self {
        self.user_path = None;
        self
    }

    /// Use this file instead of `<project>/tasksmith.toml`.
    #[must_use]
    pub fn with_explicit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Load the merged raw table for a project.
    ///
    /// Missing files are skipped; an explicit path must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be read or parsed.
    pub fn load(&self, project_dir: &Path) -> Result<toml::Table> {
        let mut merged = toml::Table::new();

        if let Some(ref user) = self.user_path {
            if user.exists() {
                debug!(path = %user.display(), "Loading user config layer");
                merge_tables(&mut merged, read_table(user)?);
            }
        }

        match self.explicit_path {
            Some(ref explicit) => {
                if !explicit.exists() {
                    return Err(TaskError::config_with_path(
                        "Config file not found",
                        explicit.clone(),
                    ));
                }
                merge_tables(&mut merged, read_table(explicit)?);
            }
            None => {
                let project = RunnerConfig::project_path(project_dir);
                if project.exists() {
                    debug!(path = %project.display(), "Loading project config layer");
                    merge_tables(&mut merged, read_table(&project)?);
                }
            }
        }

        Ok(merged)
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| TaskError::config_with_path(e.to_string(), path.to_path_buf()))
}

/// Recursively merge `overlay` into `base`; overlay scalars and arrays win.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_substitute_braced_and_bare() {
        let env = env_of(&[("HOME_DIR", "/home/me"), ("USER", "me")]);
        let (out, changed) = substitute("${HOME_DIR}/x-$USER", "k", &env).unwrap();
        assert_eq!(out, "/home/me/x-me");
        assert!(changed);
    }

    #[test]
    fn test_substitute_dollar_escape_and_literal() {
        let env = env_of(&[]);
        let (out, changed) = substitute("cost $$5 and $ alone", "k", &env).unwrap();
        assert_eq!(out, "cost $5 and $ alone");
        assert!(!changed);
    }

    #[test]
    fn test_substitute_missing_variable_is_fatal() {
        let env = env_of(&[]);
        let err = substitute("${NOPE}", "provider.api_key", &env).unwrap_err();
        match err {
            TaskError::MissingVariable { name, key } => {
                assert_eq!(name, "NOPE");
                assert_eq!(key, "provider.api_key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_substitute_unterminated() {
        let env = env_of(&[]);
        assert!(substitute("${OPEN", "k", &env).is_err());
    }

    #[test]
    fn test_resolve_records_substituted_keys() {
        let raw: toml::Table = toml::from_str(
            r#"
            [provider]
            api_key = "${KEY}"
            model = "sonnet"

            [validation]
            pre_commit = ["make -C $DIR test"]
            "#,
        )
        .unwrap();
        let env = env_of(&[("KEY", "abc"), ("DIR", "core")]);
        let resolved = resolve(&raw, &env).unwrap();
        assert_eq!(resolved.config.provider.api_key.as_deref(), Some("abc"));
        assert_eq!(resolved.config.validation.pre_commit, vec!["make -C core test"]);
        assert!(resolved.substituted_keys.contains("provider.api_key"));
        assert!(resolved.substituted_keys.contains("validation.pre_commit[0]"));
        assert!(!resolved.substituted_keys.contains("provider.model"));
    }

    #[test]
    fn test_merge_tables_project_wins() {
        let mut base: toml::Table = toml::from_str(
            r#"
            [execution]
            max_iterations = 5
            max_consecutive_failures = 2
            "#,
        )
        .unwrap();
        let overlay: toml::Table = toml::from_str(
            r#"
            [execution]
            max_iterations = 9
            "#,
        )
        .unwrap();
        merge_tables(&mut base, overlay);
        let exec = base["execution"].as_table().unwrap();
        assert_eq!(exec["max_iterations"].as_integer(), Some(9));
        assert_eq!(exec["max_consecutive_failures"].as_integer(), Some(2));
    }

    #[test]
    fn test_loader_reads_project_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("tasksmith.toml"),
            "[parallel]\nconcurrency = 2\n",
        )
        .unwrap();
        let table = ConfigLoader::new()
            .without_user_layer()
            .load(temp.path())
            .unwrap();
        assert_eq!(table["parallel"]["concurrency"].as_integer(), Some(2));
    }

    #[test]
    fn test_loader_missing_files_is_empty() {
        let temp = TempDir::new().unwrap();
        let table = ConfigLoader::new()
            .without_user_layer()
            .load(temp.path())
            .unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_loader_explicit_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let result = ConfigLoader::new()
            .without_user_layer()
            .with_explicit_path(temp.path().join("missing.toml"))
            .load(temp.path());
        assert!(result.is_err());
    }
}
