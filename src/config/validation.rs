//! Plaintext secret detection for resolved configuration.
//!
//! Values pulled in from the environment are fine; literal values sitting in a
//! config file that look like credentials are reported as warnings. The scan
//! never fails resolution.

use super::ResolvedConfig;
use regex::Regex;
use std::sync::OnceLock;

/// Key-name fragments that suggest the value is a credential.
pub const SECRET_KEY_HINTS: &[&str] = &["key", "token", "secret", "password", "credential"];

/// Value shapes of well-known credential formats.
pub const SECRET_VALUE_PATTERNS: &[&str] = &[
    r"^sk-[A-Za-z0-9_-]{16,}",
    r"^ghp_[A-Za-z0-9]{20,}",
    r"^xox[bp]-[A-Za-z0-9-]{10,}",
    r"^AKIA[0-9A-Z]{16}",
    r"-----BEGIN (RSA |DSA |EC |OPENSSH )?PRIVATE KEY-----",
];

/// A literal value in the config that looks like a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretWarning {
    /// Dotted key, e.g. `provider.api_key`.
    pub key: String,
    pub reason: String,
}

impl std::fmt::Display for SecretWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Possible plaintext secret at '{}': {}. Use an environment reference like ${{NAME}} instead",
            self.key, self.reason
        )
    }
}

fn value_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SECRET_VALUE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// Scan every literal string in the resolved table.
///
/// At most one warning is produced per key.
#[must_use]
pub fn scan_for_secrets(resolved: &ResolvedConfig) -> Vec<SecretWarning> {
    let mut warnings = Vec::new();
    scan_table(&resolved.table, "", resolved, &mut warnings);
    warnings
}

fn scan_table(
    table: &toml::Table,
    prefix: &str,
    resolved: &ResolvedConfig,
    out: &mut Vec<SecretWarning>,
) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        scan_value(key, value, &path, resolved, out);
    }
}

fn scan_value(
    key: &str,
    value: &toml::Value,
    path: &str,
    resolved: &ResolvedConfig,
    out: &mut Vec<SecretWarning>,
) {
    match value {
        toml::Value::String(s) => {
            if resolved.substituted_keys.contains(path) || s.trim().is_empty() {
                return;
            }
            if let Some(reason) = classify(key, s) {
                out.push(SecretWarning {
                    key: path.to_string(),
                    reason,
                });
            }
        }
        toml::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                scan_value(key, item, &format!("{path}[{i}]"), resolved, out);
            }
        }
        toml::Value::Table(t) => scan_table(t, path, resolved, out),
        _ => {}
    }
}

fn classify(key: &str, value: &str) -> Option<String> {
    if let Some(pattern) = value_patterns().iter().find(|re| re.is_match(value)) {
        return Some(format!("value matches credential pattern {}", pattern.as_str()));
    }

    let lower = key.to_ascii_lowercase();
    // `*_env` keys name a variable rather than hold its value
    if lower.ends_with("_env") {
        return None;
    }
    SECRET_KEY_HINTS
        .iter()
        .find(|hint| lower.contains(*hint))
        .map(|hint| format!("key name contains '{hint}' and holds a literal value"))
}
