//! Provider failure classification.
//!
//! Every way a provider call can go wrong ends up as a [`ProviderError`], which
//! maps onto exactly one [`ErrorCode`] and from there onto a loop policy.

use crate::error::ErrorCode;
use regex::Regex;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors specific to agent provider calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limit exceeded - retry after backoff.
    #[error("Rate limit exceeded: {message} (retry after {retry_after_secs}s)")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    /// Credentials missing or rejected.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// The provider binary or endpoint cannot be reached at all.
    #[error("Provider unavailable: {message}")]
    Unavailable { message: String },

    /// Process was killed by a signal.
    #[error("Provider process crashed (signal {signal})")]
    Crashed { signal: i32 },

    /// Server-side failure, may be transient.
    #[error("Server error: {message}")]
    ServerError { message: String },

    /// Prompt plus history no longer fits.
    #[error("Context length exceeded: {message}")]
    ContextLengthExceeded { message: String },

    /// Network/connection error.
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// Process exited with a non-zero code for an unrecognized reason.
    #[error("Process failed with exit code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },

    /// Deadline elapsed before the call finished.
    #[error("Provider call timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },
}

impl ProviderError {
    /// Fine-grained code used by the execution loop.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::AuthenticationFailed { .. } => ErrorCode::PermissionDenied,
            Self::Unavailable { .. } => ErrorCode::ProviderUnavailable,
            Self::Crashed { .. } => ErrorCode::ProviderCrashed,
            Self::ServerError { .. }
            | Self::ContextLengthExceeded { .. }
            | Self::ConnectionError { .. } => ErrorCode::ProviderApiError,
            Self::ProcessFailed { .. } => ErrorCode::Unknown,
            Self::Timeout { .. } => ErrorCode::Timeout,
        }
    }

    /// Classify a failed subprocess from its stderr and exit status.
    #[must_use]
    pub fn from_exit(stderr: &str, status: &ExitStatus) -> Self {
        if let Some(signal) = signal_of(status) {
            return Self::Crashed { signal };
        }
        Self::from_stderr(stderr, status.code().unwrap_or(-1))
    }

    /// Parse an error from provider stderr output.
    #[must_use]
    pub fn from_stderr(stderr: &str, exit_code: i32) -> Self {
        let lower = stderr.to_lowercase();

        if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("429")
        {
            return Self::RateLimited {
                message: stderr.trim().to_string(),
                retry_after_secs: extract_retry_after(stderr).unwrap_or(60),
            };
        }

        if lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("authentication")
            || lower.contains("permission denied")
            || lower.contains("401")
            || lower.contains("403")
        {
            return Self::AuthenticationFailed {
                message: stderr.trim().to_string(),
            };
        }

        if lower.contains("command not found") || lower.contains("no such file or directory") {
            return Self::Unavailable {
                message: stderr.trim().to_string(),
            };
        }

        if lower.contains("context length")
            || lower.contains("prompt is too long")
            || lower.contains("max tokens")
        {
            return Self::ContextLengthExceeded {
                message: stderr.trim().to_string(),
            };
        }

        if lower.contains("overloaded")
            || lower.contains("server error")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("529")
        {
            return Self::ServerError {
                message: stderr.trim().to_string(),
            };
        }

        if lower.contains("connection") || lower.contains("network") {
            return Self::ConnectionError {
                message: stderr.trim().to_string(),
            };
        }

        Self::ProcessFailed {
            exit_code,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Classify a non-2xx HTTP response.
    #[must_use]
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            429 => Self::RateLimited {
                message: body.trim().to_string(),
                retry_after_secs: extract_retry_after(body).unwrap_or(60),
            },
            401 | 403 => Self::AuthenticationFailed {
                message: body.trim().to_string(),
            },
            500..=599 => Self::ServerError {
                message: format!("HTTP {status}: {}", body.trim()),
            },
            _ => Self::from_stderr(body, i32::from(status)),
        }
    }

    /// Classify a spawn failure.
    #[must_use]
    pub fn from_spawn(program: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::Unavailable {
                message: format!("'{program}' is not installed or not in PATH"),
            },
            std::io::ErrorKind::PermissionDenied => Self::AuthenticationFailed {
                message: format!("Not permitted to run '{program}': {err}"),
            },
            _ => Self::ConnectionError {
                message: format!("Failed to spawn '{program}': {err}"),
            },
        }
    }
}

/// Extract retry-after seconds from an error message.
fn extract_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    [r"retry.?after[:\s]+(\d+)", r"(\d+)\s*seconds?"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .find_map(|re| re.captures(&lower)?.get(1)?.as_str().parse().ok())
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_detection() {
        let err = ProviderError::from_stderr("Error: rate limit exceeded, retry after 30", 1);
        assert_eq!(
            err,
            ProviderError::RateLimited {
                message: "Error: rate limit exceeded, retry after 30".into(),
                retry_after_secs: 30
            }
        );
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[test]
    fn test_rate_limit_429_defaults_retry() {
        let err = ProviderError::from_stderr("HTTP 429", 1);
        assert!(matches!(err, ProviderError::RateLimited { retry_after_secs: 60, .. }));
    }

    #[test]
    fn test_auth_error_detection() {
        let err = ProviderError::from_stderr("Invalid API key provided", 1);
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn test_server_error_detection() {
        let err = ProviderError::from_stderr("API overloaded, try later", 1);
        assert_eq!(err.code(), ErrorCode::ProviderApiError);
    }

    #[test]
    fn test_context_length_error() {
        let err = ProviderError::from_stderr("Prompt is too long for context length", 1);
        assert!(matches!(err, ProviderError::ContextLengthExceeded { .. }));
    }

    #[test]
    fn test_unknown_falls_through() {
        let err = ProviderError::from_stderr("something odd", 2);
        assert_eq!(
            err,
            ProviderError::ProcessFailed {
                exit_code: 2,
                stderr: "something odd".into()
            }
        );
        assert_eq!(err.code(), ErrorCode::Unknown);
    }

    #[test]
    fn test_spawn_not_found_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        assert_eq!(
            ProviderError::from_spawn("claude", &io).code(),
            ErrorCode::ProviderUnavailable
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ProviderError::from_http_status(429, "slow down").code(), ErrorCode::RateLimited);
        assert_eq!(ProviderError::from_http_status(401, "").code(), ErrorCode::PermissionDenied);
        assert_eq!(ProviderError::from_http_status(503, "").code(), ErrorCode::ProviderApiError);
    }

    #[test]
    fn test_timeout_code() {
        let err = ProviderError::Timeout {
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(err.to_string().contains("5s"));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_is_crash() {
        use std::os::unix::process::ExitStatusExt;
        let status = ExitStatus::from_raw(9);
        assert_eq!(
            ProviderError::from_exit("", &status),
            ProviderError::Crashed { signal: 9 }
        );
    }
}
