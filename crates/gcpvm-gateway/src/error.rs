//! Cloud API error taxonomy
//!
//! `gcloud` reports failures as free text on stderr. The gateway only sorts
//! them into a handful of codes; the raw message is kept for display.

use std::fmt;
use thiserror::Error;

/// Coarse failure category of a cloud call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudErrorCode {
    Network,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    QuotaExceeded,
    /// The `gcloud` binary could not be started
    ToolUnavailable,
    /// The tool succeeded but its output could not be understood
    InvalidResponse,
    Unknown,
}

impl CloudErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudErrorCode::Network => "network",
            CloudErrorCode::Unauthenticated => "unauthenticated",
            CloudErrorCode::PermissionDenied => "permission denied",
            CloudErrorCode::NotFound => "not found",
            CloudErrorCode::QuotaExceeded => "quota exceeded",
            CloudErrorCode::ToolUnavailable => "gcloud unavailable",
            CloudErrorCode::InvalidResponse => "invalid response",
            CloudErrorCode::Unknown => "unknown",
        }
    }

    /// Classify a `gcloud` error message
    pub fn classify(stderr: &str) -> Self {
        let text = stderr.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

        if has(&[
            "unauthenticated",
            "reauthentication",
            "gcloud auth login",
            "do not currently have an active account",
            "invalid_grant",
            "credentials",
        ]) {
            CloudErrorCode::Unauthenticated
        } else if has(&["permission_denied", "permission denied", "does not have", "required '", "forbidden"]) {
            CloudErrorCode::PermissionDenied
        } else if has(&["quota_exceeded", "quota exceeded", "rate_limit_exceeded", "resource_exhausted"]) {
            CloudErrorCode::QuotaExceeded
        } else if has(&["was not found", "not_found", "not found", "notfound"]) {
            CloudErrorCode::NotFound
        } else if has(&[
            "unable to find the server",
            "connection refused",
            "connection reset",
            "timed out",
            "name or service not known",
            "temporary failure in name resolution",
            "network is unreachable",
            "failed to connect",
        ]) {
            CloudErrorCode::Network
        } else {
            CloudErrorCode::Unknown
        }
    }
}

impl fmt::Display for CloudErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed cloud provider call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cloud API error ({code}): {message}")]
pub struct CloudApiError {
    pub code: CloudErrorCode,
    pub message: String,
}

impl CloudApiError {
    pub fn new(code: CloudErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an error from the stderr of a failed `gcloud` invocation
    pub fn from_stderr(stderr: &str) -> Self {
        let message = stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let message = if message.is_empty() {
            "gcloud exited with an error and no message".to_string()
        } else {
            message
        };

        Self::new(CloudErrorCode::classify(stderr), message)
    }

    pub fn from_spawn(tool: &str, err: std::io::Error) -> Self {
        let code = if err.kind() == std::io::ErrorKind::NotFound {
            CloudErrorCode::ToolUnavailable
        } else {
            CloudErrorCode::Unknown
        };
        Self::new(code, format!("Failed to run '{}': {}", tool, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth() {
        let stderr = "ERROR: (gcloud.compute.instances.list) You do not currently have an active account selected.\nPlease run:\n\n  $ gcloud auth login";
        assert_eq!(CloudErrorCode::classify(stderr), CloudErrorCode::Unauthenticated);
    }

    #[test]
    fn test_classify_permission() {
        let stderr = "ERROR: (gcloud.compute.instances.list) Some requests did not succeed:\n - Required 'compute.instances.list' permission for 'projects/demo'";
        assert_eq!(CloudErrorCode::classify(stderr), CloudErrorCode::PermissionDenied);
    }

    #[test]
    fn test_classify_not_found() {
        let stderr = "ERROR: (gcloud.compute.instances.describe) Could not fetch resource:\n - The resource 'projects/demo/zones/us-central1-a/instances/web-9' was not found";
        assert_eq!(CloudErrorCode::classify(stderr), CloudErrorCode::NotFound);
    }

    #[test]
    fn test_classify_quota() {
        let stderr = "ERROR: (gcloud.compute.instances.start) Quota exceeded for quota metric 'CPUS'";
        assert_eq!(CloudErrorCode::classify(stderr), CloudErrorCode::QuotaExceeded);
    }

    #[test]
    fn test_classify_network() {
        let stderr = "ERROR: gcloud failed to load: Unable to find the server at compute.googleapis.com";
        assert_eq!(CloudErrorCode::classify(stderr), CloudErrorCode::Network);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(CloudErrorCode::classify("something odd"), CloudErrorCode::Unknown);
    }

    #[test]
    fn test_from_stderr_joins_lines() {
        let err = CloudApiError::from_stderr("ERROR: first\n\n   second  \n");
        assert_eq!(err.message, "ERROR: first second");

        let empty = CloudApiError::from_stderr("   \n");
        assert!(!empty.message.is_empty());
    }

    #[test]
    fn test_from_spawn_missing_tool() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file");
        let err = CloudApiError::from_spawn("gcloud", io);
        assert_eq!(err.code, CloudErrorCode::ToolUnavailable);
    }
}
