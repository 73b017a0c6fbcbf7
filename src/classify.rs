//! Failure classification for render and upload errors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Closed taxonomy of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Timeout,
    Quota,
    Permission,
    FileSystem,
    Conversion,
    Validation,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Quota => write!(f, "quota"),
            ErrorKind::Permission => write!(f, "permission"),
            ErrorKind::FileSystem => write!(f, "filesystem"),
            ErrorKind::Conversion => write!(f, "conversion"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Ordered substring markers; the first matching pair wins.
const MARKERS: &[(&[&str], ErrorKind)] = &[
    (&["quota", "limit"], ErrorKind::Quota),
    (&["permission", "unauthorized"], ErrorKind::Permission),
    (&["network", "connection"], ErrorKind::Network),
    (&["timeout"], ErrorKind::Timeout),
    (&["file", "disk"], ErrorKind::FileSystem),
    (&["convert", "svg"], ErrorKind::Conversion),
    (&["invalid", "validation"], ErrorKind::Validation),
];

/// Maps raw failure text to an [`ErrorKind`].
///
/// Matching is case-insensitive over the full error chain text, so wrapped
/// errors classify the same as their root cause.
pub fn classify(message: &str) -> ErrorKind {
    let text = message.to_lowercase();
    for (needles, kind) in MARKERS {
        if needles.iter().any(|needle| text.contains(needle)) {
            return *kind;
        }
    }
    ErrorKind::Unknown
}

/// Suggested remediation persisted alongside error records.
pub fn remediation(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Network => "check connectivity to the remote store and retry",
        ErrorKind::Timeout => "retry later; consider raising the execution timeout",
        ErrorKind::Quota => "wait for the remote quota window to reset before retrying",
        ErrorKind::Permission => "verify credentials and remote store permissions",
        ErrorKind::FileSystem => "check free disk space and artifact directory permissions",
        ErrorKind::Conversion => "inspect the diagram markup; it failed to convert",
        ErrorKind::Validation => "fix the job input; it was rejected as invalid",
        ErrorKind::Unknown => "inspect the worker logs for the underlying cause",
    }
}

/// Per-deployment retryability verdicts.
///
/// The default marks `{Network, Timeout, Quota}` retryable and everything
/// else permanent; callers override individual kinds rather than editing
/// classifier logic.
#[derive(Debug, Clone)]
pub struct RetryTable {
    verdicts: HashMap<ErrorKind, bool>,
}

impl Default for RetryTable {
    fn default() -> Self {
        let verdicts = HashMap::from([
            (ErrorKind::Network, true),
            (ErrorKind::Timeout, true),
            (ErrorKind::Quota, true),
            (ErrorKind::Permission, false),
            (ErrorKind::FileSystem, false),
            (ErrorKind::Conversion, false),
            (ErrorKind::Validation, false),
            (ErrorKind::Unknown, false),
        ]);
        Self { verdicts }
    }
}

impl RetryTable {
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.verdicts.get(&kind).copied().unwrap_or(false)
    }

    /// Overrides the verdict for one kind.
    pub fn with_verdict(mut self, kind: ErrorKind, retryable: bool) -> Self {
        self.verdicts.insert(kind, retryable);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_is_retryable() {
        let kind = classify("network timeout: connection failed");
        assert_eq!(kind, ErrorKind::Network);
        assert!(RetryTable::default().is_retryable(kind));
    }

    #[test]
    fn test_permission_error_is_permanent() {
        let kind = classify("permission denied");
        assert_eq!(kind, ErrorKind::Permission);
        assert!(!RetryTable::default().is_retryable(kind));
    }

    #[test]
    fn test_marker_order() {
        // Quota markers are consulted before network ones.
        assert_eq!(classify("rate limit hit on network call"), ErrorKind::Quota);
        // Timeout without a network marker classifies as timeout.
        assert_eq!(classify("operation timeout after 60s"), ErrorKind::Timeout);
    }

    #[test]
    fn test_conversion_and_validation() {
        assert_eq!(classify("failed to parse SVG content"), ErrorKind::Conversion);
        assert_eq!(classify("invalid output name"), ErrorKind::Validation);
    }

    #[test]
    fn test_filesystem_markers() {
        assert_eq!(classify("disk full"), ErrorKind::FileSystem);
        assert_eq!(classify("could not open file"), ErrorKind::FileSystem);
    }

    #[test]
    fn test_unmatched_text_is_unknown() {
        assert_eq!(classify("something odd happened"), ErrorKind::Unknown);
        assert!(!RetryTable::default().is_retryable(ErrorKind::Unknown));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(classify("UNAUTHORIZED"), ErrorKind::Permission);
    }

    #[test]
    fn test_table_override() {
        let table = RetryTable::default()
            .with_verdict(ErrorKind::Unknown, true)
            .with_verdict(ErrorKind::Quota, false);
        assert!(table.is_retryable(ErrorKind::Unknown));
        assert!(!table.is_retryable(ErrorKind::Quota));
        // Untouched verdicts keep their defaults.
        assert!(table.is_retryable(ErrorKind::Network));
    }

    #[test]
    fn test_remediation_is_kind_specific() {
        assert!(remediation(ErrorKind::Quota).contains("quota"));
        assert!(remediation(ErrorKind::Permission).contains("credentials"));
    }
}
