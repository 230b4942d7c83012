//! Error types and handling
//!
//! Domain errors for the build orchestrator. Variants mirror the failure
//! kinds the pipeline can hit: bad template input, unresolvable references,
//! rejected credentials, network/daemon loss, aggregated per-item failures,
//! cancellation, and invariant violations.

use thiserror::Error;

/// One entry inside an aggregate failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    /// What failed (an architecture, an image reference, a digest file path).
    pub item: String,
    /// Why it failed.
    pub reason: String,
}

impl std::fmt::Display for FailedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.item, self.reason)
    }
}

/// Domain errors for the build orchestrator
#[derive(Error, Debug)]
pub enum WarpgateError {
    /// Template or settings reference something missing or malformed.
    /// Surfaced before any resources are consumed.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A reference (git ref, image reference, digest file) could not be
    /// resolved to a concrete object.
    #[error("failed to resolve {subject}: {message}")]
    Resolution { subject: String, message: String },

    /// Credentials were rejected or unusable. Never retried.
    #[error("authentication failed for {target}: {message}")]
    Authentication { target: String, message: String },

    /// Network loss, daemon disconnect, unexpected HTTP status. The caller
    /// may retry; this crate does not.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Aggregate across architectures or registry verifications. Failures
    /// are listed in discovery order.
    #[error("{} of {total} items failed: [{}]", .failures.len(), format_failures(.failures))]
    PartialFailure {
        total: usize,
        failures: Vec<FailedItem>,
    },

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// An invariant the pipeline relies on was violated (e.g. a digest file
    /// parsed but its algorithm is not sha256).
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

fn format_failures(failures: &[FailedItem]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl WarpgateError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn resolution(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn authentication(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WarpgateError::Cancelled)
    }

    /// For aggregate errors: did every item fail, or only some?
    pub fn all_failed(&self) -> Option<bool> {
        match self {
            WarpgateError::PartialFailure { total, failures } => Some(failures.len() == *total),
            _ => None,
        }
    }
}

/// Convenience type alias for Results with WarpgateError
pub type Result<T> = std::result::Result<T, WarpgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_lists_items_in_order() {
        let err = WarpgateError::PartialFailure {
            total: 3,
            failures: vec![
                FailedItem {
                    item: "amd64".to_string(),
                    reason: "solve failed".to_string(),
                },
                FailedItem {
                    item: "arm64".to_string(),
                    reason: "export failed".to_string(),
                },
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("2 of 3 items failed"));
        let amd = rendered.find("amd64").unwrap();
        let arm = rendered.find("arm64").unwrap();
        assert!(amd < arm);
        assert_eq!(err.all_failed(), Some(false));
    }

    #[test]
    fn all_failed_detects_total_loss() {
        let err = WarpgateError::PartialFailure {
            total: 1,
            failures: vec![FailedItem {
                item: "amd64".to_string(),
                reason: "daemon unreachable".to_string(),
            }],
        };
        assert_eq!(err.all_failed(), Some(true));
        assert_eq!(WarpgateError::Cancelled.all_failed(), None);
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(WarpgateError::Cancelled.is_cancelled());
        assert!(!WarpgateError::configuration("x").is_cancelled());
    }
}
