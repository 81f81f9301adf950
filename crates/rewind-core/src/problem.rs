//! Problem Reporting
//!
//! A "problem" is a non-fatal, consumer-visible diagnostic: a chunk that
//! failed its checksum, a channel with an unknown encoding, a remote server
//! that ignored a range request. Problems accumulate in an append-only log
//! the consumer can snapshot at any time; they never halt playback.
//!
//! Fatal failures (no source can be opened, no valid time range) are *not*
//! problems. Those surface as errors and transition the player to its
//! terminal error state.

use std::sync::{Arc, Mutex};

/// How severe a problem is, for consumer display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warn,
    Error,
}

/// A single non-fatal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    /// Display severity
    pub severity: Severity,

    /// Human-readable summary of what went wrong
    pub message: String,

    /// Underlying error text, if there was one
    pub error: Option<String>,

    /// Suggested remedy, if one exists
    pub tip: Option<String>,
}

impl Problem {
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warn,
            message: message.into(),
            error: None,
            tip: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            error: None,
            tip: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

/// Append-only, shareable accumulator of problems.
///
/// Cloning a `ProblemLog` yields another handle onto the same log, so the
/// storage layer, the sources, and the controller can all report into one
/// place while the consumer reads a consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProblemLog {
    inner: Arc<Mutex<Vec<Problem>>>,
}

impl ProblemLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a problem and log it through `tracing`.
    pub fn push(&self, problem: Problem) {
        match problem.severity {
            Severity::Warn => {
                tracing::warn!(problem = %problem.message, error = ?problem.error, "Playback problem")
            }
            Severity::Error => {
                tracing::error!(problem = %problem.message, error = ?problem.error, "Playback problem")
            }
        }
        self.inner.lock().expect("problem log poisoned").push(problem);
    }

    /// Snapshot of all problems reported so far, in report order.
    pub fn snapshot(&self) -> Vec<Problem> {
        self.inner.lock().expect("problem log poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("problem log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_snapshot() {
        let log = ProblemLog::new();
        assert!(log.is_empty());

        log.push(Problem::warn("range requests unsupported"));
        log.push(Problem::error("chunk checksum mismatch").with_error("crc 0xdead != 0xbeef"));

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].severity, Severity::Warn);
        assert_eq!(snapshot[1].severity, Severity::Error);
        assert_eq!(
            snapshot[1].error.as_deref(),
            Some("crc 0xdead != 0xbeef")
        );
    }

    #[test]
    fn test_clone_shares_log() {
        let log = ProblemLog::new();
        let other = log.clone();

        other.push(Problem::warn("degraded"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_builder_helpers() {
        let p = Problem::warn("slow source").with_tip("check your network");
        assert_eq!(p.tip.as_deref(), Some("check your network"));
        assert_eq!(p.error, None);
    }
}
