//! Connector error types and the Exception Classifier (§4.5).
//!
//! Every failure surfaced anywhere in the pipeline is ultimately reduced to
//! one of two classes: [`Retriable`](ConnectorError::is_retriable) or
//! terminal. The classifier is fail-closed: an error it cannot place in a
//! known category is treated as terminal rather than retried forever.

use thiserror::Error;

/// Errors produced anywhere in the connector. Variants are grouped by the
/// stage that raised them; classification into retriable/terminal happens
/// via [`ErrorClass::of`], not by variant name alone, since the same
/// variant (e.g. `Storage`) can be either depending on the underlying
/// cause.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("schema registry error: {0}")]
    Registry(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("commit conflict: {0}")]
    CommitConflict(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("dlq publish failed: {0}")]
    Dlq(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The two classes every error is reduced to before the Retry Executor or
/// Dead Letter Sink acts on it (§4.5, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retriable,
    Terminal,
}

impl ErrorClass {
    /// Classify an error by, in order: an explicit tag on the variant,
    /// then a known error-message category, then a substring heuristic,
    /// falling back to `Terminal` when nothing matches (fail-closed).
    pub fn of(err: &ConnectorError) -> Self {
        match err {
            ConnectorError::Configuration(_) => ErrorClass::Terminal,
            ConnectorError::Validation(_) => ErrorClass::Terminal,
            ConnectorError::Parse(_) => ErrorClass::Terminal,
            ConnectorError::Cancelled => ErrorClass::Terminal,
            // Retrying under an open circuit only grows the queue (§7.4);
            // the caller's fast-fail already did the waiting.
            ConnectorError::CircuitOpen(_) => ErrorClass::Terminal,
            ConnectorError::CommitConflict(_) => ErrorClass::Retriable,
            ConnectorError::Kafka(msg) => classify_message(msg),
            ConnectorError::Registry(msg) => classify_message(msg),
            ConnectorError::Storage(msg) => classify_message(msg),
            ConnectorError::Dlq(msg) => classify_message(msg),
            ConnectorError::Other(e) => classify_message(&e.to_string()),
        }
    }

    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorClass::Retriable)
    }
}

/// Substring heuristic used when a category can't be determined from the
/// variant alone — network/timeout/throttling language implies transient
/// failure; anything else is treated as terminal.
fn classify_message(msg: &str) -> ErrorClass {
    const RETRIABLE_MARKERS: &[&str] = &[
        "timed out",
        "timeout",
        "connection refused",
        "connection reset",
        "broken pipe",
        "temporarily unavailable",
        "throttl",
        "rate limit",
        "slow down",
        "503",
        "502",
        "500",
        "429",
        "unavailable",
        "not leader",
        "leader not available",
        "request timed out",
    ];
    let lowered = msg.to_ascii_lowercase();
    if RETRIABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        ErrorClass::Retriable
    } else {
        ErrorClass::Terminal
    }
}

impl ConnectorError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::of(self)
    }

    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }

    /// Short machine name used in DLQ envelopes and metrics labels.
    pub fn class_name(&self) -> &'static str {
        match self {
            ConnectorError::Configuration(_) => "configuration",
            ConnectorError::Parse(_) => "parse",
            ConnectorError::Registry(_) => "registry",
            ConnectorError::Validation(_) => "validation",
            ConnectorError::Storage(_) => "storage",
            ConnectorError::CommitConflict(_) => "commit_conflict",
            ConnectorError::Kafka(_) => "kafka",
            ConnectorError::Dlq(_) => "dlq",
            ConnectorError::Cancelled => "cancelled",
            ConnectorError::CircuitOpen(_) => "circuit_open",
            ConnectorError::Other(_) => "other",
        }
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_terminal() {
        let err = ConnectorError::Configuration("batchSize must be >= 1".into());
        assert_eq!(err.class(), ErrorClass::Terminal);
    }

    #[test]
    fn commit_conflicts_are_always_retriable() {
        let err = ConnectorError::CommitConflict("version 7 already exists".into());
        assert!(err.is_retriable());
    }

    #[test]
    fn storage_timeout_message_is_retriable() {
        let err = ConnectorError::Storage("request timed out after 30s".into());
        assert!(err.is_retriable());
    }

    #[test]
    fn storage_permission_message_is_terminal() {
        let err = ConnectorError::Storage("access denied: invalid credentials".into());
        assert!(!err.is_retriable());
    }

    #[test]
    fn circuit_open_is_terminal_not_retried() {
        let err = ConnectorError::CircuitOpen("writer-orders".into());
        assert!(!err.is_retriable());
    }

    #[test]
    fn unrecognized_message_fails_closed_to_terminal() {
        let err = ConnectorError::Kafka("some completely novel broker response".into());
        assert_eq!(err.class(), ErrorClass::Terminal);
    }
}
