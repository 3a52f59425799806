use serde::Serialize;
use std::fmt;

/// Structured error kinds shared across the agent loop, tool dispatcher, embedding
/// client and session store. Mirrors the `{kind, message, retryable}` shape components
/// are expected to surface to the LLM or the outbound channel.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl CoreError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_) | CoreError::Transient(_) | CoreError::SessionBusy(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "InvalidArgument",
            CoreError::UnknownTool(_) => "UnknownTool",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Transient(_) => "Transient",
            CoreError::Cancelled(_) => "Cancelled",
            CoreError::EmbeddingUnavailable(_) => "EmbeddingUnavailable",
            CoreError::SessionBusy(_) => "SessionBusy",
            CoreError::Persistence(_) => "Persistence",
        }
    }

    /// Classify an opaque `anyhow::Error` into the nearest `CoreError` variant for
    /// reporting across a transport boundary (tool ERROR, outbound `ERROR` message).
    pub fn classify(err: &anyhow::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            CoreError::Timeout(msg)
        } else if lower.contains("cancelled") || lower.contains("canceled") {
            CoreError::Cancelled(msg)
        } else if lower.contains("unknown tool") {
            CoreError::UnknownTool(msg)
        } else if lower.contains("429")
            || lower.contains("529")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("rate limit")
            || lower.contains("overloaded")
        {
            CoreError::Transient(msg)
        } else {
            CoreError::InvalidArgument(msg)
        }
    }
}

/// Structured error payload sent on the outbound channel as an `ERROR` message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub error_message: String,
}

impl From<&CoreError> for ErrorPayload {
    fn from(e: &CoreError) -> Self {
        Self {
            error_code: e.kind().to_string(),
            error_message: e.to_string(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.error_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::Timeout("x".into()).retryable());
        assert!(CoreError::Transient("x".into()).retryable());
        assert!(CoreError::SessionBusy("x".into()).retryable());
        assert!(!CoreError::UnknownTool("x".into()).retryable());
        assert!(!CoreError::InvalidArgument("x".into()).retryable());
    }

    #[test]
    fn classify_timeout() {
        let err = anyhow::anyhow!("request timed out after 30s");
        assert!(matches!(CoreError::classify(&err), CoreError::Timeout(_)));
    }

    #[test]
    fn classify_server_error_statuses_as_transient() {
        for status in ["500", "502", "503", "529"] {
            let err = anyhow::anyhow!("upstream returned {status}");
            assert!(
                matches!(CoreError::classify(&err), CoreError::Transient(_)),
                "status {status} should classify as Transient"
            );
        }
    }

    #[test]
    fn classify_unrelated_five_digit_message_is_not_transient() {
        let err = anyhow::anyhow!("found 5 matching files");
        assert!(!matches!(CoreError::classify(&err), CoreError::Transient(_)));
    }

    #[test]
    fn classify_unknown_tool() {
        let err = anyhow::anyhow!("Unknown tool: frobnicate");
        assert!(matches!(
            CoreError::classify(&err),
            CoreError::UnknownTool(_)
        ));
    }
}
