use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Dispatcher-side error taxonomy. Every kind is recoverable and reported as
/// a structured error Result; none of them terminates the command loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Decode,
    UnknownAction,
    Execution,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Decode => "decode",
            ErrorKind::UnknownAction => "unknown_action",
            ErrorKind::Execution => "execution",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error-shaped message on the Result channel: `error` is always true,
/// `invalid_message` echoes the raw offending payload for decode failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub error: bool,
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_message: Option<String>,
}

impl ErrorResult {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            error: true,
            kind: kind.as_str().to_string(),
            description: description.into(),
            invalid_message: None,
        }
    }

    pub fn with_invalid_message(mut self, raw: impl Into<String>) -> Self {
        self.invalid_message = Some(raw.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Failures reported by the terminal backend for domain reasons. These map
/// to `ErrorKind::Execution` Results; they never cross the process boundary
/// as panics.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("market closed for {0}")]
    MarketClosed(String),
    #[error("history unavailable: {0}")]
    HistoryUnavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_result_shape() {
        let e = ErrorResult::new(ErrorKind::Decode, "deserialization failed")
            .with_invalid_message("not json {");
        let v = e.to_value();
        assert_eq!(v["error"], Value::Bool(true));
        assert_eq!(v["kind"], "decode");
        assert_eq!(v["description"], "deserialization failed");
        assert_eq!(v["invalid_message"], "not json {");
    }

    #[test]
    fn invalid_message_omitted_when_absent() {
        let v = ErrorResult::new(ErrorKind::UnknownAction, "unknown action").to_value();
        assert!(v.get("invalid_message").is_none());
    }
}
