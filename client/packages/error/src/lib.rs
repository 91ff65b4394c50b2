use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const MAX_DETAIL_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NotFound,
    Conflict,
    BadRequest,
    ServerError,
    ConnectionFailure,
    Timeout,
    Cancelled,
    StreamDisconnected,
    InvalidResponse,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::NotFound => "urn:opencode-client:error:not_found",
            Self::Conflict => "urn:opencode-client:error:conflict",
            Self::BadRequest => "urn:opencode-client:error:bad_request",
            Self::ServerError => "urn:opencode-client:error:server_error",
            Self::ConnectionFailure => "urn:opencode-client:error:connection_failure",
            Self::Timeout => "urn:opencode-client:error:timeout",
            Self::Cancelled => "urn:opencode-client:error:cancelled",
            Self::StreamDisconnected => "urn:opencode-client:error:stream_disconnected",
            Self::InvalidResponse => "urn:opencode-client:error:invalid_response",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::NotFound => "Not Found",
            Self::Conflict => "Conflict",
            Self::BadRequest => "Bad Request",
            Self::ServerError => "Server Error",
            Self::ConnectionFailure => "Connection Failure",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::StreamDisconnected => "Stream Disconnected",
            Self::InvalidResponse => "Invalid Response",
        }
    }

    /// Kinds the retry policy may retry transparently for idempotent calls.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerError | Self::ConnectionFailure | Self::Timeout
        )
    }
}

/// Error body returned by the server. Both RFC 7807 problem documents and the
/// OpenCode `{ "name": ..., "data": { "message": ... } }` shape land here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(body).ok()
    }

    pub fn message(&self) -> Option<String> {
        if let Some(detail) = self.detail.as_ref().filter(|d| !d.is_empty()) {
            return Some(detail.clone());
        }
        let nested = self
            .extensions
            .get("data")
            .and_then(|data| data.get("message"))
            .and_then(Value::as_str);
        let flat = ["message", "error"]
            .iter()
            .find_map(|key| match self.extensions.get(*key) {
                Some(Value::String(text)) => Some(text.as_str()),
                Some(Value::Object(obj)) => obj.get("message").and_then(Value::as_str),
                _ => None,
            });
        nested
            .or(flat)
            .map(ToOwned::to_owned)
            .or_else(|| self.title.clone())
    }
}

/// Best-effort human readable detail for an error response body.
pub fn detail_from_body(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if let Some(message) = ProblemDetails::parse(body).and_then(|problem| problem.message()) {
        return Some(truncate(&message));
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(truncate(trimmed))
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {detail}"),
        None => String::new(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_DETAIL_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_DETAIL_CHARS).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("conflict: {detail}")]
    Conflict { detail: String },
    #[error("bad request ({status}): {detail}")]
    BadRequest { status: u16, detail: String },
    #[error("server error ({status}){}", detail_suffix(.detail))]
    ServerError { status: u16, detail: Option<String> },
    #[error("connection to {base_url} failed: {message}")]
    ConnectionFailure { base_url: String, message: String },
    #[error("timeout: {operation}")]
    Timeout { operation: String },
    #[error("cancelled")]
    Cancelled,
    #[error("event stream disconnected: {reason}")]
    StreamDisconnected { reason: String },
    #[error("invalid response from {operation}: {message}")]
    InvalidResponse { operation: String, message: String },
}

impl ClientError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::BadRequest { .. } => ErrorType::BadRequest,
            Self::ServerError { .. } => ErrorType::ServerError,
            Self::ConnectionFailure { .. } => ErrorType::ConnectionFailure,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Cancelled => ErrorType::Cancelled,
            Self::StreamDisconnected { .. } => ErrorType::StreamDisconnected,
            Self::InvalidResponse { .. } => ErrorType::InvalidResponse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error_type().is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Problem document view of the error, used by the CLI when printing
    /// failures as JSON.
    pub fn to_problem_details(&self) -> ProblemDetails {
        let error_type = self.error_type();
        let mut extensions = Map::new();
        match self {
            Self::NotFound { resource } => {
                extensions.insert("resource".to_string(), Value::String(resource.clone()));
            }
            Self::BadRequest { status, .. } | Self::ServerError { status, .. } => {
                extensions.insert(
                    "upstreamStatus".to_string(),
                    Value::Number(serde_json::Number::from(*status)),
                );
            }
            Self::ConnectionFailure { base_url, .. } => {
                extensions.insert("baseUrl".to_string(), Value::String(base_url.clone()));
            }
            Self::Timeout { operation } | Self::InvalidResponse { operation, .. } => {
                extensions.insert("operation".to_string(), Value::String(operation.clone()));
            }
            Self::Conflict { .. } | Self::Cancelled | Self::StreamDisconnected { .. } => {}
        }
        ProblemDetails {
            type_: Some(error_type.as_urn().to_string()),
            title: Some(error_type.title().to_string()),
            status: None,
            detail: Some(self.to_string()),
            extensions,
        }
    }
}

impl From<&ClientError> for ProblemDetails {
    fn from(value: &ClientError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorType::ServerError.is_retryable());
        assert!(ErrorType::ConnectionFailure.is_retryable());
        assert!(ErrorType::Timeout.is_retryable());
        assert!(!ErrorType::NotFound.is_retryable());
        assert!(!ErrorType::BadRequest.is_retryable());
        assert!(!ErrorType::Cancelled.is_retryable());
    }

    #[test]
    fn detail_prefers_problem_detail() {
        let body = br#"{"type":"about:blank","title":"Bad","status":400,"detail":"missing parts"}"#;
        assert_eq!(detail_from_body(body).as_deref(), Some("missing parts"));
    }

    #[test]
    fn detail_reads_opencode_error_shape() {
        let body = br#"{"name":"NotFoundError","data":{"message":"Session not found"}}"#;
        assert_eq!(detail_from_body(body).as_deref(), Some("Session not found"));
    }

    #[test]
    fn detail_falls_back_to_text() {
        assert_eq!(
            detail_from_body(b"  upstream exploded \n").as_deref(),
            Some("upstream exploded")
        );
        assert_eq!(detail_from_body(b""), None);
    }

    #[test]
    fn messages_carry_context() {
        let err = ClientError::ConnectionFailure {
            base_url: "http://127.0.0.1:9".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("http://127.0.0.1:9"));
        let problem = err.to_problem_details();
        assert_eq!(
            problem.type_.as_deref(),
            Some("urn:opencode-client:error:connection_failure")
        );
        assert_eq!(problem.extensions["baseUrl"], "http://127.0.0.1:9");

        let err = ClientError::ServerError {
            status: 503,
            detail: None,
        };
        assert_eq!(err.to_string(), "server error (503)");
    }
}
