//! Types shared between the transport and the session.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard User-Agent header for CareBridge API requests.
pub const USER_AGENT: &str = concat!("carebridge/", env!("CARGO_PKG_VERSION"));

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of the backend-facing conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Body of one chat request: the full history plus the opaque bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Turn>,
    #[serde(rename = "fhirToken")]
    pub token: String,
}

/// Categories of chat failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorKind {
    /// The backend could not be reached, or the stream broke before a terminal frame.
    NetworkFailure,
    /// Non-success HTTP status.
    ProtocolFailure,
    /// Error payload delivered inside a healthy stream.
    BackendReported,
    /// Stream closed without a terminal frame under `StreamEndPolicy::Incomplete`.
    Incomplete,
}

impl fmt::Display for ChatErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatErrorKind::NetworkFailure => write!(f, "network_failure"),
            ChatErrorKind::ProtocolFailure => write!(f, "protocol_failure"),
            ChatErrorKind::BackendReported => write!(f, "backend_reported"),
            ChatErrorKind::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Structured chat failure with a one-line, user-presentable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatError {
    pub kind: ChatErrorKind,
    pub message: String,
}

impl ChatError {
    pub fn new(kind: ChatErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::NetworkFailure, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::BackendReported, message)
    }

    /// Creates a protocol failure from a non-success response.
    ///
    /// Uses the body's `message` (or `error`) field when the body is a JSON
    /// object, otherwise falls back to a message keyed by the status code.
    pub fn http_status(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| {
                ["message", "error"].iter().find_map(|key| {
                    json.get(key)
                        .and_then(Value::as_str)
                        .filter(|msg| !msg.trim().is_empty())
                        .map(str::to_string)
                })
            })
            .unwrap_or_else(|| format!("Server error ({status})"));
        Self::new(ChatErrorKind::ProtocolFailure, message)
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ChatError {}

/// Result type for transport operations.
pub type ChatResult<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let request = ChatRequest {
            messages: vec![
                Turn::user("Search for patient David Stan"),
                Turn::assistant("Found 1 patient."),
            ],
            token: "tok-123".to_string(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "messages": [
                    {"role": "user", "content": "Search for patient David Stan"},
                    {"role": "assistant", "content": "Found 1 patient."}
                ],
                "fhirToken": "tok-123"
            })
        );
    }

    #[test]
    fn test_http_status_uses_message_field() {
        let err = ChatError::http_status(401, r#"{"message":"token expired"}"#);
        assert_eq!(err.kind, ChatErrorKind::ProtocolFailure);
        assert_eq!(err.message, "token expired");
    }

    #[test]
    fn test_http_status_uses_error_field() {
        let err = ChatError::http_status(400, r#"{"error":"bad request body"}"#);
        assert_eq!(err.message, "bad request body");
    }

    #[test]
    fn test_http_status_falls_back_to_status_code() {
        assert_eq!(
            ChatError::http_status(502, "<html>Bad Gateway</html>").message,
            "Server error (502)"
        );
        assert_eq!(
            ChatError::http_status(500, "").message,
            "Server error (500)"
        );
        assert_eq!(
            ChatError::http_status(500, r#"{"message":""}"#).message,
            "Server error (500)"
        );
    }
}
