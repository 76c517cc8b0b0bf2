use std::fmt::{self, Display};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error body returned by the PostHog API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub detail: String,
    #[serde(default)]
    pub attr: serde_json::Value,
}

impl ApiErrorBody {
    /// Wraps a raw (non-JSON) error payload in the structured shape.
    pub(crate) fn from_raw(detail: impl Into<String>) -> Self {
        Self {
            error_type: "server_error".to_string(),
            code: "unknown".to_string(),
            detail: detail.into(),
            attr: serde_json::Value::Null,
        }
    }
}

impl Display for ApiErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type: {}, code: {}, detail: {}, attr: {:?}",
            self.error_type, self.code, self.detail, self.attr
        )
    }
}

/// Errors surfaced to callers of the client.
///
/// Transient transport failures (connect errors, timeouts, 408/429/5xx) are
/// retried inside the transport layer and only appear here as
/// [`Error::Connection`] once retries are exhausted.
#[derive(Error, Debug)]
pub enum Error {
    /// Network-level failure after the retry budget was spent.
    #[error("connection error: {0}")]
    Connection(String),

    /// The requested resource does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Non-retryable HTTP error with the API's structured body.
    #[error("api error ({status}): {body}")]
    Api {
        status: StatusCode,
        body: ApiErrorBody,
    },

    /// HTTP 401; the project token or personal API key is wrong.
    #[error("unauthorized: {0}")]
    Unauthorized(ApiErrorBody),

    /// A payload could not be serialized or a response could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or missing client configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The client was disposed and no longer accepts work.
    #[error("client disposed")]
    Disposed,

    /// The global client was initialized twice.
    #[error("global client already initialized")]
    AlreadyInitialized,

    /// The global client was used before initialization.
    #[error("global client not initialized")]
    NotInitialized,
}

impl Error {
    /// Maps a non-retryable HTTP status and its raw body to the right surface.
    pub(crate) fn from_status(status: StatusCode, raw_body: String) -> Self {
        let body = serde_json::from_str::<ApiErrorBody>(&raw_body)
            .unwrap_or_else(|_| ApiErrorBody::from_raw(raw_body));
        if status == StatusCode::UNAUTHORIZED {
            Error::Unauthorized(body)
        } else {
            Error::Api { status, body }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_body_is_parsed() {
        let raw = r#"{"type":"validation_error","code":"required","detail":"missing api_key","attr":"api_key"}"#;
        let err = Error::from_status(StatusCode::BAD_REQUEST, raw.to_string());
        match err {
            Error::Api { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body.code, "required");
                assert_eq!(body.attr, serde_json::json!("api_key"));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn unauthorized_gets_its_own_surface() {
        let err = Error::from_status(StatusCode::UNAUTHORIZED, "nope".to_string());
        match err {
            Error::Unauthorized(body) => assert_eq!(body.detail, "nope"),
            other => panic!("expected Unauthorized, got {:?}", other),
        }
    }

    #[test]
    fn unstructured_body_is_wrapped() {
        let err =
            Error::from_status(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>".to_string());
        match err {
            Error::Api { body, .. } => assert_eq!(body.detail, "<html>bad gateway</html>"),
            other => panic!("expected Api error, got {:?}", other),
        }
    }
}
