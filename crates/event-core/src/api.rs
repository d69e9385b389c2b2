//! Signaling event envelope
//!
//! Every message on a loopcast signaling socket is one JSON object of the
//! shape `{event, uuid, parameter | response | error}`. Requests carry a
//! `parameter` object; responses echo the request uuid and carry either a
//! `response` object or an `error` object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Error object carried in non-success responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    pub description: String,
}

/// Well-known error codes used across the control plane.
///
/// The wire carries plain integers; these are the values this
/// implementation emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Request parameters missing or malformed
    ParameterError,
    /// Authentication failed
    AuthFailure,
    /// Request deadline expired before a response arrived
    Timeout,
    /// Codec mismatch between peers
    CodecMismatch,
    /// Session id is not known to the registry
    SessionUnknown,
    /// The operation failed while being applied
    ProcessingError,
    /// No free worker slot available
    NoResource,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::ParameterError => 400,
            ErrorCode::AuthFailure => 401,
            ErrorCode::Timeout => 408,
            ErrorCode::CodecMismatch => 415,
            ErrorCode::SessionUnknown => 440,
            ErrorCode::ProcessingError => 500,
            ErrorCode::NoResource => 503,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::ParameterError => "parameter error",
            ErrorCode::AuthFailure => "authentication failure",
            ErrorCode::Timeout => "request timed out",
            ErrorCode::CodecMismatch => "codec mismatch",
            ErrorCode::SessionUnknown => "session unknown",
            ErrorCode::ProcessingError => "processing error",
            ErrorCode::NoResource => "no resource available",
        }
    }
}

impl From<ErrorCode> for ErrorInfo {
    fn from(code: ErrorCode) -> Self {
        ErrorInfo {
            code: code.code(),
            description: code.description().to_string(),
        }
    }
}

/// One signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event tag, e.g. `register`, `acquire`, `connect_media`
    pub event: String,

    /// Request/response correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,

    /// Event-specific request payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Value>,

    /// Event-specific response payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Error object, present on failure responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl EventMessage {
    /// Create a request with a fresh correlation id.
    pub fn request(event: impl Into<String>, parameter: Value) -> Self {
        Self {
            event: event.into(),
            uuid: Some(Uuid::new_v4()),
            parameter: Some(parameter),
            response: None,
            error: None,
        }
    }

    /// Create a success response echoing event tag and uuid of `request`.
    pub fn success_response(request: &EventMessage, response: Value) -> Self {
        Self {
            event: request.event.clone(),
            uuid: request.uuid,
            parameter: None,
            response: Some(response),
            error: None,
        }
    }

    /// Create an error response echoing event tag and uuid of `request`.
    pub fn error_response(request: &EventMessage, code: ErrorCode) -> Self {
        Self {
            event: request.event.clone(),
            uuid: request.uuid,
            parameter: None,
            response: None,
            error: Some(code.into()),
        }
    }

    /// True when this message answers a request rather than initiating one.
    pub fn is_response(&self) -> bool {
        self.response.is_some() || self.error.is_some()
    }

    /// Result code of a response; 0 means success.
    pub fn result_code(&self) -> u32 {
        self.error.as_ref().map(|e| e.code).unwrap_or(0)
    }

    /// Error description of a response, if any.
    pub fn result_description(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.description.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let msg = EventMessage::request("join", json!({"loop": "alpha"}));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: EventMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
        assert!(!decoded.is_response());
        assert!(decoded.uuid.is_some());
    }

    #[test]
    fn test_success_response_echoes_request() {
        let req = EventMessage::request("acquire", json!({"name": "s-1"}));
        let resp = EventMessage::success_response(&req, json!({}));
        assert_eq!(resp.event, "acquire");
        assert_eq!(resp.uuid, req.uuid);
        assert!(resp.is_response());
        assert_eq!(resp.result_code(), 0);
    }

    #[test]
    fn test_error_response_carries_code() {
        let req = EventMessage::request("volume", json!({"loop": "a", "volume": 30}));
        let resp = EventMessage::error_response(&req, ErrorCode::ProcessingError);
        assert!(resp.is_response());
        assert_eq!(resp.result_code(), ErrorCode::ProcessingError.code());
        assert_eq!(
            resp.result_description(),
            Some(ErrorCode::ProcessingError.description())
        );
    }

    #[test]
    fn test_absent_error_means_success() {
        let raw = r#"{"event":"release","uuid":"f8a3e2f0-6cc1-4a3c-9e54-6f2e9a3b1c11","response":{}}"#;
        let msg: EventMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.result_code(), 0);
    }
}
