//! Supervisor errors and their JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code on control responses
pub const X_TOPICGATE_ERROR: &str = "x-topicgate-error";

/// Errors returned by supervisor operations and the proxy
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Topic is banned and can never be started
    #[error("topic '{0}' is banned")]
    Forbidden(String),

    /// No instance is running for the topic (or port)
    #[error("no instance for '{0}'")]
    NotFound(String),

    /// Every port in the configured range is taken
    #[error("no free port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    /// The instance engine refused or failed to start the topic
    #[error("failed to initialize '{topic}': {source}")]
    InitializationFailed {
        topic: String,
        #[source]
        source: anyhow::Error,
    },

    /// The proxied upstream could not be dialed or did not upgrade
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed topic or routing header
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The supervisor is closing and no longer accepts work
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// A queued task panicked or was dropped
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error codes, as sent in error bodies and the error header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Forbidden,
    NotFound,
    ResourceExhausted,
    InitializationFailed,
    UpstreamUnavailable,
    BadRequest,
    ShuttingDown,
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InitializationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::InitializationFailed => "INITIALIZATION_FAILED",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl SupervisorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::Forbidden(_) => ErrorCode::Forbidden,
            SupervisorError::NotFound(_) => ErrorCode::NotFound,
            SupervisorError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            SupervisorError::InitializationFailed { .. } => ErrorCode::InitializationFailed,
            SupervisorError::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
            SupervisorError::BadRequest(_) => ErrorCode::BadRequest,
            SupervisorError::ShuttingDown => ErrorCode::ShuttingDown,
            SupervisorError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the error code header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header(X_TOPICGATE_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Error response for a supervisor error
///
/// Initialization failures keep their detail in the logs only.
pub fn supervisor_error_response(err: &SupervisorError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let message = match err {
        SupervisorError::InitializationFailed { topic, .. } => {
            format!("failed to initialize '{}'", topic)
        }
        other => other.to_string(),
    };
    json_error_response(err.code(), message)
}
