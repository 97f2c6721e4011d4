use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use canvasync_common::protocol::ws::ServerMessage;
use serde::Serialize;
use uuid::Uuid;

use crate::validation::ValidationError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    InvalidMessage,
    SessionFull,
    UserBlocked,
    RateLimited,
    NotFound,
    NotJoined,
    PersistenceFailed,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::SessionFull => "SESSION_FULL",
            Self::UserBlocked => "USER_BLOCKED",
            Self::RateLimited => "RATE_LIMITED",
            Self::NotFound => "NOT_FOUND",
            Self::NotJoined => "NOT_JOINED",
            Self::PersistenceFailed => "PERSISTENCE_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::InvalidMessage => StatusCode::BAD_REQUEST,
            Self::SessionFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::UserBlocked => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotJoined => StatusCode::CONFLICT,
            Self::PersistenceFailed => StatusCode::INSUFFICIENT_STORAGE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Capacity-type rejections are worth retrying later.
    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::SessionFull | Self::RateLimited | Self::PersistenceFailed | Self::InternalError
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "input validation failed",
            Self::InvalidMessage => "invalid websocket frame payload",
            Self::SessionFull => "session is at capacity",
            Self::UserBlocked => "user is not allowed to join",
            Self::RateLimited => "request was rate limited",
            Self::NotFound => "requested resource not found",
            Self::NotJoined => "join the session first",
            Self::PersistenceFailed => "server could not persist data",
            Self::InternalError => "internal server error",
        }
    }
}

/// Structured error for the HTTP introspection surface.
#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<ValidationError> for RelayError {
    fn from(error: ValidationError) -> Self {
        Self::new(ErrorCode::ValidationFailed, error.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code.as_str(),
                message: &self.message,
                retryable: self.code.retryable(),
                request_id: request_id.as_deref(),
            },
        };
        let mut response = (self.code.status(), Json(envelope)).into_response();
        if let Some(request_id) = &request_id {
            attach_request_id_header(&mut response, request_id);
        }
        response
    }
}

/// Build the websocket `error` frame for a rejection.
pub fn error_frame(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        code: code.as_str().to_string(),
        message: message.into(),
        retryable: code.retryable(),
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
