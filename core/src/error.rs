//! Error types for the todo API client.
//!
//! # Design
//! `NotFound` and `Unauthorized` get dedicated variants because callers
//! branch on them: 404 means the todo is gone, 401 is what the gateway
//! recovers from. All other unexpected statuses land in `HttpError` with the
//! raw status code and body. The enum is `Clone` so one refresh failure can
//! be handed to every request queued behind it.

use thiserror::Error;

/// Errors returned by the client, the gateway and transports.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The server returned 404: the requested todo does not exist.
    #[error("resource not found")]
    NotFound,

    /// The server returned 401 and no refresh could recover it.
    #[error("unauthorized")]
    Unauthorized,

    /// The server returned a non-2xx status other than 401/404.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body could not be deserialized into the expected type.
    #[error("deserialization failed: {0}")]
    DeserializationError(String),

    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    SerializationError(String),

    /// The access token could not be decoded into claims.
    #[error("invalid access token: {0}")]
    InvalidToken(String),

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request or the refresh call exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The shared token refresh failed; carries the refresh call's own error.
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] Box<ApiError>),

    /// The request in charge of the refresh was dropped before it settled.
    #[error("token refresh was abandoned")]
    RefreshAbandoned,
}

impl ApiError {
    pub(crate) fn refresh_failed(cause: ApiError) -> Self {
        match cause {
            already @ ApiError::RefreshFailed(_) => already,
            other => ApiError::RefreshFailed(Box::new(other)),
        }
    }
}
