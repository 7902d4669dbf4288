use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::server::oci::ProxyError;

/// Message returned to clients for every proxy failure
pub const PROXY_FAILURE_MESSAGE: &str = "Failed to proxy request";

/// HTTP-facing error with server-side logging
///
/// Carries a status, the message shown to the client, an optional source kept
/// for the logs only, and structured context fields. 5xx errors are logged
/// with their full chain when converted into a response.
///
/// ```rust,ignore
/// let err = ServerError::from_anyhow(e.into(), StatusCode::BAD_GATEWAY, "Failed to proxy request")
///     .with_context("upstream", upstream)
///     .with_context("path", &path);
/// ```
#[derive(Debug)]
pub struct ServerError {
    pub status: StatusCode,
    /// User-facing message
    pub message: String,
    /// Logged, never sent to the client
    pub source: Option<anyhow::Error>,
    pub context: Vec<(&'static str, String)>,
}

impl ServerError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
            context: Vec::new(),
        }
    }

    pub fn from_anyhow(
        source: anyhow::Error,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            source: Some(source),
            context: Vec::new(),
        }
    }

    /// Add a context field for logging (chainable)
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    pub fn internal_anyhow(source: anyhow::Error, message: impl Into<String>) -> Self {
        Self::from_anyhow(source, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            // Structured fields keep request-derived values out of the message
            if let Some(source) = &self.source {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    error = ?source,
                    "Server error"
                );
            } else {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    "Server error"
                );
            }
        }

        let body = Json(json!({
            "error": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<ProxyError> for ServerError {
    fn from(err: ProxyError) -> Self {
        let status = match &err {
            ProxyError::Configuration(_) | ProxyError::MalformedChallenge(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::UpstreamTransport { .. }
            | ProxyError::UpstreamTimeout { .. }
            | ProxyError::TokenFetch { .. } => StatusCode::BAD_GATEWAY,
        };

        Self::from_anyhow(err.into(), status, PROXY_FAILURE_MESSAGE)
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal_anyhow(err, "Internal server error")
    }
}

/// Convert any `Result` into one carrying a [`ServerError`]
pub trait ServerErrorExt<T> {
    fn server_err(self, status: StatusCode, message: impl Into<String>) -> Result<T, ServerError>;

    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError>;
}

impl<T, E> ServerErrorExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn server_err(self, status: StatusCode, message: impl Into<String>) -> Result<T, ServerError> {
        self.map_err(|e| ServerError::from_anyhow(e.into(), status, message))
    }

    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError> {
        self.map_err(|e| ServerError::internal_anyhow(e.into(), message))
    }
}
