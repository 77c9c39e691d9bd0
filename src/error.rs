//! Error types for latchkey

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for latchkey
pub type Result<T> = std::result::Result<T, Error>;

/// Broker errors.
///
/// Each variant carries the HTTP status it surfaces as. Handlers return
/// these with `?`; the [`IntoResponse`] impl renders a short plain-text
/// body so relying parties never see internal detail.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or syntactically invalid request parameter
    #[error("{0}")]
    RequestMalformed(String),

    /// Missing or invalid session cookie where one is required
    #[error("{0}")]
    Unauthenticated(String),

    /// Caller does not own the identity, or a nonce/state/hash binding failed
    #[error("{0}")]
    Forbidden(String),

    /// Signature, expiry, or PKCE verification failed
    #[error("{0}")]
    Verification(String),

    /// A required claim is absent or has the wrong type
    #[error("missing claim: {0}")]
    MissingClaim(String),

    /// Network failure or non-200 status from an upstream provider
    #[error("upstream request failed: {0}")]
    UpstreamTransport(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Signing, template, or other internal failure
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// The HTTP status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RequestMalformed(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) | Self::Verification(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            // A missing claim in an inbound token means the token is bad.
            Self::MissingClaim(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamTransport(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Internal(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_error_kind() {
        assert_eq!(
            Error::RequestMalformed("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::Verification("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::UpstreamTransport("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let resp = Error::Storage("secret path".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
