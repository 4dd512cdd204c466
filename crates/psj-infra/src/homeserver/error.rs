use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use psj_core::event::EventError;
use thiserror::Error;

use crate::http::{matrix_error, FederationError};

/// Errors raised by the simulated homeserver's request handlers.
///
/// Each maps onto a Matrix `errcode` response.
#[derive(Debug, Error)]
pub enum HomeserverError {
    #[error("missing access token")]
    MissingToken,

    #[error("unknown access token")]
    UnknownToken,

    #[error("missing X-Matrix authorization")]
    MissingOrigin,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadJson(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error(transparent)]
    Event(#[from] EventError),
}

impl HomeserverError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MissingToken => (StatusCode::UNAUTHORIZED, "M_MISSING_TOKEN"),
            Self::UnknownToken => (StatusCode::UNAUTHORIZED, "M_UNKNOWN_TOKEN"),
            Self::MissingOrigin => (StatusCode::UNAUTHORIZED, "M_UNAUTHORIZED"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "M_FORBIDDEN"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "M_NOT_FOUND"),
            Self::BadJson(_) => (StatusCode::BAD_REQUEST, "M_BAD_JSON"),
            Self::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN"),
            Self::Federation(_) => (StatusCode::BAD_GATEWAY, "M_UNKNOWN"),
            Self::Event(_) => (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN"),
        }
    }
}

impl IntoResponse for HomeserverError {
    fn into_response(self) -> Response {
        let (status, errcode) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }
        matrix_error(status, errcode, self.to_string())
    }
}
