use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error};

use meridian_state::ReportError;
use meridian_util::cache::CacheError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing bearer token")]
    MissingCredentials,

    #[error("unknown API key")]
    InvalidCredentials,

    #[error("failed to look up API key: {0}")]
    CredentialsLookup(#[from] CacheError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingCredentials
            | ApiError::InvalidCredentials
            | ApiError::Report(ReportError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ApiError::Report(ReportError::Malformed(_)) => StatusCode::BAD_REQUEST,
            ApiError::CredentialsLookup(_)
            | ApiError::Report(ReportError::Internal(_))
            | ApiError::Report(ReportError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        } else {
            debug!("request rejected: {self}");
        }

        match self {
            ApiError::Report(ReportError::Malformed(reason)) => (status, reason).into_response(),
            _ => status.into_response(),
        }
    }
}
