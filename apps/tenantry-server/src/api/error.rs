//! Maps data-layer errors onto HTTP responses.

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tenantry_db::{ConfigError, ConnectionFailure, DataError, Engine};

use super::dto::ErrorResponse;

#[derive(Debug)]
pub enum ApiError {
    Data(DataError),
    /// Descriptor rejected by validation. `engine` is kept when the tag parsed.
    Config {
        error: ConfigError,
        engine: Option<Engine>,
    },
    /// Request body or headers could not be parsed.
    BadRequest(String),
}

impl From<DataError> for ApiError {
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        Self::Data(e.into())
    }
}

fn status_of(e: &DataError) -> StatusCode {
    match e {
        DataError::Configuration(_) | DataError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
        DataError::Connection {
            kind: ConnectionFailure::ServerMisconfigured,
            ..
        } => StatusCode::INTERNAL_SERVER_ERROR,
        DataError::Connection { .. } | DataError::Backend { .. } => StatusCode::BAD_GATEWAY,
        DataError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DataError::Isolation(_) => StatusCode::FORBIDDEN,
        DataError::Conflict { .. } => StatusCode::CONFLICT,
    }
}

fn data_body(e: &DataError, engine: Option<Engine>) -> (StatusCode, ErrorResponse) {
    let status = status_of(e);
    if status.is_server_error() {
        tracing::error!(error = %e, code = e.code(), "request failed");
    } else {
        tracing::debug!(error = %e, code = e.code(), "request rejected");
    }
    (
        status,
        ErrorResponse {
            success: false,
            error: e.to_string(),
            code: e.code(),
            engine: e.engine().or(engine),
        },
    )
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Data(e) => data_body(&e, None),
            Self::Config { error, engine } => data_body(&error.into(), engine),
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    success: false,
                    error: message,
                    code: "invalid_request",
                    engine: None,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}
