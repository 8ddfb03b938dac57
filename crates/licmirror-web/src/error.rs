use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use licmirror_adapters::InvalidCommand;
use licmirror_core::QueryError;
use licmirror_sync::ServiceError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("missing or invalid admin token")]
    Unauthorized,
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        AppError::Service(err.into())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<InvalidCommand> for AppError {
    fn from(err: InvalidCommand) -> Self {
        AppError::Service(err.into())
    }
}

fn reply(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

/// Client mistakes carry their message; anything else is logged and answered
/// with a generic 500 body.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => reply(StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => reply(StatusCode::NOT_FOUND, msg),
            AppError::Unauthorized => reply(
                StatusCode::UNAUTHORIZED,
                "missing or invalid admin token".to_string(),
            ),
            AppError::Service(
                err @ (ServiceError::Query(_) | ServiceError::InvalidCommand(_)),
            ) => reply(StatusCode::BAD_REQUEST, err.to_string()),
            AppError::Service(err @ ServiceError::SourceNotConfigured(_)) => {
                reply(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            AppError::Service(err) => {
                error!(error = %err, "request failed");
                reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use licmirror_core::SourceKind;

    #[test]
    fn status_mapping() {
        let cases = [
            (
                AppError::from(QueryError::InvalidSortOrder("up".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Service(ServiceError::SourceNotConfigured(SourceKind::Kaspi)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (AppError::Unauthorized, StatusCode::UNAUTHORIZED),
            (AppError::NotFound("nope".into()), StatusCode::NOT_FOUND),
            (AppError::BadRequest("bad".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
