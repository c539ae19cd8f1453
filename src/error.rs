use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Typed failure modes for the coordinator and agent services.
///
/// Each variant maps onto exactly one HTTP status, matching the exit-code
/// table in the external-interfaces section: 400 malformed, 403 forbidden,
/// 404 not found, 500 internal, 503 downstream unavailable, 504 deadline.
#[derive(Debug, thiserror::Error)]
pub enum KubeDoorError {
    #[error("no live session for env {0}")]
    SessionOffline(String),

    #[error("request timed out waiting for agent response")]
    RequestTimeout,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("metrics source unavailable: {0}")]
    MetricsUnavailable(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("missing required configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("duplicate session for env {0}")]
    DuplicateSession(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KubeDoorError {
    pub fn status(&self) -> StatusCode {
        match self {
            KubeDoorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            KubeDoorError::Forbidden(_) => StatusCode::FORBIDDEN,
            KubeDoorError::NotFound(_) => StatusCode::NOT_FOUND,
            KubeDoorError::DuplicateSession(_) => StatusCode::CONFLICT,
            KubeDoorError::SessionOffline(_)
            | KubeDoorError::StoreUnavailable(_)
            | KubeDoorError::MetricsUnavailable(_)
            | KubeDoorError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            KubeDoorError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            KubeDoorError::ConfigMissing(_) | KubeDoorError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for KubeDoorError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, KubeDoorError>;
