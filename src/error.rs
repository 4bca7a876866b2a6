use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error taxonomy for the core, each variant mapping deterministically to an
/// HTTP status at the adapter boundary (spec §7).
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("bad parameters: {0}")]
    BadParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden")]
    Forbidden,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("retry later")]
    Retry,

    #[error("no tuner available")]
    NoTuner,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            CoreError::BadParams(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            CoreError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            CoreError::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
            }
            CoreError::Retry => (StatusCode::SERVICE_UNAVAILABLE, "retry".to_string()),
            CoreError::NoTuner => {
                (StatusCode::SERVICE_UNAVAILABLE, "no tuner available".to_string())
            }
            CoreError::Internal(err) => {
                tracing::error!("internal error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Body::from(body))
            .unwrap()
    }
}
