use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;

/// HTTP-boundary error type. Internal code propagates `anyhow::Error`
/// (or crate-specific `thiserror` enums) via `?`; handlers convert the
/// final failure into one of these variants to pick a status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("{0}")]
  NotFound(String),

  #[error("{0}")]
  Conflict(String),

  #[error("{0}")]
  BadRequest(String),

  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match self {
      ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
      ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
      ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
      ApiError::Internal(err) => {
        tracing::error!("{err:#}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
      }
    };
    (status, Json(ErrorBody { error: message })).into_response()
  }
}

pub type ApiResult<T> = Result<T, ApiError>;
