//! Internal error taxonomy. Pipelines collapse any `OrchestratorError`
//! into a terminal `failed` phase message rather than letting it escape
//! past the pipeline boundary; HTTP handlers use `response::ApiError`
//! instead.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  #[error("config: {0}")]
  Config(String),

  #[error("subprocess: {0}")]
  Subprocess(String),

  #[error("registry: {0}")]
  Registry(String),

  #[error("io: {0}")]
  Io(String),

  #[error("{0}")]
  Verify(String),

  #[error("health: {0}")]
  Health(String),

  #[error("cancelled")]
  Cancelled,

  #[error("internal: {0}")]
  Internal(#[from] anyhow::Error),
}

impl From<std::io::Error> for OrchestratorError {
  fn from(err: std::io::Error) -> Self {
    OrchestratorError::Io(err.to_string())
  }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
