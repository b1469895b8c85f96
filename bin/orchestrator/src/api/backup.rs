//! `/backup/*` endpoints: start, status, SSE stream, list, restore,
//! cancel.

use std::{convert::Infallible, time::Duration};

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::sse::{Event as SseEvent, Sse},
};
use futures::{Stream, StreamExt};
use response::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
  entities::{SessionClass, SessionStatus},
  pipeline::backup::{list_generations, run_backup, run_restore},
  state::SharedState,
};

const DEFAULT_SCOPE: &[&str] = &["postgres", "influx", "config"];

#[derive(Debug, Clone, Deserialize)]
pub struct BackupStartRequest {
  #[serde(default)]
  pub scope: Vec<String>,
  #[serde(default)]
  #[allow(dead_code)]
  pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreRequest {
  pub backup_id: String,
  #[serde(default)]
  pub scope: Vec<String>,
}

#[derive(Serialize)]
pub struct BackupStartResponse {
  pub backup_id: String,
  pub state: String,
}

#[derive(Serialize)]
pub struct RestoreStartResponse {
  pub restore_id: String,
  pub state: String,
}

#[derive(Serialize)]
pub struct CancelResponse {
  pub ok: bool,
}

#[derive(Serialize)]
pub struct ListResponse {
  pub items: Vec<crate::entities::BackupGeneration>,
}

fn resolve_scope(scope: Vec<String>) -> Vec<String> {
  if scope.is_empty() {
    DEFAULT_SCOPE.iter().map(|s| s.to_string()).collect()
  } else {
    scope
  }
}

pub async fn start(
  State(state): State<SharedState>,
  Json(request): Json<BackupStartRequest>,
) -> ApiResult<(StatusCode, Json<BackupStartResponse>)> {
  let session = state.sessions.create(SessionClass::Backup, None);
  if !state.backup_gate.try_acquire(&session.id) {
    return Err(ApiError::Conflict("a backup or restore is already in progress".to_string()));
  }

  let run_state = state.clone();
  let run_session = session.clone();
  let scope = resolve_scope(request.scope);
  tokio::spawn(async move {
    run_backup(run_state, run_session, scope).await;
  });

  let body = BackupStartResponse { backup_id: session.id.clone(), state: "backup".to_string() };
  Ok((StatusCode::ACCEPTED, Json(body)))
}

pub async fn status(
  State(state): State<SharedState>,
  Path(id): Path<String>,
) -> Json<SessionStatus> {
  match state.sessions.get(&id) {
    Some(session) => Json(session.status()),
    None => Json(SessionStatus {
      id,
      state: "idle".to_string(),
      phase: "idle".to_string(),
      progress: 0,
      log_tail: Vec::new(),
      started_at: chrono::Utc::now(),
    }),
  }
}

pub async fn stream(
  State(state): State<SharedState>,
  Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
  let session = state
    .sessions
    .get(&id)
    .ok_or_else(|| ApiError::NotFound(format!("unknown backup session {id}")))?;
  let receiver = session
    .take_receiver()
    .ok_or_else(|| ApiError::Conflict("session already has a stream subscriber".to_string()))?;

  let init = SseEvent::default().event("init").data(serde_json::to_string(&session.status())
    .unwrap_or_default());
  let body = UnboundedReceiverStream::new(receiver).map(|event| {
    Ok(
      SseEvent::default()
        .event(format!("{:?}", event.event).to_lowercase())
        .data(serde_json::to_string(&event).unwrap_or_default()),
    )
  });
  let combined = futures::stream::once(async move { Ok(init) }).chain(body);

  let heartbeat_session = session.clone();
  let heartbeat_interval = Duration::from_secs(state.config.sse_heartbeat_seconds);
  tokio::spawn(async move {
    loop {
      tokio::time::sleep(heartbeat_interval).await;
      if heartbeat_session.heartbeat().is_err() {
        break;
      }
    }
  });

  Ok(Sse::new(combined))
}

pub async fn list(State(state): State<SharedState>) -> Json<ListResponse> {
  Json(ListResponse { items: list_generations(&state.config.backups_dir) })
}

pub async fn restore(
  State(state): State<SharedState>,
  Json(request): Json<RestoreRequest>,
) -> ApiResult<(StatusCode, Json<RestoreStartResponse>)> {
  let generation_dir = state.config.backups_dir.join(&request.backup_id);
  if !generation_dir.is_dir() {
    return Err(ApiError::NotFound(format!("backup generation {} not found", request.backup_id)));
  }

  let session = state.sessions.create(SessionClass::Restore, None);
  if !state.backup_gate.try_acquire(&session.id) {
    return Err(ApiError::Conflict("a backup or restore is already in progress".to_string()));
  }

  let run_state = state.clone();
  let run_session = session.clone();
  let scope = resolve_scope(request.scope);
  let backup_id = request.backup_id.clone();
  tokio::spawn(async move {
    run_restore(run_state, run_session, backup_id, scope).await;
  });

  let body = RestoreStartResponse { restore_id: session.id.clone(), state: "restore".to_string() };
  Ok((StatusCode::ACCEPTED, Json(body)))
}

/// Unlike `/update/cancel`, this 404s on an unknown id: backup/restore
/// sessions are user-initiated one-offs with no implicit "current" job
/// a caller might be polling blind, so there's no idle default to fall
/// back to.
pub async fn cancel(
  State(state): State<SharedState>,
  Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
  let session =
    state.sessions.get(&id).ok_or_else(|| ApiError::NotFound(format!("unknown session {id}")))?;
  session.request_cancel();
  Ok(Json(CancelResponse { ok: true }))
}
