//! `/update/*` endpoints: start, status, SSE stream, cancel.

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
  pipeline::update::run_update,
  state::SharedState,
};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpdateStartRequest {
  #[serde(default)]
  pub target_version: Option<String>,
  #[serde(default)]
  pub channel: Option<String>,
  #[serde(default)]
  pub force: Option<bool>,
}

#[derive(Serialize)]
pub struct StartResponse {
  pub update_id: String,
  pub state: String,
}

/// 202 with the new session id and its starting state, or 409 if an
/// update (or restore, which touches the same services) is already in
/// flight.
pub async fn start(
  State(state): State<SharedState>,
  Json(request): Json<UpdateStartRequest>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
  let session = state.sessions.create(SessionClass::Update, None);
  if !state.update_gate.try_acquire(&session.id) {
    return Err(ApiError::Conflict("an update is already in progress".to_string()));
  }

  let run_state = state.clone();
  let run_session = session.clone();
  tokio::spawn(async move {
    run_update(run_state, run_session, request).await;
  });

  let body = StartResponse { update_id: session.id.clone(), state: "preflight".to_string() };
  Ok((StatusCode::ACCEPTED, Json(body)))
}

/// Reports `idle` for an unknown id rather than 404: polling clients
/// shouldn't need to special-case "never started".
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
    .ok_or_else(|| ApiError::NotFound(format!("unknown update session {id}")))?;
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

#[derive(Serialize)]
pub struct CancelResponse {
  pub ok: bool,
}

/// Always 200, even for an unknown or already-terminal id: cancellation
/// is idempotent by design.
pub async fn cancel(
  State(state): State<SharedState>,
  Path(id): Path<String>,
) -> Json<CancelResponse> {
  if let Some(session) = state.sessions.get(&id) {
    session.request_cancel();
  }
  Json(CancelResponse { ok: true })
}
