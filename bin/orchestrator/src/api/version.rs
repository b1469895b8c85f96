//! `GET /version` — current service versions, the cached latest
//! manifest, and whether an update is available or already running.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::{entities::VersionInfo, state::SharedState, version::compute_update_available};

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
  #[serde(default)]
  pub refresh: bool,
}

pub async fn get(
  State(state): State<SharedState>,
  Query(query): Query<VersionQuery>,
) -> Json<VersionInfo> {
  let services = state.config.update_services();
  let current = state.version.current_versions(&services).await;
  let latest_result = state.version.get_latest(query.refresh).await;

  let update_in_progress = state.update_gate.is_effectively_active(|id| state.sessions.get(id));

  let (latest, last_result) = match latest_result {
    Ok(manifest) => (Some(manifest), Some("ok".to_string())),
    Err(err) => (None, Some(err.to_string())),
  };
  let update_available =
    latest.as_ref().map(|manifest| compute_update_available(&current, manifest)).unwrap_or(false);

  Json(VersionInfo {
    current,
    latest,
    update_available,
    update_in_progress,
    last_checked_at: Some(chrono::Utc::now()),
    last_result,
  })
}
