use axum::{Json, Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod backup;
pub mod update;
pub mod version;

async fn health() -> Json<serde_json::Value> {
  Json(serde_json::json!({ "ok": true }))
}

pub fn router() -> Router<SharedState> {
  let update_routes = Router::new()
    .route("/start", axum::routing::post(update::start))
    .route("/status/{id}", get(update::status))
    .route("/stream/{id}", get(update::stream))
    .route("/cancel/{id}", axum::routing::post(update::cancel));

  let backup_routes = Router::new()
    .route("/start", axum::routing::post(backup::start))
    .route("/status/{id}", get(backup::status))
    .route("/stream/{id}", get(backup::stream))
    .route("/list", get(backup::list))
    .route("/restore", axum::routing::post(backup::restore))
    .route("/cancel/{id}", axum::routing::post(backup::cancel));

  Router::new()
    .route("/health", get(health))
    .route("/version", get(version::get))
    .nest("/update", update_routes)
    .nest("/backup", backup_routes)
    .layer(TraceLayer::new_for_http())
}
