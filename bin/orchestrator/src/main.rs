#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use anyhow::Context;
use tower_http::cors::{Any, CorsLayer};

use crate::{
  compose::ComposeRunner, config::orchestrator_config, process::ProcessRunner,
  session::SessionStore, singleflight::SingleFlight, state::AppState, version::VersionResolver,
};

mod api;
mod compose;
mod config;
mod entities;
mod error;
mod pipeline;
mod process;
mod registry;
mod session;
mod singleflight;
mod state;
mod version;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = orchestrator_config();
  logger::init(&config.logging)?;

  info!("updater-orchestrator version: v{}", env!("CARGO_PKG_VERSION"));
  info!(?config, "resolved configuration");

  let docker_bin = ProcessRunner::resolve_docker_bin(config.docker_bin.as_deref())
    .context("failed to locate a container runtime binary")?;
  let process = ProcessRunner::new(docker_bin);
  let compose = ComposeRunner::new(
    process.clone(),
    config.workdir.clone(),
    config.compose_project_name.clone(),
  );
  let http = reqwest::Client::builder()
    .user_agent(concat!("updater-orchestrator/", env!("CARGO_PKG_VERSION")))
    .build()
    .context("failed to build http client")?;
  let version = Arc::new(VersionResolver::new(
    process.clone(),
    http.clone(),
    config.version_manifest_url.clone(),
    config.version_channel_default.clone(),
    config.version_cache_ttl_seconds,
    config.version_min_refresh_seconds,
  ));

  let state = Arc::new(AppState {
    config,
    sessions: SessionStore::new(),
    update_gate: SingleFlight::new(),
    backup_gate: SingleFlight::new(),
    process,
    compose,
    version,
    http,
  });

  let app = api::router()
    .with_state(state)
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr =
    SocketAddr::from_str(&addr).context("failed to parse listen address")?;

  info!("updater-orchestrator starting on http://{socket_addr}");
  let listener = tokio::net::TcpListener::bind(socket_addr)
    .await
    .context("failed to bind listen address")?;
  axum::serve(listener, app).await.context("server exited unexpectedly")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal =
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
