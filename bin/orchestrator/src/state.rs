use std::sync::Arc;

use config::Config;

use crate::{
  compose::ComposeRunner, process::ProcessRunner, session::SessionStore,
  singleflight::SingleFlight, version::VersionResolver,
};

/// Process-wide state, constructed once in `main` and injected into the
/// router via `Router::with_state` rather than module-level globals.
pub struct AppState {
  pub config: &'static Config,
  pub sessions: SessionStore,
  pub update_gate: SingleFlight,
  pub backup_gate: SingleFlight,
  pub process: ProcessRunner,
  pub compose: ComposeRunner,
  pub version: Arc<VersionResolver>,
  pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;
