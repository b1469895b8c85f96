//! Update pipeline: preflight → backup → sync → pull → verify → migrate
//! → recreate → healthcheck → finalize, with compensating rollback.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use chrono::Utc;

use crate::{
  api::update::UpdateStartRequest,
  entities::{Manifest, Session, TargetView},
  error::{OrchestratorError, OrchestratorResult},
  pipeline::backup,
  process::ProcessRunner,
  state::AppState,
};

const PRE_SYNC_EXCLUDE: &[&str] = &[".secrets", "volumes", "node-red", ".git", "*.log"];
const EXTRACT_EXTRA_EXCLUDE: &[&str] =
  &[".env", "mosquitto/config/password.txt", "docker-compose.pinned.yml"];

pub async fn run_update(
  state: Arc<AppState>,
  session: Arc<Session>,
  request: UpdateStartRequest,
) {
  let result = run_update_inner(&state, &session, &request).await;
  state.update_gate.release(&session.id);

  match result {
    Ok(()) => {}
    Err(OrchestratorError::Cancelled) => {
      tracing::info!(session = %session.id, "update cancelled");
    }
    Err(err) => {
      tracing::error!(session = %session.id, %err, "update failed");
      session.fail(err.to_string());
    }
  }
}

async fn run_update_inner(
  state: &AppState,
  session: &Session,
  request: &UpdateStartRequest,
) -> OrchestratorResult<()> {
  let services = state.config.update_services();

  session.emit("preflight", "validating environment", 5);
  if session.cancel_requested() {
    return Ok(());
  }
  ProcessRunner::resolve_docker_bin(state.config.docker_bin.as_deref())?;
  let previous_targets = capture_previous_targets(state).await;

  session.emit("backup", "creating pre-update snapshot", 15);
  if session.cancel_requested() {
    return Ok(());
  }
  let snapshot_scope = vec!["postgres".to_string(), "influx".to_string(), "config".to_string()];
  if let Err(err) = backup::run_backup_scope(state, session, &snapshot_scope).await {
    tracing::warn!(%err, "pre-update backup failed, continuing with the update");
    session.log_line(format!("pre-update backup failed: {err}"), true);
  }

  session.emit("sync", "syncing workspace from deployment repository", 25);
  if session.cancel_requested() {
    return Ok(());
  }
  sync_workspace(state, session).await?;
  session.emit("sync", "workspace sync complete", 30);

  session.emit("pull", "pulling updated images", 40);
  if session.cancel_requested() {
    return Ok(());
  }
  let mut pull_args = vec!["pull".to_string()];
  pull_args.extend(services.iter().cloned());
  let code = state
    .compose
    .run(&pull_args, Duration::from_secs(state.config.compose_timeout_seconds), session)
    .await?;
  if code != 0 {
    return Err(OrchestratorError::Subprocess(format!("compose pull exited {code}")));
  }

  session.emit("verify", "resolving target versions", 40);
  if session.cancel_requested() {
    return Ok(());
  }
  let channel = request
    .channel
    .clone()
    .unwrap_or_else(|| state.config.version_channel_default.clone());
  let manifest = state.version.get_latest(false).await.unwrap_or(Manifest {
    version: channel,
    services: HashMap::new(),
    digests: HashMap::new(),
  });
  let targets = state.version.get_target_for_services(&services, &manifest).await?;
  if !targets.is_empty() {
    session.emit("verify", "verifying pulled image digests", 50);
    verify_targets(state, &targets).await?;
  }
  session.emit("verify", "verification complete", 60);

  session.emit("migrate", "running database migrations", 60);
  if session.cancel_requested() {
    return Ok(());
  }
  let code = state
    .compose
    .run(
      &["run".to_string(), "--rm".to_string(), "migrations".to_string()],
      Duration::from_secs(state.config.compose_timeout_seconds),
      session,
    )
    .await?;
  if code != 0 {
    return Err(OrchestratorError::Subprocess(format!("migrations exited {code}")));
  }

  session.emit("recreate", "pinning image digests and recreating services", 85);
  if session.cancel_requested() {
    return Ok(());
  }
  if !targets.is_empty() {
    state.compose.write_pinned_override(&rekey_for_compose(&targets))?;
  }
  let mut up_args = vec![
    "up".to_string(),
    "-d".to_string(),
    "--no-build".to_string(),
    "--no-deps".to_string(),
    "--force-recreate".to_string(),
    "--remove-orphans".to_string(),
  ];
  up_args.extend(services.iter().cloned());
  if let Err(err) = state
    .compose
    .run(&up_args, Duration::from_secs(state.config.compose_timeout_seconds), session)
    .await
  {
    rollback(state, session, &previous_targets).await;
    return Err(err);
  }

  session.emit("healthcheck", "waiting for services to become healthy", 90);
  let healthy = wait_for_health(
    state,
    session,
    &state.config.update_health_services,
    Duration::from_secs(state.config.health_timeout_seconds),
  )
  .await;
  if !healthy {
    rollback(state, session, &previous_targets).await;
    return Err(OrchestratorError::Health(
      "services did not become healthy within the timeout".to_string(),
    ));
  }
  session.emit("healthcheck", "all services healthy", 99);

  session.emit("finalize", "rebuilding updater service", 95);
  let finalize = state
    .compose
    .run(
      &[
        "up".to_string(),
        "-d".to_string(),
        "--no-deps".to_string(),
        "--build".to_string(),
        "updater".to_string(),
      ],
      Duration::from_secs(state.config.compose_timeout_seconds),
      session,
    )
    .await;
  if let Err(err) = finalize {
    tracing::warn!(%err, "finalize step failed, non-fatal");
    session.emit("warning", format!("updater rebuild failed: {err}"), 95);
  }

  session.complete("update completed successfully");
  Ok(())
}

/// Captures the `(repo, digest)` pair for every primary service, keyed
/// by compose service name, for use by [`rollback`] on failure.
async fn capture_previous_targets(state: &AppState) -> HashMap<String, TargetView> {
  let services = state.config.update_services();
  let current = state.version.current_versions(&services).await;
  let mut out = HashMap::new();
  for (key, view) in current {
    if view.digest.is_empty() {
      continue;
    }
    let compose_name = if key == "backend" { "python_backend".to_string() } else { key };
    out.insert(compose_name, TargetView { repo: view.repo, digest: view.digest });
  }
  out
}

fn rekey_for_compose(targets: &HashMap<String, TargetView>) -> HashMap<String, TargetView> {
  targets
    .iter()
    .map(|(key, target)| {
      let compose_name = if key == "backend" { "python_backend" } else { key.as_str() };
      (compose_name.to_string(), target.clone())
    })
    .collect()
}

/// After `pull`, re-inspects the locally pulled image for each target
/// service and fails verification if its digest doesn't match. Images
/// are assumed to be referenced by a moving tag (`:latest`) prior to
/// pinning, which is what `recreate` is about to fix.
async fn verify_targets(
  state: &AppState,
  targets: &HashMap<String, TargetView>,
) -> OrchestratorResult<()> {
  for (key, target) in targets {
    let reference = format!("{}:latest", target.repo);
    let mut captured = String::new();
    let code = state
      .process
      .run(
        &[
          state.process.docker_bin.to_string_lossy().into_owned(),
          "image".to_string(),
          "inspect".to_string(),
          "--format".to_string(),
          "{{json .RepoDigests}}".to_string(),
          reference,
        ],
        None,
        Duration::from_secs(30),
        |line| captured.push_str(line),
      )
      .await;
    let Ok(0) = code else {
      continue;
    };
    let digests: Vec<String> = serde_json::from_str(&captured).unwrap_or_default();
    if !digests.iter().any(|d| d.ends_with(&target.digest)) {
      return Err(OrchestratorError::Verify(format!(
        "Digest verification failed for {key}: pulled image digest does not match target {}",
        target.digest
      )));
    }
  }
  Ok(())
}

/// Rewrites the pinned override to the previous digests and attempts to
/// recreate and re-heal. The caller is responsible for setting the
/// session's terminal `failed` state afterward; this only emits
/// progress so the last-seen progress value lands in `[90, 99]`.
async fn rollback(state: &AppState, session: &Session, previous: &HashMap<String, TargetView>) {
  if previous.is_empty() {
    session.log_line(
      "rollback skipped: no previous image digests recorded (fresh install)",
      true,
    );
    return;
  }

  session.emit("recreate", "rolling back to previous images", 92);
  if let Err(err) = state.compose.write_pinned_override(previous) {
    session.log_line(format!("rollback: failed to write pinned override: {err}"), true);
    return;
  }

  let mut up_args = vec!["up".to_string(), "-d".to_string(), "--force-recreate".to_string()];
  up_args.extend(previous.keys().cloned());
  if let Err(err) = state
    .compose
    .run(&up_args, Duration::from_secs(state.config.compose_timeout_seconds), session)
    .await
  {
    session.log_line(format!("rollback recreate failed: {err}"), true);
    return;
  }

  session.emit("healthcheck", "verifying rollback health", 97);
  let healthy = wait_for_health(
    state,
    session,
    &state.config.update_health_services,
    Duration::from_secs(state.config.health_timeout_seconds),
  )
  .await;
  if healthy {
    session.emit("healthcheck", "rollback health verified", 99);
  } else {
    session.log_line("rollback health check did not pass within the timeout", true);
  }
}

#[derive(Debug)]
enum HealthStatus {
  Healthy,
  Unhealthy,
  Pending,
}

/// Polls `docker inspect` for each container's health until all pass,
/// the deadline elapses, or cancellation is requested. Reports progress
/// at most every 5s and sleeps 2s between polls.
pub(crate) async fn wait_for_health(
  state: &AppState,
  session: &Session,
  containers: &[String],
  deadline: Duration,
) -> bool {
  let start = tokio::time::Instant::now();
  let mut last_report = start - Duration::from_secs(5);

  loop {
    if session.cancel_requested() {
      return false;
    }
    if start.elapsed() >= deadline {
      return false;
    }

    let mut all_pass = true;
    let mut statuses = Vec::with_capacity(containers.len());
    for container in containers {
      let status = inspect_health(state, container).await;
      if !matches!(status, HealthStatus::Healthy) {
        all_pass = false;
      }
      statuses.push((container.clone(), status));
    }
    if all_pass {
      return true;
    }

    if last_report.elapsed() >= Duration::from_secs(5) {
      let summary = statuses
        .iter()
        .map(|(name, status)| format!("{name}={status:?}"))
        .collect::<Vec<_>>()
        .join(", ");
      session.log_line(format!("waiting for health: {summary}"), false);
      last_report = tokio::time::Instant::now();
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
  }
}

async fn inspect_health(state: &AppState, container: &str) -> HealthStatus {
  let mut captured = String::new();
  let code = state
    .process
    .run(
      &[
        state.process.docker_bin.to_string_lossy().into_owned(),
        "inspect".to_string(),
        "--format".to_string(),
        "{{json .State}}".to_string(),
        container.to_string(),
      ],
      None,
      Duration::from_secs(15),
      |line| captured.push_str(line),
    )
    .await;
  if !matches!(code, Ok(0)) {
    return HealthStatus::Pending;
  }
  let Ok(value) = serde_json::from_str::<serde_json::Value>(&captured) else {
    return HealthStatus::Pending;
  };
  let health = value.pointer("/Health/Status").and_then(|v| v.as_str());
  let state_str = value.get("Status").and_then(|v| v.as_str()).unwrap_or_default();

  match health {
    Some("healthy") => HealthStatus::Healthy,
    Some("unhealthy") => HealthStatus::Unhealthy,
    _ if state_str == "running" && health.is_none() => HealthStatus::Healthy,
    _ if state_str == "exited" => HealthStatus::Unhealthy,
    _ => HealthStatus::Pending,
  }
}

/// Tarballs the workspace, fetches the deployment archive, and extracts
/// it over the workspace. On failure, the pre-sync tarball is restored.
async fn sync_workspace(state: &AppState, session: &Session) -> OrchestratorResult<()> {
  let workspace = state.config.workdir.clone();
  let ts = Utc::now().format("%Y%m%dT%H%M%S");
  let pre_sync_tar = std::env::temp_dir().join(format!("workspace-pre-sync-{ts}.tar.gz"));

  {
    let workspace = workspace.clone();
    let pre_sync_tar = pre_sync_tar.clone();
    tokio::task::spawn_blocking(move || {
      create_tarball(&workspace, &pre_sync_tar, PRE_SYNC_EXCLUDE)
    })
    .await
    .map_err(|err| OrchestratorError::Internal(err.into()))??;
  }

  let archive_path = std::env::temp_dir().join(format!("deployment-{ts}.tar.gz"));
  let sync_result = sync_workspace_inner(state, &workspace, &archive_path).await;

  if let Err(err) = sync_result {
    session.log_line(format!("sync failed, restoring pre-sync workspace: {err}"), true);
    let workspace = workspace.clone();
    let pre_sync_tar = pre_sync_tar.clone();
    tokio::task::spawn_blocking(move || extract_tarball(&pre_sync_tar, &workspace, &[], false))
      .await
      .map_err(|err| OrchestratorError::Internal(err.into()))??;
    return Err(err);
  }
  Ok(())
}

async fn sync_workspace_inner(
  state: &AppState,
  workspace: &Path,
  archive_path: &Path,
) -> OrchestratorResult<()> {
  download_archive(&state.http, &state.config.deployment_repo_url, archive_path).await?;

  let mut exclude: Vec<String> = PRE_SYNC_EXCLUDE.iter().map(|s| s.to_string()).collect();
  exclude.extend(EXTRACT_EXTRA_EXCLUDE.iter().map(|s| s.to_string()));

  let workspace = workspace.to_path_buf();
  let archive_path = archive_path.to_path_buf();
  tokio::task::spawn_blocking(move || {
    let exclude_refs: Vec<&str> = exclude.iter().map(String::as_str).collect();
    extract_tarball(&archive_path, &workspace, &exclude_refs, true)
  })
  .await
  .map_err(|err| OrchestratorError::Internal(err.into()))??;
  Ok(())
}

async fn download_archive(
  http: &reqwest::Client,
  url: &str,
  dest: &Path,
) -> OrchestratorResult<()> {
  let resp =
    http.get(url).send().await.map_err(|err| OrchestratorError::Io(err.to_string()))?;
  if !resp.status().is_success() {
    return Err(OrchestratorError::Io(format!("archive fetch returned {}", resp.status())));
  }
  let bytes = resp.bytes().await.map_err(|err| OrchestratorError::Io(err.to_string()))?;
  tokio::fs::write(dest, &bytes).await?;
  Ok(())
}

fn create_tarball(workspace: &Path, dest: &Path, exclude: &[&str]) -> std::io::Result<()> {
  let file = std::fs::File::create(dest)?;
  let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
  let mut builder = tar::Builder::new(encoder);
  append_dir_filtered(&mut builder, workspace, workspace, exclude)?;
  builder.into_inner()?.finish()?;
  Ok(())
}

fn append_dir_filtered<W: std::io::Write>(
  builder: &mut tar::Builder<W>,
  base: &Path,
  dir: &Path,
  exclude: &[&str],
) -> std::io::Result<()> {
  let Ok(entries) = std::fs::read_dir(dir) else { return Ok(()) };
  for entry in entries {
    let entry = entry?;
    let path = entry.path();
    let name = entry.file_name();
    let name = name.to_string_lossy();
    if exclude.iter().any(|pattern| matches_exclude(pattern, &name)) {
      continue;
    }
    let rel = path.strip_prefix(base).unwrap();
    if path.is_dir() {
      builder.append_dir(rel, &path)?;
      append_dir_filtered(builder, base, &path, exclude)?;
    } else if path.is_file() {
      builder.append_path_with_name(&path, rel)?;
    }
  }
  Ok(())
}

fn extract_tarball(
  archive_path: &Path,
  dest: &Path,
  exclude: &[&str],
  strip_first_component: bool,
) -> std::io::Result<()> {
  let file = std::fs::File::open(archive_path)?;
  let decoder = flate2::read::GzDecoder::new(file);
  let mut archive = tar::Archive::new(decoder);
  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.into_owned();
    let relative: PathBuf = if strip_first_component {
      let mut components = path.components();
      components.next();
      components.as_path().to_path_buf()
    } else {
      path
    };
    if relative.as_os_str().is_empty() {
      continue;
    }
    let relative_str = relative.to_string_lossy();
    if exclude.iter().any(|pattern| relative_str.starts_with(pattern)) {
      continue;
    }
    let target = dest.join(&relative);
    if let Some(parent) = target.parent() {
      std::fs::create_dir_all(parent)?;
    }
    entry.unpack(&target)?;
  }
  Ok(())
}

fn matches_exclude(pattern: &str, name: &str) -> bool {
  match pattern.strip_prefix('*') {
    Some(suffix) => name.ends_with(suffix),
    None => name == pattern,
  }
}
