//! Backup/restore pipeline: snapshots postgres, InfluxDB, and the
//! config tree into a timestamped generation directory; restore does
//! the inverse against a chosen generation.

use std::{path::Path, sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
  entities::{BackupGeneration, Session},
  error::{OrchestratorError, OrchestratorResult},
  pipeline::update::wait_for_health,
  state::AppState,
};

pub async fn run_backup(
  state: Arc<AppState>,
  session: Arc<Session>,
  scope: Vec<String>,
) {
  let result = run_backup_inner(&state, &session, &scope).await;
  state.backup_gate.release(&session.id);
  match result {
    Ok(()) => session.complete("backup completed"),
    Err(err) => session.fail(err.to_string()),
  }
}

/// Used directly by the update pipeline for its pre-update snapshot,
/// which shares the session but doesn't own the single-flight gate or
/// the terminal completion call.
pub async fn run_backup_scope(
  state: &AppState,
  session: &Session,
  scope: &[String],
) -> OrchestratorResult<()> {
  run_backup_inner(state, session, scope).await
}

async fn run_backup_inner(
  state: &AppState,
  session: &Session,
  scope: &[String],
) -> OrchestratorResult<()> {
  let generation_id = Utc::now().format("%Y%m%dT%H%M%S").to_string();
  let generation_dir = state.config.backups_dir.join(&generation_id);
  tokio::fs::create_dir_all(&generation_dir).await?;

  let total = scope.len().max(1);
  for (index, item) in scope.iter().enumerate() {
    if session.cancel_requested() {
      return Ok(());
    }
    let progress = progress_for(index, total);
    match item.as_str() {
      "postgres" => {
        session.emit("backup", "dumping postgres", progress);
        backup_postgres(state, &generation_dir).await?;
      }
      "influx" => {
        session.emit("backup", "backing up influxdb", progress);
        backup_influx(state, &generation_dir).await?;
      }
      "config" => {
        session.emit("backup", "copying config tree", progress);
        backup_config(state, &generation_dir).await?;
      }
      other => {
        session.log_line(format!("unknown backup scope item: {other}"), true);
      }
    }
  }

  update_latest_symlink(&state.config.backups_dir, &generation_id)?;
  prune_old_generations(&state.config.backups_dir)?;
  Ok(())
}

fn progress_for(index: usize, total: usize) -> u8 {
  (10 + (80 * (index + 1) / total)) as u8
}

/// `pg_dump` is invoked with no explicit credentials: the postgres
/// container is expected to already have `PGUSER`/`PGPASSWORD` (or a
/// `/run/secrets` wrapper) configured in its own environment.
async fn backup_postgres(state: &AppState, generation_dir: &Path) -> OrchestratorResult<()> {
  let dest_dir = generation_dir.join("postgres");
  tokio::fs::create_dir_all(&dest_dir).await?;

  let ok = state
    .process
    .exec_in_container(
      "postgres",
      &[
        "pg_dump".to_string(),
        "-F".to_string(),
        "c".to_string(),
        "-f".to_string(),
        "/tmp/backup.dump".to_string(),
      ],
      Duration::from_secs(state.config.compose_timeout_seconds),
      |_| {},
    )
    .await?;
  if !ok {
    return Err(OrchestratorError::Subprocess("pg_dump failed".to_string()));
  }

  copy_from_container(state, "postgres", "/tmp/backup.dump", &dest_dir.join("backup.dump"))
    .await?;
  let _ = state
    .process
    .exec_in_container(
      "postgres",
      &["rm".to_string(), "-f".to_string(), "/tmp/backup.dump".to_string()],
      Duration::from_secs(30),
      |_| {},
    )
    .await;
  Ok(())
}

async fn backup_influx(state: &AppState, generation_dir: &Path) -> OrchestratorResult<()> {
  let dest_dir = generation_dir.join("influx");
  tokio::fs::create_dir_all(&dest_dir).await?;

  let ok = state
    .process
    .exec_in_container(
      "influxdb",
      &["influx".to_string(), "backup".to_string(), "/tmp/influx_backup".to_string()],
      Duration::from_secs(state.config.compose_timeout_seconds),
      |_| {},
    )
    .await?;
  if !ok {
    return Err(OrchestratorError::Subprocess("influx backup failed".to_string()));
  }

  copy_from_container(state, "influxdb", "/tmp/influx_backup/.", &dest_dir).await?;
  let _ = state
    .process
    .exec_in_container(
      "influxdb",
      &["rm".to_string(), "-rf".to_string(), "/tmp/influx_backup".to_string()],
      Duration::from_secs(30),
      |_| {},
    )
    .await;
  Ok(())
}

async fn backup_config(state: &AppState, generation_dir: &Path) -> OrchestratorResult<()> {
  let dest_dir = generation_dir.join("config");
  tokio::fs::create_dir_all(&dest_dir).await?;
  copy_from_container(state, "backend", "/home/canopyos/config/.", &dest_dir).await
}

async fn copy_from_container(
  state: &AppState,
  container: &str,
  src: &str,
  dest: &Path,
) -> OrchestratorResult<()> {
  let code = state
    .process
    .run(
      &[
        state.process.docker_bin.to_string_lossy().into_owned(),
        "cp".to_string(),
        format!("{container}:{src}"),
        dest.to_string_lossy().into_owned(),
      ],
      None,
      Duration::from_secs(180),
      |_| {},
    )
    .await?;
  if code != 0 {
    return Err(OrchestratorError::Io(format!("docker cp from {container} failed")));
  }
  Ok(())
}

async fn copy_into_container(
  state: &AppState,
  src: &Path,
  container: &str,
  dest: &str,
) -> OrchestratorResult<()> {
  let code = state
    .process
    .run(
      &[
        state.process.docker_bin.to_string_lossy().into_owned(),
        "cp".to_string(),
        src.to_string_lossy().into_owned(),
        format!("{container}:{dest}"),
      ],
      None,
      Duration::from_secs(180),
      |_| {},
    )
    .await?;
  if code != 0 {
    return Err(OrchestratorError::Io(format!("docker cp into {container} failed")));
  }
  Ok(())
}

fn update_latest_symlink(backups_dir: &Path, generation_id: &str) -> OrchestratorResult<()> {
  let link = backups_dir.join("latest");
  let _ = std::fs::remove_file(&link);
  #[cfg(unix)]
  std::os::unix::fs::symlink(generation_id, &link)?;
  Ok(())
}

/// Deletes directories whose name starts with a digit, oldest first,
/// until at most 2 remain.
fn prune_old_generations(backups_dir: &Path) -> OrchestratorResult<()> {
  let mut generations: Vec<String> = std::fs::read_dir(backups_dir)?
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
    .filter_map(|entry| entry.file_name().into_string().ok())
    .filter(|name| name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
    .collect();
  generations.sort();
  while generations.len() > 2 {
    let oldest = generations.remove(0);
    let _ = std::fs::remove_dir_all(backups_dir.join(oldest));
  }
  Ok(())
}

/// Parses each generation directory name as a UTC timestamp; on parse
/// failure "now" is used so the entry is still enumerable.
pub fn list_generations(backups_dir: &Path) -> Vec<BackupGeneration> {
  let Ok(entries) = std::fs::read_dir(backups_dir) else { return Vec::new() };
  let mut out = Vec::new();
  for entry in entries.filter_map(|entry| entry.ok()) {
    if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
      continue;
    }
    let Ok(name) = entry.file_name().into_string() else { continue };
    if name == "latest" {
      continue;
    }
    let created_at = chrono::NaiveDateTime::parse_from_str(&name, "%Y%m%dT%H%M%S")
      .map(|naive| chrono::DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
      .unwrap_or_else(|_| Utc::now());
    let scopes = ["postgres", "influx", "config"]
      .into_iter()
      .filter(|scope| entry.path().join(scope).is_dir())
      .map(String::from)
      .collect();
    let size_bytes = dir_size(&entry.path());
    out.push(BackupGeneration { id: name, created_at, scopes, size_bytes });
  }
  out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
  out
}

/// Sums file sizes recursively; unreadable entries contribute 0 rather
/// than failing the whole listing.
fn dir_size(dir: &Path) -> u64 {
  let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
  let mut total = 0;
  for entry in entries.filter_map(|entry| entry.ok()) {
    let Ok(file_type) = entry.file_type() else { continue };
    if file_type.is_dir() {
      total += dir_size(&entry.path());
    } else if let Ok(metadata) = entry.metadata() {
      total += metadata.len();
    }
  }
  total
}

pub async fn run_restore(
  state: Arc<AppState>,
  session: Arc<Session>,
  backup_id: String,
  scope: Vec<String>,
) {
  let result = run_restore_inner(&state, &session, &backup_id, &scope).await;
  state.backup_gate.release(&session.id);
  match result {
    Ok(()) => session.complete("restore completed"),
    Err(err) => session.fail(err.to_string()),
  }
}

async fn run_restore_inner(
  state: &AppState,
  session: &Session,
  backup_id: &str,
  scope: &[String],
) -> OrchestratorResult<()> {
  let generation_dir = state.config.backups_dir.join(backup_id);
  if !generation_dir.is_dir() {
    return Err(OrchestratorError::Io(format!("backup generation {backup_id} not found")));
  }

  let total = scope.len().max(1);
  for (index, item) in scope.iter().enumerate() {
    if session.cancel_requested() {
      return Ok(());
    }
    let progress = progress_for(index, total);
    match item.as_str() {
      "postgres" => {
        session.emit("restore", "restoring postgres", progress);
        restore_postgres(state, session, &generation_dir).await?;
      }
      "influx" => {
        session.emit("restore", "restoring influxdb", progress);
        restore_influx(state, session, &generation_dir).await?;
      }
      "config" => {
        session.emit("restore", "restoring config tree", progress);
        restore_config(state, session, &generation_dir).await?;
      }
      other => {
        session.log_line(format!("unknown restore scope item: {other}"), true);
      }
    }
  }
  Ok(())
}

async fn restore_postgres(
  state: &AppState,
  session: &Session,
  generation_dir: &Path,
) -> OrchestratorResult<()> {
  let dump = generation_dir.join("postgres").join("backup.dump");
  if !dump.is_file() {
    return Err(OrchestratorError::Io("no postgres dump in this generation".to_string()));
  }
  stop_service(state, session, "postgres").await?;
  copy_into_container(state, &dump, "postgres", "/tmp/restore.dump").await?;
  start_service(state, session, "postgres").await?;

  let ok = state
    .process
    .exec_in_container(
      "postgres",
      &[
        "pg_restore".to_string(),
        "-c".to_string(),
        "-d".to_string(),
        "postgres".to_string(),
        "/tmp/restore.dump".to_string(),
      ],
      Duration::from_secs(state.config.compose_timeout_seconds),
      |line| session.log_line(line.to_string(), false),
    )
    .await?;
  if !ok {
    return Err(OrchestratorError::Subprocess("pg_restore failed".to_string()));
  }
  wait_for_health(state, session, &["postgres".to_string()], Duration::from_secs(60)).await;
  Ok(())
}

async fn restore_influx(
  state: &AppState,
  session: &Session,
  generation_dir: &Path,
) -> OrchestratorResult<()> {
  let src = generation_dir.join("influx");
  if !src.is_dir() {
    return Err(OrchestratorError::Io("no influx snapshot in this generation".to_string()));
  }
  stop_service(state, session, "influxdb").await?;
  copy_into_container(state, &src, "influxdb", "/tmp/influx_restore").await?;
  start_service(state, session, "influxdb").await?;

  let ok = state
    .process
    .exec_in_container(
      "influxdb",
      &["influx".to_string(), "restore".to_string(), "/tmp/influx_restore".to_string()],
      Duration::from_secs(state.config.compose_timeout_seconds),
      |line| session.log_line(line.to_string(), false),
    )
    .await?;
  if !ok {
    return Err(OrchestratorError::Subprocess("influx restore failed".to_string()));
  }
  wait_for_health(state, session, &["influxdb".to_string()], Duration::from_secs(60)).await;
  Ok(())
}

/// Swaps the config tree via a `config.bak` rename rather than deleting
/// in place, so a failed copy doesn't leave the container configless.
async fn restore_config(
  state: &AppState,
  session: &Session,
  generation_dir: &Path,
) -> OrchestratorResult<()> {
  let src = generation_dir.join("config");
  if !src.is_dir() {
    return Err(OrchestratorError::Io("no config snapshot in this generation".to_string()));
  }
  stop_service(state, session, "python_backend").await?;
  let _ = state
    .process
    .exec_in_container(
      "backend",
      &[
        "mv".to_string(),
        "/home/canopyos/config".to_string(),
        "/home/canopyos/config.bak".to_string(),
      ],
      Duration::from_secs(30),
      |_| {},
    )
    .await;
  copy_into_container(state, &src, "backend", "/home/canopyos/config").await?;
  start_service(state, session, "python_backend").await?;
  Ok(())
}

async fn stop_service(
  state: &AppState,
  session: &Session,
  service: &str,
) -> OrchestratorResult<()> {
  let code = state
    .compose
    .run(
      &["stop".to_string(), service.to_string()],
      Duration::from_secs(state.config.compose_timeout_seconds),
      session,
    )
    .await?;
  if code != 0 {
    return Err(OrchestratorError::Subprocess(format!("compose stop {service} exited {code}")));
  }
  Ok(())
}

async fn start_service(
  state: &AppState,
  session: &Session,
  service: &str,
) -> OrchestratorResult<()> {
  let code = state
    .compose
    .run(
      &[
        "up".to_string(),
        "-d".to_string(),
        "--no-build".to_string(),
        "--no-deps".to_string(),
        service.to_string(),
      ],
      Duration::from_secs(state.config.compose_timeout_seconds),
      session,
    )
    .await?;
  if code != 0 {
    return Err(OrchestratorError::Subprocess(format!("compose up {service} exited {code}")));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn prunes_to_two_newest_generations() {
    let dir = tempdir().unwrap();
    for name in ["20260101T000000", "20260102T000000", "20260103T000000", "latest"] {
      std::fs::create_dir_all(dir.path().join(name)).unwrap();
    }
    prune_old_generations(dir.path()).unwrap();
    let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
      .unwrap()
      .filter_map(|e| e.ok())
      .map(|e| e.file_name().into_string().unwrap())
      .filter(|n| n.chars().next().unwrap().is_ascii_digit())
      .collect();
    remaining.sort();
    assert_eq!(remaining, vec!["20260102T000000", "20260103T000000"]);
  }

  #[test]
  fn lists_generations_newest_first() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("20260101T000000").join("postgres")).unwrap();
    std::fs::create_dir_all(dir.path().join("20260102T000000").join("config")).unwrap();
    let generations = list_generations(dir.path());
    assert_eq!(generations.len(), 2);
    assert_eq!(generations[0].id, "20260102T000000");
    assert_eq!(generations[0].scopes, vec!["config".to_string()]);
  }

  #[test]
  fn list_reports_generation_size_in_bytes() {
    let dir = tempdir().unwrap();
    let gen_dir = dir.path().join("20260101T000000").join("postgres");
    std::fs::create_dir_all(&gen_dir).unwrap();
    std::fs::write(gen_dir.join("backup.dump"), vec![0u8; 1024]).unwrap();
    let generations = list_generations(dir.path());
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].size_bytes, 1024);
  }

  #[test]
  fn unparseable_generation_name_still_enumerates() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("not-a-timestamp")).unwrap();
    let generations = list_generations(dir.path());
    assert_eq!(generations.len(), 1);
  }
}
