//! Wraps `docker compose` invocations: project name, pinned override
//! auto-attachment, and filtered log forwarding to the SSE bus.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::{
  entities::{Session, TargetView},
  error::OrchestratorResult,
  process::ProcessRunner,
};

/// Only lines carrying one of these substrings are forwarded to the SSE
/// bus as `log` events; everything else still lands in the tail and log
/// file.
const LOG_MARKERS: &[&str] =
  &["Pulling", "Pulled", "Downloading", "Extracting", "Complete", "complete", "already"];

pub struct ComposeRunner {
  process: ProcessRunner,
  workdir: PathBuf,
  project_name: String,
  compose_file: PathBuf,
  pinned_file: PathBuf,
}

impl ComposeRunner {
  pub fn new(process: ProcessRunner, workdir: PathBuf, project_name: String) -> Self {
    let compose_file = workdir.join("docker-compose.yml");
    let pinned_file = workdir.join("docker-compose.pinned.yml");
    Self { process, workdir, project_name, compose_file, pinned_file }
  }

  pub fn pinned_path(&self) -> &PathBuf {
    &self.pinned_file
  }

  pub fn workdir(&self) -> &PathBuf {
    &self.workdir
  }

  /// Runs `docker compose <args>` in the workspace directory, injecting
  /// `-p <project>` and, unless the caller already passed `-f`,
  /// prepending the base file and the pinned override (if one exists).
  pub async fn run(
    &self,
    args: &[String],
    timeout: Duration,
    session: &Session,
  ) -> OrchestratorResult<i32> {
    let mut full = vec![
      self.process.docker_bin.to_string_lossy().into_owned(),
      "compose".to_string(),
      "-p".to_string(),
      self.project_name.clone(),
    ];

    let caller_supplied_files = args.iter().any(|a| a == "-f" || a == "--file");
    if !caller_supplied_files {
      full.push("-f".to_string());
      full.push(self.compose_file.to_string_lossy().into_owned());
      if self.pinned_file.is_file() {
        full.push("-f".to_string());
        full.push(self.pinned_file.to_string_lossy().into_owned());
      }
    }
    full.extend(args.iter().cloned());

    self
      .process
      .run(&full, Some(&self.workdir), timeout, |line| {
        let forward = LOG_MARKERS.iter().any(|marker| line.contains(marker));
        session.log_line(line.to_string(), forward);
      })
      .await
  }

  /// Writes the pinned override mapping each service to `repo@digest`.
  pub fn write_pinned_override(
    &self,
    targets: &HashMap<String, TargetView>,
  ) -> OrchestratorResult<()> {
    let mut yaml = String::from(
      "# DO NOT EDIT — generated by the updater, overwritten on every pin\nservices:\n",
    );
    let mut services: Vec<_> = targets.iter().collect();
    services.sort_by(|a, b| a.0.cmp(b.0));
    for (service, target) in services {
      yaml.push_str(&format!(
        "  {service}:\n    image: {}@{}\n",
        target.repo, target.digest
      ));
    }
    std::fs::write(&self.pinned_file, yaml)?;
    Ok(())
  }
}
