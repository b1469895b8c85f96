//! Subprocess execution: spawns external commands, streams merged
//! stdout+stderr line-wise, and enforces a timeout.

use std::{path::Path, path::PathBuf, process::ExitStatus, time::Duration};

use tokio::{
  io::{AsyncBufReadExt, AsyncRead, BufReader},
  process::Command,
  sync::mpsc::{UnboundedSender, unbounded_channel},
};

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone)]
pub struct ProcessRunner {
  pub docker_bin: PathBuf,
}

impl ProcessRunner {
  pub fn new(docker_bin: PathBuf) -> Self {
    Self { docker_bin }
  }

  /// `DOCKER_BIN`, then `PATH`, then a fixed candidate list. Absence is
  /// a permanent configuration error.
  pub fn resolve_docker_bin(
    configured: Option<&Path>,
  ) -> OrchestratorResult<PathBuf> {
    if let Some(configured) = configured {
      if configured.is_file() {
        return Ok(configured.to_path_buf());
      }
    }
    if let Ok(path_var) = std::env::var("PATH") {
      for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join("docker");
        if candidate.is_file() {
          return Ok(candidate);
        }
      }
    }
    for candidate in
      ["/usr/local/bin/docker", "/usr/bin/docker", "/usr/bin/docker.io"]
    {
      let path = PathBuf::from(candidate);
      if path.is_file() {
        return Ok(path);
      }
    }
    Err(OrchestratorError::Config(
      "no container runtime binary found (checked DOCKER_BIN, PATH, well-known paths)"
        .to_string(),
    ))
  }

  /// Runs `argv[0] argv[1..]`, streaming merged stdout+stderr to
  /// `on_line` as each line arrives. Returns the exit code, or an error
  /// on spawn failure or timeout (in which case the child is killed).
  pub async fn run(
    &self,
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
    mut on_line: impl FnMut(&str) + Send,
  ) -> OrchestratorResult<i32> {
    if argv.is_empty() {
      return Err(OrchestratorError::Config("empty argv".to_string()));
    }

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    if let Some(cwd) = cwd {
      cmd.current_dir(cwd);
    }
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(|err| {
      OrchestratorError::Subprocess(format!(
        "failed to spawn {}: {err}",
        argv[0]
      ))
    })?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let (tx, mut rx) = unbounded_channel::<String>();
    let stdout_task = tokio::spawn(pump_lines(stdout, tx.clone()));
    let stderr_task = tokio::spawn(pump_lines(stderr, tx));

    let mut exit_status: Option<ExitStatus> = None;
    let mut channel_closed = false;
    let mut timed_out = false;
    let mut wait_err: Option<std::io::Error> = None;

    {
      let wait = tokio::time::timeout(timeout, child.wait());
      tokio::pin!(wait);

      loop {
        tokio::select! {
          maybe_line = rx.recv(), if !channel_closed => {
            match maybe_line {
              Some(line) => on_line(&line),
              None => channel_closed = true,
            }
          }
          res = &mut wait, if exit_status.is_none() => {
            match res {
              Ok(Ok(status)) => exit_status = Some(status),
              Ok(Err(err)) => {
                wait_err = Some(err);
                break;
              }
              Err(_elapsed) => {
                timed_out = true;
                break;
              }
            }
          }
          else => break,
        }
        if channel_closed && exit_status.is_some() {
          break;
        }
      }
    }

    if let Some(err) = wait_err {
      return Err(OrchestratorError::Subprocess(err.to_string()));
    }

    if timed_out {
      let _ = child.start_kill();
      drain_remaining(&mut rx, &mut on_line).await;
      let _ = stdout_task.await;
      let _ = stderr_task.await;
      return Err(OrchestratorError::Subprocess(format!(
        "{} timed out after {:?}",
        argv[0], timeout
      )));
    }

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(exit_status.and_then(|s| s.code()).unwrap_or(-1))
  }

  /// Runs `docker exec <container> <argv…>`, returning whether it
  /// exited zero.
  pub async fn exec_in_container(
    &self,
    container: &str,
    argv: &[String],
    timeout: Duration,
    on_line: impl FnMut(&str) + Send,
  ) -> OrchestratorResult<bool> {
    let mut full =
      vec![self.docker_bin.to_string_lossy().into_owned(), "exec".to_string(), container.to_string()];
    full.extend(argv.iter().cloned());
    let code = self.run(&full, None, timeout, on_line).await?;
    Ok(code == 0)
  }
}

async fn pump_lines(
  reader: impl AsyncRead + Unpin,
  tx: UnboundedSender<String>,
) {
  let mut lines = BufReader::new(reader).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => {
        let line = line.trim_end_matches('\r').to_string();
        if tx.send(line).is_err() {
          break;
        }
      }
      _ => break,
    }
  }
}

async fn drain_remaining(
  rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>,
  on_line: &mut impl FnMut(&str),
) {
  while let Ok(line) = rx.try_recv() {
    on_line(&line);
  }
}
