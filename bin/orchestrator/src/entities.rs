//! Shared data types: sessions, events, and the version/backup views.

use std::{
  collections::VecDeque,
  path::PathBuf,
  sync::{
    Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{
  UnboundedReceiver, UnboundedSender, unbounded_channel,
};

pub const LOG_TAIL_CAPACITY: usize = 100;

/// The three job classes, each behind its own single-flight gate and
/// contributing the prefix of its session id (`upd-…`, `bak-…`, `rst-…`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionClass {
  Update,
  Backup,
  Restore,
}

impl SessionClass {
  pub fn prefix(self) -> &'static str {
    match self {
      SessionClass::Update => "upd",
      SessionClass::Backup => "bak",
      SessionClass::Restore => "rst",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
  Phase,
  Progress,
  Log,
  Completed,
  Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
  pub event: EventKind,
  pub state: String,
  pub message: String,
  pub ts: DateTime<Utc>,
}

impl Event {
  fn new(
    event: EventKind,
    state: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self { event, state: state.into(), message: message.into(), ts: Utc::now() }
  }
}

struct SessionInner {
  state: String,
  phase: String,
  progress: u8,
  log_tail: VecDeque<String>,
}

/// A job session: state, progress, log tail, and the event queue feeding
/// its SSE subscriber. Mutated only by the pipeline that owns it and by
/// the cancel endpoint, which may only flip `cancel_requested`.
pub struct Session {
  pub id: String,
  pub class: SessionClass,
  pub started_at: DateTime<Utc>,
  pub log_path: Option<PathBuf>,
  cancel_requested: AtomicBool,
  inner: StdMutex<SessionInner>,
  sender: UnboundedSender<Event>,
  receiver: StdMutex<Option<UnboundedReceiver<Event>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
  pub id: String,
  pub state: String,
  pub phase: String,
  pub progress: u8,
  pub log_tail: Vec<String>,
  pub started_at: DateTime<Utc>,
}

impl Session {
  pub fn new(class: SessionClass, id: String, log_path: Option<PathBuf>) -> Self {
    let (sender, receiver) = unbounded_channel();
    Self {
      id,
      class,
      started_at: Utc::now(),
      log_path,
      cancel_requested: AtomicBool::new(false),
      inner: StdMutex::new(SessionInner {
        state: "starting".to_string(),
        phase: "starting".to_string(),
        progress: 0,
        log_tail: VecDeque::with_capacity(LOG_TAIL_CAPACITY),
      }),
      sender,
      receiver: StdMutex::new(Some(receiver)),
    }
  }

  /// Updates the (state, phase, progress) triple and enqueues a `phase`
  /// event. Never blocks: the queue is unbounded.
  pub fn emit(&self, state: &str, phase: impl Into<String>, progress: u8) {
    let phase = phase.into();
    {
      let mut inner = self.inner.lock().unwrap();
      inner.state = state.to_string();
      inner.phase = phase.clone();
      inner.progress = progress;
    }
    self.push_log(phase.clone());
    let _ = self.sender.send(Event::new(EventKind::Phase, state, phase));
  }

  /// Appends a line to the 100-line tail and optionally forwards it to
  /// the SSE bus as a `log` event (used for filtered compose output).
  pub fn log_line(&self, line: impl Into<String>, forward: bool) {
    let line = line.into();
    self.push_log(line.clone());
    if forward {
      let state = self.inner.lock().unwrap().state.clone();
      let _ = self.sender.send(Event::new(EventKind::Log, state, line));
    }
  }

  fn push_log(&self, line: String) {
    let mut inner = self.inner.lock().unwrap();
    if inner.log_tail.len() == LOG_TAIL_CAPACITY {
      inner.log_tail.pop_front();
    }
    inner.log_tail.push_back(line);
  }

  /// Posts a heartbeat `progress` event without altering session state.
  pub fn heartbeat(&self) -> Result<(), ()> {
    let state = self.inner.lock().unwrap().state.clone();
    self
      .sender
      .send(Event::new(EventKind::Progress, state, "heartbeat"))
      .map_err(|_| ())
  }

  pub fn complete(&self, message: impl Into<String>) {
    let message = message.into();
    {
      let mut inner = self.inner.lock().unwrap();
      inner.state = "completed".to_string();
      inner.phase = message.clone();
      inner.progress = 100;
    }
    self.push_log(message.clone());
    let _ = self.sender.send(Event::new(EventKind::Completed, "completed", message));
  }

  /// Marks the session terminally failed, preserving the last progress
  /// value (terminal failure never resets progress to 0).
  pub fn fail(&self, message: impl Into<String>) {
    let message = message.into();
    {
      let mut inner = self.inner.lock().unwrap();
      inner.state = "failed".to_string();
      inner.phase = message.clone();
    }
    self.push_log(message.clone());
    let _ = self.sender.send(Event::new(EventKind::Failed, "failed", message));
  }

  pub fn request_cancel(&self) {
    self.cancel_requested.store(true, Ordering::SeqCst);
  }

  pub fn cancel_requested(&self) -> bool {
    self.cancel_requested.load(Ordering::SeqCst)
  }

  pub fn is_terminal(&self) -> bool {
    let inner = self.inner.lock().unwrap();
    inner.state == "completed" || inner.state == "failed"
  }

  pub fn progress(&self) -> u8 {
    self.inner.lock().unwrap().progress
  }

  pub fn status(&self) -> SessionStatus {
    let inner = self.inner.lock().unwrap();
    SessionStatus {
      id: self.id.clone(),
      state: inner.state.clone(),
      phase: inner.phase.clone(),
      progress: inner.progress,
      log_tail: inner.log_tail.iter().cloned().collect(),
      started_at: self.started_at,
    }
  }

  pub fn sender(&self) -> UnboundedSender<Event> {
    self.sender.clone()
  }

  /// The receiver half may only be taken once: only one stream consumer
  /// per session is supported.
  pub fn take_receiver(&self) -> Option<UnboundedReceiver<Event>> {
    self.receiver.lock().unwrap().take()
  }
}

/// Current view of one running service, as seen by inspecting its
/// container.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
  pub image: String,
  pub repo: String,
  pub tag: String,
  pub digest: String,
  pub image_id: String,
}

/// Target a service should be moved to.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct TargetView {
  pub repo: String,
  pub digest: String,
}

/// The update manifest, fetched from `VERSION_MANIFEST_URL`.
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
pub struct Manifest {
  pub version: String,
  #[serde(default)]
  pub services: std::collections::HashMap<String, String>,
  #[serde(default)]
  pub digests: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
  pub current: std::collections::HashMap<String, ServiceView>,
  pub latest: Option<Manifest>,
  pub update_available: bool,
  pub update_in_progress: bool,
  pub last_checked_at: Option<DateTime<Utc>>,
  pub last_result: Option<String>,
}

/// Singleton cache of the most recently fetched manifest.
pub struct LatestCache {
  pub latest: Option<Manifest>,
  pub last_result: Option<String>,
  pub expires_at: DateTime<Utc>,
  pub min_refresh_at: DateTime<Utc>,
  pub channel: String,
}

impl Default for LatestCache {
  fn default() -> Self {
    let now = Utc::now();
    Self {
      latest: None,
      last_result: None,
      expires_at: now,
      min_refresh_at: now,
      channel: String::new(),
    }
  }
}

/// One entry in `/backup/list`: a timestamped generation directory.
#[derive(Debug, Clone, Serialize)]
pub struct BackupGeneration {
  pub id: String,
  pub created_at: DateTime<Utc>,
  pub scopes: Vec<String>,
  pub size_bytes: u64,
}
