//! Session store: sessions keyed by id, created by pipeline entry
//! points and never removed.

use std::{collections::HashMap, path::PathBuf, sync::Arc, sync::Mutex};

use chrono::Utc;

use crate::entities::{Session, SessionClass};

#[derive(Default)]
pub struct SessionStore {
  sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create(&self, class: SessionClass, log_path: Option<PathBuf>) -> Arc<Session> {
    let id = format!("{}-{}", class.prefix(), Utc::now().timestamp());
    let session = Arc::new(Session::new(class, id.clone(), log_path));
    self.sessions.lock().unwrap().insert(id, session.clone());
    session
  }

  pub fn get(&self, id: &str) -> Option<Arc<Session>> {
    self.sessions.lock().unwrap().get(id).cloned()
  }
}
