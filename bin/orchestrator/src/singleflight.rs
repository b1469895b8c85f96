//! At-most-one-holder gate, one per job class: a mutex-guarded holder
//! id rather than a generic state enum.

use std::sync::{Arc, Mutex};

use crate::entities::Session;

#[derive(Default)]
pub struct SingleFlight {
  holder: Mutex<Option<String>>,
}

impl SingleFlight {
  pub fn new() -> Self {
    Self { holder: Mutex::new(None) }
  }

  /// Atomically claims the gate for `id`. Returns `false` if another id
  /// already holds it.
  pub fn try_acquire(&self, id: &str) -> bool {
    let mut holder = self.holder.lock().unwrap();
    if holder.is_some() {
      return false;
    }
    *holder = Some(id.to_string());
    true
  }

  /// Releases the gate, but only if `id` is the current holder.
  pub fn release(&self, id: &str) {
    let mut holder = self.holder.lock().unwrap();
    if holder.as_deref() == Some(id) {
      *holder = None;
    }
  }

  pub fn holder(&self) -> Option<String> {
    self.holder.lock().unwrap().clone()
  }

  /// Clears a held id whose session no longer exists or has reached a
  /// terminal state.
  pub fn cleanup_stale(&self, lookup: impl Fn(&str) -> Option<Arc<Session>>) {
    let current = self.holder();
    let Some(id) = current else { return };
    let stale = match lookup(&id) {
      Some(session) => session.is_terminal(),
      None => true,
    };
    if stale {
      self.release(&id);
    }
  }

  /// Holder present AND session present AND session is non-terminal.
  pub fn is_effectively_active(
    &self,
    lookup: impl Fn(&str) -> Option<Arc<Session>>,
  ) -> bool {
    match self.holder() {
      Some(id) => match lookup(&id) {
        Some(session) => !session.is_terminal(),
        None => false,
      },
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn second_acquire_is_refused() {
    let gate = SingleFlight::new();
    assert!(gate.try_acquire("upd-1"));
    assert!(!gate.try_acquire("upd-2"));
    assert_eq!(gate.holder().as_deref(), Some("upd-1"));
  }

  #[test]
  fn release_only_clears_matching_holder() {
    let gate = SingleFlight::new();
    gate.try_acquire("upd-1").then_some(()).unwrap();
    gate.release("upd-2");
    assert_eq!(gate.holder().as_deref(), Some("upd-1"));
    gate.release("upd-1");
    assert!(gate.holder().is_none());
  }

  #[test]
  fn acquire_after_release_succeeds() {
    let gate = SingleFlight::new();
    gate.try_acquire("upd-1");
    gate.release("upd-1");
    assert!(gate.try_acquire("upd-2"));
  }
}
