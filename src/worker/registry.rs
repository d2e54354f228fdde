//! Registered workers, by scope.

use std::sync::Mutex;
use tracing::{debug, info};

use super::{ServiceWorker, WorkerHandle};

#[derive(Clone)]
pub struct Registration {
  pub scope: String,
  pub worker: WorkerHandle,
}

#[derive(Default)]
pub struct WorkerRegistry {
  registrations: Mutex<Vec<Registration>>,
}

impl WorkerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start `worker` for `scope`, install it, and let it take over right away.
  /// A worker previously registered for the scope is terminated.
  pub async fn register(&self, scope: &str, worker: ServiceWorker) -> WorkerHandle {
    let version = worker.version().to_string();
    let handle = worker.spawn();

    // The worker only fails these if its task is gone, which leaves it redundant
    if handle.install().await.is_ok() {
      let _ = handle.activate().await;
    }

    let replaced = {
      let mut registrations = self
        .registrations
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      let old = registrations
        .iter()
        .position(|r| r.scope == scope)
        .map(|i| registrations.remove(i));
      registrations.push(Registration {
        scope: scope.to_string(),
        worker: handle.clone(),
      });
      old
    };

    if let Some(old) = replaced {
      debug!(scope = %scope, "replacing previous worker");
      old.worker.terminate();
    }

    info!(scope = %scope, version = %version, "worker registered");
    handle
  }

  pub fn registrations(&self) -> Vec<Registration> {
    self
      .registrations
      .lock()
      .map(|r| r.clone())
      .unwrap_or_default()
  }

  /// Remove every registration and hand them back. The workers keep running
  /// until their last handle is dropped, so they can still answer messages.
  pub fn unregister_all(&self) -> Vec<Registration> {
    let removed: Vec<Registration> = self
      .registrations
      .lock()
      .map(|mut r| r.drain(..).collect())
      .unwrap_or_default();

    for registration in &removed {
      info!(scope = %registration.scope, "unregistering worker");
    }
    removed
  }

  /// The first registration with an active worker.
  pub fn ready(&self) -> Option<WorkerHandle> {
    self
      .registrations()
      .into_iter()
      .find(|r| r.worker.is_active())
      .map(|r| r.worker)
  }
}
