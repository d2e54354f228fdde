//! Bookkeeping for reset runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::surface::{ClearResult, SurfaceKind};

/// Per-surface results of one reset, persisted with its record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetCounts {
  pub surfaces: Vec<SurfaceCount>,
  pub workers_unregistered: usize,
  pub worker_caches_cleared: usize,
  pub worker_reply_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceCount {
  pub surface: SurfaceKind,
  pub result: ClearResult,
}

impl ResetCounts {
  #[cfg(test)]
  pub fn for_surface(&self, kind: SurfaceKind) -> Option<&ClearResult> {
    self
      .surfaces
      .iter()
      .find(|c| c.surface == kind)
      .map(|c| &c.result)
  }

  /// Surfaces whose clear was attempted and failed.
  pub fn failed_surfaces(&self) -> Vec<SurfaceKind> {
    self
      .surfaces
      .iter()
      .filter(|c| c.result.attempted && !c.result.succeeded)
      .map(|c| c.surface)
      .collect()
  }
}

/// One reset run. Written before anything is cleared and completed after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRecord {
  pub reset_id: String,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub counts: Option<ResetCounts>,
}

impl ResetRecord {
  pub fn begin(reset_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
    Self {
      reset_id: reset_id.into(),
      started_at,
      completed_at: None,
      counts: None,
    }
  }

  /// A reset that started but never recorded completion was interrupted.
  pub fn is_partial(&self) -> bool {
    self.completed_at.is_none()
  }

  /// Whether `now` falls inside the cooldown that follows this reset.
  pub fn within_cooldown(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
    now - self.started_at < cooldown
  }
}

/// A fresh id of the form `rs-<epoch-ms>-<9 chars>`.
pub fn generate_reset_id(now: DateTime<Utc>) -> String {
  let suffix = uuid::Uuid::new_v4().simple().to_string();
  format!("rs-{}-{}", now.timestamp_millis(), &suffix[..9])
}
