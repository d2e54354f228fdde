//! Every client-side persistence surface the app may have written to.
//!
//! Each surface exposes the same capability (`kind`, `item_count`, `clear`) so
//! the reset orchestrator can iterate them without knowing what they are.
//! A clear never fails outward: problems are logged and reported in the
//! returned [`ClearResult`], and never stop sibling surfaces from clearing.

mod caches;
mod cookies;
mod database;
mod storage;

pub use caches::CacheStorageSurface;
pub use cookies::CookieSurface;
pub use database::StructuredDatabaseSurface;
pub use storage::KeyValueSurface;

use color_eyre::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::CacheStorage;
use crate::db::Database;
use crate::page::PageContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SurfaceKind {
  LocalStorage,
  SessionStorage,
  Cookies,
  StructuredDatabase,
  CacheStorage,
}

impl fmt::Display for SurfaceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::LocalStorage => "local storage",
      Self::SessionStorage => "session storage",
      Self::Cookies => "cookies",
      Self::StructuredDatabase => "structured database",
      Self::CacheStorage => "cache storage",
    };
    f.write_str(name)
  }
}

/// When a surface is cleared relative to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearPhase {
  /// Synchronous and fast, cleared one after another first
  Immediate,
  /// Asynchronous, cleared concurrently as one awaited batch
  Deferred,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResult {
  pub attempted: bool,
  pub succeeded: bool,
  pub items_before: usize,
  pub items_after: usize,
}

impl ClearResult {
  /// The host has no such surface: nothing to do, nothing went wrong.
  pub fn unavailable() -> Self {
    Self {
      attempted: false,
      succeeded: true,
      items_before: 0,
      items_after: 0,
    }
  }

  pub fn cleared(items_before: usize, items_after: usize) -> Self {
    Self {
      attempted: true,
      succeeded: true,
      items_before,
      items_after,
    }
  }

  pub fn failed(items_before: usize, items_after: usize) -> Self {
    Self {
      attempted: true,
      succeeded: false,
      items_before,
      items_after,
    }
  }

  pub fn removed(&self) -> usize {
    self.items_before.saturating_sub(self.items_after)
  }
}

pub trait PersistenceSurface: Send + Sync {
  fn kind(&self) -> SurfaceKind;

  fn phase(&self) -> ClearPhase;

  /// Items currently held, as far as this surface can see them.
  fn item_count(&self) -> BoxFuture<'_, Result<usize>>;

  /// Remove everything reachable. Safe to call repeatedly.
  fn clear(&self) -> BoxFuture<'_, ClearResult>;
}

/// Every surface of a profile, in clearing order within each phase.
/// Without `caches` the cache storage surface reports itself unavailable.
pub fn standard_surfaces(
  db: Arc<Database>,
  page: Arc<dyn PageContext>,
  caches: Option<Arc<dyn CacheStorage>>,
) -> Vec<Arc<dyn PersistenceSurface>> {
  let cache_surface = match caches {
    Some(storage) => CacheStorageSurface::new(storage),
    None => CacheStorageSurface::unavailable(),
  };

  vec![
    Arc::new(KeyValueSurface::local(db.clone())),
    Arc::new(KeyValueSurface::session(db.clone())),
    Arc::new(CookieSurface::new(db.clone(), page)),
    Arc::new(StructuredDatabaseSurface::new(db)),
    Arc::new(cache_surface),
  ]
}

/// Log one surface's result the same way for every surface.
pub(crate) fn report(kind: SurfaceKind, result: &ClearResult) {
  if !result.attempted {
    warn!(surface = %kind, "surface unavailable, nothing cleared");
  } else if result.succeeded {
    info!(
      surface = %kind,
      before = result.items_before,
      after = result.items_after,
      "surface cleared"
    );
  } else {
    warn!(
      surface = %kind,
      before = result.items_before,
      after = result.items_after,
      "surface clear failed"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_clear_result_constructors() {
    let r = ClearResult::unavailable();
    assert!(!r.attempted && r.succeeded);

    let r = ClearResult::failed(3, 1);
    assert!(r.attempted && !r.succeeded);
    assert_eq!(r.removed(), 2);
  }

  #[test]
  fn test_clear_result_wire_shape() {
    let json = serde_json::to_value(ClearResult::cleared(4, 0)).unwrap();
    assert_eq!(
      json,
      serde_json::json!({"attempted": true, "succeeded": true, "itemsBefore": 4, "itemsAfter": 0})
    );
  }
}
