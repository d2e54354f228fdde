//! Local and session key-value areas.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

use super::{report, ClearPhase, ClearResult, PersistenceSurface, SurfaceKind};
use crate::db::{Database, StorageArea};

pub struct KeyValueSurface {
  db: Arc<Database>,
  area: StorageArea,
}

impl KeyValueSurface {
  pub fn local(db: Arc<Database>) -> Self {
    Self {
      db,
      area: StorageArea::Local,
    }
  }

  pub fn session(db: Arc<Database>) -> Self {
    Self {
      db,
      area: StorageArea::Session,
    }
  }

  fn clear_now(&self) -> ClearResult {
    let before = match self.db.kv_len(self.area) {
      Ok(n) => n,
      Err(e) => {
        warn!(surface = %self.kind(), error = %e, "could not count keys");
        0
      }
    };

    let result = match self.db.kv_clear(self.area) {
      Ok(_) => ClearResult::cleared(before, self.db.kv_len(self.area).unwrap_or(0)),
      Err(e) => {
        warn!(surface = %self.kind(), error = %e, "clear rejected");
        ClearResult::failed(before, self.db.kv_len(self.area).unwrap_or(before))
      }
    };

    report(self.kind(), &result);
    result
  }
}

impl PersistenceSurface for KeyValueSurface {
  fn kind(&self) -> SurfaceKind {
    match self.area {
      StorageArea::Local => SurfaceKind::LocalStorage,
      StorageArea::Session => SurfaceKind::SessionStorage,
    }
  }

  fn phase(&self) -> ClearPhase {
    ClearPhase::Immediate
  }

  fn item_count(&self) -> BoxFuture<'_, Result<usize>> {
    Box::pin(async move { self.db.kv_len(self.area) })
  }

  fn clear(&self) -> BoxFuture<'_, ClearResult> {
    Box::pin(async move { self.clear_now() })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_clear_local_leaves_session() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.kv_set(StorageArea::Local, "current_user", "{}").unwrap();
    db.kv_set(StorageArea::Local, "nope_user_a", "{}").unwrap();
    db.kv_set(StorageArea::Session, "tab", "1").unwrap();

    let surface = KeyValueSurface::local(db.clone());
    assert_eq!(surface.kind(), SurfaceKind::LocalStorage);

    let result = surface.clear().await;
    assert_eq!(result, ClearResult::cleared(2, 0));
    assert_eq!(db.kv_len(StorageArea::Session).unwrap(), 1);

    // Second clear is a no-op, not an error
    assert_eq!(surface.clear().await, ClearResult::cleared(0, 0));
  }
}
