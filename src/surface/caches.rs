//! Response cache storage: every named generation, enumerated then deleted.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{report, ClearPhase, ClearResult, PersistenceSurface, SurfaceKind};
use crate::cache::CacheStorage;

pub struct CacheStorageSurface {
  storage: Option<Arc<dyn CacheStorage>>,
}

impl CacheStorageSurface {
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      storage: Some(storage),
    }
  }

  pub fn unavailable() -> Self {
    Self { storage: None }
  }

  fn clear_with(storage: &dyn CacheStorage) -> ClearResult {
    let names = match storage.keys() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "cache enumeration failed");
        return ClearResult::failed(0, 0);
      }
    };

    let before = names.len();
    let mut failures = 0;
    for name in &names {
      match storage.delete(name) {
        Ok(_) => debug!(cache = %name, "cache deleted"),
        Err(e) => {
          warn!(cache = %name, error = %e, "failed to delete cache");
          failures += 1;
        }
      }
    }

    let after = storage.keys().map(|k| k.len()).unwrap_or(failures);
    if failures > 0 {
      ClearResult::failed(before, after)
    } else {
      ClearResult::cleared(before, after)
    }
  }
}

impl PersistenceSurface for CacheStorageSurface {
  fn kind(&self) -> SurfaceKind {
    SurfaceKind::CacheStorage
  }

  fn phase(&self) -> ClearPhase {
    ClearPhase::Deferred
  }

  fn item_count(&self) -> BoxFuture<'_, Result<usize>> {
    Box::pin(async move {
      match &self.storage {
        Some(storage) => Ok(storage.keys()?.len()),
        None => Ok(0),
      }
    })
  }

  fn clear(&self) -> BoxFuture<'_, ClearResult> {
    Box::pin(async move {
      let result = match &self.storage {
        Some(storage) => Self::clear_with(storage.as_ref()),
        None => ClearResult::unavailable(),
      };
      report(self.kind(), &result);
      result
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::{Request, Response};
  use url::Url;

  #[tokio::test]
  async fn test_deletes_every_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let req = Request::get(Url::parse("http://localhost/app.js").unwrap());
    storage.put("static-v1", &req, &Response::new(200, "js")).unwrap();
    storage.put("dynamic-v1", &req, &Response::new(200, "js")).unwrap();

    let surface = CacheStorageSurface::new(storage.clone());
    assert_eq!(surface.item_count().await.unwrap(), 2);
    assert_eq!(surface.clear().await, ClearResult::cleared(2, 0));
    assert_eq!(storage.entry_count().unwrap(), 0);
  }
}
