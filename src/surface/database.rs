//! Structured on-disk databases: enumerated, then deleted one by one.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{report, ClearPhase, ClearResult, PersistenceSurface, SurfaceKind};
use crate::db::Database;

/// Host capability to list and delete named databases.
pub trait DatabaseCatalog: Send + Sync {
  fn names(&self) -> Result<Vec<String>>;

  /// Returns false when the database did not exist.
  fn delete(&self, name: &str) -> Result<bool>;
}

impl DatabaseCatalog for Database {
  fn names(&self) -> Result<Vec<String>> {
    self.structured_database_names()
  }

  fn delete(&self, name: &str) -> Result<bool> {
    self.delete_structured_database(name)
  }
}

pub struct StructuredDatabaseSurface {
  /// None when the host has no structured database API at all
  catalog: Option<Arc<dyn DatabaseCatalog>>,
}

impl StructuredDatabaseSurface {
  pub fn new(catalog: Arc<dyn DatabaseCatalog>) -> Self {
    Self {
      catalog: Some(catalog),
    }
  }

  #[cfg(test)]
  pub fn unavailable() -> Self {
    Self { catalog: None }
  }

  fn clear_with(catalog: &dyn DatabaseCatalog) -> ClearResult {
    let names = match catalog.names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "database enumeration failed");
        return ClearResult::failed(0, 0);
      }
    };

    let before = names.len();
    let mut failures = 0;
    for name in names.iter().filter(|n| !n.is_empty()) {
      match catalog.delete(name) {
        Ok(_) => debug!(database = %name, "database deleted"),
        Err(e) => {
          warn!(database = %name, error = %e, "failed to delete database");
          failures += 1;
        }
      }
    }

    let after = catalog.names().map(|n| n.len()).unwrap_or(failures);
    if failures > 0 {
      ClearResult::failed(before, after)
    } else {
      ClearResult::cleared(before, after)
    }
  }
}

impl PersistenceSurface for StructuredDatabaseSurface {
  fn kind(&self) -> SurfaceKind {
    SurfaceKind::StructuredDatabase
  }

  fn phase(&self) -> ClearPhase {
    ClearPhase::Deferred
  }

  fn item_count(&self) -> BoxFuture<'_, Result<usize>> {
    Box::pin(async move {
      match &self.catalog {
        Some(catalog) => Ok(catalog.names()?.len()),
        None => Ok(0),
      }
    })
  }

  fn clear(&self) -> BoxFuture<'_, ClearResult> {
    Box::pin(async move {
      let result = match &self.catalog {
        Some(catalog) => Self::clear_with(catalog.as_ref()),
        None => ClearResult::unavailable(),
      };
      report(self.kind(), &result);
      result
    })
  }
}
