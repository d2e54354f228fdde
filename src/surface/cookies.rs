//! The cookie jar, as far as page script can reach it.
//!
//! Only names visible in the readable cookie string are expired, and only at
//! the page's host and the root path. Cookies scoped to another path or marked
//! HTTP-only stay behind; that is a limitation of the surface, not a failure.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{report, ClearPhase, ClearResult, PersistenceSurface, SurfaceKind};
use crate::db::Database;
use crate::page::PageContext;

pub struct CookieSurface {
  db: Arc<Database>,
  page: Arc<dyn PageContext>,
}

impl CookieSurface {
  pub fn new(db: Arc<Database>, page: Arc<dyn PageContext>) -> Self {
    Self { db, page }
  }

  /// Host and path of the page the cookie string is read from.
  fn scope(&self) -> (String, String) {
    let location = self.page.location();
    (
      location.host_str().unwrap_or_default().to_string(),
      location.path().to_string(),
    )
  }

  fn visible_names(&self, host: &str, path: &str) -> Result<Vec<String>> {
    let cookie_string = self.db.readable_cookie_string(host, path)?;
    Ok(
      cookie_string
        .split(';')
        .filter_map(|pair| pair.split('=').next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect(),
    )
  }

  fn clear_now(&self) -> ClearResult {
    let (host, path) = self.scope();

    let names = match self.visible_names(&host, &path) {
      Ok(names) => names,
      Err(e) => {
        warn!(surface = %self.kind(), error = %e, "could not read cookie string");
        let result = ClearResult::failed(0, 0);
        report(self.kind(), &result);
        return result;
      }
    };

    let before = names.len();
    let mut failed = false;
    for name in &names {
      match self.db.expire_cookie(name, &host, "/") {
        Ok(true) => debug!(cookie = %name, "cookie expired"),
        Ok(false) => debug!(cookie = %name, "cookie out of reach (different path)"),
        Err(e) => {
          warn!(cookie = %name, error = %e, "failed to expire cookie");
          failed = true;
        }
      }
    }

    let after = self
      .visible_names(&host, &path)
      .map(|n| n.len())
      .unwrap_or(before);
    let result = if failed {
      ClearResult::failed(before, after)
    } else {
      ClearResult::cleared(before, after)
    };

    report(self.kind(), &result);
    result
  }
}

impl PersistenceSurface for CookieSurface {
  fn kind(&self) -> SurfaceKind {
    SurfaceKind::Cookies
  }

  fn phase(&self) -> ClearPhase {
    ClearPhase::Immediate
  }

  fn item_count(&self) -> BoxFuture<'_, Result<usize>> {
    Box::pin(async move {
      let (host, path) = self.scope();
      Ok(self.visible_names(&host, &path)?.len())
    })
  }

  fn clear(&self) -> BoxFuture<'_, ClearResult> {
    Box::pin(async move { self.clear_now() })
  }
}
