//! The visible address of the page the reset layer runs in.

use std::sync::Mutex;
use tracing::info;
use url::Url;

/// What the reset layer needs from the page it runs in.
pub trait PageContext: Send + Sync {
  fn location(&self) -> Url;

  /// Replace the current history entry without navigating.
  fn replace_history(&self, url: &Url);

  /// Navigate away, replacing the current history entry.
  fn navigate(&self, url: &Url);
}

/// A page that records where it was sent instead of loading anything.
#[derive(Debug)]
pub struct SimulatedPage {
  state: Mutex<PageState>,
}

#[derive(Debug)]
struct PageState {
  location: Url,
  navigations: Vec<Url>,
}

impl SimulatedPage {
  pub fn new(location: Url) -> Self {
    Self {
      state: Mutex::new(PageState {
        location,
        navigations: Vec::new(),
      }),
    }
  }

  /// Every navigation requested so far, oldest first.
  #[cfg(test)]
  pub fn navigations(&self) -> Vec<Url> {
    self
      .state
      .lock()
      .map(|s| s.navigations.clone())
      .unwrap_or_default()
  }
}

impl PageContext for SimulatedPage {
  fn location(&self) -> Url {
    match self.state.lock() {
      Ok(state) => state.location.clone(),
      Err(poisoned) => poisoned.into_inner().location.clone(),
    }
  }

  fn replace_history(&self, url: &Url) {
    if let Ok(mut state) = self.state.lock() {
      state.location = url.clone();
    }
  }

  fn navigate(&self, url: &Url) {
    info!(url = %url, "navigating");
    if let Ok(mut state) = self.state.lock() {
      state.location = url.clone();
      state.navigations.push(url.clone());
    }
  }
}
