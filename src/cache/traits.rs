//! Core traits and naming rules for cache generations.

use color_eyre::Result;
use sha2::{Digest, Sha256};

use crate::http::{Request, Response};

/// Storage for named cache generations of request/response pairs.
///
/// Only the worker writes entries. The reset layer is the one other caller,
/// and it only deletes.
pub trait CacheStorage: Send + Sync {
  /// Names of every existing generation, in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Create the generation if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Delete a generation and all its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Store a response under the request in the named generation.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up a request in one generation.
  fn match_in(&self, name: &str, request: &Request) -> Result<Option<Response>>;

  /// Total entries across all generations.
  fn entry_count(&self) -> Result<usize>;
}

/// The kind of content a generation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
  /// App-shell assets populated on install
  Static,
  /// Assets stored as they are fetched
  Dynamic,
}

impl GenerationKind {
  fn prefix(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }
}

/// Name of the generation of `kind` for `version`, e.g. `static-v2`.
pub fn generation_name(kind: GenerationKind, version: &str) -> String {
  format!("{}-{}", kind.prefix(), version)
}

/// Version component of a generation name (everything after the first `-`).
pub fn generation_version(name: &str) -> Option<&str> {
  name.split_once('-').map(|(_, version)| version)
}

/// Whether a generation belongs to the current version.
///
/// Compares the whole version component, so `static-v10` is not current for `v1`.
pub fn is_current_generation(name: &str, version: &str) -> bool {
  generation_version(name) == Some(version)
}

/// Stable key for a request inside a generation.
pub fn request_key(request: &Request) -> String {
  let mut url = request.url.clone();
  url.set_fragment(None);
  let input = format!("{} {}", request.method, url);

  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[test]
  fn test_generation_names() {
    assert_eq!(generation_name(GenerationKind::Static, "v2"), "static-v2");
    assert_eq!(
      generation_name(GenerationKind::Dynamic, "v3-2026-10-18"),
      "dynamic-v3-2026-10-18"
    );
    assert_eq!(generation_version("static-v3-2026-10-18"), Some("v3-2026-10-18"));
    assert_eq!(generation_version("nodash"), None);
  }

  #[test]
  fn test_current_generation_is_exact() {
    assert!(is_current_generation("static-v2", "v2"));
    assert!(!is_current_generation("static-v1", "v2"));
    assert!(!is_current_generation("dynamic-v10", "v1"));
    assert!(!is_current_generation("v2", "v2"));
  }

  #[test]
  fn test_request_key_ignores_fragment() {
    let a = Request::get(Url::parse("http://localhost/app.js#x").unwrap());
    let b = Request::get(Url::parse("http://localhost/app.js").unwrap());
    assert_eq!(request_key(&a), request_key(&b));
    assert_eq!(request_key(&a).len(), 64);
  }
}
