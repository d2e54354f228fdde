//! Versioned response caches.
//!
//! This module provides the storage the worker keeps its cache generations in:
//! - Generations are named `<kind>-<version>` and compared by version component
//! - Entries are keyed by a hash of method and URL
//! - A no-op backend is available when caching is disabled

mod storage;
mod traits;

pub use storage::{NoopStorage, SqliteStorage};
pub use traits::{
  generation_name, is_current_generation, CacheStorage, GenerationKind,
};
