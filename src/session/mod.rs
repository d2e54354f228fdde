//! Local users, their session pointer, and the data they write.
//!
//! There is no ambient "current user": callers get a [`SessionContext`] from
//! the store and pass it back into every operation that touches user data.

pub mod model;
mod store;

pub use store::SessionStore;

use thiserror::Error;

use model::UserRecord;

/// An authenticated session: whose it is and their record as last loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
  pub username: String,
  pub user_key: String,
  pub record: UserRecord,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
  #[error("invalid username: {0}")]
  InvalidUsername(String),
  #[error("artefak upload available again in {days} day(s)")]
  UploadCooldown { days: i64 },
}
