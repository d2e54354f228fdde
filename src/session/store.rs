//! Session state kept in the local key-value area.

use chrono::{DateTime, Local, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::model::{
  cooldown_remaining, update_streak, Artefak, Classifier, KnownUser, LoginEntry, Rant,
  SessionPointer, UserDataBundle, UserRecord,
};
use super::{SessionContext, SessionError};
use crate::config::SessionConfig;
use crate::db::{Database, StorageArea};

const CURRENT_USER: &str = "current_user";
const KNOWN_USERS: &str = "nope_users";
const LOGIN_HISTORY: &str = "nope_login_history";

pub fn user_key(username: &str) -> String {
  format!("nope_user_{}", username)
}

pub fn data_key(username: &str) -> String {
  format!("nope_data_{}", username)
}

/// 3 to 20 characters, ASCII letters, digits and underscore.
pub fn validate_username(username: &str) -> Result<(), SessionError> {
  let len = username.chars().count();
  if len < 3 {
    return Err(SessionError::InvalidUsername("at least 3 characters".to_string()));
  }
  if len > 20 {
    return Err(SessionError::InvalidUsername("at most 20 characters".to_string()));
  }
  if !username
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || c == '_')
  {
    return Err(SessionError::InvalidUsername(
      "only letters, digits and underscore".to_string(),
    ));
  }
  Ok(())
}

pub struct SessionStore {
  db: Arc<Database>,
  config: SessionConfig,
}

impl SessionStore {
  pub fn new(db: Arc<Database>, config: SessionConfig) -> Self {
    Self { db, config }
  }

  /// A stored value that fails to parse is treated as absent.
  fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let Some(raw) = self.db.kv_get(StorageArea::Local, key)? else {
      return Ok(None);
    };
    match serde_json::from_str(&raw) {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        warn!(key = %key, error = %e, "malformed stored value, ignoring");
        Ok(None)
      }
    }
  }

  fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let raw =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    self.db.kv_set(StorageArea::Local, key, &raw)
  }

  fn discard_pointer(&self, reason: &str) -> Result<()> {
    info!(reason, "discarding session pointer");
    self.db.kv_remove(StorageArea::Local, CURRENT_USER)
  }

  /// The active session, if the pointer is fresh and its user record exists.
  /// Anything less discards the pointer.
  pub fn current_session(&self, now: DateTime<Utc>) -> Result<Option<SessionContext>> {
    let pointer = match self.read::<SessionPointer>(CURRENT_USER)? {
      Some(pointer) if !pointer.username.is_empty() => pointer,
      Some(_) => {
        self.discard_pointer("pointer has no username")?;
        return Ok(None);
      }
      None => {
        if self.db.kv_get(StorageArea::Local, CURRENT_USER)?.is_some() {
          self.discard_pointer("pointer is malformed")?;
        }
        return Ok(None);
      }
    };

    if !pointer.is_fresh(now, self.config.max_age()) {
      self.discard_pointer("session expired")?;
      return Ok(None);
    }

    let key = pointer
      .key
      .clone()
      .unwrap_or_else(|| user_key(&pointer.username));
    let Some(record) = self.read::<UserRecord>(&key)? else {
      self.discard_pointer("user record missing")?;
      return Ok(None);
    };

    Ok(Some(SessionContext {
      username: pointer.username,
      user_key: key,
      record,
    }))
  }

  pub fn is_returning(&self, username: &str) -> Result<bool> {
    let known: BTreeMap<String, KnownUser> = self.read(KNOWN_USERS)?.unwrap_or_default();
    Ok(known.contains_key(username))
  }

  /// Log in, registering the user on first sight.
  pub fn establish(&self, username: &str, now: DateTime<Utc>) -> Result<SessionContext> {
    validate_username(username)?;

    let mut known: BTreeMap<String, KnownUser> = self.read(KNOWN_USERS)?.unwrap_or_default();
    let is_returning = known.contains_key(username);
    let created_at = known.get(username).map(|u| u.created_at).unwrap_or(now);
    known.insert(
      username.to_string(),
      KnownUser {
        created_at,
        last_login: now,
      },
    );
    self.write(KNOWN_USERS, &known)?;

    let key = user_key(username);
    let mut record = match self.read::<UserRecord>(&key)? {
      Some(record) if is_returning => record,
      Some(_) | None => UserRecord::new(username, now),
    };
    record.last_login = Some(now);
    update_streak(&mut record.stats, now.with_timezone(&Local));
    self.write(&key, &record)?;

    self.write(CURRENT_USER, &SessionPointer::new(username, &key, now))?;

    let mut history: Vec<LoginEntry> = self.read(LOGIN_HISTORY)?.unwrap_or_default();
    history.push(LoginEntry {
      username: username.to_string(),
      timestamp: now,
      is_returning,
    });
    self.write(LOGIN_HISTORY, &history)?;

    info!(username = %username, is_returning, "session established");
    Ok(SessionContext {
      username: username.to_string(),
      user_key: key,
      record,
    })
  }

  /// Drop the pointer. The user's record and data stay.
  pub fn logout(&self) -> Result<bool> {
    let had_session = self.db.kv_get(StorageArea::Local, CURRENT_USER)?.is_some();
    self.db.kv_remove(StorageArea::Local, CURRENT_USER)?;
    debug!(had_session, "logged out");
    Ok(had_session)
  }

  /// Count today's activity toward the streak and persist it.
  pub fn record_activity(&self, session: &mut SessionContext, now: DateTime<Utc>) -> Result<()> {
    update_streak(&mut session.record.stats, now.with_timezone(&Local));
    self.write(&session.user_key, &session.record)
  }

  pub fn load_data(&self, username: &str) -> Result<UserDataBundle> {
    Ok(self.read(&data_key(username))?.unwrap_or_default())
  }

  pub fn append_rant(
    &self,
    session: &mut SessionContext,
    text: &str,
    classifier: &dyn Classifier,
    now: DateTime<Utc>,
  ) -> Result<Rant> {
    let rant = Rant {
      id: uuid::Uuid::new_v4().to_string(),
      text: text.to_string(),
      category: classifier.classify(text),
      date: now,
      word_count: text.split_whitespace().count(),
    };

    let mut data = self.load_data(&session.username)?;
    data.rants.push(rant.clone());
    self.write(&data_key(&session.username), &data)?;

    session.record.stats.total_rants += 1;
    session.record.stats.rant_categories.bump(rant.category);
    self.write(&session.user_key, &session.record)?;

    debug!(username = %session.username, category = ?rant.category, "rant saved");
    Ok(rant)
  }

  /// Rejected while the upload cooldown is still running.
  pub fn append_artefak(
    &self,
    session: &mut SessionContext,
    title: &str,
    now: DateTime<Utc>,
  ) -> Result<Artefak> {
    let cooldown = chrono::Duration::days(self.config.upload_cooldown_days);
    let remaining = cooldown_remaining(session.record.last_artefak_upload, now, cooldown);
    if remaining > chrono::Duration::zero() {
      // Any partial day, however short, counts as a whole one
      let secs = remaining.num_seconds() + i64::from(remaining.subsec_nanos() > 0);
      let days = (secs + 86_399) / 86_400;
      return Err(SessionError::UploadCooldown { days }.into());
    }

    let artefak = Artefak {
      id: uuid::Uuid::new_v4().to_string(),
      title: title.to_string(),
      date: now,
    };

    let mut data = self.load_data(&session.username)?;
    data.artefaks.push(artefak.clone());
    self.write(&data_key(&session.username), &data)?;

    session.record.stats.total_artefaks += 1;
    session.record.last_artefak_upload = Some(now);
    self.write(&session.user_key, &session.record)?;

    info!(username = %session.username, title = %title, "artefak saved");
    Ok(artefak)
  }
}
