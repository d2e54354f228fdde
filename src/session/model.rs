//! Persisted session and user shapes, and the rules that update them.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Which local user is active, and since when (epoch ms).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPointer {
  pub username: String,
  #[serde(default)]
  pub key: Option<String>,
  pub timestamp: i64,
}

impl SessionPointer {
  pub fn new(username: &str, key: &str, now: DateTime<Utc>) -> Self {
    Self {
      username: username.to_string(),
      key: Some(key.to_string()),
      timestamp: now.timestamp_millis(),
    }
  }

  /// Valid strictly before `max_age` has passed.
  pub fn is_fresh(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    now.timestamp_millis() - self.timestamp < max_age.num_milliseconds()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
  PopCulture,
  PersonalPain,
  SocialSickness,
}

/// Picks a category for a rant's text.
pub trait Classifier {
  fn classify(&self, text: &str) -> Category;
}

/// A category chosen up front classifies everything as itself.
impl Classifier for Category {
  fn classify(&self, _text: &str) -> Category {
    *self
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RantCategories {
  pub pop_culture: u32,
  pub personal_pain: u32,
  pub social_sickness: u32,
}

impl RantCategories {
  pub fn bump(&mut self, category: Category) {
    match category {
      Category::PopCulture => self.pop_culture += 1,
      Category::PersonalPain => self.personal_pain += 1,
      Category::SocialSickness => self.social_sickness += 1,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
  pub total_rants: u32,
  pub total_artefaks: u32,
  #[serde(default)]
  pub rant_categories: RantCategories,
  pub streak: u32,
  pub last_active: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
  pub theme: String,
  pub notifications: bool,
  pub auto_categorize: bool,
}

impl Default for UserSettings {
  fn default() -> Self {
    Self {
      theme: "dark".to_string(),
      notifications: false,
      auto_categorize: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
  pub username: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub last_login: Option<DateTime<Utc>>,
  pub last_artefak_upload: Option<DateTime<Utc>>,
  pub stats: UserStats,
  #[serde(default)]
  pub settings: UserSettings,
}

impl UserRecord {
  pub fn new(username: &str, now: DateTime<Utc>) -> Self {
    Self {
      username: username.to_string(),
      created_at: now,
      last_login: None,
      last_artefak_upload: None,
      stats: UserStats::default(),
      settings: UserSettings::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rant {
  pub id: String,
  pub text: String,
  pub category: Category,
  pub date: DateTime<Utc>,
  pub word_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artefak {
  pub id: String,
  pub title: String,
  pub date: DateTime<Utc>,
}

/// Everything a user wrote. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataBundle {
  #[serde(default)]
  pub rants: Vec<Rant>,
  #[serde(default)]
  pub artefaks: Vec<Artefak>,
}

/// Entry in the known-user index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownUser {
  pub created_at: DateTime<Utc>,
  pub last_login: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginEntry {
  pub username: String,
  pub timestamp: DateTime<Utc>,
  pub is_returning: bool,
}

/// Count a day of activity at `now`, in `now`'s timezone.
///
/// Days are compared at midnight, so activity at 23:59 and 00:01 the next day
/// is consecutive. A clock that went backwards counts as the same day.
pub fn update_streak<Tz: TimeZone>(stats: &mut UserStats, now: DateTime<Tz>) {
  let today = now.date_naive();

  stats.streak = match stats.last_active {
    None => 1,
    Some(last) => {
      let last_day = last.with_timezone(&now.timezone()).date_naive();
      match (today - last_day).num_days().max(0) {
        0 if stats.streak == 0 => 1,
        0 => stats.streak,
        1 => stats.streak + 1,
        _ => 1,
      }
    }
  };

  stats.last_active = Some(now.with_timezone(&Utc));
}

/// Time left before another artefak may be uploaded; zero when allowed.
pub fn cooldown_remaining(
  last_upload: Option<DateTime<Utc>>,
  now: DateTime<Utc>,
  cooldown: chrono::Duration,
) -> chrono::Duration {
  match last_upload {
    Some(last) => (last + cooldown - now).max(chrono::Duration::zero()),
    None => chrono::Duration::zero(),
  }
}
