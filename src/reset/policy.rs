//! Whether a page load should reset, and the freshness marker on addresses.
//!
//! The marker is `fresh=<epoch-ms>&rs=<reset-id>`. Only its presence matters;
//! the values are never interpreted.

use chrono::{DateTime, Utc};
use url::Url;

use super::record::ResetRecord;

const FRESH_PARAM: &str = "fresh";
const RESET_ID_PARAM: &str = "rs";

/// Why a reset runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTrigger {
  /// Login, registration, or app root
  AuthEntryPoint,
  /// The address carries the freshness marker
  FreshnessMarker,
  /// The previous reset never recorded completion
  PartialReset,
  /// The force flag is set
  Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetDecision {
  /// Nothing about this page calls for a reset
  NotRequired,
  /// A reset is called for but the last one was too recent
  Suppressed {
    trigger: ResetTrigger,
    last_reset_id: String,
  },
  Run(ResetTrigger),
}

/// Login and registration pages plus the app root.
pub fn is_auth_entry_point(url: &Url) -> bool {
  let path = url.path().to_lowercase();
  path.contains("login") || path.contains("register") || path == "/" || path == "/index.html"
}

pub fn has_freshness_marker(url: &Url) -> bool {
  url.query_pairs().any(|(k, _)| k == FRESH_PARAM)
}

/// `url` with any old marker dropped and a new one appended.
pub fn with_freshness_marker(url: &Url, now: DateTime<Utc>, reset_id: &str) -> Url {
  let mut fresh = url.clone();
  let kept: Vec<(String, String)> = url
    .query_pairs()
    .filter(|(k, _)| k != FRESH_PARAM && k != RESET_ID_PARAM)
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect();

  fresh.set_query(None);
  {
    let mut pairs = fresh.query_pairs_mut();
    for (k, v) in &kept {
      pairs.append_pair(k, v);
    }
    pairs.append_pair(FRESH_PARAM, &now.timestamp_millis().to_string());
    pairs.append_pair(RESET_ID_PARAM, reset_id);
  }
  fresh
}

/// `url` reduced to its path: no query, no fragment.
pub fn without_transient_state(url: &Url) -> Url {
  let mut stripped = url.clone();
  stripped.set_query(None);
  stripped.set_fragment(None);
  stripped
}

fn trigger_for(url: &Url, force: bool, last: Option<&ResetRecord>) -> Option<ResetTrigger> {
  if is_auth_entry_point(url) {
    Some(ResetTrigger::AuthEntryPoint)
  } else if has_freshness_marker(url) {
    Some(ResetTrigger::FreshnessMarker)
  } else if last.map(ResetRecord::is_partial).unwrap_or(false) {
    Some(ResetTrigger::PartialReset)
  } else if force {
    Some(ResetTrigger::Forced)
  } else {
    None
  }
}

/// Decide for a page at `url`. The cooldown applies to every trigger; it is
/// what stops a reset that redirects to a resetting page from looping.
pub fn decide(
  url: &Url,
  force: bool,
  last: Option<&ResetRecord>,
  now: DateTime<Utc>,
  cooldown: chrono::Duration,
) -> ResetDecision {
  let Some(trigger) = trigger_for(url, force, last) else {
    return ResetDecision::NotRequired;
  };

  match last {
    Some(record) if record.within_cooldown(now, cooldown) => ResetDecision::Suppressed {
      trigger,
      last_reset_id: record.reset_id.clone(),
    },
    _ => ResetDecision::Run(trigger),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_auth_entry_points() {
    assert!(is_auth_entry_point(&url("http://localhost/")));
    assert!(is_auth_entry_point(&url("http://localhost/index.html")));
    assert!(is_auth_entry_point(&url("http://localhost/Login.html")));
    assert!(is_auth_entry_point(&url("http://localhost/register")));
    assert!(!is_auth_entry_point(&url("http://localhost/home.html")));
  }

  #[test]
  fn test_marker_presence_only() {
    assert!(has_freshness_marker(&url("http://localhost/home.html?fresh=")));
    assert!(has_freshness_marker(&url("http://localhost/?a=1&fresh=abc")));
    assert!(!has_freshness_marker(&url("http://localhost/?refresh=1")));
  }

  #[test]
  fn test_with_freshness_marker_replaces_old() {
    let now = Utc::now();
    let base = url("http://localhost/login.html?next=home&fresh=1&rs=old#top");
    let fresh = with_freshness_marker(&base, now, "rs-new");

    let pairs: Vec<(String, String)> = fresh
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    assert_eq!(
      pairs,
      vec![
        ("next".to_string(), "home".to_string()),
        ("fresh".to_string(), now.timestamp_millis().to_string()),
        ("rs".to_string(), "rs-new".to_string()),
      ]
    );
  }

  #[test]
  fn test_without_transient_state() {
    let stripped = without_transient_state(&url("http://localhost/login.html?fresh=1&rs=x#a"));
    assert_eq!(stripped.as_str(), "http://localhost/login.html");
  }

  #[test]
  fn test_decide() {
    let now = Utc::now();
    let cooldown = chrono::Duration::seconds(1);
    let home = url("http://localhost/home.html");
    let login = url("http://localhost/login.html");

    assert_eq!(decide(&home, false, None, now, cooldown), ResetDecision::NotRequired);
    assert_eq!(
      decide(&home, true, None, now, cooldown),
      ResetDecision::Run(ResetTrigger::Forced)
    );
    assert_eq!(
      decide(&login, false, None, now, cooldown),
      ResetDecision::Run(ResetTrigger::AuthEntryPoint)
    );

    let mut recent = ResetRecord::begin("rs-1", now - chrono::Duration::milliseconds(200));
    recent.completed_at = Some(now);
    assert!(matches!(
      decide(&login, false, Some(&recent), now, cooldown),
      ResetDecision::Suppressed { trigger: ResetTrigger::AuthEntryPoint, .. }
    ));
    assert_eq!(
      decide(&home, false, Some(&recent), now, cooldown),
      ResetDecision::NotRequired
    );

    let interrupted = ResetRecord::begin("rs-0", now - chrono::Duration::minutes(5));
    assert_eq!(
      decide(&home, false, Some(&interrupted), now, cooldown),
      ResetDecision::Run(ResetTrigger::PartialReset)
    );
  }
}
