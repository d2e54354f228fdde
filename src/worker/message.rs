//! Messages between pages and the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Page → worker control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  SkipWaiting,
  ClearCache,
  GetVersion,
}

impl ControlMessage {
  /// Parse the wire form: a bare string (`"CLEAR_CACHE"`) or an object with a
  /// `type` field (`{"type": "CLEAR_CACHE"}`).
  pub fn from_value(value: &Value) -> Option<Self> {
    let tag = match value {
      Value::String(s) => s.as_str(),
      Value::Object(map) => map.get("type")?.as_str()?,
      _ => return None,
    };

    match tag {
      "SKIP_WAITING" => Some(Self::SkipWaiting),
      "CLEAR_CACHE" => Some(Self::ClearCache),
      "GET_VERSION" => Some(Self::GetVersion),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::SkipWaiting => "SKIP_WAITING",
      Self::ClearCache => "CLEAR_CACHE",
      Self::GetVersion => "GET_VERSION",
    }
  }
}

/// Worker → page replies sent on a message's reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerReply {
  Cleared { success: bool },
  Version { version: String },
}

/// Worker → all controlled pages. Advisory; pages may ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  ClearStorage { timestamp: i64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
  #[error("worker did not reply within {0:?}")]
  Timeout(std::time::Duration),
  #[error("worker is gone")]
  Closed,
  #[error("worker dropped the reply channel")]
  NoReply,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_both_wire_forms() {
    assert_eq!(
      ControlMessage::from_value(&json!("CLEAR_CACHE")),
      Some(ControlMessage::ClearCache)
    );
    assert_eq!(
      ControlMessage::from_value(&json!({"type": "CLEAR_CACHE"})),
      Some(ControlMessage::ClearCache)
    );
    assert_eq!(
      ControlMessage::from_value(&json!("SKIP_WAITING")),
      Some(ControlMessage::SkipWaiting)
    );
    assert_eq!(ControlMessage::from_value(&json!("CLEAR_NOPE_CACHE")), None);
    assert_eq!(ControlMessage::from_value(&json!(42)), None);
  }

  #[test]
  fn test_reply_shapes() {
    assert_eq!(
      serde_json::to_value(WorkerReply::Cleared { success: true }).unwrap(),
      json!({"success": true})
    );
    assert_eq!(
      serde_json::to_value(WorkerReply::Version { version: "v2".into() }).unwrap(),
      json!({"version": "v2"})
    );
    assert_eq!(
      serde_json::to_value(ClientMessage::ClearStorage { timestamp: 5 }).unwrap(),
      json!({"type": "CLEAR_STORAGE", "timestamp": 5})
    );
  }
}
