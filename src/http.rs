//! Request and response values as seen by the worker.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Value of the Accept header, if any
  pub accept: Option<String>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      accept: None,
    }
  }

  /// A top-level page navigation (accepts HTML).
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      accept: Some("text/html,application/xhtml+xml,*/*;q=0.8".to_string()),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }

  pub fn accepts_html(&self) -> bool {
    self
      .accept
      .as_deref()
      .map(|a| a.contains("text/html"))
      .unwrap_or(false)
  }

  /// The same request pointed at another path of the same origin.
  pub fn for_path(&self, path: &str) -> Option<Self> {
    let url = self.url.join(path).ok()?;
    Some(Self {
      method: Method::GET,
      url,
      accept: self.accept.clone(),
    })
  }
}

/// How a response relates to the requesting origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin response, readable
  Basic,
  /// Cross-origin response allowed by CORS
  Cors,
  /// Cross-origin response that cannot be inspected
  Opaque,
  /// Synthesized by the worker
  Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseType,
  pub url: Option<String>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      headers: Vec::new(),
      body: body.into(),
      kind: ResponseType::Basic,
      url: None,
    }
  }

  /// Plain-text 503 returned when a static asset is neither cached nor reachable.
  pub fn offline() -> Self {
    Self {
      status: 503,
      status_text: "Service Unavailable".to_string(),
      headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
      body: b"Offline".to_vec(),
      kind: ResponseType::Synthetic,
      url: None,
    }
  }

  pub fn with_kind(mut self, kind: ResponseType) -> Self {
    self.kind = kind;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Only complete, same-origin, readable responses may enter a cache.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.kind == ResponseType::Basic
  }
}
