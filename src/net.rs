//! Network access for the worker.

use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::http::{Request, Response, ResponseType};

#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("request failed: {0}")]
  Failed(String),
}

/// Anything that can turn a request into a response.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>>;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| NetworkError::Failed(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client, origin })
  }

  fn response_type(&self, url: &Url) -> ResponseType {
    if url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    }
  }
}

impl Network for HttpNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>> {
    Box::pin(async move {
      debug!(method = %request.method, url = %request.url, "network fetch");

      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone());
      if let Some(accept) = &request.accept {
        builder = builder.header(reqwest::header::ACCEPT, accept);
      }

      let resp = builder.send().await.map_err(|e| {
        if e.is_connect() || e.is_timeout() {
          NetworkError::Unreachable(e.to_string())
        } else {
          NetworkError::Failed(e.to_string())
        }
      })?;

      let status = resp.status();
      let final_url = resp.url().clone();
      let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();
      let body = resp
        .bytes()
        .await
        .map_err(|e| NetworkError::Failed(e.to_string()))?;

      let mut response =
        Response::new(status.as_u16(), body.to_vec()).with_kind(self.response_type(&final_url));
      response.status_text = status.canonical_reason().unwrap_or_default().to_string();
      response.headers = headers;
      response.url = Some(final_url.to_string());
      Ok(response)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_same_origin_is_basic() {
    let net = HttpNetwork::new(
      Url::parse("http://localhost:8080/").unwrap(),
      Duration::from_secs(5),
    )
    .unwrap();
    let same = Url::parse("http://localhost:8080/app.css").unwrap();
    let other = Url::parse("https://cdn.example/app.css").unwrap();
    assert_eq!(net.response_type(&same), ResponseType::Basic);
    assert_eq!(net.response_type(&other), ResponseType::Cors);
  }
}
