//! Raw request/response types and the network seam.
//!
//! Everything that talks HTTP goes through a [`Transport`]. The plain
//! [`HttpTransport`] hits the network; the cache engine handle wraps it and
//! implements the same trait, so callers never know whether they were
//! intercepted.

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
pub use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;

use crate::cache::CacheSource;
use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl HttpRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_json(mut self, body: &serde_json::Value) -> Self {
    self.body = Some(body.to_string().into_bytes());
    self
      .headers
      .push((CONTENT_TYPE.as_str().to_string(), "application/json".to_string()));
    self
  }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Vec<u8>,
  pub content_type: Option<String>,
  /// Whether this came off the wire or out of the cache
  pub source: CacheSource,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
    serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
  }
}

/// Something that can carry a request to the server.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Send a request. Only transport-level problems are errors; any HTTP
  /// status, including 4xx/5xx, is a response.
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

/// Transport backed by a reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    let mut builder = self.client.request(request.method, request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| ApiError::Network(e.to_string()))?;

    Ok(HttpResponse {
      status,
      body: body.to_vec(),
      content_type,
      source: CacheSource::Network,
    })
  }
}
