use std::sync::{Arc, RwLock};

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::api::api_types::ApiEnvelope;
use crate::api::types::{DateRange, EntityKind, Operation};
use crate::cache::CacheSource;
use crate::error::ApiError;
use crate::store::Record;
use crate::transport::{HttpRequest, Method, Transport};

/// Header carrying the caller-supplied anti-forgery token on writes
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Records returned by a list call, with their provenance
#[derive(Debug, Clone)]
pub struct Listing<T> {
  pub records: Vec<T>,
  pub source: CacheSource,
}

impl<T> Listing<T> {
  /// The engine had nothing to offer: no data, but not an error either
  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Calendar/task API client
#[derive(Clone)]
pub struct ApiClient {
  transport: Arc<dyn Transport>,
  base: Url,
  csrf_token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
  pub fn new(transport: Arc<dyn Transport>, base_url: &str) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with '/'
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base =
      Url::parse(&normalized).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    Ok(Self {
      transport,
      base,
      csrf_token: Arc::new(RwLock::new(None)),
    })
  }

  /// Set the token attached to every write, shared by all clones of this client.
  pub fn set_csrf_token(&self, token: Option<String>) {
    if let Ok(mut slot) = self.csrf_token.write() {
      *slot = token;
    }
  }

  /// List the records of `T`'s kind dated inside `range`
  pub async fn list<T: Record>(&self, range: DateRange) -> Result<Listing<T>, ApiError> {
    let mut url = self.collection_url(T::KIND)?;
    url
      .query_pairs_mut()
      .append_pair("start", &range.start.format("%Y-%m-%d").to_string())
      .append_pair("end", &range.end.format("%Y-%m-%d").to_string());

    let response = self.transport.send(HttpRequest::get(url)).await?;
    let source = response.source;
    let mut envelope = ApiEnvelope::from_response(&response)?;

    if envelope.offline || source == CacheSource::Offline {
      return Ok(Listing {
        records: Vec::new(),
        source: CacheSource::Offline,
      });
    }

    let records = envelope.take_list(T::KIND.collection_field())?;
    Ok(Listing { records, source })
  }

  /// Send one mutation. Ok means the server acknowledged it.
  pub async fn submit(
    &self,
    kind: EntityKind,
    operation: Operation,
    payload: &Value,
  ) -> Result<(), ApiError> {
    let (method, url) = self.endpoint(kind, operation)?;

    let body = match operation {
      Operation::CompleteStatus => with_completed_status(payload),
      _ => payload.clone(),
    };

    let mut request = HttpRequest::new(method, url).with_json(&body);
    if let Some(token) = self.csrf_token() {
      request = request.with_header(CSRF_HEADER, &token);
    }

    debug!(kind = %kind, operation = %operation, "submitting mutation");
    let response = self.transport.send(request).await?;
    ApiEnvelope::from_response(&response)?;
    Ok(())
  }

  fn csrf_token(&self) -> Option<String> {
    self.csrf_token.read().ok().and_then(|t| t.clone())
  }

  fn collection_url(&self, kind: EntityKind) -> Result<Url, ApiError> {
    let (path, action) = match kind {
      EntityKind::Event => ("calendar-events", None),
      EntityKind::Task => ("task-api", Some("tasks")),
    };
    let mut url = self
      .base
      .join(path)
      .map_err(|e| ApiError::Decode(format!("bad endpoint URL: {}", e)))?;
    if let Some(action) = action {
      url.query_pairs_mut().append_pair("action", action);
    }
    Ok(url)
  }

  /// Which endpoint and method carry `operation` for `kind`
  fn endpoint(&self, kind: EntityKind, operation: Operation) -> Result<(Method, Url), ApiError> {
    if !operation.applies_to(kind) {
      return Err(ApiError::Unsupported { kind, operation });
    }

    match operation {
      Operation::Create => Ok((Method::POST, self.collection_url(kind)?)),
      Operation::Update | Operation::CompleteStatus => Ok((Method::PUT, self.collection_url(kind)?)),
      Operation::ProgressUpdate => {
        let mut url = self
          .base
          .join("task-api")
          .map_err(|e| ApiError::Decode(format!("bad endpoint URL: {}", e)))?;
        url
          .query_pairs_mut()
          .append_pair("action", "update_progress");
        Ok((Method::POST, url))
      }
    }
  }
}

fn with_completed_status(payload: &Value) -> Value {
  let mut body = payload.clone();
  if let Value::Object(map) = &mut body {
    map.insert("status".to_string(), Value::String("completed".to_string()));
  }
  body
}
