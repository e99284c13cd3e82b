//! Cache engine that applies a caching strategy to every intercepted request.

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::Result;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::policy::{Buckets, Classifier, RequestClass};
use super::storage::{request_key, CachedResponse, ResponseStore};
use super::traits::CacheSource;
use crate::error::ApiError;
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};

/// Body returned for a calendar/task read when neither network nor cache can answer.
pub const OFFLINE_BODY: &str = r#"{"success":true,"events":[],"tasks":[],"offline":true}"#;

/// Cache engine sitting between callers and the network.
///
/// Static assets are served cache-first. Calendar/task reads and everything
/// else are network-first with the last good response as fallback. Only GET
/// requests are ever cached; writes go straight to the network so their
/// failures stay visible to the caller.
pub struct CacheEngine<S: ResponseStore> {
  storage: Arc<S>,
  network: Arc<dyn Transport>,
  classifier: Classifier,
  buckets: Buckets,
  /// One lock per static key with a fetch in progress
  inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: ResponseStore> CacheEngine<S> {
  /// Create an engine for cache `version`, deleting buckets left by any other version.
  pub fn start(
    storage: S,
    network: Arc<dyn Transport>,
    classifier: Classifier,
    version: u32,
  ) -> Result<Self> {
    let buckets = Buckets::for_version(version);
    let removed = storage.retain_buckets(&buckets.names())?;
    if removed > 0 {
      info!(version, removed, "evicted cache entries from previous engine versions");
    }

    Ok(Self {
      storage: Arc::new(storage),
      network,
      classifier,
      buckets,
      inflight: Mutex::new(HashMap::new()),
    })
  }

  /// Serve one request according to its class.
  pub async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    if request.method != Method::GET {
      return self.network.send(request).await;
    }

    match self.classifier.classify(&request.url) {
      RequestClass::Static => self.cache_first(request).await,
      RequestClass::DomainApi => self.network_first(request, true).await,
      RequestClass::Other => self.network_first(request, false).await,
    }
  }

  /// Convenience GET, used for static asset loads.
  pub async fn fetch(&self, url: Url) -> Result<HttpResponse, ApiError> {
    self.handle(HttpRequest::get(url)).await
  }

  async fn cache_first(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    let key = request_key(&request.method, request.url.as_str());
    let bucket = &self.buckets.static_bucket;

    if let Some(hit) = self.lookup(bucket, &key) {
      debug!(url = %request.url, "static cache hit");
      return Ok(into_response(hit, CacheSource::CacheFresh));
    }

    let lock = {
      let mut map = self.inflight.lock().await;
      Arc::clone(
        map
          .entry(key.clone())
          .or_insert_with(|| Arc::new(Mutex::new(()))),
      )
    };

    let result = {
      let _guard = lock.lock().await;
      // Whoever held the lock before us may have stored it already
      match self.lookup(bucket, &key) {
        Some(hit) => {
          debug!(url = %request.url, "static cache hit after concurrent fetch");
          Ok(into_response(hit, CacheSource::CacheFresh))
        }
        None => {
          let url = request.url.to_string();
          let response = self.network.send(request).await;
          if let Ok(response) = &response {
            if response.is_success() {
              self.remember(bucket, &key, &url, response);
            }
          }
          response
        }
      }
    };

    let mut map = self.inflight.lock().await;
    // Clones are only taken under the map lock: two means nobody else is waiting
    if Arc::strong_count(&lock) == 2 {
      map.remove(&key);
    }
    result
  }

  async fn network_first(
    &self,
    request: HttpRequest,
    synthesize_empty: bool,
  ) -> Result<HttpResponse, ApiError> {
    let key = request_key(&request.method, request.url.as_str());
    let bucket = &self.buckets.dynamic_bucket;
    let url = request.url.to_string();

    match self.network.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(bucket, &key, &url, &response);
        }
        Ok(response)
      }
      Err(err) if err.is_transient() => {
        if let Some(hit) = self.lookup(bucket, &key) {
          debug!(url = %url, error = %err, "network failed, serving cached response");
          return Ok(into_response(hit, CacheSource::CacheStale));
        }
        if synthesize_empty {
          debug!(url = %url, error = %err, "network failed with no cached copy, answering offline");
          return Ok(HttpResponse {
            status: 200,
            body: OFFLINE_BODY.as_bytes().to_vec(),
            content_type: Some("application/json".to_string()),
            source: CacheSource::Offline,
          });
        }
        Err(err)
      }
      Err(err) => Err(err),
    }
  }

  /// Cache reads are best effort; a broken cache must not fail the request.
  fn lookup(&self, bucket: &str, key: &str) -> Option<CachedResponse> {
    match self.storage.get(bucket, key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(bucket, error = %e, "cache lookup failed");
        None
      }
    }
  }

  fn remember(&self, bucket: &str, key: &str, url: &str, response: &HttpResponse) {
    if let Err(e) = self.storage.put(
      bucket,
      key,
      url,
      response.status,
      response.content_type.as_deref(),
      &response.body,
    ) {
      warn!(bucket, url, error = %e, "failed to store response in cache");
    }
  }
}

fn into_response(hit: CachedResponse, source: CacheSource) -> HttpResponse {
  HttpResponse {
    status: hit.status,
    body: hit.body,
    content_type: hit.content_type,
    source,
  }
}
