//! Runs the cache engine as its own long-lived task.
//!
//! The engine shares no memory with its callers: requests arrive over a
//! channel and each carries a oneshot for the answer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use url::Url;

use super::layer::CacheEngine;
use super::storage::ResponseStore;
use crate::error::ApiError;
use crate::transport::{HttpRequest, HttpResponse, Transport};

struct EngineRequest {
  request: HttpRequest,
  reply: oneshot::Sender<Result<HttpResponse, ApiError>>,
}

/// Clone + Send + Sync handle to a running cache engine.
#[derive(Clone)]
pub struct EngineHandle {
  tx: mpsc::UnboundedSender<EngineRequest>,
}

impl EngineHandle {
  /// Move the engine onto its own task. It stops once every handle is dropped.
  pub fn spawn<S: ResponseStore + 'static>(engine: CacheEngine<S>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(Self::run_loop(Arc::new(engine), rx));
    Self { tx }
  }

  async fn run_loop<S: ResponseStore + 'static>(
    engine: Arc<CacheEngine<S>>,
    mut rx: mpsc::UnboundedReceiver<EngineRequest>,
  ) {
    while let Some(EngineRequest { request, reply }) = rx.recv().await {
      let engine = Arc::clone(&engine);
      // Requests are served concurrently, like independent fetch events
      tokio::spawn(async move {
        let result = engine.handle(request).await;
        // Ignore send errors - the caller may have given up
        let _ = reply.send(result);
      });
    }
    debug!("cache engine stopped");
  }

  pub async fn fetch(&self, url: Url) -> Result<HttpResponse, ApiError> {
    self.send(HttpRequest::get(url)).await
  }
}

#[async_trait]
impl Transport for EngineHandle {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(EngineRequest { request, reply })
      .map_err(|_| ApiError::EngineStopped)?;
    rx.await.map_err(|_| ApiError::EngineStopped)?
  }
}
