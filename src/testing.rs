//! Test doubles shared by the unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use url::Position;

use crate::cache::CacheSource;
use crate::error::ApiError;
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};

#[derive(Debug, Clone)]
pub struct RecordedCall {
  pub method: Method,
  /// Path and query, e.g. `/api/task-api?action=tasks`
  pub target: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
}

#[derive(Clone)]
enum Outcome {
  Respond(u16, String),
  NetworkError,
}

struct Rule {
  target: String,
  body_contains: Option<String>,
  outcome: Outcome,
}

/// Transport answering from a list of rules, recording every call.
///
/// Rules match on a substring of path+query (and optionally of the body);
/// later rules win over earlier ones.
pub struct ScriptedTransport {
  rules: Mutex<Vec<Rule>>,
  calls: Mutex<Vec<RecordedCall>>,
  offline: Mutex<bool>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self {
      rules: Mutex::new(Vec::new()),
      calls: Mutex::new(Vec::new()),
      offline: Mutex::new(false),
    }
  }

  pub fn respond(&self, target: &str, status: u16, body: &str) {
    self.push(target, None, Outcome::Respond(status, body.to_string()));
  }

  pub fn respond_ok(&self, target: &str, body: &str) {
    self.respond(target, 200, body);
  }

  /// Answer with `status` when the request body contains `needle`.
  pub fn respond_when_body_contains(&self, target: &str, needle: &str, status: u16, body: &str) {
    self.push(
      target,
      Some(needle.to_string()),
      Outcome::Respond(status, body.to_string()),
    );
  }

  pub fn fail_when_body_contains(&self, target: &str, needle: &str) {
    self.push(target, Some(needle.to_string()), Outcome::NetworkError);
  }

  pub fn go_offline(&self) {
    *self.offline.lock().unwrap() = true;
  }

  pub fn go_online(&self) {
    *self.offline.lock().unwrap() = false;
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, target: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.target.contains(target))
      .count()
  }

  /// Bodies of the writes that reached the network, in order.
  pub fn write_bodies(&self) -> Vec<Value> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.method != Method::GET)
      .filter_map(|c| c.body.clone())
      .collect()
  }

  fn push(&self, target: &str, body_contains: Option<String>, outcome: Outcome) {
    self.rules.lock().unwrap().push(Rule {
      target: target.to_string(),
      body_contains,
      outcome,
    });
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    let target = request.url[Position::BeforePath..].to_string();
    let raw_body = request
      .body
      .as_deref()
      .map(|b| String::from_utf8_lossy(b).into_owned());

    self.calls.lock().unwrap().push(RecordedCall {
      method: request.method.clone(),
      target: target.clone(),
      headers: request.headers.clone(),
      body: raw_body
        .as_deref()
        .and_then(|b| serde_json::from_str(b).ok()),
    });

    if *self.offline.lock().unwrap() {
      return Err(ApiError::Network("offline".into()));
    }

    let outcome = {
      let rules = self.rules.lock().unwrap();
      rules
        .iter()
        .rev()
        .find(|rule| {
          target.contains(&rule.target)
            && match (&rule.body_contains, &raw_body) {
              (None, _) => true,
              (Some(needle), Some(body)) => body.contains(needle.as_str()),
              (Some(_), None) => false,
            }
        })
        .map(|rule| rule.outcome.clone())
    };

    match outcome {
      Some(Outcome::Respond(status, body)) => Ok(HttpResponse {
        status,
        body: body.into_bytes(),
        content_type: Some("application/json".to_string()),
        source: CacheSource::Network,
      }),
      Some(Outcome::NetworkError) => Err(ApiError::Network("connection reset".into())),
      None => Ok(HttpResponse {
        status: 404,
        body: br#"{"success":false,"error":"no route"}"#.to_vec(),
        content_type: Some("application/json".to_string()),
        source: CacheSource::Network,
      }),
    }
  }
}
