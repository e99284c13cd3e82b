//! Serde types matching the remote API's JSON envelopes.
//!
//! Every endpoint answers `{success, error?, ...}`; list endpoints add the
//! collection under `events` or `tasks`. The cache engine may add
//! `offline: true` to a synthesized answer.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::transport::HttpResponse;

#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
  #[serde(default)]
  pub success: bool,
  #[serde(default)]
  pub error: Option<String>,
  #[serde(default)]
  pub offline: bool,
  #[serde(flatten)]
  pub rest: Map<String, Value>,
}

impl ApiEnvelope {
  /// Parse a response, turning HTTP and application-level failures into rejections.
  pub fn from_response(response: &HttpResponse) -> Result<Self, ApiError> {
    let parsed: Result<Self, ApiError> = response.json();

    if !response.is_success() {
      let message = parsed
        .ok()
        .and_then(|envelope| envelope.error)
        .unwrap_or_else(|| format!("HTTP {}", response.status));
      return Err(ApiError::Rejected {
        status: response.status,
        message,
      });
    }

    let envelope = parsed?;
    if !envelope.success {
      return Err(ApiError::Rejected {
        status: response.status,
        message: envelope
          .error
          .clone()
          .unwrap_or_else(|| "request failed".to_string()),
      });
    }

    Ok(envelope)
  }

  /// Take the list stored under `field`. A missing field is an empty list.
  pub fn take_list<T: DeserializeOwned>(&mut self, field: &str) -> Result<Vec<T>, ApiError> {
    match self.rest.remove(field) {
      Some(Value::Null) | None => Ok(Vec::new()),
      Some(value) => serde_json::from_value(value)
        .map_err(|e| ApiError::Decode(format!("bad {} list: {}", field, e))),
    }
  }
}
