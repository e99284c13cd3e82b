//! Typed failures for calls against the remote calendar/task API.
//!
//! Infrastructure errors (config, storage) travel as `color_eyre::Report`;
//! remote failures need to be told apart by callers, so they get their own type.

use thiserror::Error;

use crate::api::types::{EntityKind, Operation};

#[derive(Debug, Clone, Error)]
pub enum ApiError {
  /// Timeout, DNS failure, refused connection, or no network at all
  #[error("network unavailable: {0}")]
  Network(String),

  /// The server answered but refused the request
  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },

  /// The server answered with a body we could not understand
  #[error("malformed response: {0}")]
  Decode(String),

  /// The operation makes no sense for this kind of entity
  #[error("{operation} is not supported for {kind}")]
  Unsupported {
    kind: EntityKind,
    operation: Operation,
  },

  /// The cache worker went away before answering
  #[error("cache engine stopped")]
  EngineStopped,
}

impl ApiError {
  /// Failures that are recovered locally (cache fallback or queueing).
  pub fn is_transient(&self) -> bool {
    matches!(self, ApiError::Network(_) | ApiError::EngineStopped)
  }

  /// Rejections that will never succeed on replay.
  ///
  /// 408, 425, 429 and 5xx are worth retrying; every other 4xx, and an
  /// application-level `success: false`, is not.
  pub fn is_permanent(&self) -> bool {
    match self {
      ApiError::Rejected { status, .. } => !(matches!(*status, 408 | 425 | 429) || *status >= 500),
      ApiError::Unsupported { .. } => true,
      // Garbled answers are retried
      ApiError::Decode(_) | ApiError::Network(_) | ApiError::EngineStopped => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rejected(status: u16) -> ApiError {
    ApiError::Rejected {
      status,
      message: String::new(),
    }
  }

  #[test]
  fn test_network_errors_are_transient() {
    assert!(ApiError::Network("timeout".into()).is_transient());
    assert!(!ApiError::Network("timeout".into()).is_permanent());
    assert!(!rejected(500).is_transient());
  }

  #[test]
  fn test_rejection_classification() {
    assert!(rejected(400).is_permanent());
    assert!(rejected(404).is_permanent());
    assert!(rejected(422).is_permanent());
    assert!(!rejected(408).is_permanent());
    assert!(!rejected(429).is_permanent());
    assert!(!rejected(503).is_permanent());
  }

  #[test]
  fn test_application_level_failure_is_permanent() {
    // `success: false` arrives with a 200 status
    assert!(rejected(200).is_permanent());
  }
}
