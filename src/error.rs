//! Error taxonomy for the cache.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::cache::AttrValue;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors surfaced by cache operations.
///
/// Identity and configuration errors point at a wiring defect and are returned
/// synchronously. Everything else comes from the network boundary. The type is
/// `Clone` so a single refresh result can be handed to every coalesced caller.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  #[error("model type `{0}` is not registered")]
  UnknownType(String),

  #[error("model `{type_name}` has no relation `{relation}`")]
  UnknownRelation { type_name: String, relation: String },

  #[error("{type_name} has no persisted id")]
  MissingId { type_name: String },

  #[error("{0} is a read-only snapshot")]
  ReadOnly(String),

  #[error("configuration error: {0}")]
  Config(String),

  /// The server rejected a write with 409. The entity has been refreshed from the
  /// server; `unsent` holds the local edits that were not written.
  #[error("write conflict on {label}, entity refreshed from server")]
  StaleWrite {
    label: String,
    unsent: BTreeMap<String, AttrValue>,
  },

  #[error("HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("transport error: {0}")]
  Transport(String),

  #[error("malformed response: {0}")]
  Decode(String),

  #[error("background task {id} ended with status {status}")]
  BackgroundTask { id: u64, status: String },

  #[error("{0} was destroyed while a request was in flight")]
  Evicted(String),

  /// Some relationship mutations queued on `label` failed. The failed
  /// operations have been queued again for the next save.
  #[error("{} relationship operation(s) failed on {label}", failures.len())]
  JoinResolution { label: String, failures: Vec<String> },
}

impl CacheError {
  /// Whether this error is a 409 conflict.
  pub fn is_conflict(&self) -> bool {
    matches!(self, CacheError::StaleWrite { .. })
  }

  /// Identity/configuration errors that indicate a programming defect.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      CacheError::UnknownType(_)
        | CacheError::UnknownRelation { .. }
        | CacheError::MissingId { .. }
        | CacheError::ReadOnly(_)
        | CacheError::Config(_)
    )
  }

  pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
    CacheError::Decode(err.to_string())
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(err: serde_json::Error) -> Self {
    CacheError::decode(err)
  }
}
