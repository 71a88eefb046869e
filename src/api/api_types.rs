//! Wire formats: resource envelopes, background tasks and batched queries.
//!
//! These types mirror what the server sends and expects, separate from the
//! cache's own entity representation.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CacheError, Result};

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

/// Substitute `{id}` in an endpoint template.
pub fn expand_path(template: &str, id: u64) -> String {
  template.replace("{id}", &id.to_string())
}

// ============================================================================
// Resource envelopes
// ============================================================================

/// `{ "<singular>": {...} }`
pub fn wrap_single(singular: &str, payload: Map<String, Value>) -> Value {
  let mut envelope = Map::new();
  envelope.insert(singular.to_string(), Value::Object(payload));
  Value::Object(envelope)
}

/// Extract the payload from a single-resource envelope. A bare object without
/// the envelope key is accepted as the payload itself.
pub fn unwrap_single(singular: &str, body: Value) -> Result<Map<String, Value>> {
  match body {
    Value::Object(mut envelope) => match envelope.remove(singular) {
      Some(Value::Object(payload)) => Ok(payload),
      Some(other) => Err(CacheError::Decode(format!(
        "`{singular}` envelope holds {other} instead of an object"
      ))),
      None => Ok(envelope),
    },
    other => Err(CacheError::Decode(format!(
      "expected `{singular}` object, got {other}"
    ))),
  }
}

/// Extract records from `{ "<plural>_collection": { "<plural>": [...] } }`.
pub fn unwrap_collection(plural: &str, body: Value) -> Result<Vec<Value>> {
  let records = body
    .get(format!("{plural}_collection"))
    .and_then(|collection| collection.get(plural))
    .or_else(|| body.get(plural))
    .and_then(Value::as_array)
    .ok_or_else(|| CacheError::Decode(format!("response has no `{plural}` collection")))?;
  Ok(records.clone())
}

// ============================================================================
// Background tasks
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackgroundTask {
  pub id: u64,
  #[serde(default)]
  pub status: String,
}

/// Id of the background task a write response asks us to wait on.
pub fn background_task_id(body: &Value) -> Option<u64> {
  body
    .get("background_task")
    .and_then(|task| task.get("id"))
    .and_then(Value::as_u64)
}

// ============================================================================
// Batched queries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryFilters {
  pub expression: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBy {
  pub name: String,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub desc: bool,
}

/// One entry of a `POST /query` request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryDescriptor {
  pub object_name: String,
  pub filters: QueryFilters,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub order_by: Vec<OrderBy>,
  /// `[first, last)` row range.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<[u64; 2]>,
  #[serde(rename = "type")]
  pub kind: String,
}

/// One `{values, total}` page of a query response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryPage {
  #[serde(default)]
  pub values: Vec<Value>,
  #[serde(default)]
  pub total: u64,
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  #[test]
  fn test_single_envelope() {
    let body = json!({ "control": { "id": 5, "title": "Access" } });
    let payload = unwrap_single("control", body).unwrap();
    assert_eq!(payload.get("id"), Some(&json!(5)));

    let bare = unwrap_single("control", json!({ "id": 6 })).unwrap();
    assert_eq!(bare.get("id"), Some(&json!(6)));

    assert!(unwrap_single("control", json!([1, 2])).is_err());
    assert_eq!(
      wrap_single("control", payload),
      json!({ "control": { "id": 5, "title": "Access" } })
    );
  }

  #[test]
  fn test_collection_envelope() {
    let body = json!({ "people_collection": { "people": [{ "id": 1 }, { "id": 2 }] } });
    assert_eq!(unwrap_collection("people", body).unwrap().len(), 2);
    assert!(unwrap_collection("people", json!({ "other": [] })).is_err());
  }

  #[test]
  fn test_background_task_id() {
    assert_eq!(background_task_id(&json!({ "background_task": { "id": 7 } })), Some(7));
    assert_eq!(background_task_id(&Value::Null), None);
  }

  #[test]
  fn test_descriptor_wire_shape() {
    let descriptor = QueryDescriptor {
      object_name: "Control".into(),
      filters: QueryFilters {
        expression: json!({}),
      },
      order_by: vec![OrderBy {
        name: "title".into(),
        desc: false,
      }],
      limit: Some([0, 10]),
      kind: "values".into(),
    };
    assert_eq!(
      serde_json::to_value(&descriptor).unwrap(),
      json!({
        "object_name": "Control",
        "filters": { "expression": {} },
        "order_by": [{ "name": "title" }],
        "limit": [0, 10],
        "type": "values",
      })
    );
  }
}
