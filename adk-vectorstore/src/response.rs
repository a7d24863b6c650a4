//! Structured outcome envelopes.
//!
//! Operations whose failure is an expected outcome (health checks, stats,
//! deletion counts) return a [`StoreResponse`] instead of an error, so callers
//! can tell "the store is unreachable" from "the collection does not exist"
//! without matching on errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::StoreError;

/// A success/failure envelope with timing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Always carries `elapsed_seconds`; failures add `error_type`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StoreResponse {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None, message: None, metadata: Map::new() }
    }

    /// A failure built from a normalized error.
    pub fn from_error(err: &StoreError) -> Self {
        let mut metadata = Map::new();
        metadata.insert("error_type".into(), json!(err.error_type()));
        if err.is_not_found() {
            metadata.insert("not_found".into(), json!(true));
        }
        Self { success: false, data: None, error: Some(err.to_string()), message: None, metadata }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_elapsed(self, elapsed: Duration) -> Self {
        self.with_metadata("elapsed_seconds", json!(elapsed.as_secs_f64()))
    }

    /// The taxonomy label of a failure, if any.
    pub fn error_type(&self) -> Option<&str> {
        self.metadata.get("error_type").and_then(Value::as_str)
    }

    /// Whether this failure reports a missing collection.
    pub fn is_not_found(&self) -> bool {
        !self.success
            && self.error_type() == Some("CollectionError")
            && self.metadata.get("not_found").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Deleted-chunk count reported by `delete_documents`.
    pub fn deleted_count(&self) -> Option<u64> {
        self.data
            .as_ref()
            .and_then(|d| d.get("deleted_count"))
            .or_else(|| self.metadata.get("deleted_count"))
            .and_then(Value::as_u64)
    }

    pub fn elapsed_seconds(&self) -> Option<f64> {
        self.metadata.get("elapsed_seconds").and_then(Value::as_f64)
    }
}

/// What a backend actually removed during `delete_documents`.
///
/// Backends that delete in several native calls report the count reached
/// before a failure in `error` rather than discarding it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionReport {
    pub deleted_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeletionReport {
    pub fn deleted(ids: Vec<String>) -> Self {
        Self { deleted_count: ids.len() as u64, deleted_ids: ids, error: None }
    }

    pub fn count(deleted_count: u64) -> Self {
        Self { deleted_count, ..Self::default() }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_failure_is_detectable() {
        let response = StoreResponse::from_error(&StoreError::collection_not_found("memory", "x"));
        assert!(response.is_not_found());
        assert_eq!(response.error_type(), Some("CollectionError"));

        let response = StoreResponse::from_error(&StoreError::store("memory", "down"));
        assert!(!response.is_not_found());
    }

    #[test]
    fn deleted_count_is_read_from_data() {
        let response = StoreResponse::ok(json!({ "deleted_count": 2 }))
            .with_elapsed(Duration::from_millis(5));
        assert_eq!(response.deleted_count(), Some(2));
        assert!(response.elapsed_seconds().is_some());
    }
}
