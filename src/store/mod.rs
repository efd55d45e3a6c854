//! Document store boundary.
//!
//! Everything the sync layer knows about the backend goes through
//! [`DocumentStore`]: live queries that deliver full snapshots, point reads,
//! single-document writes and atomic set-membership updates.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::schema::query::{CollectionPath, DocumentPath, Query, CREATED_AT};

pub mod memory;
pub mod postgres;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("access denied: {0}")]
    Denied(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("no such document: {0}")]
    NotFound(String),

    #[error("parent document missing: {0}")]
    MissingParent(String),

    #[error("malformed document: {0}")]
    Malformed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Field lookup, with `createdAt` served from the server timestamp.
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == CREATED_AT {
            return Some(Value::String(
                self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
        }
        self.data.get(name).cloned()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        let mut data = self.data.clone();
        data.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(created_at) = self.field(CREATED_AT) {
            data.insert(CREATED_AT.to_string(), created_at);
        }
        serde_json::from_value(Value::Object(data))
            .map_err(|e| StoreError::Malformed(format!("{}: {e}", self.id)))
    }
}

/// Serializes a record into the field map a store write expects.
pub fn encode<T: Serialize>(record: &T) -> StoreResult<Map<String, Value>> {
    match serde_json::to_value(record) {
        Ok(Value::Object(mut map)) => {
            map.remove("id");
            map.remove(CREATED_AT);
            Ok(map)
        }
        Ok(other) => Err(StoreError::Malformed(format!(
            "expected an object, got {other}"
        ))),
        Err(e) => Err(StoreError::Malformed(e.to_string())),
    }
}

/// Backend-assigned document id: 20 random alphanumerics.
pub(crate) fn new_document_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

pub type SnapshotResult = StoreResult<Vec<Document>>;

/// Receiving end of a live query. Yields one full snapshot per remote change;
/// an `Err` item means the channel is gone and nothing else will follow.
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<SnapshotResult>,
}

impl ChangeFeed {
    pub fn channel() -> (mpsc::UnboundedSender<SnapshotResult>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<SnapshotResult> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Opens a live query. The first snapshot is queued before this returns.
    async fn listen(&self, query: &Query) -> StoreResult<ChangeFeed>;

    async fn get(&self, doc: &DocumentPath) -> StoreResult<Option<Document>>;

    /// Creates a document with a backend-assigned id and server timestamp.
    /// Fails with [`StoreError::MissingParent`] when the owning document of a
    /// subcollection does not exist.
    async fn create(&self, collection: &CollectionPath, data: Map<String, Value>)
        -> StoreResult<String>;

    /// Creates or replaces a document under a caller-chosen id.
    async fn set(&self, doc: &DocumentPath, data: Map<String, Value>) -> StoreResult<()>;

    /// Merges `fields` into an existing document.
    async fn update(&self, doc: &DocumentPath, fields: Map<String, Value>) -> StoreResult<()>;

    async fn delete(&self, doc: &DocumentPath) -> StoreResult<()>;

    /// Adds `value` to the array field `field` unless already present.
    async fn add_to_set(&self, doc: &DocumentPath, field: &str, value: &str) -> StoreResult<()>;

    /// Removes every occurrence of `value` from the array field `field`.
    async fn remove_from_set(&self, doc: &DocumentPath, field: &str, value: &str)
        -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::db::{Complaint, Status};
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn decode_injects_id_and_timestamp() {
        let doc = Document {
            id: "c1".into(),
            data: json!({ "title": "Broken AC", "status": "open" })
                .as_object()
                .cloned()
                .unwrap(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        let complaint: Complaint = doc.decode().unwrap();
        assert_eq!(complaint.id, "c1");
        assert_eq!(complaint.status, Status::Open);
        assert_eq!(complaint.created_at, Some(doc.created_at));
    }

    #[test]
    fn encode_strips_server_fields() {
        let complaint = Complaint {
            id: "c1".into(),
            title: "t".into(),
            ..Default::default()
        };
        let map = encode(&complaint).unwrap();
        assert!(!map.contains_key("id"));
        assert!(!map.contains_key(CREATED_AT));
        assert_eq!(map["upvotes"], json!([]));
    }
}
