//! In-process document store with live queries.
//!
//! Writes are applied under one lock and every affected live query is
//! re-evaluated before the lock is released, so each feed sees snapshots in
//! write order. Fault injection hooks exist for exercising failure paths.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{log, Level};
use serde_json::{Map, Value};
use tokio::sync::{mpsc::UnboundedSender, watch};

use super::{
    new_document_id, ChangeFeed, Document, DocumentStore, SnapshotResult, StoreError, StoreResult,
};
use crate::schema::query::{CollectionPath, DocumentPath, Query};

struct Watcher {
    query: Query,
    tx: UnboundedSender<SnapshotResult>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<CollectionPath, BTreeMap<String, Document>>,
    watchers: Vec<Watcher>,
    last_timestamp: Option<DateTime<Utc>>,
    denied: HashSet<String>,
    failing_writes: usize,
    offline: bool,
}

impl Inner {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn is_denied(&self, collection: &CollectionPath) -> bool {
        let path = collection.as_str();
        let name = path.rsplit('/').next().unwrap_or(path);
        self.denied.contains(path) || self.denied.contains(name)
    }

    fn exists(&self, doc: &DocumentPath) -> bool {
        self.collections
            .get(&doc.collection)
            .is_some_and(|docs| docs.contains_key(&doc.id))
    }

    fn snapshot(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .collections
            .get(query.target.collection())
            .map(|docs| docs.values().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default();
        query.sort(&mut docs);
        docs
    }

    fn publish(&mut self, collection: &CollectionPath) {
        let mut watchers = std::mem::take(&mut self.watchers);
        watchers.retain(|w| {
            if !w.query.watches(collection) {
                return !w.tx.is_closed();
            }
            w.tx.send(Ok(self.snapshot(&w.query))).is_ok()
        });
        self.watchers = watchers;
    }

    fn document_mut(&mut self, doc: &DocumentPath) -> StoreResult<&mut Document> {
        self.collections
            .get_mut(&doc.collection)
            .and_then(|docs| docs.get_mut(&doc.id))
            .ok_or_else(|| StoreError::NotFound(doc.to_string()))
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    writes_open: watch::Sender<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (writes_open, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner::default()),
            writes_open,
        }
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// Rejects reads and writes on a collection path, or on every
    /// subcollection with that final segment (`"notes"`).
    pub fn deny(&self, collection: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.denied.insert(collection.to_string());
        }
    }

    /// The next `count` writes fail as if the backend were unreachable.
    pub fn fail_next_writes(&self, count: usize) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_writes = count;
        }
    }

    /// While offline, new live queries and writes fail.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.offline = offline;
        }
    }

    /// Holds every write until [`MemoryStore::resume_writes`] is called.
    pub fn pause_writes(&self) {
        self.writes_open.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.writes_open.send_replace(true);
    }

    /// Severs every open live query with a channel error.
    pub fn drop_channels(&self) {
        if let Ok(mut inner) = self.lock() {
            for watcher in inner.watchers.drain(..) {
                let _ = watcher
                    .tx
                    .send(Err(StoreError::Unavailable("channel dropped".to_string())));
            }
        }
    }

    /// Number of live queries still attached.
    pub fn listener_count(&self) -> usize {
        self.lock()
            .map(|mut inner| {
                inner.watchers.retain(|w| !w.tx.is_closed());
                inner.watchers.len()
            })
            .unwrap_or_default()
    }

    /// Number of documents currently stored in a collection.
    pub fn count(&self, collection: &CollectionPath) -> usize {
        self.lock()
            .map(|inner| inner.collections.get(collection).map_or(0, |d| d.len()))
            .unwrap_or_default()
    }

    async fn write<R>(
        &self,
        collection: &CollectionPath,
        op: impl FnOnce(&mut Inner) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut open = self.writes_open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map_err(|_| StoreError::Unavailable("store shut down".to_string()))?;

        let mut inner = self.lock()?;
        if inner.offline {
            return Err(StoreError::Unavailable("offline".to_string()));
        }
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            log!(Level::Debug, "Injected write failure on {collection}");
            return Err(StoreError::Unavailable("write rejected".to_string()));
        }
        if inner.is_denied(collection) {
            return Err(StoreError::Denied(collection.to_string()));
        }
        let result = op(&mut inner)?;
        inner.publish(collection);
        Ok(result)
    }
}

fn set_field(doc: &mut Document, field: &str, value: &str, present: bool) {
    let mut values: Vec<Value> = match doc.data.remove(field) {
        Some(Value::Array(values)) => values,
        _ => Vec::new(),
    };
    values.retain(|v| v.as_str() != Some(value));
    if present {
        values.push(Value::String(value.to_string()));
    }
    doc.data.insert(field.to_string(), Value::Array(values));
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn listen(&self, query: &Query) -> StoreResult<ChangeFeed> {
        let mut inner = self.lock()?;
        let collection = query.target.collection();
        if inner.offline {
            return Err(StoreError::Unavailable("offline".to_string()));
        }
        if inner.is_denied(collection) {
            return Err(StoreError::Denied(collection.to_string()));
        }
        let (tx, feed) = ChangeFeed::channel();
        let _ = tx.send(Ok(inner.snapshot(query)));
        inner.watchers.push(Watcher {
            query: query.clone(),
            tx,
        });
        log!(Level::Trace, "Live query attached to {collection}");
        Ok(feed)
    }

    async fn get(&self, doc: &DocumentPath) -> StoreResult<Option<Document>> {
        let inner = self.lock()?;
        if inner.offline {
            return Err(StoreError::Unavailable("offline".to_string()));
        }
        if inner.is_denied(&doc.collection) {
            return Err(StoreError::Denied(doc.collection.to_string()));
        }
        Ok(inner
            .collections
            .get(&doc.collection)
            .and_then(|docs| docs.get(&doc.id))
            .cloned())
    }

    async fn create(
        &self,
        collection: &CollectionPath,
        data: Map<String, Value>,
    ) -> StoreResult<String> {
        self.write(collection, |inner| {
            if let Some(parent) = collection.parent() {
                if !inner.exists(&parent) {
                    return Err(StoreError::MissingParent(parent.to_string()));
                }
            }
            let id = new_document_id();
            let created_at = inner.next_timestamp();
            inner.collections.entry(collection.clone()).or_default().insert(
                id.clone(),
                Document {
                    id: id.clone(),
                    data,
                    created_at,
                },
            );
            Ok(id)
        })
        .await
    }

    async fn set(&self, doc: &DocumentPath, data: Map<String, Value>) -> StoreResult<()> {
        self.write(&doc.collection, |inner| {
            let existing = inner
                .collections
                .get(&doc.collection)
                .and_then(|docs| docs.get(&doc.id))
                .map(|d| d.created_at);
            let created_at = match existing {
                Some(ts) => ts,
                None => inner.next_timestamp(),
            };
            inner.collections.entry(doc.collection.clone()).or_default().insert(
                doc.id.clone(),
                Document {
                    id: doc.id.clone(),
                    data,
                    created_at,
                },
            );
            Ok(())
        })
        .await
    }

    async fn update(&self, doc: &DocumentPath, fields: Map<String, Value>) -> StoreResult<()> {
        self.write(&doc.collection, |inner| {
            let existing = inner.document_mut(doc)?;
            existing.data.extend(fields);
            Ok(())
        })
        .await
    }

    async fn delete(&self, doc: &DocumentPath) -> StoreResult<()> {
        self.write(&doc.collection, |inner| {
            if let Some(docs) = inner.collections.get_mut(&doc.collection) {
                docs.remove(&doc.id);
            }
            Ok(())
        })
        .await
    }

    async fn add_to_set(&self, doc: &DocumentPath, field: &str, value: &str) -> StoreResult<()> {
        self.write(&doc.collection, |inner| {
            set_field(inner.document_mut(doc)?, field, value, true);
            Ok(())
        })
        .await
    }

    async fn remove_from_set(
        &self,
        doc: &DocumentPath,
        field: &str,
        value: &str,
    ) -> StoreResult<()> {
        self.write(&doc.collection, |inner| {
            set_field(inner.document_mut(doc)?, field, value, false);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::query::{Direction, CREATED_AT};
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn listen_delivers_initial_and_subsequent_snapshots() {
        let store = MemoryStore::new();
        let query = Query::collection(CollectionPath::complaints())
            .order_by(CREATED_AT, Direction::Descending);
        let mut feed = store.listen(&query).await.unwrap();
        assert!(feed.next().await.unwrap().unwrap().is_empty());

        let first = store
            .create(&CollectionPath::complaints(), object(json!({ "title": "a" })))
            .await
            .unwrap();
        let second = store
            .create(&CollectionPath::complaints(), object(json!({ "title": "b" })))
            .await
            .unwrap();

        assert_eq!(feed.next().await.unwrap().unwrap().len(), 1);
        let latest = feed.next().await.unwrap().unwrap();
        let ids: Vec<&str> = latest.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        assert!(latest[0].created_at > latest[1].created_at);
    }

    #[tokio::test]
    async fn set_membership_is_unique() {
        let store = MemoryStore::new();
        let id = store
            .create(&CollectionPath::complaints(), object(json!({ "upvotes": [] })))
            .await
            .unwrap();
        let doc = DocumentPath::complaint(&id);
        store.add_to_set(&doc, "upvotes", "u1").await.unwrap();
        store.add_to_set(&doc, "upvotes", "u1").await.unwrap();
        let stored = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(stored.data["upvotes"], json!(["u1"]));

        store.remove_from_set(&doc, "upvotes", "u1").await.unwrap();
        let stored = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(stored.data["upvotes"], json!([]));
    }

    #[tokio::test]
    async fn subcollection_write_requires_parent() {
        let store = MemoryStore::new();
        let err = store
            .create(&CollectionPath::comments("missing"), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingParent(_)));
    }

    #[tokio::test]
    async fn denied_collections_reject_listeners() {
        let store = MemoryStore::new();
        store.deny("notes");
        let query = Query::collection(CollectionPath::notes("c1"));
        assert!(matches!(
            store.listen(&query).await,
            Err(StoreError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn dropped_feed_detaches_watcher() {
        let store = MemoryStore::new();
        let feed = store
            .listen(&Query::collection(CollectionPath::complaints()))
            .await
            .unwrap();
        assert_eq!(store.listener_count(), 1);
        drop(feed);
        assert_eq!(store.listener_count(), 0);
    }
}
