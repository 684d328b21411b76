//! In-process implementations of [`RemoteStore`] and [`ObjectStore`].
//!
//! `MemoryRemoteStore` behaves like the live store from the engine's point of
//! view: subscriptions receive a full ordered snapshot on open and after every
//! change. It also supports fault injection (denied reads, unreachable store,
//! failing or paused writes) so degraded paths can be exercised.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracetech_config::{new_entity_id, Document, Fields};
use tracing::debug;

use crate::error::{ChannelError, Result, SyncError};
use crate::remote::{ChannelItem, CollectionQuery, ObjectStore, RemoteStore, SnapshotStream};

struct Subscriber {
    query: CollectionQuery,
    tx: mpsc::UnboundedSender<ChannelItem>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    subscribers: Vec<Subscriber>,
    denied_reads: HashSet<String>,
    denied_writes: HashSet<String>,
    unreachable: bool,
    write_failures: Vec<SyncError>,
    writes: usize,
}

impl Inner {
    fn snapshot(&self, query: &CollectionQuery) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .filter(|doc| query.matches(doc))
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| query.compare(a, b));
        docs
    }

    fn broadcast(&mut self, collection: &str) {
        let mut live = Vec::with_capacity(self.subscribers.len());
        for subscriber in std::mem::take(&mut self.subscribers) {
            if subscriber.query.collection == collection {
                let snapshot = self.snapshot(&subscriber.query);
                if subscriber.tx.send(Ok(snapshot)).is_err() {
                    continue;
                }
            } else if subscriber.tx.is_closed() {
                continue;
            }
            live.push(subscriber);
        }
        self.subscribers = live;
    }

    fn check_write(&mut self, collection: &str) -> Result<()> {
        if self.unreachable {
            return Err(SyncError::ConnectionError("remote store unreachable".to_string()));
        }
        if self.denied_writes.contains(collection) {
            return Err(SyncError::PermissionDenied(format!(
                "writes to '{}' are not allowed",
                collection
            )));
        }
        if !self.write_failures.is_empty() {
            return Err(self.write_failures.remove(0));
        }
        self.writes += 1;
        Ok(())
    }
}

/// In-memory document store with live subscriptions.
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
    write_gate: watch::Sender<bool>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let (write_gate, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner::default()),
            write_gate,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock can only come from a test assertion;
        // the data itself is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store documents directly, without notifying subscribers.
    pub fn preload(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
        let mut inner = self.lock();
        let target = inner.collections.entry(collection.to_string()).or_default();
        for doc in docs {
            target.insert(doc.id, doc.fields);
        }
    }

    /// Current contents of a collection, ordered by id.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        let inner = self.lock();
        inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of writes accepted so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Reject new subscriptions to `collection` and fail live ones.
    pub fn deny_reads(&self, collection: &str) {
        let mut inner = self.lock();
        inner.denied_reads.insert(collection.to_string());
        let reason = format!("reads of '{}' are not allowed", collection);
        inner.subscribers.retain(|subscriber| {
            if subscriber.query.collection == collection {
                let _ = subscriber
                    .tx
                    .send(Err(ChannelError::PermissionDenied(reason.clone())));
                false
            } else {
                true
            }
        });
    }

    pub fn allow_reads(&self, collection: &str) {
        self.lock().denied_reads.remove(collection);
    }

    pub fn deny_writes(&self, collection: &str) {
        self.lock().denied_writes.insert(collection.to_string());
    }

    /// Make the next write fail with `error`. Failures queue up.
    pub fn fail_next_write(&self, error: SyncError) {
        self.lock().write_failures.push(error);
    }

    /// Drop every live subscription with a connection error and refuse new
    /// reads and writes until [`MemoryRemoteStore::reconnect`].
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.unreachable = true;
        for subscriber in inner.subscribers.drain(..) {
            let _ = subscriber.tx.send(Err(ChannelError::ConnectionError(
                "connection lost".to_string(),
            )));
        }
    }

    pub fn reconnect(&self) {
        self.lock().unreachable = false;
    }

    /// Hold every write until [`MemoryRemoteStore::resume_writes`].
    pub fn pause_writes(&self) {
        self.write_gate.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.write_gate.send_replace(true);
    }

    async fn wait_for_gate(&self) {
        let mut gate = self.write_gate.subscribe();
        // The sender lives as long as `self`, so this only fails if the store
        // is gone, in which case there is nothing left to wait for.
        let _ = gate.wait_for(|open| *open).await;
    }

    /// Number of live subscribers on `collection`.
    pub fn subscriber_count(&self, collection: &str) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner
            .subscribers
            .iter()
            .filter(|s| s.query.collection == collection)
            .count()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn subscribe(
        &self,
        query: CollectionQuery,
    ) -> std::result::Result<SnapshotStream, ChannelError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            if inner.unreachable {
                return Err(ChannelError::ConnectionError(
                    "remote store unreachable".to_string(),
                ));
            }
            if inner.denied_reads.contains(&query.collection) {
                return Err(ChannelError::PermissionDenied(format!(
                    "reads of '{}' are not allowed",
                    query.collection
                )));
            }
            let initial = inner.snapshot(&query);
            let _ = tx.send(Ok(initial));
            debug!(collection = %query.collection, "memory store subscription added");
            inner.subscribers.push(Subscriber { query, tx });
        }

        let stream = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(stream.boxed())
    }

    async fn fetch(&self, collection: &str) -> Result<Vec<Document>> {
        let inner = self.lock();
        if inner.unreachable {
            return Err(SyncError::ConnectionError("remote store unreachable".to_string()));
        }
        if inner.denied_reads.contains(collection) {
            return Err(SyncError::PermissionDenied(format!(
                "reads of '{}' are not allowed",
                collection
            )));
        }
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<String> {
        self.wait_for_gate().await;
        let mut inner = self.lock();
        inner.check_write(collection)?;
        let id = new_entity_id();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        inner.broadcast(collection);
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<()> {
        self.wait_for_gate().await;
        let mut inner = self.lock();
        inner.check_write(collection)?;
        let docs = inner.collections.entry(collection.to_string()).or_default();
        match docs.get_mut(id) {
            Some(existing) if merge => existing.extend(fields),
            _ => {
                docs.insert(id.to_string(), fields);
            }
        }
        inner.broadcast(collection);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, partial: Fields) -> Result<()> {
        self.wait_for_gate().await;
        let mut inner = self.lock();
        inner.check_write(collection)?;
        let existing = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| SyncError::not_found(collection, id))?;
        existing.extend(partial);
        inner.broadcast(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.wait_for_gate().await;
        let mut inner = self.lock();
        inner.check_write(collection)?;
        let removed = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id));
        if removed.is_none() {
            return Err(SyncError::not_found(collection, id));
        }
        inner.broadcast(collection);
        Ok(())
    }
}

/// Object store keeping uploads in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, bytes: Vec<u8>, path: &str) -> Result<String> {
        if path.trim().is_empty() {
            return Err(SyncError::Validation("upload path is empty".to_string()));
        }
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_string(), bytes);
        Ok(format!("memory://{}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn update_and_delete_missing_documents_fail() {
        let store = MemoryRemoteStore::new();
        let err = store
            .update("records", "nope", fields(json!({"status": "A"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
        assert!(matches!(
            store.delete("records", "nope").await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn set_with_merge_keeps_existing_fields() {
        let store = MemoryRemoteStore::new();
        store
            .set("users", "1", fields(json!({"username": "admin", "role": "ADMIN"})), false)
            .await
            .unwrap();
        store
            .set("users", "1", fields(json!({"name": "Administrador"})), true)
            .await
            .unwrap();

        let docs = store.documents("users");
        assert_eq!(docs[0].str_field("username"), Some("admin"));
        assert_eq!(docs[0].str_field("name"), Some("Administrador"));
    }

    #[tokio::test]
    async fn queued_write_failures_are_consumed_in_order() {
        let store = MemoryRemoteStore::new();
        store.fail_next_write(SyncError::ConnectionError("flaky".into()));

        assert!(store.add("records", Fields::new()).await.is_err());
        assert!(store.add("records", Fields::new()).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_rejects_everything() {
        let store = MemoryRemoteStore::new();
        store.disconnect();
        assert!(matches!(
            store.fetch("records").await,
            Err(SyncError::ConnectionError(_))
        ));
        assert!(store
            .subscribe(CollectionQuery::new("records", "date"))
            .await
            .is_err());
        store.reconnect();
        assert!(store.fetch("records").await.is_ok());
    }

    #[tokio::test]
    async fn object_store_returns_reference() {
        let store = MemoryObjectStore::new();
        let url = store
            .upload(b"%PDF".to_vec(), "documents/1_report.pdf")
            .await
            .unwrap();
        assert_eq!(url, "memory://documents/1_report.pdf");
        assert_eq!(store.get("documents/1_report.pdf"), Some(b"%PDF".to_vec()));
    }
}
