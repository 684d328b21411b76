//! Live subscription to one remote collection.
//!
//! [`RemoteCollectionChannel::open`] returns the snapshot stream together with
//! a [`CancelHandle`]. The stream forwards full-replacement snapshots in the
//! order the store emits them, yields at most one terminal error and then
//! ends. It never retries: recovery is a fresh `open`.

use futures::stream::{AbortHandle, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::remote::{ChannelItem, CollectionQuery, RemoteStore, SnapshotStream};

/// Identifier of one subscription instance. Reopening a collection always
/// yields a new id, so emissions from a closed instance can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle of a subscription instance.
///
/// `Unsubscribed -> Subscribing -> Synced <-> (new snapshot) -> Error`.
/// `Error` is terminal for the instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Unsubscribed,
    Subscribing,
    Synced,
    Error(ChannelError),
}

impl ChannelStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, ChannelStatus::Error(_))
    }

    /// State after receiving `item`. An instance in `Error` stays there.
    pub fn on_item(&self, item: &ChannelItem) -> ChannelStatus {
        match (self, item) {
            (ChannelStatus::Error(err), _) => ChannelStatus::Error(err.clone()),
            (_, Ok(_)) => ChannelStatus::Synced,
            (_, Err(err)) => ChannelStatus::Error(err.clone()),
        }
    }
}

/// Cancels a channel. Dropping the handle cancels as well.
#[derive(Debug)]
pub struct CancelHandle {
    abort: AbortHandle,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_aborted()
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

pub struct RemoteCollectionChannel;

impl RemoteCollectionChannel {
    /// Open a subscription for `query`. Nothing is issued until the stream is
    /// first polled.
    pub fn open(store: Arc<dyn RemoteStore>, query: CollectionQuery) -> (SnapshotStream, CancelHandle) {
        let stream = async_stream::stream! {
            let collection = query.collection.clone();
            let mut inner = match store.subscribe(query).await {
                Ok(inner) => inner,
                Err(err) => {
                    warn!(collection = %collection, error = %err, "subscription rejected");
                    yield Err(err);
                    return;
                }
            };

            while let Some(item) = inner.next().await {
                let terminal = item.is_err();
                if let Err(err) = &item {
                    warn!(collection = %collection, error = %err, "subscription failed");
                }
                yield item;
                if terminal {
                    break;
                }
            }
            debug!(collection = %collection, "subscription stream ended");
        };

        let (stream, abort) = futures::stream::abortable(stream);
        (stream.boxed(), CancelHandle { abort })
    }
}

/// A channel whose emissions are being forwarded into an event queue.
///
/// Dropping it cancels the stream and stops the forwarding task; together
/// with the subscription id check on the receiving side this guarantees no
/// emission of a closed instance is applied.
#[derive(Debug)]
pub struct ActiveChannel {
    pub id: SubscriptionId,
    pub query: CollectionQuery,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl ActiveChannel {
    /// Open `query` and forward each emission as `wrap(id, item)` into `sink`.
    pub fn spawn<E, F>(
        id: SubscriptionId,
        store: Arc<dyn RemoteStore>,
        query: CollectionQuery,
        sink: UnboundedSender<E>,
        wrap: F,
    ) -> Self
    where
        E: Send + 'static,
        F: Fn(SubscriptionId, ChannelItem) -> E + Send + 'static,
    {
        let (mut stream, cancel) = RemoteCollectionChannel::open(store, query.clone());
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                if sink.send(wrap(id, item)).is_err() {
                    break;
                }
            }
        });

        debug!(subscription = %id, collection = %query.collection, "channel opened");
        Self {
            id,
            query,
            cancel,
            task,
        }
    }
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
        debug!(subscription = %self.id, collection = %self.query.collection, "channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemoteStore;
    use serde_json::json;
    use tracetech_config::Fields;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn status_transitions() {
        let snapshot: ChannelItem = Ok(Vec::new());
        let failure: ChannelItem = Err(ChannelError::ConnectionError("offline".into()));

        let status = ChannelStatus::Subscribing.on_item(&snapshot);
        assert_eq!(status, ChannelStatus::Synced);

        let status = status.on_item(&failure);
        assert!(status.is_error());

        // Error is terminal for the instance
        assert!(status.on_item(&snapshot).is_error());
    }

    #[tokio::test]
    async fn open_emits_initial_and_subsequent_snapshots() {
        let store = Arc::new(MemoryRemoteStore::new());
        store
            .set("records", "r1", fields(json!({"date": "2024-01-01"})), false)
            .await
            .unwrap();

        let (mut stream, _cancel) =
            RemoteCollectionChannel::open(store.clone(), CollectionQuery::new("records", "date"));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);

        store
            .set("records", "r2", fields(json!({"date": "2024-02-01"})), false)
            .await
            .unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let ids: Vec<_> = second.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }

    #[tokio::test]
    async fn denied_subscription_yields_single_error_then_ends() {
        let store = Arc::new(MemoryRemoteStore::new());
        store.deny_reads("users");

        let (mut stream, _cancel) =
            RemoteCollectionChannel::open(store, CollectionQuery::new("users", "username"));

        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(ChannelError::PermissionDenied(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_stream_stops_emitting() {
        let store = Arc::new(MemoryRemoteStore::new());
        let (mut stream, cancel) =
            RemoteCollectionChannel::open(store.clone(), CollectionQuery::new("records", "date"));

        assert!(stream.next().await.unwrap().is_ok());
        cancel.cancel();
        assert!(cancel.is_cancelled());

        store
            .set("records", "r9", fields(json!({"date": "2024-05-01"})), false)
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
    }
}
