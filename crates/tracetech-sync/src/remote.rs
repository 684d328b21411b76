//! Contract of the remote document store and file object store.
//!
//! Implement [`RemoteStore`] for a concrete backend; the engine only relies on
//! the operations below. [`crate::memory::MemoryRemoteStore`] is the in-process
//! implementation used by tests and local runs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use tracetech_config::{Document, Fields};

use crate::error::{ChannelError, Result};

/// One emission of a live subscription: the complete, ordered contents of the
/// watched collection, or a terminal error.
pub type ChannelItem = std::result::Result<Vec<Document>, ChannelError>;

/// Stream of emissions produced by [`RemoteStore::subscribe`].
pub type SnapshotStream = BoxStream<'static, ChannelItem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Server-side equality filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: JsonValue,
}

/// Description of a live query against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionQuery {
    pub collection: String,
    pub order_by: OrderBy,
    pub filter: Option<FieldFilter>,
}

impl CollectionQuery {
    /// Query ordered descending by `order_field`, the store's default.
    pub fn new(collection: impl Into<String>, order_field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: OrderBy {
                field: order_field.into(),
                direction: Direction::Descending,
            },
            filter: None,
        }
    }

    pub fn ascending(mut self) -> Self {
        self.order_by.direction = Direction::Ascending;
        self
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.filter = Some(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Whether a document belongs to this query's result set.
    pub fn matches(&self, doc: &Document) -> bool {
        match &self.filter {
            Some(filter) => doc.fields.get(&filter.field) == Some(&filter.value),
            None => true,
        }
    }

    /// Order two documents per this query. Missing fields sort first when
    /// ascending; ties fall back to document id for a stable result.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let field = &self.order_by.field;
        let ordering = compare_json(a.fields.get(field), b.fields.get(field))
            .then_with(|| a.id.cmp(&b.id));
        match self.order_by.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        (Some(JsonValue::Bool(x)), Some(JsonValue::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Remote, eventually-consistent document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a live subscription. Each emission is a full replacement of the
    /// query's result set; a terminal error ends the stream.
    async fn subscribe(&self, query: CollectionQuery) -> std::result::Result<SnapshotStream, ChannelError>;

    /// One-shot read of a whole collection.
    async fn fetch(&self, collection: &str) -> Result<Vec<Document>>;

    /// Insert a document under a store-assigned id.
    async fn add(&self, collection: &str, fields: Fields) -> Result<String>;

    /// Write a document under a caller-chosen id. With `merge`, existing
    /// fields not present in `fields` are kept.
    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<()>;

    /// Merge `partial` into an existing document. Fails with `NotFound` when
    /// the document does not exist.
    async fn update(&self, collection: &str, id: &str, partial: Fields) -> Result<()>;

    /// Remove a document. Fails with `NotFound` when it does not exist.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

/// Blob storage for attachments. Only the returned reference is kept.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, path: &str) -> Result<String>;
}
