//! Populating an empty remote store with the seed dataset.

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracetech_config::{Actor, Entity, TraceRecord};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::remote::RemoteStore;

/// Result of a seeding attempt, with a message fit for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub success: bool,
    pub records_written: usize,
    pub actors_written: usize,
    pub message: String,
}

/// Write `records` and `actors` into their remote collections, each only if
/// that collection is currently empty. Records get store-assigned ids; actors
/// keep their ids so references from records stay valid.
pub async fn seed_remote(
    store: &dyn RemoteStore,
    records: &[TraceRecord],
    actors: &[Actor],
) -> SeedReport {
    match write_seed(store, records, actors).await {
        Ok((records_written, actors_written)) => {
            info!(records_written, actors_written, "seeded remote store");
            SeedReport {
                success: true,
                records_written,
                actors_written,
                message: "Data synchronized successfully.".to_string(),
            }
        }
        Err(err) => {
            warn!(error = %err, "seeding failed");
            let message = match &err {
                SyncError::PermissionDenied(_) => {
                    "No write permission. Review the remote store security rules.".to_string()
                }
                other => format!("Error: {}", other),
            };
            SeedReport {
                success: false,
                records_written: 0,
                actors_written: 0,
                message,
            }
        }
    }
}

async fn write_seed(
    store: &dyn RemoteStore,
    records: &[TraceRecord],
    actors: &[Actor],
) -> Result<(usize, usize)> {
    let mut records_written = 0;
    if store.fetch(TraceRecord::COLLECTION).await?.is_empty() {
        let created_at = JsonValue::String(Utc::now().to_rfc3339());
        for record in records {
            let mut fields = record.to_document().fields;
            fields.insert("createdAt".to_string(), created_at.clone());
            store.add(TraceRecord::COLLECTION, fields).await?;
            records_written += 1;
        }
    }

    let mut actors_written = 0;
    if store.fetch(Actor::COLLECTION).await?.is_empty() {
        for actor in actors {
            let doc = actor.to_document();
            store.set(Actor::COLLECTION, &doc.id, doc.fields, true).await?;
            actors_written += 1;
        }
    }
    Ok((records_written, actors_written))
}
