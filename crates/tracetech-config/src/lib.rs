//! Configuration, data model and durable local state for tracetech.
//!
//! - [`config`] loads the TOML configuration with environment overrides.
//! - [`types`] defines the typed entities and the decoding boundary for
//!   schemaless remote documents.
//! - [`persistence`] stores small JSON blobs (session, snapshot cache) on disk.

pub mod config;
pub mod persistence;
pub mod types;

pub use config::{AppConfig, LoggingConfig, RemoteConfig, RemoteMode, SessionConfig, SummarizerConfig};
pub use persistence::{FileStore, KeyValueStore, MemoryStore, SESSION_KEY, SNAPSHOT_KEY};
pub use types::{
    new_entity_id, patch_fields, Actor, ActorId, ActorPatch, Attachments, Comment, ConfigEntity,
    ConfigKind, ConfigPatch, DecodeError, Document, Entity, Fields, RecordId, RecordPatch, Role,
    TraceRecord,
};
