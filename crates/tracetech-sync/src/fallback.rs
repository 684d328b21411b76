//! Static dataset used when the remote store is unavailable.
//!
//! The dataset is immutable once loaded. It comes either from the snapshot
//! cached under [`SNAPSHOT_KEY`] by a previous connected run, or from the
//! built-in seed.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracetech_config::persistence::{load_json, save_json};
use tracetech_config::{
    Actor, Attachments, ConfigEntity, ConfigKind, KeyValueStore, Role, TraceRecord, SNAPSHOT_KEY,
};
use tracing::{debug, warn};

use crate::error::Result;

/// Categories offered before any vocabulary has been configured.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Inspección Técnica",
    "Mantenimiento",
    "Reparación",
    "Auditoría",
];

/// Statuses offered before any vocabulary has been configured.
pub const DEFAULT_STATUSES: &[&str] = &["ACTIVO", "CERRADO", "EN REVISIÓN", "PENDIENTE"];

const SAMPLE_REPORT: &str = "https://www.w3.org/WAI/ER/tests/xhtml/testfiles/resources/pdf/dummy.pdf";

/// Canonical collections as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub records: Vec<TraceRecord>,
    pub actors: Vec<Actor>,
    #[serde(default)]
    pub vocabulary: Vec<ConfigEntity>,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSnapshot {
    pub fn load(store: &dyn KeyValueStore) -> Result<Option<Self>> {
        Ok(load_json(store, SNAPSHOT_KEY)?)
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(store, SNAPSHOT_KEY, self)?;
        debug!(
            records = self.records.len(),
            actors = self.actors.len(),
            "persisted snapshot"
        );
        Ok(())
    }
}

/// Where a [`LocalFallbackStore`] got its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSource {
    BuiltIn,
    Cached,
}

/// Read-only seed collections.
#[derive(Debug, Clone)]
pub struct LocalFallbackStore {
    records: Arc<[TraceRecord]>,
    actors: Arc<[Actor]>,
    vocabulary: Arc<[ConfigEntity]>,
    source: FallbackSource,
}

impl Default for LocalFallbackStore {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LocalFallbackStore {
    /// The built-in seed dataset.
    pub fn builtin() -> Self {
        Self {
            records: seed_records().into(),
            actors: seed_actors().into(),
            vocabulary: default_vocabulary().into(),
            source: FallbackSource::BuiltIn,
        }
    }

    pub fn from_snapshot(snapshot: PersistedSnapshot) -> Self {
        let vocabulary = if snapshot.vocabulary.is_empty() {
            default_vocabulary()
        } else {
            snapshot.vocabulary
        };
        Self {
            records: snapshot.records.into(),
            actors: snapshot.actors.into(),
            vocabulary: vocabulary.into(),
            source: FallbackSource::Cached,
        }
    }

    /// Prefer a cached snapshot; an unreadable or empty cache falls back to
    /// the built-in seed.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        match PersistedSnapshot::load(store) {
            Ok(Some(snapshot)) if !snapshot.actors.is_empty() => {
                debug!(saved_at = %snapshot.saved_at, "using cached snapshot as fallback");
                Self::from_snapshot(snapshot)
            }
            Ok(_) => Self::builtin(),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable cached snapshot");
                Self::builtin()
            }
        }
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    pub fn vocabulary(&self) -> &[ConfigEntity] {
        &self.vocabulary
    }

    pub fn source(&self) -> FallbackSource {
        self.source
    }
}

pub fn seed_actors() -> Vec<Actor> {
    vec![
        Actor::new("1", "admin", "Administrador", Role::Admin).with_secret("1234"),
        Actor::new("2", "cliente01", "Juan Pérez", Role::Client)
            .with_secret("123")
            .with_affiliation("Construcciones S.A."),
        Actor::new("3", "sergio", "Sergio Operador", Role::Operator)
            .with_secret("1234")
            .with_affiliation("X-Over Ops"),
    ]
}

pub fn seed_records() -> Vec<TraceRecord> {
    vec![
        TraceRecord {
            id: "r1".to_string(),
            code: "TRC-2024-001".to_string(),
            occurred_on: date(2024, 3, 15),
            category: "Inspección Técnica".to_string(),
            description: "Inspección estructural de soportes nivel 4.".to_string(),
            status: "CERRADO".to_string(),
            assigned_actor_id: "2".to_string(),
            attachments: Attachments {
                report_ref: Some(SAMPLE_REPORT.to_string()),
                ..Attachments::default()
            },
            notes: Some("Se detectó corrosión leve en el ala norte.".to_string()),
        },
        TraceRecord {
            id: "r2".to_string(),
            code: "TRC-2024-002".to_string(),
            occurred_on: date(2024, 3, 18),
            category: "Mantenimiento".to_string(),
            description: "Cambio de filtros y lubricación de motores primarios.".to_string(),
            status: "ACTIVO".to_string(),
            assigned_actor_id: "2".to_string(),
            attachments: Attachments {
                report_ref: Some(SAMPLE_REPORT.to_string()),
                ..Attachments::default()
            },
            notes: None,
        },
    ]
}

/// Vocabulary built from [`DEFAULT_CATEGORIES`] and [`DEFAULT_STATUSES`].
pub fn default_vocabulary() -> Vec<ConfigEntity> {
    let categories = DEFAULT_CATEGORIES
        .iter()
        .enumerate()
        .map(|(i, name)| ConfigEntity::new(format!("cat-{}", i + 1), *name, ConfigKind::Category));
    let statuses = DEFAULT_STATUSES
        .iter()
        .enumerate()
        .map(|(i, name)| ConfigEntity::new(format!("st-{}", i + 1), *name, ConfigKind::Status));
    categories.chain(statuses).collect()
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}
