//! Canonical in-memory state and the single entry point that mutates it.
//!
//! Every watched collection is held in a [`CanonicalCollection`]. Each entity
//! lives in a slot made of a *confirmed base* (what the last snapshot said)
//! and an ordered list of pending mutations issued locally. The visible value
//! is the base with the pending mutations folded over it, so:
//!
//! - a later local write always supersedes an earlier one, whatever order the
//!   remote acknowledgments come back in;
//! - rolling back a failed write is removing its mutation and folding again;
//! - a snapshot replaces every base wholesale and drops mutations the remote
//!   store has already confirmed.
//!
//! All changes go through [`ReconciliationState::apply`].

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracetech_config::{
    Actor, Comment, ConfigEntity, DecodeError, Document, Entity, Fields, RecordId, TraceRecord,
};
use tracing::{debug, info, warn};

use crate::channel::ChannelStatus;
use crate::error::ChannelError;
use crate::fallback::LocalFallbackStore;

/// Upper bound on remembered quarantined documents.
const QUARANTINE_LIMIT: usize = 64;

/// Identifier of a locally issued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// A locally issued change to one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
    /// Replace the entity entirely (creates).
    Upsert(T),
    /// Overlay a partial field map (updates).
    Patch(Fields),
    /// Tombstone the entity.
    Delete,
}

impl<T: Entity> Mutation<T> {
    fn apply(&self, current: Option<T>) -> Option<T> {
        match self {
            Mutation::Upsert(entity) => Some(entity.clone()),
            Mutation::Patch(fields) => current.map(|entity| match entity.merged(fields) {
                Ok(merged) => merged,
                Err(err) => {
                    warn!(collection = T::COLLECTION, error = %err, "pending patch no longer applies");
                    entity
                }
            }),
            Mutation::Delete => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingOp<T> {
    op: OpId,
    mutation: Mutation<T>,
    acked: bool,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    base: Option<T>,
    in_snapshot: bool,
    pending: Vec<PendingOp<T>>,
    value: Option<T>,
}

impl<T: Entity> Slot<T> {
    fn confirmed(entity: T) -> Self {
        Self {
            base: Some(entity.clone()),
            in_snapshot: true,
            pending: Vec::new(),
            value: Some(entity),
        }
    }

    fn recompute(&mut self) {
        self.value = self
            .pending
            .iter()
            .fold(self.base.clone(), |value, op| op.mutation.apply(value));
    }

    /// Move the leading run of acknowledged mutations into the base.
    fn promote(&mut self) {
        while self.pending.first().is_some_and(|op| op.acked) {
            let op = self.pending.remove(0);
            self.base = op.mutation.apply(self.base.take());
        }
    }

    /// Drop every mutation at or before the last acknowledged one: the
    /// snapshot that just arrived is authoritative for all of them.
    fn drop_confirmed(&mut self) {
        if let Some(last) = self.pending.iter().rposition(|op| op.acked) {
            self.pending.drain(..=last);
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.base.is_none()
    }
}

/// Where entities that exist only locally are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPlacement {
    /// Newest first, ahead of the snapshot order (records, actors).
    First,
    /// In creation order, after the snapshot order (comment threads).
    Last,
}

/// One canonical collection: a single copy of each entity keyed by id, in
/// the order established by the latest snapshot.
#[derive(Debug, Clone)]
pub struct CanonicalCollection<T> {
    order: Vec<String>,
    local: Vec<String>,
    slots: HashMap<String, Slot<T>>,
    placement: LocalPlacement,
}

impl<T: Entity> CanonicalCollection<T> {
    pub fn new(placement: LocalPlacement) -> Self {
        Self {
            order: Vec::new(),
            local: Vec::new(),
            slots: HashMap::new(),
            placement,
        }
    }

    /// Visible value of an entity, pending mutations included.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.slots.get(id).and_then(|slot| slot.value.as_ref())
    }

    /// Last confirmed value of an entity, ignoring pending mutations.
    pub fn confirmed(&self, id: &str) -> Option<&T> {
        self.slots.get(id).and_then(|slot| slot.base.as_ref())
    }

    /// Whether an entity has at least one unacknowledged mutation.
    pub fn is_pending(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.pending.iter().any(|op| !op.acked))
    }

    /// Whether an entity is hidden by a pending delete.
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.value.is_none() && !slot.pending.is_empty())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Visible entities in display order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let local: Vec<&String> = match self.placement {
            LocalPlacement::First => self.local.iter().rev().collect(),
            LocalPlacement::Last => self.local.iter().collect(),
        };
        let local_values = local
            .into_iter()
            .filter_map(|id| self.slots.get(id))
            .filter(|slot| !slot.in_snapshot)
            .filter_map(|slot| slot.value.as_ref());
        let snapshot_values = self
            .order
            .iter()
            .filter_map(|id| self.slots.get(id))
            .filter(|slot| slot.in_snapshot)
            .filter_map(|slot| slot.value.as_ref());

        let (before, after): (Vec<&T>, Vec<&T>) = match self.placement {
            LocalPlacement::First => (local_values.collect(), Vec::new()),
            LocalPlacement::Last => (Vec::new(), local_values.collect()),
        };
        before.into_iter().chain(snapshot_values).chain(after)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.pending.iter().any(|op| !op.acked))
            .count()
    }

    /// Replace the collection with an authoritative snapshot. Entities with
    /// unconfirmed mutations keep them, re-applied over the new base.
    pub fn replace(&mut self, entities: Vec<T>) {
        let mut order = Vec::with_capacity(entities.len());
        let mut incoming: HashMap<String, T> = HashMap::with_capacity(entities.len());
        for entity in entities {
            let id = entity.id().to_string();
            if incoming.insert(id.clone(), entity).is_none() {
                order.push(id);
            }
        }

        for (id, slot) in self.slots.iter_mut() {
            slot.drop_confirmed();
            slot.base = incoming.remove(id);
            slot.in_snapshot = slot.base.is_some();
            slot.recompute();
        }
        self.slots.retain(|_, slot| !slot.is_idle());
        for (id, entity) in incoming {
            self.slots.insert(id, Slot::confirmed(entity));
        }

        self.order = order;
        let slots = &self.slots;
        self.local
            .retain(|id| slots.get(id).is_some_and(|slot| !slot.in_snapshot));
    }

    /// Replace the collection and forget every pending mutation.
    pub fn reset(&mut self, entities: Vec<T>) {
        self.slots.clear();
        self.local.clear();
        self.replace(entities);
    }

    fn push(&mut self, id: &str, op: OpId, mutation: Mutation<T>) {
        let creates = matches!(mutation, Mutation::Upsert(_));
        let slot = self.slots.entry(id.to_string()).or_insert_with(|| Slot {
            base: None,
            in_snapshot: false,
            pending: Vec::new(),
            value: None,
        });
        slot.pending.push(PendingOp {
            op,
            mutation,
            acked: false,
        });
        slot.recompute();
        if creates && !slot.in_snapshot && !self.local.iter().any(|known| known == id) {
            self.local.push(id.to_string());
        }
    }

    fn acknowledge(&mut self, id: &str, op: OpId) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };
        let Some(entry) = slot.pending.iter_mut().find(|entry| entry.op == op) else {
            return false;
        };
        entry.acked = true;
        slot.promote();
        if slot.is_idle() {
            self.slots.remove(id);
        }
        true
    }

    fn revert(&mut self, id: &str, op: OpId) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };
        let before = slot.pending.len();
        slot.pending.retain(|entry| entry.op != op);
        if slot.pending.len() == before {
            return false;
        }
        slot.promote();
        slot.recompute();
        if slot.is_idle() {
            self.slots.remove(id);
            self.local.retain(|known| known != id);
        }
        true
    }
}

impl<T: Entity> Default for CanonicalCollection<T> {
    fn default() -> Self {
        Self::new(LocalPlacement::First)
    }
}

/// A watched remote source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Watch {
    Records,
    Actors,
    Vocabulary,
    Thread(RecordId),
}

impl Watch {
    /// The collections whose failure degrades the whole engine.
    pub const CORE: [Watch; 3] = [Watch::Records, Watch::Actors, Watch::Vocabulary];

    pub fn collection(&self) -> &'static str {
        match self {
            Watch::Records => TraceRecord::COLLECTION,
            Watch::Actors => Actor::COLLECTION,
            Watch::Vocabulary => ConfigEntity::COLLECTION,
            Watch::Thread(_) => Comment::COLLECTION,
        }
    }

    /// Records and actors are required to operate at all.
    pub fn is_essential(&self) -> bool {
        matches!(self, Watch::Records | Watch::Actors)
    }
}

impl std::fmt::Display for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Watch::Thread(record_id) => write!(f, "comments[{}]", record_id),
            other => f.write_str(other.collection()),
        }
    }
}

/// Where canonical data currently comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataMode {
    #[default]
    Cloud,
    LocalFallback,
}

/// Derived overall connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Syncing,
    Degraded(String),
    LocalFallback,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Synced => f.write_str("SYNCED"),
            SyncStatus::Syncing => f.write_str("SYNCING"),
            SyncStatus::Degraded(reason) => write!(f, "DEGRADED({})", reason),
            SyncStatus::LocalFallback => f.write_str("LOCAL_FALLBACK"),
        }
    }
}

/// A document that failed to decode and was kept out of canonical state.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedDocument {
    pub collection: &'static str,
    pub id: String,
    pub reason: String,
    pub received_at: DateTime<Utc>,
}

/// Addresses the slot an operation was applied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Record(String),
    Actor(String),
    Config(String),
    Comment { record_id: RecordId, id: String },
}

/// An optimistic mutation addressed to one entity.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    Record(String, Mutation<TraceRecord>),
    Actor(String, Mutation<Actor>),
    Config(String, Mutation<ConfigEntity>),
    Comment {
        record_id: RecordId,
        id: String,
        mutation: Mutation<Comment>,
    },
}

impl PendingWrite {
    pub fn key(&self) -> EntityKey {
        match self {
            PendingWrite::Record(id, _) => EntityKey::Record(id.clone()),
            PendingWrite::Actor(id, _) => EntityKey::Actor(id.clone()),
            PendingWrite::Config(id, _) => EntityKey::Config(id.clone()),
            PendingWrite::Comment { record_id, id, .. } => EntityKey::Comment {
                record_id: record_id.clone(),
                id: id.clone(),
            },
        }
    }
}

/// Every way canonical state can change.
#[derive(Debug)]
pub enum Change {
    /// A subscription for `watch` was issued.
    Subscribing(Watch),
    /// A channel delivered a full snapshot.
    Snapshot(Watch, Vec<Document>),
    /// A channel failed terminally.
    ChannelFailed(Watch, ChannelError),
    /// A subscription was cancelled. Closing a thread discards its comments.
    Closed(Watch),
    /// A local write was issued.
    Optimistic(OpId, PendingWrite),
    /// The remote store accepted a write.
    Acknowledged(OpId),
    /// The remote store rejected a write.
    Reverted(OpId),
    /// Switch to the fallback dataset.
    EnterFallback(LocalFallbackStore),
    /// Drop everything ahead of reopening live subscriptions.
    ResetForCloud,
}

/// The single owned copy of every watched collection plus connectivity.
#[derive(Debug)]
pub struct ReconciliationState {
    records: CanonicalCollection<TraceRecord>,
    actors: CanonicalCollection<Actor>,
    vocabulary: CanonicalCollection<ConfigEntity>,
    threads: HashMap<RecordId, CanonicalCollection<Comment>>,
    statuses: HashMap<Watch, ChannelStatus>,
    synced_once: HashSet<Watch>,
    ops: HashMap<OpId, EntityKey>,
    mode: DataMode,
    quarantine: VecDeque<QuarantinedDocument>,
}

impl Default for ReconciliationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self {
            records: CanonicalCollection::new(LocalPlacement::First),
            actors: CanonicalCollection::new(LocalPlacement::First),
            vocabulary: CanonicalCollection::new(LocalPlacement::First),
            threads: HashMap::new(),
            statuses: HashMap::new(),
            synced_once: HashSet::new(),
            ops: HashMap::new(),
            mode: DataMode::Cloud,
            quarantine: VecDeque::new(),
        }
    }

    pub fn records(&self) -> &CanonicalCollection<TraceRecord> {
        &self.records
    }

    pub fn actors(&self) -> &CanonicalCollection<Actor> {
        &self.actors
    }

    pub fn vocabulary(&self) -> &CanonicalCollection<ConfigEntity> {
        &self.vocabulary
    }

    /// Comments of an open thread.
    pub fn thread(&self, record_id: &str) -> Option<&CanonicalCollection<Comment>> {
        self.threads.get(record_id)
    }

    pub fn actor_by_username(&self, username: &str) -> Option<&Actor> {
        self.actors.iter().find(|actor| actor.username == username)
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    pub fn channel_status(&self, watch: &Watch) -> ChannelStatus {
        self.statuses.get(watch).cloned().unwrap_or_default()
    }

    /// Whether `watch` has delivered at least one snapshot since it was
    /// last (re)opened.
    pub fn has_synced(&self, watch: &Watch) -> bool {
        self.synced_once.contains(watch)
    }

    pub fn quarantine(&self) -> impl Iterator<Item = &QuarantinedDocument> {
        self.quarantine.iter()
    }

    pub fn status(&self) -> SyncStatus {
        if self.mode == DataMode::LocalFallback {
            return SyncStatus::LocalFallback;
        }
        let mut syncing = false;
        for watch in Watch::CORE.iter() {
            match self.channel_status(watch) {
                ChannelStatus::Error(err) => {
                    return SyncStatus::Degraded(format!("{}: {}", watch, err));
                }
                ChannelStatus::Synced => {}
                ChannelStatus::Unsubscribed | ChannelStatus::Subscribing => syncing = true,
            }
        }
        if syncing {
            SyncStatus::Syncing
        } else {
            SyncStatus::Synced
        }
    }

    /// The mutation entry point.
    pub fn apply(&mut self, change: Change) {
        match change {
            Change::Subscribing(watch) => {
                if let Watch::Thread(record_id) = &watch {
                    self.threads
                        .entry(record_id.clone())
                        .or_insert_with(|| CanonicalCollection::new(LocalPlacement::Last));
                }
                self.synced_once.remove(&watch);
                self.statuses.insert(watch, ChannelStatus::Subscribing);
            }
            Change::Snapshot(watch, docs) => self.apply_snapshot(watch, docs),
            Change::ChannelFailed(watch, error) => {
                warn!(watch = %watch, error = %error, "channel failed");
                let next = self
                    .channel_status(&watch)
                    .on_item(&Err(error));
                self.statuses.insert(watch, next);
            }
            Change::Closed(watch) => {
                if let Watch::Thread(record_id) = &watch {
                    self.threads.remove(record_id);
                    self.ops.retain(|_, key| {
                        !matches!(key, EntityKey::Comment { record_id: owner, .. } if owner == record_id)
                    });
                }
                self.synced_once.remove(&watch);
                self.statuses.remove(&watch);
            }
            Change::Optimistic(op, write) => self.apply_optimistic(op, write),
            Change::Acknowledged(op) => {
                if let Some(key) = self.ops.remove(&op) {
                    self.settle(op, &key, true);
                }
            }
            Change::Reverted(op) => {
                if let Some(key) = self.ops.remove(&op) {
                    self.settle(op, &key, false);
                }
            }
            Change::EnterFallback(store) => {
                self.records.reset(store.records().to_vec());
                self.actors.reset(store.actors().to_vec());
                self.vocabulary.reset(store.vocabulary().to_vec());
                self.threads.clear();
                self.statuses.clear();
                self.synced_once.clear();
                self.ops.clear();
                self.mode = DataMode::LocalFallback;
                info!(
                    records = self.records.len(),
                    actors = self.actors.len(),
                    source = ?store.source(),
                    "loaded fallback dataset"
                );
            }
            Change::ResetForCloud => {
                self.records.reset(Vec::new());
                self.actors.reset(Vec::new());
                self.vocabulary.reset(Vec::new());
                self.threads.clear();
                self.statuses.clear();
                self.synced_once.clear();
                self.ops.clear();
                self.mode = DataMode::Cloud;
            }
        }
    }

    fn apply_snapshot(&mut self, watch: Watch, docs: Vec<Document>) {
        let status = self.channel_status(&watch);
        if status.is_error() {
            debug!(watch = %watch, "ignoring snapshot for failed channel");
            return;
        }
        let count = docs.len();
        match &watch {
            Watch::Records => {
                let entities = self.decode_all::<TraceRecord>(&docs);
                self.records.replace(entities);
            }
            Watch::Actors => {
                let entities = self.decode_all::<Actor>(&docs);
                self.actors.replace(entities);
            }
            Watch::Vocabulary => {
                let entities = self.decode_all::<ConfigEntity>(&docs);
                self.vocabulary.replace(entities);
            }
            Watch::Thread(record_id) => {
                if !self.threads.contains_key(record_id) {
                    debug!(watch = %watch, "ignoring snapshot for closed thread");
                    return;
                }
                let mut entities = self.decode_all::<Comment>(&docs);
                entities.retain(|comment| {
                    let belongs = &comment.record_id == record_id;
                    if !belongs {
                        self.quarantine.push_back(QuarantinedDocument {
                            collection: Comment::COLLECTION,
                            id: comment.id.clone(),
                            reason: format!("comment belongs to record '{}'", comment.record_id),
                            received_at: Utc::now(),
                        });
                    }
                    belongs
                });
                self.trim_quarantine();
                if let Some(thread) = self.threads.get_mut(record_id) {
                    thread.replace(entities);
                }
            }
        }
        debug!(watch = %watch, documents = count, "applied snapshot");
        self.statuses.insert(watch.clone(), status.on_item(&Ok(Vec::new())));
        self.synced_once.insert(watch);
    }

    fn decode_all<T: Entity>(&mut self, docs: &[Document]) -> Vec<T> {
        let mut entities = Vec::with_capacity(docs.len());
        for doc in docs {
            match T::from_document(doc) {
                Ok(entity) => entities.push(entity),
                Err(err) => self.quarantine_document(doc, err),
            }
        }
        entities
    }

    fn quarantine_document(&mut self, doc: &Document, err: DecodeError) {
        let collection = match &err {
            DecodeError::Malformed { collection, .. } | DecodeError::InvalidPatch { collection, .. } => {
                *collection
            }
        };
        warn!(collection, id = %doc.id, error = %err, "quarantined malformed document");
        self.quarantine.push_back(QuarantinedDocument {
            collection,
            id: doc.id.clone(),
            reason: err.to_string(),
            received_at: Utc::now(),
        });
        self.trim_quarantine();
    }

    fn trim_quarantine(&mut self) {
        while self.quarantine.len() > QUARANTINE_LIMIT {
            self.quarantine.pop_front();
        }
    }

    fn apply_optimistic(&mut self, op: OpId, write: PendingWrite) {
        let key = write.key();
        match write {
            PendingWrite::Record(id, mutation) => self.records.push(&id, op, mutation),
            PendingWrite::Actor(id, mutation) => self.actors.push(&id, op, mutation),
            PendingWrite::Config(id, mutation) => self.vocabulary.push(&id, op, mutation),
            PendingWrite::Comment {
                record_id,
                id,
                mutation,
            } => match self.threads.get_mut(&record_id) {
                Some(thread) => thread.push(&id, op, mutation),
                None => {
                    debug!(record_id = %record_id, "thread closed, comment not echoed");
                    return;
                }
            },
        }
        self.ops.insert(op, key);
    }

    fn settle(&mut self, op: OpId, key: &EntityKey, accepted: bool) {
        let applied = match key {
            EntityKey::Record(id) => settle_in(&mut self.records, id, op, accepted),
            EntityKey::Actor(id) => settle_in(&mut self.actors, id, op, accepted),
            EntityKey::Config(id) => settle_in(&mut self.vocabulary, id, op, accepted),
            EntityKey::Comment { record_id, id } => match self.threads.get_mut(record_id) {
                Some(thread) => settle_in(thread, id, op, accepted),
                None => false,
            },
        };
        if !applied {
            debug!(op = %op, "operation already superseded by a snapshot");
        }
    }
}

fn settle_in<T: Entity>(
    collection: &mut CanonicalCollection<T>,
    id: &str,
    op: OpId,
    accepted: bool,
) -> bool {
    if accepted {
        collection.acknowledge(id, op)
    } else {
        collection.revert(id, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use tracetech_config::{patch_fields, Attachments, RecordPatch, Role};

    fn record(id: &str, assigned: &str, status: &str) -> TraceRecord {
        TraceRecord {
            id: id.to_string(),
            code: format!("TRC-{}", id),
            occurred_on: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            category: "Mantenimiento".to_string(),
            description: "Cambio de filtros".to_string(),
            status: status.to_string(),
            assigned_actor_id: assigned.to_string(),
            attachments: Attachments::default(),
            notes: None,
        }
    }

    fn docs(records: &[TraceRecord]) -> Vec<Document> {
        records.iter().map(Entity::to_document).collect()
    }

    fn synced_state(records: &[TraceRecord]) -> ReconciliationState {
        let mut state = ReconciliationState::new();
        state.apply(Change::Subscribing(Watch::Records));
        state.apply(Change::Snapshot(Watch::Records, docs(records)));
        state
    }

    fn status_patch(status: &str) -> Mutation<TraceRecord> {
        Mutation::Patch(patch_fields(&RecordPatch::status(status)))
    }

    #[test]
    fn snapshot_replaces_collection_in_order() {
        let mut state = synced_state(&[record("r1", "2", "ACTIVO"), record("r2", "3", "ACTIVO")]);
        state.apply(Change::Snapshot(
            Watch::Records,
            docs(&[record("r3", "2", "CERRADO"), record("r1", "2", "CERRADO")]),
        ));

        let ids: Vec<_> = state.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r1"]);
        assert_eq!(state.records().get("r1").unwrap().status, "CERRADO");
        assert!(state.records().get("r2").is_none());
    }

    #[test]
    fn malformed_documents_are_quarantined() {
        let mut state = ReconciliationState::new();
        let mut bad = Fields::new();
        bad.insert("code".to_string(), json!("X"));
        state.apply(Change::Snapshot(
            Watch::Records,
            vec![
                Document::new("bad", bad),
                record("r1", "2", "ACTIVO").to_document(),
            ],
        ));

        assert_eq!(state.records().len(), 1);
        let quarantined: Vec<_> = state.quarantine().collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].id, "bad");
        assert_eq!(quarantined[0].collection, "records");
    }

    #[test]
    fn later_local_write_wins_regardless_of_ack_order() {
        let mut state = synced_state(&[record("r1", "2", "ACTIVO")]);
        state.apply(Change::Optimistic(OpId(1), PendingWrite::Record("r1".into(), status_patch("A"))));
        state.apply(Change::Optimistic(OpId(2), PendingWrite::Record("r1".into(), status_patch("B"))));
        assert_eq!(state.records().get("r1").unwrap().status, "B");

        state.apply(Change::Acknowledged(OpId(2)));
        assert_eq!(state.records().get("r1").unwrap().status, "B");
        assert!(state.records().is_pending("r1"));

        state.apply(Change::Acknowledged(OpId(1)));
        assert_eq!(state.records().get("r1").unwrap().status, "B");
        assert!(!state.records().is_pending("r1"));
        assert_eq!(state.records().confirmed("r1").unwrap().status, "B");
    }

    #[test]
    fn revert_restores_pre_write_value() {
        let before = record("r1", "2", "ACTIVO");
        let mut state = synced_state(&[before.clone()]);

        state.apply(Change::Optimistic(OpId(7), PendingWrite::Record("r1".into(), Mutation::Delete)));
        assert!(state.records().get("r1").is_none());
        assert!(state.records().is_tombstoned("r1"));

        state.apply(Change::Reverted(OpId(7)));
        assert_eq!(state.records().get("r1"), Some(&before));
        assert!(!state.records().is_pending("r1"));
    }

    #[test]
    fn reverting_earlier_write_keeps_later_one() {
        let mut state = synced_state(&[record("r1", "2", "ACTIVO")]);
        state.apply(Change::Optimistic(OpId(1), PendingWrite::Record("r1".into(), status_patch("A"))));
        state.apply(Change::Optimistic(OpId(2), PendingWrite::Record("r1".into(), status_patch("B"))));
        state.apply(Change::Reverted(OpId(1)));
        assert_eq!(state.records().get("r1").unwrap().status, "B");
        state.apply(Change::Reverted(OpId(2)));
        assert_eq!(state.records().get("r1").unwrap().status, "ACTIVO");
    }

    #[test]
    fn snapshot_keeps_unconfirmed_mutations_on_top() {
        let mut state = synced_state(&[record("r1", "2", "ACTIVO")]);
        state.apply(Change::Optimistic(OpId(1), PendingWrite::Record("r1".into(), status_patch("B"))));

        // A snapshot that predates the write changes the base only
        let mut remote = record("r1", "2", "ACTIVO");
        remote.description = "Actualizado".to_string();
        state.apply(Change::Snapshot(Watch::Records, docs(&[remote])));

        let visible = state.records().get("r1").unwrap();
        assert_eq!(visible.status, "B");
        assert_eq!(visible.description, "Actualizado");
        assert!(state.records().is_pending("r1"));

        // Everything not pending equals the snapshot
        assert_eq!(state.records().confirmed("r1").unwrap().status, "ACTIVO");
    }

    #[test]
    fn snapshot_drops_acknowledged_mutations() {
        let mut state = synced_state(&[record("r1", "2", "ACTIVO")]);
        state.apply(Change::Optimistic(OpId(1), PendingWrite::Record("r1".into(), status_patch("A"))));
        state.apply(Change::Optimistic(OpId(2), PendingWrite::Record("r1".into(), status_patch("B"))));
        state.apply(Change::Acknowledged(OpId(2)));

        state.apply(Change::Snapshot(Watch::Records, docs(&[record("r1", "2", "Z")])));
        assert_eq!(state.records().get("r1").unwrap().status, "Z");
        assert!(!state.records().is_pending("r1"));
    }

    #[test]
    fn local_creates_are_listed_first_until_confirmed() {
        let mut state = synced_state(&[record("r1", "2", "ACTIVO")]);
        let created = record("n1", "2", "PENDIENTE");
        state.apply(Change::Optimistic(
            OpId(1),
            PendingWrite::Record("n1".into(), Mutation::Upsert(created.clone())),
        ));

        let ids: Vec<_> = state.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "r1"]);

        state.apply(Change::Acknowledged(OpId(1)));
        state.apply(Change::Snapshot(
            Watch::Records,
            docs(&[record("r1", "2", "ACTIVO"), created]),
        ));
        let ids: Vec<_> = state.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "n1"]);
    }

    #[test]
    fn closing_thread_discards_only_its_comments() {
        let mut state = ReconciliationState::new();
        let comment = |id: &str, record: &str| Comment {
            id: id.to_string(),
            record_id: record.to_string(),
            author_id: "2".to_string(),
            author_name: "Juan".to_string(),
            text: "ok".to_string(),
            posted_at: Utc::now(),
        };

        for record_id in ["r1", "r2"] {
            state.apply(Change::Subscribing(Watch::Thread(record_id.into())));
        }
        state.apply(Change::Snapshot(
            Watch::Thread("r1".into()),
            vec![comment("c1", "r1").to_document()],
        ));
        state.apply(Change::Snapshot(
            Watch::Thread("r2".into()),
            vec![comment("c2", "r2").to_document()],
        ));

        state.apply(Change::Closed(Watch::Thread("r1".into())));
        assert!(state.thread("r1").is_none());
        assert_eq!(state.thread("r2").unwrap().len(), 1);

        // Late emission for the closed thread is ignored
        state.apply(Change::Snapshot(
            Watch::Thread("r1".into()),
            vec![comment("c3", "r1").to_document()],
        ));
        assert!(state.thread("r1").is_none());
    }

    #[test]
    fn overall_status_derivation() {
        let mut state = ReconciliationState::new();
        assert_eq!(state.status(), SyncStatus::Syncing);

        for watch in Watch::CORE {
            state.apply(Change::Subscribing(watch.clone()));
            state.apply(Change::Snapshot(watch, Vec::new()));
        }
        assert_eq!(state.status(), SyncStatus::Synced);

        state.apply(Change::ChannelFailed(
            Watch::Actors,
            ChannelError::PermissionDenied("missing or insufficient permissions".into()),
        ));
        assert!(matches!(state.status(), SyncStatus::Degraded(reason) if reason.starts_with("users")));

        // A failed instance ignores later snapshots
        state.apply(Change::Snapshot(Watch::Actors, Vec::new()));
        assert!(state.channel_status(&Watch::Actors).is_error());

        state.apply(Change::EnterFallback(LocalFallbackStore::builtin()));
        assert_eq!(state.status(), SyncStatus::LocalFallback);
        assert_eq!(state.actors().len(), 3);
        assert!(state.actor_by_username("admin").is_some_and(|a| a.role == Role::Admin));
    }
}
