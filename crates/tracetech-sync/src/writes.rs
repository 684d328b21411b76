//! Optimistic writes against the remote store.
//!
//! Each write is validated locally, echoed into [`ReconciliationState`] as a
//! pending mutation, then issued to the remote store on a spawned task. The
//! task reports back through the engine's event queue; the coordinator then
//! clears the pending mark or rolls the mutation back.

use chrono::{NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracetech_config::{
    Actor, ActorId, Attachments, Comment, ConfigEntity, ConfigKind, Entity, Fields,
    Role, TraceRecord,
};
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;
use crate::error::{Result, SyncError};
use crate::reconcile::{
    CanonicalCollection, Change, DataMode, Mutation, OpId, PendingWrite, ReconciliationState,
};
use crate::remote::RemoteStore;

/// Upper bound on remembered outcomes nobody has taken yet. The oldest are
/// forgotten first.
pub const SETTLED_LIMIT: usize = 256;

/// How a write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The remote store accepted the write.
    Confirmed,
    /// Issued in local fallback mode; nothing was written anywhere.
    Discarded,
    /// The engine left cloud mode before the remote store answered.
    Detached,
}

/// Handle returned by every write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTicket {
    pub op: OpId,
    /// Id of the written entity. For creates this is the generated id.
    pub id: String,
    discarded: bool,
}

impl WriteTicket {
    /// Whether the write was accepted without durable effect.
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }
}

/// Remote call backing an optimistic write.
#[derive(Debug, Clone)]
pub enum RemoteWrite {
    Set {
        collection: &'static str,
        id: String,
        fields: Fields,
        merge: bool,
    },
    Update {
        collection: &'static str,
        id: String,
        fields: Fields,
    },
    Delete {
        collection: &'static str,
        id: String,
    },
}

impl RemoteWrite {
    pub async fn execute(self, store: &dyn RemoteStore) -> Result<()> {
        match self {
            RemoteWrite::Set {
                collection,
                id,
                fields,
                merge,
            } => store.set(collection, &id, fields, merge).await,
            RemoteWrite::Update {
                collection,
                id,
                fields,
            } => store.update(collection, &id, fields).await,
            RemoteWrite::Delete { collection, id } => store.delete(collection, &id).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            RemoteWrite::Set { collection, id, .. } => format!("set {}/{}", collection, id),
            RemoteWrite::Update { collection, id, .. } => format!("update {}/{}", collection, id),
            RemoteWrite::Delete { collection, id } => format!("delete {}/{}", collection, id),
        }
    }
}

/// Entities that can be written through the coordinator.
pub trait Writable: Entity {
    fn canonical(state: &ReconciliationState) -> &CanonicalCollection<Self>;

    fn pending(id: String, mutation: Mutation<Self>) -> PendingWrite;
}

impl Writable for TraceRecord {
    fn canonical(state: &ReconciliationState) -> &CanonicalCollection<Self> {
        state.records()
    }

    fn pending(id: String, mutation: Mutation<Self>) -> PendingWrite {
        PendingWrite::Record(id, mutation)
    }
}

impl Writable for Actor {
    fn canonical(state: &ReconciliationState) -> &CanonicalCollection<Self> {
        state.actors()
    }

    fn pending(id: String, mutation: Mutation<Self>) -> PendingWrite {
        PendingWrite::Actor(id, mutation)
    }
}

impl Writable for ConfigEntity {
    fn canonical(state: &ReconciliationState) -> &CanonicalCollection<Self> {
        state.vocabulary()
    }

    fn pending(id: String, mutation: Mutation<Self>) -> PendingWrite {
        PendingWrite::Config(id, mutation)
    }
}

/// Fields of a record to create.
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
    pub code: String,
    pub occurred_on: Option<NaiveDate>,
    pub category: String,
    pub description: String,
    pub status: String,
    pub assigned_actor_id: ActorId,
    pub attachments: Attachments,
    pub notes: Option<String>,
}

impl RecordDraft {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn assigned_to(mut self, actor_id: impl Into<String>) -> Self {
        self.assigned_actor_id = actor_id.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn into_record(self, id: String) -> TraceRecord {
        TraceRecord {
            id,
            code: self.code,
            occurred_on: self
                .occurred_on
                .unwrap_or_else(|| Utc::now().date_naive()),
            category: self.category,
            description: self.description,
            status: self.status,
            assigned_actor_id: self.assigned_actor_id,
            attachments: self.attachments,
            notes: self.notes.filter(|n| !n.trim().is_empty()),
        }
    }
}

/// Fields of an actor to create.
#[derive(Debug, Clone)]
pub struct ActorDraft {
    pub username: String,
    pub display_name: String,
    pub secret: String,
    pub role: Role,
    pub affiliation: Option<String>,
}

impl ActorDraft {
    pub fn into_actor(self, id: String) -> Actor {
        let mut actor = Actor::new(id, self.username, self.display_name, self.role);
        if !self.secret.is_empty() {
            actor = actor.with_secret(self.secret);
        }
        if let Some(affiliation) = self.affiliation.filter(|a| !a.trim().is_empty()) {
            actor = actor.with_affiliation(affiliation);
        }
        actor
    }
}

/// Fields of a vocabulary entry to create.
#[derive(Debug, Clone)]
pub struct ConfigDraft {
    pub name: String,
    pub description: String,
    pub kind: ConfigKind,
    pub icon_hint: Option<String>,
}

impl ConfigDraft {
    pub fn new(name: impl Into<String>, kind: ConfigKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            icon_hint: None,
        }
    }

    pub fn into_entity(self, id: String) -> ConfigEntity {
        let mut entity = ConfigEntity::new(id, self.name, self.kind);
        entity.description = self.description;
        entity.icon_hint = self.icon_hint;
        entity
    }
}

/// Issues writes and tracks them until the remote store answers.
pub struct WriteCoordinator {
    store: Arc<dyn RemoteStore>,
    events: UnboundedSender<EngineEvent>,
    next_op: u64,
    in_flight: HashMap<OpId, String>,
    settled: HashMap<OpId, Result<WriteOutcome>>,
    settled_order: VecDeque<OpId>,
}

impl WriteCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>, events: UnboundedSender<EngineEvent>) -> Self {
        Self {
            store,
            events,
            next_op: 0,
            in_flight: HashMap::new(),
            settled: HashMap::new(),
            settled_order: VecDeque::new(),
        }
    }

    fn allocate(&mut self) -> OpId {
        self.next_op += 1;
        OpId(self.next_op)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, op: OpId) -> bool {
        self.in_flight.contains_key(&op)
    }

    /// Number of outcomes waiting to be taken.
    pub fn retained_outcomes(&self) -> usize {
        self.settled.len()
    }

    /// Remove and return the outcome of a settled write.
    pub fn take_outcome(&mut self, op: OpId) -> Option<Result<WriteOutcome>> {
        let outcome = self.settled.remove(&op)?;
        self.settled_order.retain(|queued| *queued != op);
        Some(outcome)
    }

    fn record_outcome(&mut self, op: OpId, outcome: Result<WriteOutcome>) {
        self.settled.insert(op, outcome);
        self.settled_order.push_back(op);
        while self.settled_order.len() > SETTLED_LIMIT {
            if let Some(evicted) = self.settled_order.pop_front() {
                self.settled.remove(&evicted);
            }
        }
    }

    pub fn create<T: Writable>(
        &mut self,
        state: &mut ReconciliationState,
        entity: T,
    ) -> Result<WriteTicket> {
        let id = entity.id().to_string();
        if state.mode() == DataMode::LocalFallback {
            return Ok(self.discard(id, "create"));
        }
        let missing = entity.missing_fields();
        if !missing.is_empty() {
            return Err(SyncError::missing_fields(&missing));
        }
        if T::canonical(state).contains(&id) {
            return Err(SyncError::Validation(format!(
                "{}/{} already exists",
                T::COLLECTION,
                id
            )));
        }

        let mut fields = entity.to_document().fields;
        fields.insert(
            "createdAt".to_string(),
            JsonValue::String(Utc::now().to_rfc3339()),
        );
        let remote = RemoteWrite::Set {
            collection: T::COLLECTION,
            id: id.clone(),
            fields,
            merge: false,
        };
        Ok(self.submit(state, T::pending(id.clone(), Mutation::Upsert(entity)), remote, id))
    }

    pub fn update<T: Writable>(
        &mut self,
        state: &mut ReconciliationState,
        id: &str,
        patch: Fields,
    ) -> Result<WriteTicket> {
        if state.mode() == DataMode::LocalFallback {
            return Ok(self.discard(id.to_string(), "update"));
        }
        if patch.is_empty() {
            return Err(SyncError::Validation("nothing to update".to_string()));
        }
        let current = T::canonical(state)
            .get(id)
            .ok_or_else(|| SyncError::not_found(T::COLLECTION, id))?;
        let merged = current.merged(&patch)?;
        let missing = merged.missing_fields();
        if !missing.is_empty() {
            return Err(SyncError::missing_fields(&missing));
        }

        let remote = RemoteWrite::Update {
            collection: T::COLLECTION,
            id: id.to_string(),
            fields: patch.clone(),
        };
        Ok(self.submit(
            state,
            T::pending(id.to_string(), Mutation::Patch(patch)),
            remote,
            id.to_string(),
        ))
    }

    pub fn delete<T: Writable>(
        &mut self,
        state: &mut ReconciliationState,
        id: &str,
    ) -> Result<WriteTicket> {
        if state.mode() == DataMode::LocalFallback {
            return Ok(self.discard(id.to_string(), "delete"));
        }
        if !T::canonical(state).contains(id) {
            return Err(SyncError::not_found(T::COLLECTION, id));
        }
        let remote = RemoteWrite::Delete {
            collection: T::COLLECTION,
            id: id.to_string(),
        };
        Ok(self.submit(
            state,
            T::pending(id.to_string(), Mutation::Delete),
            remote,
            id.to_string(),
        ))
    }

    /// Post a comment into an open thread.
    pub fn comment(
        &mut self,
        state: &mut ReconciliationState,
        comment: Comment,
    ) -> Result<WriteTicket> {
        if state.mode() == DataMode::LocalFallback {
            return Ok(self.discard(comment.id, "comment"));
        }
        let missing = comment.missing_fields();
        if !missing.is_empty() {
            return Err(SyncError::missing_fields(&missing));
        }
        let id = comment.id.clone();
        let remote = RemoteWrite::Set {
            collection: Comment::COLLECTION,
            id: id.clone(),
            fields: comment.to_document().fields,
            merge: false,
        };
        let pending = PendingWrite::Comment {
            record_id: comment.record_id.clone(),
            id: id.clone(),
            mutation: Mutation::Upsert(comment),
        };
        Ok(self.submit(state, pending, remote, id))
    }

    /// Settle a write immediately as [`WriteOutcome::Discarded`].
    pub fn discard(&mut self, id: String, kind: &str) -> WriteTicket {
        let op = self.allocate();
        info!(op = %op, id = %id, kind, "write discarded in local fallback mode");
        self.record_outcome(op, Ok(WriteOutcome::Discarded));
        WriteTicket {
            op,
            id,
            discarded: true,
        }
    }

    fn submit(
        &mut self,
        state: &mut ReconciliationState,
        pending: PendingWrite,
        remote: RemoteWrite,
        id: String,
    ) -> WriteTicket {
        let op = self.allocate();
        state.apply(Change::Optimistic(op, pending));

        let description = remote.describe();
        debug!(op = %op, write = %description, "issuing remote write");
        self.in_flight.insert(op, description);

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = remote.execute(store.as_ref()).await;
            // The engine may be gone; nothing is left to reconcile then.
            let _ = events.send(EngineEvent::WriteSettled { op, result });
        });

        WriteTicket {
            op,
            id,
            discarded: false,
        }
    }

    /// Reconcile a remote answer. Answers for detached writes are ignored.
    pub fn settle(&mut self, state: &mut ReconciliationState, op: OpId, result: Result<()>) {
        let Some(description) = self.in_flight.remove(&op) else {
            debug!(op = %op, "ignoring answer for detached write");
            return;
        };
        match result {
            Ok(()) => {
                debug!(op = %op, write = %description, "remote write confirmed");
                state.apply(Change::Acknowledged(op));
                self.record_outcome(op, Ok(WriteOutcome::Confirmed));
            }
            Err(err) => {
                warn!(op = %op, write = %description, error = %err, "remote write failed, rolled back");
                state.apply(Change::Reverted(op));
                self.record_outcome(op, Err(err));
            }
        }
    }

    /// Stop tracking every in-flight write. Used when leaving cloud mode.
    pub fn detach_all(&mut self) {
        let mut detached: Vec<(OpId, String)> = self.in_flight.drain().collect();
        detached.sort_by_key(|(op, _)| *op);
        for (op, description) in detached {
            debug!(op = %op, write = %description, "detached in-flight write");
            self.record_outcome(op, Ok(WriteOutcome::Detached));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelStatus;
    use crate::fallback::LocalFallbackStore;
    use crate::memory::MemoryRemoteStore;
    use crate::reconcile::Watch;
    use tokio::sync::mpsc;
    use tracetech_config::{new_entity_id, patch_fields, RecordPatch};

    fn setup() -> (
        Arc<MemoryRemoteStore>,
        WriteCoordinator,
        ReconciliationState,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let store = Arc::new(MemoryRemoteStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = WriteCoordinator::new(store.clone(), tx);
        let mut state = ReconciliationState::new();
        state.apply(Change::Subscribing(Watch::Records));
        state.apply(Change::Snapshot(Watch::Records, Vec::new()));
        assert_eq!(state.channel_status(&Watch::Records), ChannelStatus::Synced);
        (store, coordinator, state, rx)
    }

    async fn settle_next(
        coordinator: &mut WriteCoordinator,
        state: &mut ReconciliationState,
        rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        match rx.recv().await {
            Some(EngineEvent::WriteSettled { op, result }) => coordinator.settle(state, op, result),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_is_visible_before_confirmation() {
        let (store, mut coordinator, mut state, mut rx) = setup();
        let record = RecordDraft::new("T-1", "x").assigned_to("2").into_record(new_entity_id());

        let ticket = coordinator.create(&mut state, record).unwrap();
        assert!(state.records().contains(&ticket.id));
        assert!(state.records().is_pending(&ticket.id));

        settle_next(&mut coordinator, &mut state, &mut rx).await;
        assert!(!state.records().is_pending(&ticket.id));
        assert_eq!(
            coordinator.take_outcome(ticket.op).unwrap(),
            Ok(WriteOutcome::Confirmed)
        );
        assert_eq!(store.documents("records")[0].id, ticket.id);
    }

    #[tokio::test]
    async fn missing_required_fields_never_reach_the_store() {
        let (store, mut coordinator, mut state, _rx) = setup();
        let record = RecordDraft::new("", "x").into_record(new_entity_id());

        let err = coordinator.create(&mut state, record).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(state.records().is_empty());
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn failed_write_rolls_back() {
        let (store, mut coordinator, mut state, mut rx) = setup();
        store.fail_next_write(SyncError::PermissionDenied("read-only".into()));
        let record = RecordDraft::new("T-1", "x").into_record(new_entity_id());

        let ticket = coordinator.create(&mut state, record).unwrap();
        settle_next(&mut coordinator, &mut state, &mut rx).await;

        assert!(state.records().is_empty());
        assert!(matches!(
            coordinator.take_outcome(ticket.op),
            Some(Err(SyncError::PermissionDenied(_)))
        ));
    }

    #[tokio::test]
    async fn update_and_delete_require_existing_target() {
        let (_store, mut coordinator, mut state, _rx) = setup();
        let patch = patch_fields(&RecordPatch::status("CERRADO"));
        assert!(matches!(
            coordinator.update::<TraceRecord>(&mut state, "ghost", patch),
            Err(SyncError::NotFound { .. })
        ));
        assert!(matches!(
            coordinator.delete::<TraceRecord>(&mut state, "ghost"),
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fallback_writes_are_discarded() {
        let (store, mut coordinator, mut state, _rx) = setup();
        state.apply(Change::EnterFallback(LocalFallbackStore::builtin()));

        let patch = patch_fields(&RecordPatch::status("PENDIENTE"));
        let ticket = coordinator
            .update::<TraceRecord>(&mut state, "r1", patch)
            .unwrap();
        assert!(ticket.is_discarded());
        // The seed dataset is untouched
        assert_eq!(state.records().get("r1").unwrap().status, "CERRADO");
        assert!(!state.records().is_pending("r1"));
        assert_eq!(
            coordinator.take_outcome(ticket.op).unwrap(),
            Ok(WriteOutcome::Discarded)
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn detached_writes_ignore_late_answers() {
        let (store, mut coordinator, mut state, mut rx) = setup();
        store.pause_writes();
        let record = RecordDraft::new("T-9", "late").into_record(new_entity_id());
        let ticket = coordinator.create(&mut state, record).unwrap();

        coordinator.detach_all();
        assert_eq!(
            coordinator.take_outcome(ticket.op).unwrap(),
            Ok(WriteOutcome::Detached)
        );

        store.resume_writes();
        settle_next(&mut coordinator, &mut state, &mut rx).await;
        assert!(coordinator.take_outcome(ticket.op).is_none());
    }

    #[tokio::test]
    async fn unclaimed_outcomes_stay_bounded() {
        let (_store, mut coordinator, mut state, mut rx) = setup();
        let total = SETTLED_LIMIT + 40;
        let mut tickets = Vec::new();
        for i in 0..total {
            let record = RecordDraft::new(format!("T-{}", i), "x").into_record(new_entity_id());
            tickets.push(coordinator.create(&mut state, record).unwrap());
        }
        for _ in 0..total {
            settle_next(&mut coordinator, &mut state, &mut rx).await;
        }
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(coordinator.retained_outcomes(), SETTLED_LIMIT);

        state.apply(Change::EnterFallback(LocalFallbackStore::builtin()));
        let mut last = None;
        for _ in 0..total {
            let patch = patch_fields(&RecordPatch::status("PENDIENTE"));
            last = Some(coordinator.update::<TraceRecord>(&mut state, "r1", patch).unwrap());
        }
        assert_eq!(coordinator.retained_outcomes(), SETTLED_LIMIT);
        // Oldest outcomes are forgotten first
        assert!(coordinator.take_outcome(tickets[0].op).is_none());
        assert_eq!(
            coordinator.take_outcome(last.unwrap().op).unwrap(),
            Ok(WriteOutcome::Discarded)
        );
        assert_eq!(coordinator.retained_outcomes(), SETTLED_LIMIT - 1);
    }
}
