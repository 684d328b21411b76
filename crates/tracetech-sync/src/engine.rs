//! The synchronization engine: one owner for canonical state, one event queue.
//!
//! Channel forwarders and remote write tasks never touch state. They post
//! [`EngineEvent`]s into the engine's queue and the engine applies them one at
//! a time when the caller pumps it ([`SyncEngine::process_pending`],
//! [`SyncEngine::next_event`], [`SyncEngine::pump_until`]). Every mutation thus
//! happens on the caller's logical thread and no locking is needed.
//!
//! Each opened subscription gets a fresh [`SubscriptionId`]. Emissions tagged
//! with an id that is no longer registered are dropped, so a closed thread can
//! never be written to by its old channel.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracetech_config::{
    new_entity_id, patch_fields, Actor, ActorPatch, AppConfig, Comment, ConfigEntity, ConfigPatch,
    Entity, KeyValueStore, RecordPatch, RemoteConfig, RemoteMode, TraceRecord,
};
use tracing::{debug, info, warn};

use crate::attachments::{self, AttachmentKind};
use crate::channel::{ActiveChannel, ChannelStatus, SubscriptionId};
use crate::error::{Result, SyncError};
use crate::fallback::{seed_actors, seed_records, LocalFallbackStore, PersistedSnapshot};
use crate::insights::{summarizer_from_config, Summarizer, SummaryService};
use crate::memory::MemoryObjectStore;
use crate::projection::{RecordFilter, RecordStats, ViewProjector};
use crate::reconcile::{Change, DataMode, OpId, ReconciliationState, SyncStatus, Watch};
use crate::remote::{ChannelItem, CollectionQuery, ObjectStore, RemoteStore};
use crate::seed::{self, SeedReport};
use crate::session::{Action, SessionContext};
use crate::writes::{
    ActorDraft, ConfigDraft, RecordDraft, WriteCoordinator, WriteOutcome, WriteTicket,
};

/// Field comments are ordered by.
const COMMENT_ORDER_FIELD: &str = "createdAt";

/// Work posted to the engine by background tasks.
#[derive(Debug)]
pub enum EngineEvent {
    Channel {
        subscription: SubscriptionId,
        item: ChannelItem,
    },
    WriteSettled {
        op: OpId,
        result: Result<()>,
    },
}

pub struct SyncEngine {
    settings: RemoteConfig,
    remote: Arc<dyn RemoteStore>,
    objects: Arc<dyn ObjectStore>,
    local: Arc<dyn KeyValueStore>,
    state: ReconciliationState,
    writes: WriteCoordinator,
    session: SessionContext,
    summaries: SummaryService,
    channels: HashMap<Watch, ActiveChannel>,
    next_subscription: u64,
    drift_reported: bool,
    /// Session actor as it was before each in-flight write to its own profile.
    profile_writes: HashMap<OpId, Actor>,
    events: UnboundedSender<EngineEvent>,
    inbox: UnboundedReceiver<EngineEvent>,
}

impl SyncEngine {
    /// Build an engine. Nothing is subscribed until [`SyncEngine::start`].
    pub fn new(
        config: &AppConfig,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        Self {
            settings: config.remote.clone(),
            writes: WriteCoordinator::new(Arc::clone(&remote), events.clone()),
            session: SessionContext::restore(Arc::clone(&local), config.login_delay()),
            summaries: SummaryService::new(summarizer_from_config(&config.summarizer)),
            objects: Arc::new(MemoryObjectStore::new()),
            remote,
            local,
            state: ReconciliationState::new(),
            channels: HashMap::new(),
            next_subscription: 0,
            drift_reported: false,
            profile_writes: HashMap::new(),
            events,
            inbox,
        }
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summaries = SummaryService::new(summarizer);
        self
    }

    /// Enter the configured mode.
    pub fn start(&mut self) {
        match self.settings.mode {
            RemoteMode::Cloud => self.connect(),
            RemoteMode::Local => self.enter_fallback(),
        }
    }

    /// Drop all canonical data and open fresh subscriptions to the core
    /// collections.
    pub fn connect(&mut self) {
        self.channels.clear();
        self.restore_detached_profile();
        self.writes.detach_all();
        self.state.apply(Change::ResetForCloud);
        self.settings.mode = RemoteMode::Cloud;
        for watch in Watch::CORE {
            self.open(watch);
        }
        self.drift_reported = false;
        info!("connecting to remote store");
    }

    /// Cancel every subscription and serve the fallback dataset.
    pub fn enter_fallback(&mut self) {
        self.channels.clear();
        self.restore_detached_profile();
        self.writes.detach_all();
        let store = LocalFallbackStore::load(self.local.as_ref());
        self.state.apply(Change::EnterFallback(store));
        self.settings.mode = RemoteMode::Local;
        self.drift_reported = false;
        self.report_session_drift();
        info!("entered local fallback mode");
    }

    /// Switch modes. Recovery from a failed channel is a switch to cloud.
    pub fn set_mode(&mut self, mode: RemoteMode) {
        match mode {
            RemoteMode::Cloud => self.connect(),
            RemoteMode::Local => self.enter_fallback(),
        }
    }

    fn query_for(&self, watch: &Watch) -> CollectionQuery {
        match watch {
            Watch::Records => {
                CollectionQuery::new(watch.collection(), &self.settings.records_order_field)
            }
            Watch::Actors => {
                CollectionQuery::new(watch.collection(), &self.settings.users_order_field)
                    .ascending()
            }
            Watch::Vocabulary => {
                CollectionQuery::new(watch.collection(), &self.settings.settings_order_field)
                    .ascending()
            }
            Watch::Thread(record_id) => CollectionQuery::new(watch.collection(), COMMENT_ORDER_FIELD)
                .ascending()
                .where_eq("recordId", record_id.as_str()),
        }
    }

    fn open(&mut self, watch: Watch) {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        let query = self.query_for(&watch);
        let channel = ActiveChannel::spawn(
            id,
            Arc::clone(&self.remote),
            query,
            self.events.clone(),
            |subscription, item| EngineEvent::Channel { subscription, item },
        );
        self.state.apply(Change::Subscribing(watch.clone()));
        // Replacing an entry drops, and so cancels, the previous instance
        self.channels.insert(watch, channel);
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Channel { subscription, item } => {
                let watch = self
                    .channels
                    .iter()
                    .find(|(_, channel)| channel.id == subscription)
                    .map(|(watch, _)| watch.clone());
                let Some(watch) = watch else {
                    debug!(subscription = %subscription, "dropping emission from closed subscription");
                    return;
                };
                match item {
                    Ok(docs) => {
                        let actors = watch == Watch::Actors;
                        self.state.apply(Change::Snapshot(watch, docs));
                        if actors {
                            self.report_session_drift();
                        }
                    }
                    Err(error) => {
                        let before_first_snapshot = !self.state.has_synced(&watch);
                        self.channels.remove(&watch);
                        self.state.apply(Change::ChannelFailed(watch.clone(), error));
                        if watch.is_essential()
                            && before_first_snapshot
                            && self.settings.fallback_on_startup_error
                        {
                            warn!(watch = %watch, "core channel failed at startup, switching to fallback");
                            self.enter_fallback();
                        }
                    }
                }
            }
            EngineEvent::WriteSettled { op, result } => {
                let failed = result.is_err();
                self.writes.settle(&mut self.state, op, result);
                if let Some(before) = self.profile_writes.remove(&op) {
                    if failed {
                        // The reverted slot still folds any later pending edits
                        let actor = self.state.actors().get(&before.id).cloned().unwrap_or(before);
                        self.refresh_session(&actor);
                    }
                }
            }
        }
    }

    /// Put back the session actor from before the oldest unanswered profile
    /// write. Its outcome will never be known once the write is detached.
    fn restore_detached_profile(&mut self) {
        let oldest = self.profile_writes.keys().min().copied();
        if let Some(actor) = oldest.and_then(|op| self.profile_writes.remove(&op)) {
            debug!(actor = %actor.username, "restoring session profile of detached write");
            self.refresh_session(&actor);
        }
        self.profile_writes.clear();
    }

    fn refresh_session(&mut self, actor: &Actor) {
        if let Err(err) = self.session.refresh(actor) {
            warn!(error = %err, "failed to persist the session actor");
        }
    }

    fn report_session_drift(&mut self) {
        if self.drift_reported {
            return;
        }
        let stale = self.session.stale_fields(&self.state);
        if !stale.is_empty() {
            warn!(fields = ?stale, "session actor differs from the authoritative actor set");
            self.drift_reported = true;
        }
    }

    /// Apply every event already queued, without waiting. Returns how many
    /// were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle(event);
            applied += 1;
        }
        applied
    }

    /// Wait for the next event and apply it.
    pub async fn next_event(&mut self) {
        if let Some(event) = self.inbox.recv().await {
            self.handle(event);
        }
    }

    /// Apply events until `done` holds. There is no timeout: a stalled
    /// channel keeps this waiting.
    pub async fn pump_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&Self) -> bool,
    {
        while !done(self) {
            self.next_event().await;
        }
    }

    /// Wait until the engine is no longer [`SyncStatus::Syncing`].
    pub async fn wait_until_ready(&mut self) {
        self.pump_until(|engine| engine.status() != SyncStatus::Syncing)
            .await;
    }

    /// Wait for the outcome of a write. Rolled-back writes return their error.
    pub async fn settle(&mut self, ticket: &WriteTicket) -> Result<WriteOutcome> {
        loop {
            if let Some(outcome) = self.writes.take_outcome(ticket.op) {
                return outcome;
            }
            if !self.writes.is_in_flight(ticket.op) {
                return Err(SyncError::Internal(format!(
                    "outcome of {} is no longer tracked",
                    ticket.op
                )));
            }
            self.next_event().await;
        }
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status()
    }

    pub fn mode(&self) -> DataMode {
        self.state.mode()
    }

    pub fn channel_status(&self, watch: &Watch) -> ChannelStatus {
        self.state.channel_status(watch)
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn current_actor(&self) -> Option<&Actor> {
        self.session.current()
    }

    /// Read view for the current actor.
    pub fn projector(&self) -> ViewProjector<'_> {
        ViewProjector::new(&self.state, self.session.current())
    }

    pub fn stats(&self, filter: &RecordFilter) -> RecordStats {
        self.projector().stats(filter)
    }

    pub async fn login(&mut self, username: &str, secret: &str) -> Result<Actor> {
        let actor = self.session.login(&self.state, username, secret).await?;
        self.drift_reported = false;
        Ok(actor)
    }

    pub fn logout(&mut self) -> Result<()> {
        self.session.logout()
    }

    pub fn create_record(&mut self, draft: RecordDraft) -> Result<WriteTicket> {
        self.session.authorize(Action::WriteRecords)?;
        let record = draft.into_record(new_entity_id());
        self.writes.create(&mut self.state, record)
    }

    pub fn update_record(&mut self, id: &str, patch: RecordPatch) -> Result<WriteTicket> {
        self.session.authorize(Action::WriteRecords)?;
        let ticket = self
            .writes
            .update::<TraceRecord>(&mut self.state, id, patch_fields(&patch))?;
        if patch.description.is_some() || patch.category.is_some() {
            self.summaries.invalidate(id);
        }
        Ok(ticket)
    }

    pub fn delete_record(&mut self, id: &str) -> Result<WriteTicket> {
        self.session.authorize(Action::WriteRecords)?;
        let ticket = self.writes.delete::<TraceRecord>(&mut self.state, id)?;
        self.summaries.invalidate(id);
        Ok(ticket)
    }

    /// Upload a file and attach the resulting reference to a record.
    pub async fn attach(
        &mut self,
        record_id: &str,
        kind: AttachmentKind,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<WriteTicket> {
        self.session.authorize(Action::WriteRecords)?;
        if self.state.mode() == DataMode::LocalFallback {
            return Ok(self.writes.discard(record_id.to_string(), "attach"));
        }
        if !self.state.records().contains(record_id) {
            return Err(SyncError::not_found(TraceRecord::COLLECTION, record_id));
        }
        let patch = attachments::upload(self.objects.as_ref(), kind, file_name, bytes).await?;
        self.update_record(record_id, patch)
    }

    pub fn create_actor(&mut self, draft: ActorDraft) -> Result<WriteTicket> {
        self.session.authorize(Action::ManageActors)?;
        if self.state.actor_by_username(&draft.username).is_some() {
            return Err(SyncError::Validation(format!(
                "username '{}' is already taken",
                draft.username
            )));
        }
        let actor = draft.into_actor(new_entity_id());
        self.writes.create(&mut self.state, actor)
    }

    /// Update an actor. Actors may edit their own profile except for the
    /// role; anything else requires ADMIN.
    pub fn update_actor(&mut self, id: &str, patch: ActorPatch) -> Result<WriteTicket> {
        self.session.authorize(Action::UpdateProfile {
            actor_id: id,
            changes_role: patch.role.is_some(),
        })?;
        if let Some(username) = &patch.username {
            if self
                .state
                .actor_by_username(username)
                .is_some_and(|other| other.id != id)
            {
                return Err(SyncError::Validation(format!(
                    "username '{}' is already taken",
                    username
                )));
            }
        }
        let before = self
            .session
            .current()
            .filter(|actor| actor.id == id)
            .cloned();
        let ticket = self
            .writes
            .update::<Actor>(&mut self.state, id, patch_fields(&patch))?;
        if let Some(before) = before {
            if !ticket.is_discarded() {
                self.profile_writes.insert(ticket.op, before);
            }
            if let Some(updated) = self.state.actors().get(id) {
                self.session.refresh(updated)?;
            }
        }
        Ok(ticket)
    }

    /// Update the current actor's own profile.
    pub fn update_profile(&mut self, patch: ActorPatch) -> Result<WriteTicket> {
        let id = self
            .session
            .current()
            .map(|actor| actor.id.clone())
            .ok_or(SyncError::NotAuthenticated)?;
        self.update_actor(&id, patch)
    }

    /// Delete an actor. Actors still assigned to records are kept.
    pub fn delete_actor(&mut self, id: &str) -> Result<WriteTicket> {
        let current = self.session.authorize(Action::ManageActors)?;
        if current.id == id {
            return Err(SyncError::Validation("cannot delete the signed-in actor".to_string()));
        }
        let assigned = self
            .state
            .records()
            .iter()
            .filter(|record| record.assigned_actor_id == id)
            .count();
        if assigned > 0 {
            return Err(SyncError::Validation(format!(
                "actor is assigned to {} record(s)",
                assigned
            )));
        }
        self.writes.delete::<Actor>(&mut self.state, id)
    }

    pub fn create_config(&mut self, draft: ConfigDraft) -> Result<WriteTicket> {
        self.session.authorize(Action::WriteVocabulary)?;
        let duplicate = self
            .state
            .vocabulary()
            .iter()
            .any(|entry| entry.kind == draft.kind && entry.name == draft.name);
        if duplicate {
            return Err(SyncError::Validation(format!(
                "'{}' already exists",
                draft.name
            )));
        }
        let entity = draft.into_entity(new_entity_id());
        self.writes.create(&mut self.state, entity)
    }

    pub fn update_config(&mut self, id: &str, patch: ConfigPatch) -> Result<WriteTicket> {
        self.session.authorize(Action::WriteVocabulary)?;
        self.writes
            .update::<ConfigEntity>(&mut self.state, id, patch_fields(&patch))
    }

    pub fn delete_config(&mut self, id: &str) -> Result<WriteTicket> {
        self.session.authorize(Action::WriteVocabulary)?;
        self.writes.delete::<ConfigEntity>(&mut self.state, id)
    }

    /// Start watching a record's comment thread.
    pub fn open_thread(&mut self, record_id: &str) -> Result<()> {
        {
            let record = self
                .state
                .records()
                .get(record_id)
                .ok_or_else(|| SyncError::not_found(TraceRecord::COLLECTION, record_id))?;
            self.session.authorize(Action::Discuss { record })?;
        }
        let watch = Watch::Thread(record_id.to_string());
        // A failed thread stays listed until reopened here
        if self.state.thread(record_id).is_some() && !self.state.channel_status(&watch).is_error()
        {
            return Ok(());
        }
        match self.state.mode() {
            DataMode::Cloud => self.open(watch),
            DataMode::LocalFallback => {
                // The fallback dataset has no comments
                self.state.apply(Change::Subscribing(watch.clone()));
                self.state.apply(Change::Snapshot(watch, Vec::new()));
            }
        }
        debug!(record_id, "thread opened");
        Ok(())
    }

    /// Stop watching a thread and discard its comments. Once this returns no
    /// emission of the closed subscription can reach state.
    pub fn close_thread(&mut self, record_id: &str) {
        let watch = Watch::Thread(record_id.to_string());
        self.channels.remove(&watch);
        self.state.apply(Change::Closed(watch));
        debug!(record_id, "thread closed");
    }

    pub fn post_comment(&mut self, record_id: &str, text: &str) -> Result<WriteTicket> {
        let comment = {
            let record = self
                .state
                .records()
                .get(record_id)
                .ok_or_else(|| SyncError::not_found(TraceRecord::COLLECTION, record_id))?;
            let author = self.session.authorize(Action::Discuss { record })?;
            if self.state.thread(record_id).is_none() {
                return Err(SyncError::Validation(format!(
                    "thread of record '{}' is not open",
                    record_id
                )));
            }
            Comment {
                id: new_entity_id(),
                record_id: record_id.to_string(),
                author_id: author.id.clone(),
                author_name: author.display_name.clone(),
                text: text.trim().to_string(),
                posted_at: Utc::now(),
            }
        };
        self.writes.comment(&mut self.state, comment)
    }

    /// Summary of a visible record's description. Never fails once the record
    /// is visible; unavailable summaries come back as a fixed message.
    pub async fn summarize(&mut self, record_id: &str) -> Result<String> {
        let (description, category) = {
            let projected = self
                .projector()
                .record(record_id)
                .ok_or_else(|| SyncError::not_found(TraceRecord::COLLECTION, record_id))?;
            (
                projected.record.description.clone(),
                projected.record.category.clone(),
            )
        };
        Ok(self
            .summaries
            .summarize(record_id, &description, &category)
            .await)
    }

    /// Write the built-in seed dataset into empty remote collections.
    pub async fn seed_remote(&mut self) -> Result<SeedReport> {
        self.session.authorize(Action::SeedRemote)?;
        if self.state.mode() == DataMode::LocalFallback {
            return Err(SyncError::Validation(
                "seeding requires cloud mode".to_string(),
            ));
        }
        Ok(seed::seed_remote(self.remote.as_ref(), &seed_records(), &seed_actors()).await)
    }

    /// Cache the canonical collections for the next fallback start. Skipped
    /// (returns `false`) unless connected, synced and free of pending writes.
    pub fn persist_snapshot(&self) -> Result<bool> {
        let ready = self.state.mode() == DataMode::Cloud
            && self.state.has_synced(&Watch::Records)
            && self.state.has_synced(&Watch::Actors)
            && self.writes.in_flight() == 0;
        if !ready {
            debug!("snapshot not persisted, state is not settled");
            return Ok(false);
        }
        let snapshot = PersistedSnapshot {
            records: self.state.records().iter().cloned().collect(),
            actors: self.state.actors().iter().cloned().collect(),
            vocabulary: self.state.vocabulary().iter().cloned().collect(),
            saved_at: Utc::now(),
        };
        snapshot.save(self.local.as_ref())?;
        Ok(true)
    }
}
