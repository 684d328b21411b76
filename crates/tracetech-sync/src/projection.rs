//! Role-scoped read views over canonical state.
//!
//! Everything here is a pure function of the state, the current actor and the
//! caller's filters. Nothing performs I/O or mutates state, so projections can
//! be recomputed on every render.

use tracetech_config::{Actor, Comment, ConfigEntity, ConfigKind, TraceRecord};

use crate::reconcile::ReconciliationState;

/// Caller-supplied record predicates. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub category: Option<String>,
    pub status: Option<String>,
    /// Case-insensitive substring of the code or description.
    pub search: Option<String>,
}

impl RecordFilter {
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn matches(&self, record: &TraceRecord) -> bool {
        if let Some(category) = &self.category {
            if &record.category != category {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if &record.status != status {
                return false;
            }
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                record.code.to_lowercase().contains(&needle)
                    || record.description.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }
}

/// A visible record and whether it carries unconfirmed local changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedRecord<'a> {
    pub record: &'a TraceRecord,
    pub pending: bool,
}

/// Counts over the visible record set. Buckets keep first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub total: usize,
    pub by_status: Vec<(String, usize)>,
    pub by_category: Vec<(String, usize)>,
}

impl RecordStats {
    pub fn count_status(&self, status: &str) -> usize {
        bucket(&self.by_status, status)
    }

    pub fn count_category(&self, category: &str) -> usize {
        bucket(&self.by_category, category)
    }
}

fn bucket(buckets: &[(String, usize)], key: &str) -> usize {
    buckets
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, count)| *count)
        .unwrap_or(0)
}

fn increment(buckets: &mut Vec<(String, usize)>, key: &str) {
    match buckets.iter_mut().find(|(name, _)| name == key) {
        Some((_, count)) => *count += 1,
        None => buckets.push((key.to_string(), 1)),
    }
}

/// The controlled vocabulary as seen by pickers and renderers.
#[derive(Debug, Clone, Copy)]
pub struct VocabularyView<'a> {
    state: &'a ReconciliationState,
}

impl<'a> VocabularyView<'a> {
    fn active(&self, kind: ConfigKind) -> impl Iterator<Item = &'a ConfigEntity> + 'a {
        self.state
            .vocabulary()
            .iter()
            .filter(move |entry| entry.kind == kind && entry.active)
    }

    /// Active category names, in vocabulary order.
    pub fn categories(&self) -> Vec<&'a str> {
        self.active(ConfigKind::Category).map(|e| e.name.as_str()).collect()
    }

    /// Active status names, in vocabulary order.
    pub fn statuses(&self) -> Vec<&'a str> {
        self.active(ConfigKind::Status).map(|e| e.name.as_str()).collect()
    }

    /// Vocabulary entry named `value`, active or not.
    pub fn lookup(&self, kind: ConfigKind, value: &str) -> Option<&'a ConfigEntity> {
        self.state
            .vocabulary()
            .iter()
            .find(|entry| entry.kind == kind && entry.name == value)
    }

    pub fn is_known(&self, kind: ConfigKind, value: &str) -> bool {
        self.lookup(kind, value).is_some()
    }

    /// Display label of a value. Values absent from the vocabulary are shown
    /// verbatim.
    pub fn label<'v>(&self, kind: ConfigKind, value: &'v str) -> &'v str
    where
        'a: 'v,
    {
        match self.lookup(kind, value) {
            Some(entry) => entry.name.as_str(),
            None => value,
        }
    }
}

/// Read access to canonical state on behalf of one actor.
#[derive(Debug, Clone, Copy)]
pub struct ViewProjector<'a> {
    state: &'a ReconciliationState,
    actor: Option<&'a Actor>,
}

impl<'a> ViewProjector<'a> {
    pub fn new(state: &'a ReconciliationState, actor: Option<&'a Actor>) -> Self {
        Self { state, actor }
    }

    pub fn actor(&self) -> Option<&'a Actor> {
        self.actor
    }

    /// ADMIN sees every record; anyone else only records assigned to them.
    /// Without an actor nothing is visible.
    pub fn can_see(&self, record: &TraceRecord) -> bool {
        match self.actor {
            Some(actor) if actor.role.is_admin() => true,
            Some(actor) => record.assigned_actor_id == actor.id,
            None => false,
        }
    }

    /// Visible records matching `filter`, in canonical order.
    pub fn records(&self, filter: &RecordFilter) -> Vec<ProjectedRecord<'a>> {
        let records = self.state.records();
        records
            .iter()
            .filter(|record| self.can_see(record))
            .filter(|record| filter.matches(record))
            .map(|record| ProjectedRecord {
                record,
                pending: records.is_pending(&record.id),
            })
            .collect()
    }

    /// A single visible record.
    pub fn record(&self, id: &str) -> Option<ProjectedRecord<'a>> {
        let records = self.state.records();
        records
            .get(id)
            .filter(|record| self.can_see(record))
            .map(|record| ProjectedRecord {
                record,
                pending: records.is_pending(id),
            })
    }

    pub fn stats(&self, filter: &RecordFilter) -> RecordStats {
        let mut stats = RecordStats::default();
        for projected in self.records(filter) {
            stats.total += 1;
            increment(&mut stats.by_status, &projected.record.status);
            increment(&mut stats.by_category, &projected.record.category);
        }
        stats
    }

    /// Comments of an open thread on a visible record.
    pub fn thread(&self, record_id: &str) -> Option<Vec<&'a Comment>> {
        self.record(record_id)?;
        self.state
            .thread(record_id)
            .map(|thread| thread.iter().collect())
    }

    /// Actor directory. Only ADMIN sees other actors.
    pub fn actors(&self) -> Vec<&'a Actor> {
        match self.actor {
            Some(actor) if actor.role.is_admin() => self.state.actors().iter().collect(),
            Some(actor) => self
                .state
                .actors()
                .get(&actor.id)
                .into_iter()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Display name of the actor a record is assigned to, if known.
    pub fn assignee_name(&self, record: &TraceRecord) -> Option<&'a str> {
        self.state
            .actors()
            .get(&record.assigned_actor_id)
            .map(|actor| actor.display_name.as_str())
    }

    pub fn vocabulary(&self) -> VocabularyView<'a> {
        VocabularyView { state: self.state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::LocalFallbackStore;
    use crate::reconcile::{Change, Mutation, OpId, PendingWrite, Watch};
    use chrono::NaiveDate;
    use tracetech_config::{patch_fields, Attachments, Entity, RecordPatch, Role};

    fn record(id: &str, assigned: &str, category: &str, status: &str) -> TraceRecord {
        TraceRecord {
            id: id.to_string(),
            code: format!("TRC-{}", id.to_uppercase()),
            occurred_on: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            category: category.to_string(),
            description: format!("Trabajo {}", id),
            status: status.to_string(),
            assigned_actor_id: assigned.to_string(),
            attachments: Attachments::default(),
            notes: None,
        }
    }

    fn state_with(records: &[TraceRecord]) -> ReconciliationState {
        let mut state = ReconciliationState::new();
        state.apply(Change::Subscribing(Watch::Records));
        state.apply(Change::Snapshot(
            Watch::Records,
            records.iter().map(Entity::to_document).collect(),
        ));
        state
    }

    fn ids(projected: &[ProjectedRecord<'_>]) -> Vec<String> {
        projected.iter().map(|p| p.record.id.clone()).collect()
    }

    #[test]
    fn client_sees_only_assigned_records() {
        let state = state_with(&[
            record("r1", "2", "Mantenimiento", "ACTIVO"),
            record("r2", "3", "Mantenimiento", "ACTIVO"),
        ]);
        let client = Actor::new("2", "cliente01", "Juan Pérez", Role::Client);
        let projector = ViewProjector::new(&state, Some(&client));

        assert_eq!(ids(&projector.records(&RecordFilter::default())), vec!["r1"]);
        assert!(projector.record("r2").is_none());
    }

    #[test]
    fn visibility_holds_for_every_non_admin_actor() {
        let records = vec![
            record("a", "1", "X", "S"),
            record("b", "2", "X", "S"),
            record("c", "3", "X", "S"),
            record("d", "2", "X", "S"),
        ];
        let state = state_with(&records);
        for role in [Role::Operator, Role::Client] {
            for actor_id in ["1", "2", "3", "4"] {
                let actor = Actor::new(actor_id, "u", "U", role);
                let visible = ids(&ViewProjector::new(&state, Some(&actor)).records(&RecordFilter::default()));
                for r in &records {
                    assert_eq!(visible.contains(&r.id), r.assigned_actor_id == actor_id);
                }
            }
        }
    }

    #[test]
    fn admin_sees_everything_and_anonymous_nothing() {
        let state = state_with(&[
            record("r1", "2", "Mantenimiento", "ACTIVO"),
            record("r2", "3", "Auditoría", "CERRADO"),
        ]);
        let admin = Actor::new("1", "admin", "Administrador", Role::Admin);
        assert_eq!(
            ViewProjector::new(&state, Some(&admin)).records(&RecordFilter::default()).len(),
            2
        );
        assert!(ViewProjector::new(&state, None)
            .records(&RecordFilter::default())
            .is_empty());
    }

    #[test]
    fn filters_compose_and_preserve_order() {
        let state = state_with(&[
            record("r3", "1", "Mantenimiento", "ACTIVO"),
            record("r2", "1", "Auditoría", "ACTIVO"),
            record("r1", "1", "Mantenimiento", "CERRADO"),
        ]);
        let admin = Actor::new("1", "admin", "Administrador", Role::Admin);
        let projector = ViewProjector::new(&state, Some(&admin));

        let by_category = projector.records(&RecordFilter::default().category("Mantenimiento"));
        assert_eq!(ids(&by_category), vec!["r3", "r1"]);

        let combined = projector.records(
            &RecordFilter::default()
                .category("Mantenimiento")
                .status("CERRADO"),
        );
        assert_eq!(ids(&combined), vec!["r1"]);

        // Search is case-insensitive over code and description
        assert_eq!(ids(&projector.records(&RecordFilter::default().search("trc-R2"))), vec!["r2"]);
        assert_eq!(ids(&projector.records(&RecordFilter::default().search("TRABAJO r3"))), vec!["r3"]);
        assert_eq!(projector.records(&RecordFilter::default().search("  ")).len(), 3);
    }

    #[test]
    fn pending_flag_is_projected() {
        let mut state = state_with(&[record("r1", "2", "Mantenimiento", "ACTIVO")]);
        state.apply(Change::Optimistic(
            OpId(1),
            PendingWrite::Record(
                "r1".into(),
                Mutation::Patch(patch_fields(&RecordPatch::status("CERRADO"))),
            ),
        ));
        let client = Actor::new("2", "cliente01", "Juan Pérez", Role::Client);
        let projected = ViewProjector::new(&state, Some(&client)).record("r1").unwrap();
        assert!(projected.pending);
        assert_eq!(projected.record.status, "CERRADO");
    }

    #[test]
    fn stats_count_in_first_seen_order() {
        let state = state_with(&[
            record("r1", "1", "Mantenimiento", "ACTIVO"),
            record("r2", "1", "Auditoría", "CERRADO"),
            record("r3", "1", "Mantenimiento", "ACTIVO"),
        ]);
        let admin = Actor::new("1", "admin", "Administrador", Role::Admin);
        let stats = ViewProjector::new(&state, Some(&admin)).stats(&RecordFilter::default());

        assert_eq!(stats.total, 3);
        assert_eq!(
            stats.by_status,
            vec![("ACTIVO".to_string(), 2), ("CERRADO".to_string(), 1)]
        );
        assert_eq!(stats.count_category("Mantenimiento"), 2);
        assert_eq!(stats.count_category("Reparación"), 0);
    }

    #[test]
    fn vocabulary_renders_unknown_values_verbatim() {
        let mut state = ReconciliationState::new();
        state.apply(Change::EnterFallback(LocalFallbackStore::builtin()));
        let projector = ViewProjector::new(&state, None);
        let vocabulary = projector.vocabulary();

        assert_eq!(vocabulary.statuses(), vec!["ACTIVO", "CERRADO", "EN REVISIÓN", "PENDIENTE"]);
        assert_eq!(vocabulary.categories().len(), 4);
        assert!(vocabulary.is_known(ConfigKind::Status, "ACTIVO"));
        assert_eq!(vocabulary.label(ConfigKind::Status, "ARCHIVADO"), "ARCHIVADO");
    }

    #[test]
    fn non_admin_sees_only_itself_in_directory() {
        let mut state = ReconciliationState::new();
        state.apply(Change::EnterFallback(LocalFallbackStore::builtin()));
        let operator = state.actor_by_username("sergio").unwrap().clone();
        let projector = ViewProjector::new(&state, Some(&operator));
        let directory = projector.actors();
        assert_eq!(directory.len(), 1);
        assert_eq!(directory[0].id, "3");
    }
}
