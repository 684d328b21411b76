//! The signed-in actor and the permission gate for every operation.
//!
//! The actor is persisted under [`SESSION_KEY`] with its credential stripped.
//! A restored session is trusted as-is: it is not re-checked against the
//! authoritative actor set. [`SessionContext::stale_fields`] reports where the
//! two have drifted apart so callers can decide what to do.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracetech_config::persistence::{load_json, save_json};
use tracetech_config::{Actor, KeyValueStore, TraceRecord, SESSION_KEY};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::reconcile::ReconciliationState;

/// Operations that need a permission check.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    WriteRecords,
    ManageActors,
    WriteVocabulary,
    SeedRemote,
    /// Change an actor's profile. Changing a role always requires ADMIN.
    UpdateProfile {
        actor_id: &'a str,
        changes_role: bool,
    },
    /// Read or post comments on a record.
    Discuss { record: &'a TraceRecord },
}

impl Action<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::WriteRecords => "write records",
            Action::ManageActors => "manage actors",
            Action::WriteVocabulary => "write vocabulary",
            Action::SeedRemote => "seed the remote store",
            Action::UpdateProfile { .. } => "update this profile",
            Action::Discuss { .. } => "discuss this record",
        }
    }
}

/// Current authenticated actor, if any.
pub struct SessionContext {
    store: Arc<dyn KeyValueStore>,
    current: Option<Actor>,
    login_delay: Duration,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("current", &self.current)
            .field("login_delay", &self.login_delay)
            .finish()
    }
}

impl SessionContext {
    /// Restore the persisted session, if any. A corrupt blob is discarded.
    pub fn restore(store: Arc<dyn KeyValueStore>, login_delay: Duration) -> Self {
        let current = match load_json::<Actor>(store.as_ref(), SESSION_KEY) {
            Ok(Some(actor)) => {
                info!(actor = %actor.username, role = %actor.role, "restored session");
                Some(actor)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "discarding unreadable session blob");
                if let Err(err) = store.remove(SESSION_KEY) {
                    warn!(error = %err, "failed to remove session blob");
                }
                None
            }
        };
        Self {
            store,
            current,
            login_delay,
        }
    }

    pub fn current(&self) -> Option<&Actor> {
        self.current.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.is_some()
    }

    /// Match `username`/`secret` against the loaded actor set. The call
    /// takes at least the configured login delay whatever the result, and a
    /// mismatch never says whether the username exists.
    pub async fn login(
        &mut self,
        state: &ReconciliationState,
        username: &str,
        secret: &str,
    ) -> Result<Actor> {
        let started = Instant::now();
        let matched = state
            .actors()
            .iter()
            .find(|actor| actor.username == username && actor.credential_matches(secret))
            .cloned();
        tokio::time::sleep_until(started + self.login_delay).await;

        let Some(actor) = matched else {
            warn!("login rejected");
            return Err(SyncError::AuthMismatch);
        };
        let actor = strip_secret(actor);
        self.persist(&actor)?;
        info!(actor = %actor.username, role = %actor.role, "logged in");
        self.current = Some(actor.clone());
        Ok(actor)
    }

    pub fn logout(&mut self) -> Result<()> {
        if let Some(actor) = self.current.take() {
            info!(actor = %actor.username, "logged out");
        }
        self.store.remove(SESSION_KEY)?;
        Ok(())
    }

    /// Replace the session actor after its profile changed. Ignored when
    /// `actor` is someone else.
    pub fn refresh(&mut self, actor: &Actor) -> Result<()> {
        if self.current.as_ref().map(|c| c.id.as_str()) != Some(actor.id.as_str()) {
            return Ok(());
        }
        let actor = strip_secret(actor.clone());
        self.persist(&actor)?;
        self.current = Some(actor);
        Ok(())
    }

    fn persist(&self, actor: &Actor) -> Result<()> {
        save_json(self.store.as_ref(), SESSION_KEY, actor)?;
        Ok(())
    }

    /// Fields where the session actor differs from the authoritative actor
    /// set. `"id"` means the actor no longer exists there.
    pub fn stale_fields(&self, state: &ReconciliationState) -> Vec<&'static str> {
        let Some(current) = &self.current else {
            return Vec::new();
        };
        let Some(authoritative) = state.actors().get(&current.id) else {
            return vec!["id"];
        };
        let mut stale = Vec::new();
        if authoritative.username != current.username {
            stale.push("username");
        }
        if authoritative.display_name != current.display_name {
            stale.push("name");
        }
        if authoritative.role != current.role {
            stale.push("role");
        }
        if authoritative.affiliation != current.affiliation {
            stale.push("company");
        }
        stale
    }

    /// Check that the current actor may perform `action`.
    pub fn authorize(&self, action: Action<'_>) -> Result<&Actor> {
        let actor = self.current.as_ref().ok_or(SyncError::NotAuthenticated)?;
        let admin = actor.role.is_admin();
        let allowed = match action {
            Action::WriteRecords
            | Action::ManageActors
            | Action::WriteVocabulary
            | Action::SeedRemote => admin,
            Action::UpdateProfile {
                actor_id,
                changes_role,
            } => admin || (actor_id == actor.id && !changes_role),
            Action::Discuss { record } => admin || record.assigned_actor_id == actor.id,
        };
        if allowed {
            Ok(actor)
        } else {
            Err(SyncError::Forbidden(format!(
                "{} may not {}",
                actor.role,
                action.name()
            )))
        }
    }
}

fn strip_secret(mut actor: Actor) -> Actor {
    actor.credential_secret = None;
    actor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::LocalFallbackStore;
    use crate::reconcile::Change;
    use tracetech_config::{MemoryStore, Role};

    fn fallback_state() -> ReconciliationState {
        let mut state = ReconciliationState::new();
        state.apply(Change::EnterFallback(LocalFallbackStore::builtin()));
        state
    }

    fn session(store: Arc<MemoryStore>) -> SessionContext {
        SessionContext::restore(store, Duration::ZERO)
    }

    #[tokio::test]
    async fn login_persists_actor_without_secret() {
        let store = Arc::new(MemoryStore::new());
        let state = fallback_state();
        let mut ctx = session(store.clone());

        let actor = ctx.login(&state, "cliente01", "123").await.unwrap();
        assert_eq!(actor.id, "2");
        assert!(actor.credential_secret.is_none());

        let raw = store.get(SESSION_KEY).unwrap().unwrap();
        assert!(!raw.contains("123\""));
        assert!(!raw.contains("password"));

        let restored = session(store);
        assert_eq!(restored.current().map(|a| a.id.as_str()), Some("2"));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let state = fallback_state();
        let mut ctx = session(Arc::new(MemoryStore::new()));

        let wrong = ctx.login(&state, "admin", "0000").await.unwrap_err();
        let unknown = ctx.login(&state, "nobody", "1234").await.unwrap_err();
        assert_eq!(wrong, SyncError::AuthMismatch);
        assert_eq!(wrong, unknown);
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn login_takes_at_least_the_configured_delay() {
        let state = fallback_state();
        let mut ctx = SessionContext::restore(Arc::new(MemoryStore::new()), Duration::from_millis(1000));
        let started = Instant::now();
        ctx.login(&state, "admin", "1234").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn logout_clears_persisted_session() {
        let store = Arc::new(MemoryStore::new());
        let state = fallback_state();
        let mut ctx = session(store.clone());
        ctx.login(&state, "admin", "1234").await.unwrap();

        ctx.logout().unwrap();
        assert!(!ctx.is_authenticated());
        assert!(store.get(SESSION_KEY).unwrap().is_none());
    }

    #[test]
    fn corrupt_session_blob_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.put(SESSION_KEY, "not json").unwrap();
        let ctx = session(store.clone());
        assert!(!ctx.is_authenticated());
        assert!(store.get(SESSION_KEY).unwrap().is_none());
    }

    #[test]
    fn restored_session_is_trusted_but_drift_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let stale = Actor::new("3", "sergio", "Sergio Operador", Role::Admin);
        save_json(store.as_ref(), SESSION_KEY, &stale).unwrap();

        let ctx = session(store);
        // Trusted as stored, including the outdated role
        assert!(ctx.authorize(Action::ManageActors).is_ok());

        let state = fallback_state();
        assert_eq!(ctx.stale_fields(&state), vec!["role", "company"]);
    }

    #[tokio::test]
    async fn permission_gate() {
        let state = fallback_state();
        let mut ctx = session(Arc::new(MemoryStore::new()));
        assert_eq!(
            ctx.authorize(Action::SeedRemote).unwrap_err(),
            SyncError::NotAuthenticated
        );

        ctx.login(&state, "cliente01", "123").await.unwrap();
        assert!(matches!(
            ctx.authorize(Action::WriteRecords),
            Err(SyncError::Forbidden(_))
        ));
        assert!(ctx
            .authorize(Action::UpdateProfile { actor_id: "2", changes_role: false })
            .is_ok());
        assert!(ctx
            .authorize(Action::UpdateProfile { actor_id: "2", changes_role: true })
            .is_err());
        assert!(ctx
            .authorize(Action::UpdateProfile { actor_id: "3", changes_role: false })
            .is_err());

        let own = state.records().get("r1").unwrap();
        assert!(ctx.authorize(Action::Discuss { record: own }).is_ok());
    }
}
