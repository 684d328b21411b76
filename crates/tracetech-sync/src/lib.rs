//! Synchronization and view-projection engine for tracetech.
//!
//! Canonical state lives in one [`reconcile::ReconciliationState`] owned by a
//! [`engine::SyncEngine`]. Live subscriptions ([`channel`]) and optimistic
//! writes ([`writes`]) feed it through the engine's event queue; readers get
//! role-filtered views from [`projection::ViewProjector`]. When the remote
//! store is unavailable the engine serves [`fallback::LocalFallbackStore`]
//! read-only.

pub mod attachments;
pub mod channel;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod insights;
pub mod memory;
pub mod projection;
pub mod reconcile;
pub mod remote;
pub mod seed;
pub mod session;
pub mod writes;

pub use channel::{ChannelStatus, RemoteCollectionChannel, SubscriptionId};
pub use engine::SyncEngine;
pub use error::{ChannelError, Result, SyncError};
pub use fallback::LocalFallbackStore;
pub use projection::{RecordFilter, RecordStats, ViewProjector};
pub use reconcile::{DataMode, ReconciliationState, SyncStatus, Watch};
pub use remote::{CollectionQuery, ObjectStore, RemoteStore};
pub use session::SessionContext;
pub use writes::{ActorDraft, ConfigDraft, RecordDraft, WriteCoordinator, WriteOutcome, WriteTicket};
