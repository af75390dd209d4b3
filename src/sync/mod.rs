//! Offline-first sync engine.
//!
//! - [`reconcile`]: cache key layout and the last-write-wins merge
//! - [`SyncService`]: the orchestrator (timeout, single-session guard,
//!   progress reporting)
//! - [`EventBus`]: lifecycle events for UI indicators

mod events;
pub mod reconcile;
mod service;
mod state;

pub use events::{EventBus, ListenerId, SyncEvent, SyncListener};
pub use reconcile::{merge, CacheKey, CacheSlots, Record};
pub use service::{SyncError, SyncReport, SyncService, DEFAULT_SYNC_TIMEOUT};
pub use state::{SyncSession, SyncState, SyncStatus};
