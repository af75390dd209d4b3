//! In-process publish/subscribe for sync lifecycle events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

use crate::storage::CachedData;

/// Sync lifecycle event.
///
/// Serializes with a `type` tag (`sync_start`, `sync_progress`,
/// `sync_complete`, `sync_error`) for consumers outside the process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    #[serde(rename = "sync_start")]
    Started { message: String },

    #[serde(rename = "sync_progress")]
    Progress {
        step: usize,
        total: usize,
        message: String,
        /// Percentage of steps started, 0-100
        progress: u8,
    },

    #[serde(rename = "sync_complete")]
    Completed {
        #[serde(rename = "updatesFound")]
        updates_found: bool,
        data: Arc<CachedData>,
    },

    #[serde(rename = "sync_error")]
    Failed { message: String },
}

/// Receives events published on an [`EventBus`].
///
/// Called synchronously on the publishing task; keep it short.
pub trait SyncListener: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

impl<F> SyncListener for F
where
    F: Fn(&SyncEvent) + Send + Sync,
{
    fn on_event(&self, event: &SyncEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Entry = (ListenerId, Arc<dyn SyncListener>);

/// Synchronous, ordered fan-out of [`SyncEvent`]s.
///
/// `publish` delivers to a snapshot of the listeners taken when it starts:
/// listeners added while an event is being delivered do not see it.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L>(&self, listener: L) -> ListenerId
    where
        L: SyncListener + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Subscribe through an unbounded channel, for async consumers.
    ///
    /// The listener stays registered until unsubscribed; once the receiver
    /// is dropped, events sent to it are discarded.
    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event: &SyncEvent| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn publish(&self, event: &SyncEvent) {
        // Snapshot so listeners can (un)subscribe without deadlocking
        let snapshot: Vec<Arc<dyn SyncListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        tracing::trace!(listeners = snapshot.len(), ?event, "Publishing sync event");
        for listener in snapshot {
            listener.on_event(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
