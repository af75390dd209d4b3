use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use super::events::{EventBus, SyncEvent};
use super::reconcile::{merge, CacheKey, Record};
use super::state::{SyncSession, SyncState, SyncStatus};
use crate::remote::{Gateway, RemoteError};
use crate::storage::{CachedData, DatabaseStats, StorageError};

/// Default deadline for a whole sync run.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

const PIPELINE_STEPS: usize = 2;

/// Why a sync run did not complete. `Display` is the message shown to the
/// user.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync session holds the slot
    #[error("Sync already in progress")]
    AlreadyRunning,
    /// Connectivity probe failed before any fetch
    #[error("Offline mode - using cached data")]
    Offline,
    /// Remote query failed mid-pipeline
    #[error("Could not reach the story library: {0}")]
    Remote(#[from] RemoteError),
    /// Pipeline exceeded the global deadline
    #[error("Sync timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
}

/// Outcome of a successful sync run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// True when the remote returned any categories or stories
    pub updates_found: bool,
    /// Freshly merged cache contents
    pub data: Arc<CachedData>,
}

/// Sync orchestrator.
///
/// Construct once at startup and share behind an `Arc`. At most one sync
/// session runs at a time; a second request is rejected, never queued.
/// Lifecycle events go to the [`EventBus`]; callers that only render
/// state can ignore the returned `Result`.
pub struct SyncService {
    gateway: Gateway,
    events: Arc<EventBus>,
    state: SyncState,
    /// Held across "is this session current" plus the cache write that
    /// depends on it, and across reset.
    writes: Mutex<()>,
    timeout: Duration,
}

impl SyncService {
    pub fn new(gateway: Gateway, events: Arc<EventBus>) -> Self {
        Self {
            gateway,
            events,
            state: SyncState::new(),
            writes: Mutex::new(()),
            timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status()
    }

    // ========================================================================
    // Sync entry points
    // ========================================================================

    /// Probe the remote and record the result.
    pub async fn check_connectivity(&self) -> bool {
        let online = self.gateway.probe_connectivity().await;
        self.state.set_online(online);
        if let Err(e) = self.gateway.slots().set_offline_mode(!online).await {
            tracing::warn!(error = %e, "Failed to persist offline flag");
        }
        tracing::info!(online, "Connectivity checked");
        online
    }

    /// Run the fetch pipeline once.
    ///
    /// `force` marks a user-initiated refresh. Every run fetches the full
    /// remote collections, so it only changes the start message today.
    pub async fn run_sync(&self, force: bool) -> Result<SyncReport, SyncError> {
        let Some(session) = self.state.try_begin() else {
            tracing::info!("Sync already in progress, rejecting request");
            return Err(SyncError::AlreadyRunning);
        };

        tracing::info!(force, generation = session.generation(), "Starting sync");
        self.events.publish(&SyncEvent::Started {
            message: if force {
                "Refreshing library...".to_string()
            } else {
                "Syncing library...".to_string()
            },
        });

        let outcome = match tokio::time::timeout(self.timeout, self.pipeline(&session)).await {
            Ok(result) => result,
            Err(_) => {
                // The pipeline future is dropped here; bumping the generation
                // also fences any work it handed off.
                let _writes = self.writes.lock().await;
                self.state.invalidate();
                Err(SyncError::Timeout(self.timeout))
            }
        };
        drop(session);

        match outcome {
            Ok(report) => {
                tracing::info!(updates_found = report.updates_found, "Sync complete");
                self.events.publish(&SyncEvent::Completed {
                    updates_found: report.updates_found,
                    data: Arc::clone(&report.data),
                });
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sync failed");
                self.events.publish(&SyncEvent::Failed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Probe first; when offline, report it and keep the cache as is.
    pub async fn auto_sync(&self) -> Result<SyncReport, SyncError> {
        if !self.check_connectivity().await {
            let error = SyncError::Offline;
            self.events.publish(&SyncEvent::Failed {
                message: error.to_string(),
            });
            return Err(error);
        }
        self.run_sync(false).await
    }

    /// Full sync requested by the user (pull-to-refresh, settings button).
    pub async fn manual_refresh(&self) -> Result<SyncReport, SyncError> {
        self.run_sync(true).await
    }

    /// Start [`SyncService::auto_sync`] on a detached task.
    ///
    /// The outcome is only observable through the event bus. A panic inside
    /// the task is reported as a `sync_error` event.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            match AssertUnwindSafe(service.auto_sync()).catch_unwind().await {
                Ok(Ok(report)) => {
                    tracing::debug!(updates_found = report.updates_found, "Background sync finished");
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Background sync did not complete");
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(error = %message, "Background sync panicked");
                    service.events.publish(&SyncEvent::Failed {
                        message: format!("Background sync crashed: {message}"),
                    });
                }
            }
        })
    }

    // ========================================================================
    // Cache access
    // ========================================================================

    pub async fn get_cached_data(&self) -> CachedData {
        CachedData {
            categories: self.gateway.read_cached_categories().await,
            stories: self.gateway.read_cached_stories().await,
        }
    }

    pub async fn get_database_stats(&self) -> DatabaseStats {
        let data = self.get_cached_data().await;
        DatabaseStats {
            categories_count: data.categories.len(),
            stories_count: data.stories.len(),
            last_sync: self.last_sync_time().await,
        }
    }

    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.gateway.slots().last_sync_time().await
    }

    /// Drop every cached slot. An in-flight sync keeps running but its
    /// remaining writes are discarded.
    pub async fn reset_local_data(&self) -> Result<(), StorageError> {
        let _writes = self.writes.lock().await;
        self.state.invalidate();
        self.gateway.slots().clear_all().await?;
        tracing::info!("Local data cleared");
        Ok(())
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    /// Categories then stories, each reconciled and persisted before the
    /// next step starts, so a later failure keeps earlier progress.
    async fn pipeline(&self, session: &SyncSession<'_>) -> Result<SyncReport, SyncError> {
        self.report_step(1, "categories");
        let categories = self.gateway.fetch_categories().await?;
        let merged_categories = self
            .reconcile(session, CacheKey::Categories, &categories)
            .await;

        self.report_step(2, "stories");
        let stories = self.gateway.fetch_stories().await?;
        let merged_stories = self.reconcile(session, CacheKey::Stories, &stories).await;

        {
            let _writes = self.writes.lock().await;
            if session.is_current() {
                if let Err(e) = self.gateway.slots().set_last_sync_time(Utc::now()).await {
                    tracing::warn!(error = %e, "Failed to record last sync time");
                }
            }
        }

        Ok(SyncReport {
            updates_found: !categories.is_empty() || !stories.is_empty(),
            data: Arc::new(CachedData {
                categories: merged_categories,
                stories: merged_stories,
            }),
        })
    }

    /// Merge `incoming` into the cached collection and persist the result.
    /// A failed write degrades durability only; the merged data is still
    /// returned.
    async fn reconcile<T>(&self, session: &SyncSession<'_>, key: CacheKey, incoming: &[T]) -> Vec<T>
    where
        T: Record + Clone + Serialize + DeserializeOwned,
    {
        let existing: Vec<T> = self.gateway.slots().load_collection(key).await;
        let cached = existing.len();
        let merged = merge(existing, incoming);

        let _writes = self.writes.lock().await;
        if !session.is_current() {
            tracing::warn!(key = key.as_str(), "Sync session abandoned, discarding cache write");
            return merged;
        }
        if let Err(e) = self.gateway.slots().save_collection(key, &merged).await {
            tracing::warn!(key = key.as_str(), error = %e, "Failed to persist merged collection");
        }
        tracing::debug!(
            key = key.as_str(),
            cached,
            incoming = incoming.len(),
            merged = merged.len(),
            "Reconciled collection"
        );
        merged
    }

    fn report_step(&self, step: usize, name: &str) {
        self.events.publish(&SyncEvent::Progress {
            step,
            total: PIPELINE_STEPS,
            message: format!("Fetching {name}..."),
            progress: (step * 100 / PIPELINE_STEPS) as u8,
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Disconnected, RemoteSource};
    use crate::storage::{Category, MemoryStore, Story};
    use crate::sync::CacheSlots;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticRemote {
        categories: Vec<Category>,
        stories: Vec<Story>,
    }

    #[async_trait]
    impl RemoteSource for StaticRemote {
        async fn fetch_categories(&self) -> Result<Vec<Category>, RemoteError> {
            Ok(self.categories.clone())
        }

        async fn fetch_stories(&self) -> Result<Vec<Story>, RemoteError> {
            Ok(self.stories.clone())
        }

        async fn fetch_story_by_idx(&self, _idx: i64) -> Result<Option<Story>, RemoteError> {
            Ok(None)
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn service(remote: Arc<dyn RemoteSource>) -> SyncService {
        let slots = CacheSlots::new(Arc::new(MemoryStore::new()));
        SyncService::new(Gateway::new(remote, slots), Arc::new(EventBus::new()))
    }

    fn record_events(service: &SyncService) -> Arc<Mutex<Vec<SyncEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        service
            .events()
            .subscribe(move |event: &SyncEvent| sink.lock().unwrap().push(event.clone()));
        log
    }

    fn category(id: &str) -> Category {
        Category {
            id: id.to_string(),
            name: id.to_uppercase(),
            poster_url: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_empty_remote_reports_no_updates() {
        let service = service(Arc::new(StaticRemote {
            categories: vec![],
            stories: vec![],
        }));
        let events = record_events(&service);

        let report = service.run_sync(false).await.unwrap();
        assert!(!report.updates_found);
        assert!(service.last_sync_time().await.is_some());

        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(SyncEvent::Completed {
                updates_found: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_progress_steps_in_order() {
        let service = service(Arc::new(StaticRemote {
            categories: vec![category("a")],
            stories: vec![],
        }));
        let events = record_events(&service);

        service.manual_refresh().await.unwrap();

        let steps: Vec<(usize, u8)> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                SyncEvent::Progress { step, progress, .. } => Some((*step, *progress)),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![(1, 50), (2, 100)]);
    }

    #[tokio::test]
    async fn test_remote_failure_publishes_error() {
        let service = service(Arc::new(Disconnected));
        let events = record_events(&service);

        let err = service.run_sync(false).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::NotConfigured)));
        assert!(!service.status().is_syncing);
        assert!(service.last_sync_time().await.is_none());

        let events = events.lock().unwrap();
        match events.last() {
            Some(SyncEvent::Failed { message }) => assert_eq!(message, &err.to_string()),
            other => panic!("expected sync_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_sync_offline_short_circuits() {
        let service = service(Arc::new(Disconnected));
        let events = record_events(&service);

        let err = service.auto_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert!(!service.status().is_online);
        assert!(service.gateway().slots().offline_mode().await);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SyncEvent::Failed { message } if message == "Offline mode - using cached data"
        ));
    }

    #[tokio::test]
    async fn test_stats_follow_cache() {
        let service = service(Arc::new(StaticRemote {
            categories: vec![category("a"), category("b")],
            stories: vec![],
        }));
        let empty = service.get_database_stats().await;
        assert_eq!((empty.categories_count, empty.stories_count), (0, 0));
        assert!(empty.last_sync.is_none());

        service.run_sync(false).await.unwrap();
        let stats = service.get_database_stats().await;
        assert_eq!(stats.categories_count, 2);
        assert!(stats.last_sync.is_some());

        service.reset_local_data().await.unwrap();
        let cleared = service.get_database_stats().await;
        assert_eq!(cleared.categories_count, 0);
        assert!(cleared.last_sync.is_none());
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
