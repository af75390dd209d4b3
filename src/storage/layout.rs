//! Cache slot layout and typed access over a [`CacheStore`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use super::slots::CacheStore;
use super::types::{Category, StorageError, Story};

// ============================================================================
// Key layout
// ============================================================================

/// Logical cache slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey {
    Categories,
    Stories,
    LastSyncTime,
    /// Legacy flag mirroring the last connectivity probe.
    OfflineMode,
}

impl CacheKey {
    pub const ALL: [CacheKey; 4] = [
        CacheKey::Categories,
        CacheKey::Stories,
        CacheKey::LastSyncTime,
        CacheKey::OfflineMode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheKey::Categories => "stories_categories",
            CacheKey::Stories => "stories_stories",
            CacheKey::LastSyncTime => "stories_last_sync",
            CacheKey::OfflineMode => "stories_offline_mode",
        }
    }
}

// ============================================================================
// Typed slot access
// ============================================================================

/// Typed view over a [`CacheStore`] using the slot layout above.
///
/// Reads never fail: store errors and undecodable payloads are logged and
/// read as empty. Writes return the error so callers can decide to degrade.
#[derive(Clone)]
pub struct CacheSlots {
    store: Arc<dyn CacheStore>,
}

impl CacheSlots {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Load a whole collection; empty on any failure.
    pub async fn load_collection<T: DeserializeOwned>(&self, key: CacheKey) -> Vec<T> {
        let raw = match self.store.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(key = key.as_str(), error = %e, "Cache read failed, treating as empty");
                return Vec::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(key = key.as_str(), error = %e, "Cached collection is corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    /// Replace a whole collection.
    pub async fn save_collection<T: Serialize>(
        &self,
        key: CacheKey,
        items: &[T],
    ) -> Result<(), StorageError> {
        let encoded = serde_json::to_string(items)?;
        self.store.set(key.as_str(), &encoded).await?;
        tracing::debug!(key = key.as_str(), count = items.len(), "Cached collection");
        Ok(())
    }

    pub async fn categories(&self) -> Vec<Category> {
        self.load_collection(CacheKey::Categories).await
    }

    pub async fn stories(&self) -> Vec<Story> {
        self.load_collection(CacheKey::Stories).await
    }

    /// Time of the last successful sync, stored as Unix milliseconds.
    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        let raw = match self.store.get(CacheKey::LastSyncTime.as_str()).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read last sync time");
                return None;
            }
        };

        raw.trim()
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    pub async fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.store
            .set(
                CacheKey::LastSyncTime.as_str(),
                &at.timestamp_millis().to_string(),
            )
            .await
    }

    pub async fn offline_mode(&self) -> bool {
        match self.store.get(CacheKey::OfflineMode.as_str()).await {
            Ok(raw) => raw.as_deref() == Some("true"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read offline flag");
                false
            }
        }
    }

    pub async fn set_offline_mode(&self, offline: bool) -> Result<(), StorageError> {
        self.store
            .set(CacheKey::OfflineMode.as_str(), if offline { "true" } else { "false" })
            .await
    }

    /// Remove every slot in the layout.
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        let keys = CacheKey::ALL.map(CacheKey::as_str);
        self.store.remove(&keys).await
    }
}
