//! Remote data gateway.
//!
//! [`RemoteSource`] is the read-only query surface of the remote database.
//! [`RemoteClient`] implements it over HTTP; [`Disconnected`] stands in when
//! no remote is configured. [`Gateway`] pairs a source with the local cache
//! and is the only path the UI uses to read data.

mod client;
mod error;
mod gateway;

use async_trait::async_trait;

use crate::storage::{Category, Story};

pub use client::{ClientOptions, RemoteClient};
pub use error::RemoteError;
pub use gateway::Gateway;

/// Read-only queries against the remote source.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// All categories, ordered by name ascending.
    async fn fetch_categories(&self) -> Result<Vec<Category>, RemoteError>;

    /// All stories, ordered by idx ascending.
    async fn fetch_stories(&self) -> Result<Vec<Story>, RemoteError>;

    /// The story with the given idx, or `None` when no such row exists.
    async fn fetch_story_by_idx(&self, idx: i64) -> Result<Option<Story>, RemoteError>;

    /// Lightweight reachability check. Never fails; any error is `false`.
    async fn probe(&self) -> bool;
}

/// Source used when no remote URL is configured: always offline.
pub struct Disconnected;

#[async_trait]
impl RemoteSource for Disconnected {
    async fn fetch_categories(&self) -> Result<Vec<Category>, RemoteError> {
        Err(RemoteError::NotConfigured)
    }

    async fn fetch_stories(&self) -> Result<Vec<Story>, RemoteError> {
        Err(RemoteError::NotConfigured)
    }

    async fn fetch_story_by_idx(&self, _idx: i64) -> Result<Option<Story>, RemoteError> {
        Err(RemoteError::NotConfigured)
    }

    async fn probe(&self) -> bool {
        false
    }
}
