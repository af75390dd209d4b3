use std::collections::HashSet;
use std::sync::Arc;

use super::{RemoteError, RemoteSource};
use crate::storage::{CacheKey, CacheSlots, Category, Story};

/// Single entry point for story data.
///
/// Network-facing calls (`fetch_*`, `smart_fetch_*`, `probe_connectivity`)
/// are used by sync and explicit user actions. The `read_*` accessors only
/// touch the local cache, so screens never wait on the network.
#[derive(Clone)]
pub struct Gateway {
    remote: Arc<dyn RemoteSource>,
    slots: CacheSlots,
}

impl Gateway {
    pub fn new(remote: Arc<dyn RemoteSource>, slots: CacheSlots) -> Self {
        Self { remote, slots }
    }

    pub fn slots(&self) -> &CacheSlots {
        &self.slots
    }

    // ========================================================================
    // Remote fetches
    // ========================================================================

    /// All remote categories, sorted by name.
    pub async fn fetch_categories(&self) -> Result<Vec<Category>, RemoteError> {
        tracing::debug!("Fetching categories from remote");
        let mut categories = self.remote.fetch_categories().await?;
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!(count = categories.len(), "Fetched categories");
        Ok(categories)
    }

    /// All remote stories, sorted by idx.
    pub async fn fetch_stories(&self) -> Result<Vec<Story>, RemoteError> {
        tracing::debug!("Fetching stories from remote");
        let mut stories = self.remote.fetch_stories().await?;
        stories.sort_by_key(|s| s.idx);
        tracing::info!(count = stories.len(), "Fetched stories");
        Ok(stories)
    }

    /// Look up a single story by idx. A missing row is `Ok(None)`.
    pub async fn fetch_story_by_idx(&self, idx: i64) -> Result<Option<Story>, RemoteError> {
        let story = self.remote.fetch_story_by_idx(idx).await?;
        if story.is_none() {
            tracing::debug!(idx, "No story with this idx");
        }
        Ok(story)
    }

    /// Markdown body of a static page authored as a story record.
    pub async fn fetch_static_page(&self, idx: i64) -> Result<Option<String>, RemoteError> {
        Ok(self.fetch_story_by_idx(idx).await?.map(|story| story.content))
    }

    pub async fn probe_connectivity(&self) -> bool {
        self.remote.probe().await
    }

    /// Fetch categories and replace the cached copy. On a remote failure
    /// the cached collection is returned instead, indistinguishable from
    /// a fresh result.
    pub async fn smart_fetch_categories(&self) -> Vec<Category> {
        match self.fetch_categories().await {
            Ok(categories) => {
                if let Err(e) = self
                    .slots
                    .save_collection(CacheKey::Categories, &categories)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to cache categories");
                }
                categories
            }
            Err(e) => {
                tracing::warn!(error = %e, "Category fetch failed, falling back to cache");
                self.slots.categories().await
            }
        }
    }

    /// Story counterpart of [`Gateway::smart_fetch_categories`].
    pub async fn smart_fetch_stories(&self) -> Vec<Story> {
        match self.fetch_stories().await {
            Ok(stories) => {
                if let Err(e) = self.slots.save_collection(CacheKey::Stories, &stories).await {
                    tracing::warn!(error = %e, "Failed to cache stories");
                }
                stories
            }
            Err(e) => {
                tracing::warn!(error = %e, "Story fetch failed, falling back to cache");
                self.slots.stories().await
            }
        }
    }

    // ========================================================================
    // Cache-only reads
    // ========================================================================

    pub async fn read_cached_categories(&self) -> Vec<Category> {
        self.slots.categories().await
    }

    pub async fn read_cached_stories(&self) -> Vec<Story> {
        self.slots.stories().await
    }

    pub async fn read_stories_by_category(&self, category_id: &str) -> Vec<Story> {
        self.slots
            .stories()
            .await
            .into_iter()
            .filter(|story| story.category_id.as_deref() == Some(category_id))
            .collect()
    }

    /// Stories with no category, or whose category is not in the cache.
    pub async fn read_uncategorized_stories(&self) -> Vec<Story> {
        let known: HashSet<String> = self
            .slots
            .categories()
            .await
            .into_iter()
            .map(|category| category.id)
            .collect();

        self.slots
            .stories()
            .await
            .into_iter()
            .filter(|story| match &story.category_id {
                Some(id) => !known.contains(id),
                None => true,
            })
            .collect()
    }

    pub async fn read_story_by_id(&self, id: &str) -> Option<Story> {
        self.slots
            .stories()
            .await
            .into_iter()
            .find(|story| story.id == id)
    }

    /// Stories whose idx is a multiple of `every`. A non-positive stride
    /// disables featuring.
    pub async fn read_featured_stories(&self, every: i64) -> Vec<Story> {
        if every <= 0 {
            return Vec::new();
        }
        self.slots
            .stories()
            .await
            .into_iter()
            .filter(|story| story.idx.rem_euclid(every) == 0)
            .collect()
    }
}
