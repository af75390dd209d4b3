//! Reconciliation of remote collections with the local cache.
//!
//! Last-write-wins merge by id. Merging only adds or overwrites; a record
//! missing from the incoming collection is never dropped.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::storage::{Category, Story};

pub use crate::storage::{CacheKey, CacheSlots};

// ============================================================================
// Merge
// ============================================================================

/// A record that can be reconciled by id and recency.
pub trait Record {
    fn record_id(&self) -> &str;
    fn updated_at(&self) -> Option<DateTime<Utc>>;
}

impl Record for Category {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

impl Record for Story {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// Missing timestamps compare as the Unix epoch (`DateTime::default()`).
fn recency<T: Record>(record: &T) -> DateTime<Utc> {
    record.updated_at().unwrap_or_default()
}

/// Merge `incoming` into `existing` by id.
///
/// An incoming record is taken when its id is new or its `updated_at` is
/// strictly newer than the cached one. Ids only present in `existing` are
/// kept unchanged. Existing records keep their position; new ids are
/// appended in incoming order.
pub fn merge<T: Record + Clone>(existing: Vec<T>, incoming: &[T]) -> Vec<T> {
    let mut merged = existing;
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(pos, record)| (record.record_id().to_owned(), pos))
        .collect();

    for record in incoming {
        match index.get(record.record_id()) {
            Some(&pos) => {
                if recency(record) > recency(&merged[pos]) {
                    merged[pos] = record.clone();
                }
            }
            None => {
                index.insert(record.record_id().to_owned(), merged.len());
                merged.push(record.clone());
            }
        }
    }

    merged
}
