//! Persistent cache store.
//!
//! A string-keyed slot store ([`CacheStore`]) with a SQLite backend
//! ([`Database`]) and an in-memory backend ([`MemoryStore`]), the slot
//! layout with typed access ([`CacheSlots`]), and the record types
//! replicated from the remote source.

mod layout;
mod schema;
mod slots;
mod types;

pub use layout::{CacheKey, CacheSlots};
pub use schema::Database;
pub use slots::{CacheStore, MemoryStore};
pub use types::{timestamp, CachedData, Category, DatabaseStats, StorageError, Story};
