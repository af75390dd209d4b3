//! Offline-first story library cache.
//!
//! Replicates categories and stories from a remote relational source into a
//! local key-value cache, reconciles them with last-write-wins, and serves
//! every read from the cache so the library stays usable offline.

pub mod config;
pub mod remote;
pub mod storage;
pub mod sync;
