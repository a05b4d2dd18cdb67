//! Versioned response cache.
//!
//! This module provides the namespaced key/value store the router serves from:
//! - Responses are keyed by request method + URL (fragment dropped)
//! - Namespaces are created on demand and deleted wholesale on version cutover
//! - Backends: SQLite (persistent) and in-memory

mod storage;
mod traits;

pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheStorage, CachedResponse, RequestKey};
