//! Storage module for crawl persistence
//!
//! This module handles everything the crawl keeps outside memory:
//! - SQLite database initialization and schema management
//! - The conditional-fetch cache (ETag / Last-Modified / checksum per URL)
//! - Session snapshots for resuming an interrupted crawl
//! - Saved files under the project directory

mod schema;
mod sink;
mod sqlite;
mod traits;

pub use sink::{local_path, PageSink};
pub use sqlite::{RunRecord, RunStatus, SqliteStore};
pub use traits::{
    CacheRecord, CacheStore, FrontierEntry, SessionSnapshot, SessionStore, StorageError,
    StorageResult,
};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Opens the database at `path`, creating it if needed
pub fn open_store(path: &Path) -> StorageResult<SqliteStore> {
    SqliteStore::new(path)
}

/// In-memory cache used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCache {
    fn lookup(&self, url: &str) -> StorageResult<Option<CacheRecord>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned())
    }

    fn update(&self, url: &str, record: &CacheRecord) -> StorageResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        assert_eq!(cache.last_modified_and_etag("u"), (None, None));

        cache
            .update(
                "u",
                &CacheRecord {
                    etag: Some("e".to_string()),
                    last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
                    checksum: None,
                },
            )
            .unwrap();

        let (lm, etag) = cache.last_modified_and_etag("u");
        assert_eq!(etag.as_deref(), Some("e"));
        assert!(lm.is_some());
    }
}
