//! Storage traits and error types
//!
//! This module defines the interfaces the crawl core uses for its conditional-fetch
//! cache, session persistence and saved files.

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("No saved session")]
    NoSession,

    #[error("Invalid path for {0}")]
    InvalidPath(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Validators remembered from a previous download of a URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheRecord {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Hex SHA-256 of the body
    pub checksum: Option<String>,
}

impl CacheRecord {
    /// True if the record can drive a conditional request
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Conditional-fetch cache
pub trait CacheStore: Send + Sync {
    /// Returns the validators stored for a URL
    fn lookup(&self, url: &str) -> StorageResult<Option<CacheRecord>>;

    /// Stores the validators of a fresh download
    fn update(&self, url: &str, record: &CacheRecord) -> StorageResult<()>;

    /// Returns `(last_modified, etag)` for a URL, empty when unknown
    fn last_modified_and_etag(&self, url: &str) -> (Option<String>, Option<String>) {
        match self.lookup(url) {
            Ok(Some(record)) => (record.last_modified, record.etag),
            Ok(None) => (None, None),
            Err(e) => {
                tracing::warn!(url, error = %e, "cache lookup failed");
                (None, None)
            }
        }
    }
}

/// A pending URL saved with an interrupted crawl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierEntry {
    pub url: String,
    pub priority: i32,
    pub generation: u32,
}

/// Everything needed to resume an interrupted crawl
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub seed: String,
    pub frontier: Vec<FrontierEntry>,
    /// Raw ids of every URL already accepted
    pub seen: Vec<u64>,
    /// Named statistics counters
    pub stats: Vec<(String, u64)>,
}

/// Session persistence used by `Coordinator::restart`
pub trait SessionStore: Send + Sync {
    fn save_session(&self, snapshot: &SessionSnapshot) -> StorageResult<()>;

    fn load_session(&self) -> StorageResult<SessionSnapshot>;

    fn clear_session(&self) -> StorageResult<()>;
}
