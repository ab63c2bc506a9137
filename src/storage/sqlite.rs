//! SQLite storage implementation
//!
//! This module provides the SQLite-backed cache and session store.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{
    CacheRecord, CacheStore, FrontierEntry, SessionSnapshot, SessionStore, StorageError,
    StorageResult,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SEED_KEY: &str = "seed";
const STAT_PREFIX: &str = "stat.";

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

/// A crawl run as recorded in the database
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub seed: String,
    pub status: RunStatus,
}

/// SQLite storage backend
///
/// The connection sits behind a mutex so one store can be shared by every
/// download worker.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Run Management =====

    pub fn create_run(&self, config_hash: &str, seed: &str) -> StorageResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (started_at, config_hash, seed, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                Utc::now().to_rfc3339(),
                config_hash,
                seed,
                RunStatus::Running.to_db_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let updated = self.conn().execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), Utc::now().to_rfc3339(), run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    pub fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn()
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, seed, status
                 FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        config_hash: row.get(3)?,
                        seed: row.get(4)?,
                        status: RunStatus::from_db_string(&row.get::<_, String>(5)?)
                            .unwrap_or(RunStatus::Running),
                    })
                },
            )
            .optional()?;
        Ok(run)
    }
}

impl CacheStore for SqliteStore {
    fn lookup(&self, url: &str) -> StorageResult<Option<CacheRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT etag, last_modified, checksum FROM url_cache WHERE url = ?1",
                params![url],
                |row| {
                    Ok(CacheRecord {
                        etag: row.get(0)?,
                        last_modified: row.get(1)?,
                        checksum: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn update(&self, url: &str, record: &CacheRecord) -> StorageResult<()> {
        self.conn().execute(
            "INSERT INTO url_cache (url, etag, last_modified, checksum, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(url) DO UPDATE SET
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                checksum = excluded.checksum,
                updated_at = excluded.updated_at",
            params![
                url,
                record.etag,
                record.last_modified,
                record.checksum,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteStore {
    fn save_session(&self, snapshot: &SessionSnapshot) -> StorageResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute_batch(
            "DELETE FROM session_frontier; DELETE FROM session_seen; DELETE FROM session_meta;",
        )?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO session_frontier (url, priority, generation) VALUES (?1, ?2, ?3)",
            )?;
            for entry in &snapshot.frontier {
                insert.execute(params![entry.url, entry.priority, entry.generation])?;
            }

            let mut insert_seen = tx.prepare("INSERT OR IGNORE INTO session_seen (url_id) VALUES (?1)")?;
            for id in &snapshot.seen {
                // Stored as the signed reinterpretation of the 64-bit id
                insert_seen.execute(params![*id as i64])?;
            }

            let mut insert_meta =
                tx.prepare("INSERT INTO session_meta (key, value) VALUES (?1, ?2)")?;
            insert_meta.execute(params![SEED_KEY, snapshot.seed])?;
            for (name, value) in &snapshot.stats {
                insert_meta.execute(params![
                    format!("{}{}", STAT_PREFIX, name),
                    value.to_string()
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn load_session(&self) -> StorageResult<SessionSnapshot> {
        let conn = self.conn();

        let seed: Option<String> = conn
            .query_row(
                "SELECT value FROM session_meta WHERE key = ?1",
                params![SEED_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let Some(seed) = seed else {
            return Err(StorageError::NoSession);
        };

        let mut stmt = conn.prepare(
            "SELECT url, priority, generation FROM session_frontier ORDER BY priority, id",
        )?;
        let frontier = stmt
            .query_map([], |row| {
                Ok(FrontierEntry {
                    url: row.get(0)?,
                    priority: row.get(1)?,
                    generation: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT url_id FROM session_seen")?;
        let seen = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(|id| id as u64))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT key, value FROM session_meta WHERE key LIKE 'stat.%'")?;
        let stats = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .filter_map(|row| match row {
                Ok((key, value)) => {
                    let name = key.strip_prefix(STAT_PREFIX)?.to_string();
                    value.parse::<u64>().ok().map(|v| Ok((name, v)))
                }
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SessionSnapshot {
            seed,
            frontier,
            seen,
            stats,
        })
    }

    fn clear_session(&self) -> StorageResult<()> {
        self.conn().execute_batch(
            "DELETE FROM session_frontier; DELETE FROM session_seen; DELETE FROM session_meta;",
        )?;
        Ok(())
    }
}
