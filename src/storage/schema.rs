//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Ripple-Harvest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    seed TEXT NOT NULL,
    status TEXT NOT NULL
);

-- Conditional-fetch validators per URL
CREATE TABLE IF NOT EXISTS url_cache (
    url TEXT PRIMARY KEY,
    etag TEXT,
    last_modified TEXT,
    checksum TEXT,
    updated_at TEXT NOT NULL
);

-- Pending URLs of an interrupted crawl
CREATE TABLE IF NOT EXISTS session_frontier (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    generation INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_session_frontier_priority ON session_frontier(priority);

-- URL ids already accepted by an interrupted crawl
CREATE TABLE IF NOT EXISTS session_seen (
    url_id INTEGER PRIMARY KEY
);

-- Seed and statistics counters of an interrupted crawl
CREATE TABLE IF NOT EXISTS session_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(initialize_schema(&conn).is_ok());
    }

    #[test]
    fn test_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for table in [
            "runs",
            "url_cache",
            "session_frontier",
            "session_seen",
            "session_meta",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }
}
