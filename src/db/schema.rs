//! SQL DDL for every table the engine touches.
//!
//! `entries` belongs to the journal's entry store and is created here only
//! when absent so the engine can run against a fresh file. The engine owns
//! `embeddings`, `entry_fts` (FTS5), `patterns`, `pattern_members`,
//! `memory_log` and `schema_meta`. All DDL uses `IF NOT EXISTS`.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Host entry store (read-only for the engine)
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_text TEXT NOT NULL,
    enhanced_text TEXT,
    structured_summary TEXT,
    mode TEXT NOT NULL DEFAULT 'raw',
    timestamp TEXT NOT NULL,
    mood_tags TEXT,
    word_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp);

-- Vectors, one row per (entry, granularity, seq)
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id INTEGER NOT NULL,
    granularity TEXT NOT NULL CHECK(granularity IN ('full_text','summary','sentence')),
    seq INTEGER NOT NULL DEFAULT 0,
    sentence TEXT,
    encoding TEXT NOT NULL CHECK(encoding IN ('f32','int8')),
    dim INTEGER NOT NULL,
    scale REAL NOT NULL DEFAULT 1.0,
    vector BLOB NOT NULL,
    entry_created_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(entry_id, granularity, seq)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_scan ON embeddings(granularity, entry_created_at);
CREATE INDEX IF NOT EXISTS idx_embeddings_entry ON embeddings(entry_id);

-- Lexical index over entry text, rowid = entry id
CREATE VIRTUAL TABLE IF NOT EXISTS entry_fts USING fts5(text);

-- Discovered patterns
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    pattern_type TEXT NOT NULL CHECK(pattern_type IN ('mood','topic','temporal','behavior')),
    description TEXT NOT NULL,
    frequency INTEGER NOT NULL,
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(pattern_type);
CREATE INDEX IF NOT EXISTS idx_patterns_confidence ON patterns(confidence);

CREATE TABLE IF NOT EXISTS pattern_members (
    pattern_id TEXT NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
    entry_id INTEGER NOT NULL,
    PRIMARY KEY (pattern_id, entry_id)
);

CREATE INDEX IF NOT EXISTS idx_pattern_members_entry ON pattern_members(entry_id);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('embed','delete','analyze','pattern_create','pattern_update','pattern_hide')),
    subject_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for name in [
            "entries",
            "embeddings",
            "entry_fts",
            "patterns",
            "pattern_members",
            "memory_log",
            "schema_meta",
        ] {
            assert!(tables.contains(&name.to_string()), "{name} table missing");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn pattern_confidence_is_range_checked() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO patterns (id, pattern_type, description, frequency, confidence, first_seen, last_seen, created_at, updated_at)
             VALUES ('p', 'topic', 'd', 3, 1.5, 'a', 'b', 'c', 'd')",
            [],
        );
        assert!(result.is_err(), "confidence above 1.0 must be rejected");
    }
}
