use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::db::migrations::{get_embedding_dim, get_embedding_model};
use crate::memory::cache::CacheStats;
use crate::memory::scheduler::{load_state, SchedulerState};
use crate::memory::types::{Granularity, PatternType};

/// Snapshot of what the engine holds.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub entries: u64,
    /// Entries present in the lexical index.
    pub indexed_entries: u64,
    /// Entries with a current `full_text` vector.
    pub embedded_entries: u64,
    pub embeddings: BTreeMap<String, u64>,
    /// Vectors whose dimension differs from the encoder's.
    pub stale_vectors: u64,
    /// Vectors whose entry is gone.
    pub orphaned_vectors: u64,
    pub patterns: u64,
    pub visible_patterns: u64,
    pub patterns_by_type: BTreeMap<String, u64>,
    pub scheduler: SchedulerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_entry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_entry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

/// Compute engine statistics.
///
/// `dim` is the encoder's output dimension, `visibility_threshold` the
/// pattern visibility cut-off. `db_path` is used for the file size; pass
/// None for in-memory databases.
pub fn engine_stats(
    conn: &Connection,
    dim: usize,
    visibility_threshold: f64,
    db_path: Option<&Path>,
) -> Result<StatsReport> {
    let count = |sql: &str| -> rusqlite::Result<u64> {
        conn.query_row(sql, [], |r| r.get::<_, i64>(0)).map(|n| n as u64)
    };

    let entries = count("SELECT COUNT(*) FROM entries")?;
    let indexed_entries =
        count("SELECT COUNT(*) FROM entries WHERE id IN (SELECT rowid FROM entry_fts)")?;
    let embedded_entries: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT entry_id) FROM embeddings e
         WHERE granularity = 'full_text' AND dim = ?1 AND entry_id IN (SELECT id FROM entries)",
        [dim as i64],
        |r| r.get(0),
    )?;
    let stale_vectors: i64 = conn.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE dim != ?1",
        [dim as i64],
        |r| r.get(0),
    )?;
    let orphaned_vectors =
        count("SELECT COUNT(*) FROM embeddings WHERE entry_id NOT IN (SELECT id FROM entries)")?;

    let patterns = count("SELECT COUNT(*) FROM patterns")?;
    let visible_patterns: i64 = conn.query_row(
        "SELECT COUNT(*) FROM patterns WHERE confidence >= ?1",
        params![visibility_threshold],
        |r| r.get(0),
    )?;

    let (oldest_entry, newest_entry): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(timestamp), MAX(timestamp) FROM entries",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsReport {
        entries,
        indexed_entries,
        embedded_entries: embedded_entries as u64,
        embeddings: count_by_granularity(conn)?,
        stale_vectors: stale_vectors as u64,
        orphaned_vectors,
        patterns,
        visible_patterns: visible_patterns as u64,
        patterns_by_type: count_by_pattern_type(conn)?,
        scheduler: load_state(conn)?,
        embedding_model: get_embedding_model(conn)?,
        embedding_dim: get_embedding_dim(conn)?,
        db_size_bytes,
        oldest_entry,
        newest_entry,
        cache: None,
    })
}

/// Vector count per granularity, every granularity present.
fn count_by_granularity(conn: &Connection) -> Result<BTreeMap<String, u64>> {
    let mut map: BTreeMap<String, u64> = Granularity::ALL
        .iter()
        .map(|g| (g.as_str().to_string(), 0))
        .collect();

    let mut stmt = conn.prepare("SELECT granularity, COUNT(*) FROM embeddings GROUP BY granularity")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (g, n) in rows {
        map.insert(g, n as u64);
    }
    Ok(map)
}

/// Pattern count per type, every type present.
fn count_by_pattern_type(conn: &Connection) -> Result<BTreeMap<String, u64>> {
    let mut map: BTreeMap<String, u64> = PatternType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), 0))
        .collect();

    let mut stmt = conn.prepare("SELECT pattern_type, COUNT(*) FROM patterns GROUP BY pattern_type")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (t, n) in rows {
        map.insert(t, n as u64);
    }
    Ok(map)
}
