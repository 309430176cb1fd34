//! Read side of the host entry store, plus the lexical index the engine
//! keeps over entry text.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::memory::keywords::tokenize;
use crate::memory::types::{format_ts, ts_from_sql, DateRange, Entry, EntryId};

const ENTRY_COLUMNS: &str =
    "id, raw_text, enhanced_text, structured_summary, timestamp, mood_tags";

fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    let mood_tags: Option<String> = row.get(5)?;
    Ok(Entry {
        id: row.get(0)?,
        raw_text: row.get(1)?,
        enhanced_text: row.get(2)?,
        structured_summary: row.get(3)?,
        created_at: ts_from_sql(4, row.get(4)?)?,
        mood_tags: parse_mood_tags(mood_tags.as_deref()),
    })
}

/// Mood tags are a JSON array of strings; anything else reads as no tags.
fn parse_mood_tags(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn fetch_entry(conn: &Connection, id: EntryId) -> Result<Option<Entry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
            [id],
            entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

/// All entries, oldest first.
pub fn fetch_all_entries(conn: &Connection) -> Result<Vec<Entry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY timestamp, id"
    ))?;
    let entries = stmt
        .query_map([], entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub fn count_entries(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?;
    Ok(n as usize)
}

/// Entries written after `id`, the highest id a previous run saw.
pub fn count_entries_after(conn: &Connection, id: EntryId) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM entries WHERE id > ?1", [id], |r| r.get(0))?;
    Ok(n as usize)
}

/// Creation timestamps of the given entries; ids that no longer exist are
/// omitted. Output follows the order of `ids`.
pub fn existing_entries(
    conn: &Connection,
    ids: &[EntryId],
) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
    let mut stmt = conn.prepare_cached("SELECT timestamp FROM entries WHERE id = ?1")?;
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        let ts: Option<String> = stmt.query_row([id], |r| r.get(0)).optional()?;
        if let Some(ts) = ts {
            out.push((id, ts_from_sql(0, ts)?));
        }
    }
    Ok(out)
}

/// Entries without a current `full_text` vector of dimension `dim`.
pub fn entries_missing_full_text(conn: &Connection, dim: usize) -> Result<Vec<EntryId>> {
    let mut stmt = conn.prepare(
        "SELECT e.id FROM entries e WHERE NOT EXISTS (
             SELECT 1 FROM embeddings m
             WHERE m.entry_id = e.id AND m.granularity = 'full_text' AND m.dim = ?1
         ) ORDER BY e.id",
    )?;
    let ids = stmt
        .query_map([dim as i64], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<EntryId>>>()?;
    Ok(ids)
}

/// Entries referenced by vectors or pattern memberships but gone from the
/// entry store.
pub fn orphaned_entry_ids(conn: &Connection) -> Result<Vec<EntryId>> {
    let mut stmt = conn.prepare(
        "SELECT entry_id FROM embeddings WHERE entry_id NOT IN (SELECT id FROM entries)
         UNION
         SELECT entry_id FROM pattern_members WHERE entry_id NOT IN (SELECT id FROM entries)
         ORDER BY entry_id",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<EntryId>>>()?;
    Ok(ids)
}

/// Entries with no row in the lexical index.
pub fn entries_missing_from_index(conn: &Connection) -> Result<Vec<EntryId>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM entries WHERE id NOT IN (SELECT rowid FROM entry_fts) ORDER BY id",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<EntryId>>>()?;
    Ok(ids)
}

/// Lexical index rows whose entry is gone.
pub fn orphaned_index_rows(conn: &Connection) -> Result<Vec<EntryId>> {
    let mut stmt = conn.prepare(
        "SELECT rowid FROM entry_fts WHERE rowid NOT IN (SELECT id FROM entries) ORDER BY rowid",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<EntryId>>>()?;
    Ok(ids)
}

/// Fields for [`insert_entry`].
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub raw_text: String,
    pub enhanced_text: Option<String>,
    pub structured_summary: Option<String>,
    pub mood_tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Write an entry the way the host entry store does. The engine never calls
/// this on its own; it exists for tooling and tests.
pub fn insert_entry(conn: &Connection, entry: &NewEntry) -> Result<EntryId> {
    let created_at = entry.created_at.unwrap_or_else(Utc::now);
    let mood_tags = if entry.mood_tags.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&entry.mood_tags).map_err(anyhow::Error::from)?)
    };
    conn.execute(
        "INSERT INTO entries (raw_text, enhanced_text, structured_summary, mode, timestamp, mood_tags, word_count)
         VALUES (?1, ?2, ?3, 'raw', ?4, ?5, ?6)",
        params![
            entry.raw_text,
            entry.enhanced_text,
            entry.structured_summary,
            format_ts(created_at),
            mood_tags,
            entry.raw_text.split_whitespace().count() as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ── Lexical index ──

/// Replace the indexed text of an entry (raw, enhanced and summary text).
pub fn index_entry_text(conn: &Connection, entry: &Entry) -> Result<()> {
    let mut text = entry.raw_text.clone();
    for extra in [&entry.enhanced_text, &entry.structured_summary].into_iter().flatten() {
        text.push('\n');
        text.push_str(extra);
    }
    conn.execute("DELETE FROM entry_fts WHERE rowid = ?1", [entry.id])?;
    conn.execute(
        "INSERT INTO entry_fts (rowid, text) VALUES (?1, ?2)",
        params![entry.id, text],
    )?;
    Ok(())
}

pub fn unindex_entry(conn: &Connection, id: EntryId) -> Result<()> {
    conn.execute("DELETE FROM entry_fts WHERE rowid = ?1", [id])?;
    Ok(())
}

/// Turn free text into an FTS5 query: quoted non-stopword terms joined by OR.
/// Returns `None` when nothing searchable remains.
pub fn fts_query(text: &str) -> Option<String> {
    let mut terms: Vec<String> = tokenize(text)
        .into_iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return None;
    }
    Some(terms.join(" OR "))
}

/// BM25 hits as (entry id, bm25 rank, timestamp), best first. FTS5 ranks are
/// negative; more negative is better.
pub fn lexical_search(
    conn: &Connection,
    text: &str,
    range: Option<&DateRange>,
    limit: usize,
) -> Result<Vec<(EntryId, f64, DateTime<Utc>)>> {
    let Some(query) = fts_query(text) else {
        return Ok(vec![]);
    };
    let (start, end) = match range {
        Some(r) => (format_ts(r.start), format_ts(r.end)),
        None => (String::new(), "9999".to_string()),
    };
    let mut stmt = conn.prepare(
        "SELECT entry_fts.rowid, entry_fts.rank, e.timestamp FROM entry_fts
         JOIN entries e ON e.id = entry_fts.rowid
         WHERE entry_fts MATCH ?1
         ORDER BY entry_fts.rank LIMIT ?2",
    )?;
    // Host timestamps are not uniformly formatted, so the range is applied
    // after parsing; a ranged search cannot stop at `limit` rows in SQL.
    let sql_limit = if range.is_some() { -1 } else { limit as i64 };
    let rows = stmt
        .query_map(params![query, sql_limit], |row| {
            Ok((row.get::<_, EntryId>(0)?, row.get::<_, f64>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut hits = Vec::new();
    for (id, rank, ts) in rows {
        let created_at = ts_from_sql(2, ts)?;
        let stamp = format_ts(created_at);
        if stamp < start || stamp > end {
            continue;
        }
        hits.push((id, rank, created_at));
        if hits.len() == limit {
            break;
        }
    }
    Ok(hits)
}

/// Entries whose text contains `keyword`, newest first.
pub fn entries_matching_keyword(conn: &Connection, keyword: &str, limit: usize) -> Result<Vec<EntryId>> {
    let Some(query) = fts_query(keyword) else {
        return Ok(vec![]);
    };
    let mut stmt = conn.prepare(
        "SELECT e.id FROM entry_fts JOIN entries e ON e.id = entry_fts.rowid
         WHERE entry_fts MATCH ?1
         ORDER BY e.timestamp DESC, e.id DESC LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![query, limit as i64], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<EntryId>>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_db() -> Connection {
        crate::db::open_memory_database().unwrap()
    }

    fn add(conn: &Connection, text: &str, day: u32) -> EntryId {
        let id = insert_entry(
            conn,
            &NewEntry {
                raw_text: text.into(),
                created_at: Some(Utc.with_ymd_and_hms(2026, 2, day, 8, 0, 0).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        index_entry_text(conn, &fetch_entry(conn, id).unwrap().unwrap()).unwrap();
        id
    }

    #[test]
    fn reads_host_rows_with_naive_timestamps_and_tags() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO entries (raw_text, timestamp, mood_tags) VALUES ('hello', '2026-02-01T10:00:00.123456', '[\"Anxious\", \"tired\"]')",
            [],
        )
        .unwrap();
        let entry = fetch_entry(&conn, 1).unwrap().unwrap();
        assert_eq!(entry.created_at, Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap() + chrono::Duration::microseconds(123456));
        assert_eq!(entry.mood_tags, vec!["anxious", "tired"]);
        assert!(fetch_entry(&conn, 2).unwrap().is_none());
    }

    #[test]
    fn malformed_mood_tags_read_as_empty() {
        assert!(parse_mood_tags(Some("anxious, tired")).is_empty());
        assert!(parse_mood_tags(None).is_empty());
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("my \"dog\" Rex").as_deref(), Some("\"dog\" OR \"rex\""));
        assert_eq!(fts_query("what did I"), None);
    }

    #[test]
    fn lexical_search_respects_range() {
        let conn = test_db();
        let a = add(&conn, "Long walk with the dog", 1);
        let b = add(&conn, "The dog chewed my shoes", 10);
        add(&conn, "Spreadsheet work all day", 11);

        let all: Vec<EntryId> = lexical_search(&conn, "dog", None, 10)
            .unwrap()
            .into_iter()
            .map(|(id, _, _)| id)
            .collect();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&a) && all.contains(&b));

        let range = DateRange::days(
            chrono::NaiveDate::from_ymd_opt(2026, 2, 5).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
        );
        let ranged: Vec<EntryId> = lexical_search(&conn, "dog", Some(&range), 10)
            .unwrap()
            .into_iter()
            .map(|(id, _, _)| id)
            .collect();
        assert_eq!(ranged, vec![b]);
    }

    #[test]
    fn keyword_matches_are_newest_first() {
        let conn = test_db();
        let a = add(&conn, "Interview prep tonight", 1);
        let b = add(&conn, "Second interview went well", 3);
        assert_eq!(entries_matching_keyword(&conn, "interview", 10).unwrap(), vec![b, a]);
    }

    #[test]
    fn missing_and_orphaned_entries() {
        let conn = test_db();
        let a = add(&conn, "first", 1);
        let b = add(&conn, "second", 2);
        assert_eq!(entries_missing_full_text(&conn, 4).unwrap(), vec![a, b]);

        conn.execute(
            "INSERT INTO embeddings (entry_id, granularity, seq, encoding, dim, vector, entry_created_at, created_at)
             VALUES (99, 'full_text', 0, 'f32', 1, x'0000803f', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        assert_eq!(orphaned_entry_ids(&conn).unwrap(), vec![99]);
        assert_eq!(count_entries(&conn).unwrap(), 2);
    }

    #[test]
    fn index_sync_queries() {
        let conn = test_db();
        let a = add(&conn, "indexed entry", 1);
        let b = insert_entry(
            &conn,
            &NewEntry {
                raw_text: "not yet indexed".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(entries_missing_from_index(&conn).unwrap(), vec![b]);

        conn.execute("DELETE FROM entries WHERE id = ?1", [a]).unwrap();
        assert_eq!(orphaned_index_rows(&conn).unwrap(), vec![a]);
        unindex_entry(&conn, a).unwrap();
        assert!(orphaned_index_rows(&conn).unwrap().is_empty());
    }
}
