//! Vector store: per-entry, per-granularity embedding records in SQLite.
//!
//! [`VectorStore::put`] replaces every record for one (entry, granularity)
//! inside a single transaction, so readers see either the old set or the new
//! one. [`VectorStore::scan`] pages through the table by row id instead of
//! materializing the corpus.
//!
//! Vectors are stored either as raw `f32` (the form sqlite-vec reads
//! natively) or quantized to `int8` with one scale factor per vector. The
//! `int8` form is 4x smaller; cosine similarity is scale invariant, so the
//! ranking error is bounded by the rounding error of each component
//! (at most `max|x| / 254`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::memory::cache::SimilarityCache;
use crate::memory::embedding_to_bytes;
use crate::memory::types::{format_ts, ts_from_sql, DateRange, EmbeddingRecord, EntryId, Granularity};

/// On-disk vector encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorEncoding {
    #[default]
    F32,
    Int8,
}

impl VectorEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::Int8 => "int8",
        }
    }
}

// ── Codec ──

/// Encode a vector. Returns the blob and the dequantization scale.
pub fn encode_vector(vector: &[f32], encoding: VectorEncoding) -> (Vec<u8>, f32) {
    match encoding {
        VectorEncoding::F32 => (embedding_to_bytes(vector).to_vec(), 1.0),
        VectorEncoding::Int8 => {
            let max = vector.iter().fold(0.0f32, |m, x| m.max(x.abs()));
            if max == 0.0 {
                return (vec![0u8; vector.len()], 1.0);
            }
            let scale = max / 127.0;
            let bytes = vector
                .iter()
                .map(|x| (x / scale).round().clamp(-127.0, 127.0) as i8 as u8)
                .collect();
            (bytes, scale)
        }
    }
}

/// Decode a stored blob. Returns `None` when the blob length disagrees with
/// the recorded dimension.
pub fn decode_vector(blob: &[u8], encoding: VectorEncoding, scale: f32, dim: usize) -> Option<Vec<f32>> {
    match encoding {
        VectorEncoding::F32 => {
            if blob.len() != dim * 4 {
                return None;
            }
            Some(
                blob.chunks_exact(4)
                    .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
        VectorEncoding::Int8 => {
            if blob.len() != dim {
                return None;
            }
            Some(blob.iter().map(|b| (*b as i8) as f32 * scale).collect())
        }
    }
}

fn encoding_from_sql(idx: usize, raw: String) -> rusqlite::Result<VectorEncoding> {
    match raw.as_str() {
        "f32" => Ok(VectorEncoding::F32),
        "int8" => Ok(VectorEncoding::Int8),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown vector encoding: {other}").into(),
        )),
    }
}

fn granularity_from_sql(idx: usize, raw: String) -> rusqlite::Result<Granularity> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// One vector handed to [`VectorStore::put`].
#[derive(Debug, Clone)]
pub struct VectorInput {
    /// Source sentence, for `sentence` granularity.
    pub sentence: Option<String>,
    pub vector: Vec<f32>,
}

impl VectorInput {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { sentence: None, vector }
    }

    pub fn sentence(sentence: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            sentence: Some(sentence.into()),
            vector,
        }
    }
}

const RECORD_COLUMNS: &str =
    "id, entry_id, granularity, seq, sentence, encoding, dim, scale, vector, entry_created_at, created_at";

fn record_from_row(row: &rusqlite::Row) -> rusqlite::Result<(i64, Option<EmbeddingRecord>)> {
    let rowid: i64 = row.get(0)?;
    let encoding = encoding_from_sql(5, row.get(5)?)?;
    let dim: i64 = row.get(6)?;
    let scale: f64 = row.get(7)?;
    let blob: Vec<u8> = row.get(8)?;
    let Some(vector) = decode_vector(&blob, encoding, scale as f32, dim as usize) else {
        return Ok((rowid, None));
    };
    Ok((
        rowid,
        Some(EmbeddingRecord {
            entry_id: row.get(1)?,
            granularity: granularity_from_sql(2, row.get(2)?)?,
            seq: row.get(3)?,
            sentence: row.get(4)?,
            vector,
            entry_created_at: ts_from_sql(9, row.get(9)?)?,
            created_at: ts_from_sql(10, row.get(10)?)?,
        }),
    ))
}

/// Persistence for embedding records.
#[derive(Clone)]
pub struct VectorStore {
    encoding: VectorEncoding,
    cache: Option<Arc<SimilarityCache>>,
}

impl VectorStore {
    pub fn new(encoding: VectorEncoding) -> Self {
        Self {
            encoding,
            cache: None,
        }
    }

    /// Attach a cache whose entries are invalidated on every write.
    pub fn with_cache(mut self, cache: Arc<SimilarityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn encoding(&self) -> VectorEncoding {
        self.encoding
    }

    /// Replace all records of (entry, granularity) with `vectors`.
    ///
    /// An empty `vectors` clears the slot. All vectors must share one
    /// dimension.
    pub fn put(
        &self,
        conn: &mut Connection,
        entry_id: EntryId,
        granularity: Granularity,
        entry_created_at: DateTime<Utc>,
        vectors: &[VectorInput],
    ) -> Result<usize> {
        if let Some(first) = vectors.first() {
            let dim = first.vector.len();
            if let Some(bad) = vectors.iter().find(|v| v.vector.len() != dim) {
                return Err(EngineError::DimensionMismatch {
                    expected: dim,
                    found: bad.vector.len(),
                });
            }
        }

        let now = format_ts(Utc::now());
        let entry_ts = format_ts(entry_created_at);

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM embeddings WHERE entry_id = ?1 AND granularity = ?2",
            params![entry_id, granularity.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO embeddings (entry_id, granularity, seq, sentence, encoding, dim, scale, vector, entry_created_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (seq, input) in vectors.iter().enumerate() {
                let (blob, scale) = encode_vector(&input.vector, self.encoding);
                stmt.execute(params![
                    entry_id,
                    granularity.as_str(),
                    seq as i64,
                    input.sentence,
                    self.encoding.as_str(),
                    input.vector.len() as i64,
                    scale as f64,
                    blob,
                    entry_ts,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        if let Some(cache) = &self.cache {
            cache.invalidate(entry_id, granularity);
        }
        Ok(vectors.len())
    }

    /// Records of (entry, granularity) whose dimension is `dim`, ordered by
    /// sequence. `None` when the slot is empty or holds only stale vectors.
    pub fn get(
        &self,
        conn: &Connection,
        entry_id: EntryId,
        granularity: Granularity,
        dim: usize,
    ) -> Result<Option<Vec<EmbeddingRecord>>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM embeddings \
             WHERE entry_id = ?1 AND granularity = ?2 ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![entry_id, granularity.as_str()], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let total = rows.len();
        let records: Vec<EmbeddingRecord> = rows
            .into_iter()
            .filter_map(|(_, r)| r)
            .filter(|r| r.vector.len() == dim)
            .collect();

        if records.len() < total {
            tracing::warn!(
                entry_id,
                granularity = %granularity,
                stale = total - records.len(),
                "ignoring stale vectors"
            );
        }
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records))
    }

    /// Lazy iterator over all records of `granularity` with dimension `dim`,
    /// optionally restricted to entries created inside `range`.
    pub fn scan<'c>(
        &self,
        conn: &'c Connection,
        granularity: Granularity,
        dim: usize,
        range: Option<DateRange>,
    ) -> EmbeddingScan<'c> {
        EmbeddingScan {
            conn,
            granularity,
            dim,
            range,
            page_size: DEFAULT_PAGE_SIZE,
            last_rowid: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Remove every record of an entry. Returns the number of rows deleted.
    pub fn delete(&self, conn: &Connection, entry_id: EntryId) -> Result<usize> {
        let n = conn.execute("DELETE FROM embeddings WHERE entry_id = ?1", [entry_id])?;
        if let Some(cache) = &self.cache {
            cache.invalidate_entry(entry_id);
        }
        Ok(n)
    }

    /// Entries holding at least one record whose dimension is not `dim`.
    pub fn stale_entries(&self, conn: &Connection, dim: usize) -> Result<Vec<EntryId>> {
        let mut stmt = conn
            .prepare("SELECT DISTINCT entry_id FROM embeddings WHERE dim != ?1 ORDER BY entry_id")?;
        let ids = stmt
            .query_map([dim as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<EntryId>>>()?;
        Ok(ids)
    }

    /// Entries holding records although they are gone from the entry store.
    pub fn orphaned_entries(&self, conn: &Connection) -> Result<Vec<EntryId>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entry_id FROM embeddings \
             WHERE entry_id NOT IN (SELECT id FROM entries) ORDER BY entry_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<EntryId>>>()?;
        Ok(ids)
    }

    /// Whether the entry has a current `full_text` vector.
    pub fn has_full_text(&self, conn: &Connection, entry_id: EntryId, dim: usize) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM embeddings WHERE entry_id = ?1 AND granularity = 'full_text' AND dim = ?2 LIMIT 1",
                params![entry_id, dim as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// Rows fetched per query by [`EmbeddingScan`].
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Keyset-paged iterator returned by [`VectorStore::scan`].
///
/// Holds at most one page in memory. Rows written after the scan passed
/// their position are not revisited; [`EmbeddingScan::restart`] starts over.
pub struct EmbeddingScan<'c> {
    conn: &'c Connection,
    granularity: Granularity,
    dim: usize,
    range: Option<DateRange>,
    page_size: usize,
    last_rowid: i64,
    buffer: VecDeque<EmbeddingRecord>,
    exhausted: bool,
}

impl EmbeddingScan<'_> {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn restart(&mut self) {
        self.last_rowid = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<()> {
        let (start, end) = match &self.range {
            Some(r) => (format_ts(r.start), format_ts(r.end)),
            None => (String::new(), "9999".to_string()),
        };
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM embeddings \
             WHERE granularity = ?1 AND dim = ?2 AND id > ?3 \
               AND entry_created_at >= ?4 AND entry_created_at <= ?5 \
             ORDER BY id LIMIT ?6"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    self.granularity.as_str(),
                    self.dim as i64,
                    self.last_rowid,
                    start,
                    end,
                    self.page_size as i64
                ],
                record_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        for (rowid, record) in rows {
            self.last_rowid = rowid;
            if let Some(record) = record {
                self.buffer.push_back(record);
            }
        }
        Ok(())
    }
}

impl Iterator for EmbeddingScan<'_> {
    type Item = Result<EmbeddingRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    subject_id: &str,
    details: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    let now = format_ts(Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, subject_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, subject_id, details_json, now],
    )?;
    Ok(())
}
